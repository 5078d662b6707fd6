use anyhow::Error as AnyhowError;

#[derive(Debug, thiserror::Error)]
pub enum DatumError {
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Multiple geometry fields in table {table}: {}", fields.join(", "))]
    MultipleGeometryFields { table: String, fields: Vec<String> },

    #[error("Unknown field type '{native_type}' for field '{field}'")]
    UnknownFieldType { field: String, native_type: String },

    #[error("Field '{field}' does not exist in table {table}")]
    UnknownField { table: String, field: String },

    #[error("Unhandled value type: {0}")]
    UnhandledValueType(String),

    #[error("Invalid value for field '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Error executing statement: {message}\n{statement}")]
    Statement { statement: String, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("General error: {0}")]
    General(#[from] AnyhowError),
}

impl DatumError {
    /// Wraps a native driver failure together with the statement that caused it.
    pub fn statement(statement: &str, err: impl std::fmt::Display) -> Self {
        DatumError::Statement {
            statement: statement.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DatumError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = DatumError::UnsupportedBackend("badscheme".to_string());
        assert_eq!(err.to_string(), "Unsupported backend: badscheme");
    }

    #[test]
    fn test_multiple_geometry_fields_display() {
        let err = DatumError::MultipleGeometryFields {
            table: "parcels".to_string(),
            fields: vec!["shape".to_string(), "centroid".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Multiple geometry fields in table parcels: shape, centroid"
        );
    }

    #[test]
    fn test_statement_error_keeps_sql() {
        let err = DatumError::statement("SELECT * FROM nowhere", "relation does not exist");
        let text = err.to_string();
        assert!(text.contains("relation does not exist"));
        assert!(text.contains("SELECT * FROM nowhere"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = DatumError::from(io_err);
        assert!(matches!(err, DatumError::Io(_)));
    }

    #[test]
    fn test_url_error_conversion() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        let err = DatumError::from(parse_err);
        assert!(matches!(err, DatumError::Url(_)));
    }
}
