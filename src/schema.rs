use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{DatumError, Result};

/// The backend-independent field kinds exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalType {
    Num,
    Text,
    Date,
    Geom,
    Lob,
}

impl CanonicalType {
    pub const ALL: [CanonicalType; 5] = [
        CanonicalType::Num,
        CanonicalType::Text,
        CanonicalType::Date,
        CanonicalType::Geom,
        CanonicalType::Lob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Num => "num",
            CanonicalType::Text => "text",
            CanonicalType::Date => "date",
            CanonicalType::Geom => "geom",
            CanonicalType::Lob => "lob",
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalType {
    type Err = DatumError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "num" => Ok(CanonicalType::Num),
            "text" => Ok(CanonicalType::Text),
            "date" => Ok(CanonicalType::Date),
            "geom" => Ok(CanonicalType::Geom),
            "lob" => Ok(CanonicalType::Lob),
            other => Err(DatumError::UnhandledValueType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CanonicalType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: CanonicalType) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// A possibly schema-qualified table name, e.g. `gis.parcels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (schema, name) = match raw.split_once('.') {
            Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
            None => (None, raw.to_string()),
        };
        if name.is_empty() || schema.as_deref() == Some("") || name.contains('.') {
            return Err(DatumError::Configuration(format!(
                "Invalid table name: '{}'",
                raw
            )));
        }
        Ok(Self { schema, name })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryColumn {
    pub field: String,
    /// OGC type name, e.g. `POLYGON` or `MULTIPOLYGON`.
    pub geom_type: String,
    /// `None` when the backend cannot tell (e.g. an empty unregistered table).
    pub srid: Option<i32>,
}

/// Immutable description of a table, computed once when the table is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table: TableName,
    /// Schema the table was resolved in (the backend default when unqualified).
    pub owner: String,
    pub fields: Vec<FieldDescriptor>,
    pub geometry: Option<GeometryColumn>,
    pub pk_field: Option<String>,
    /// Not-null surrogate key required on every insert (Oracle ST_Geometry only).
    pub objectid_field: Option<String>,
}

impl TableMetadata {
    /// Builds metadata from introspected fields, enforcing the single-geometry rule.
    pub fn new(table: TableName, owner: impl Into<String>, fields: Vec<FieldDescriptor>) -> Result<Self> {
        let geom_fields: Vec<String> = fields
            .iter()
            .filter(|f| f.kind == CanonicalType::Geom)
            .map(|f| f.name.clone())
            .collect();
        if geom_fields.len() > 1 {
            return Err(DatumError::MultipleGeometryFields {
                table: table.to_string(),
                fields: geom_fields,
            });
        }

        Ok(Self {
            table,
            owner: owner.into(),
            fields,
            geometry: None,
            pk_field: None,
            objectid_field: None,
        })
    }

    /// Name of the single geometry-typed field, if any.
    pub fn geom_field_name(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.kind == CanonicalType::Geom)
            .map(|f| f.name.as_str())
    }

    pub fn geom_field(&self) -> Option<&str> {
        self.geometry.as_ref().map(|g| g.field.as_str())
    }

    pub fn geom_type(&self) -> Option<&str> {
        self.geometry.as_ref().map(|g| g.geom_type.as_str())
    }

    pub fn srid(&self) -> Option<i32> {
        self.geometry.as_ref().and_then(|g| g.srid)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn non_geom_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.kind != CanonicalType::Geom)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Case-insensitive field lookup.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Boolean(bool),
    Date(DateTime<Utc>),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of catalog values, which arrive as text from some drivers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Decimal(d) => d.trunc().to_string().parse().ok(),
            Value::Float(f) if f.is_finite() => Some(*f as i64),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| Decimal::from_str(s).ok().and_then(|d| d.trunc().to_string().parse().ok()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%dT%H:%M:%S")),
            Value::Null => f.write_str("NULL"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Field name to value, in insertion order.
pub type Row = IndexMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, kind: CanonicalType) -> FieldDescriptor {
        FieldDescriptor::new(name, kind)
    }

    #[test]
    fn test_canonical_type_parsing() {
        for kind in CanonicalType::ALL {
            assert_eq!(kind.to_string().parse::<CanonicalType>().unwrap(), kind);
        }
        assert!("blob".parse::<CanonicalType>().is_err());
    }

    #[test]
    fn test_table_name_parse() {
        let plain = TableName::parse("parcels").unwrap();
        assert_eq!(plain.schema, None);
        assert_eq!(plain.name, "parcels");

        let qualified = TableName::parse("gis.parcels").unwrap();
        assert_eq!(qualified.schema.as_deref(), Some("gis"));
        assert_eq!(qualified.to_string(), "gis.parcels");

        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("a.b.c").is_err());
    }

    #[test]
    fn test_metadata_single_geometry() {
        let meta = TableMetadata::new(
            TableName::parse("parcels").unwrap(),
            "public",
            vec![
                field("id", CanonicalType::Num),
                field("address", CanonicalType::Text),
                field("shape", CanonicalType::Geom),
            ],
        )
        .unwrap();
        assert_eq!(meta.geom_field_name(), Some("shape"));
        assert_eq!(meta.non_geom_fields(), vec!["id", "address"]);
        assert!(meta.field("ADDRESS").is_some());
    }

    #[test]
    fn test_metadata_rejects_two_geometry_fields() {
        let result = TableMetadata::new(
            TableName::parse("parcels").unwrap(),
            "public",
            vec![
                field("shape", CanonicalType::Geom),
                field("centroid", CanonicalType::Geom),
            ],
        );
        match result {
            Err(DatumError::MultipleGeometryFields { fields, .. }) => {
                assert_eq!(fields, vec!["shape", "centroid"]);
            }
            other => panic!("expected MultipleGeometryFields, got {:?}", other),
        }
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::from("abc").to_string(), "abc");
        assert_eq!(Value::Integer(42).to_string(), "42");
        assert_eq!(Value::Float(1.5).to_string(), "1.5");
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_value_as_i64() {
        assert_eq!(Value::Integer(4326).as_i64(), Some(4326));
        assert_eq!(Value::from("2272").as_i64(), Some(2272));
        assert_eq!(Value::from("262160.0").as_i64(), Some(262160));
        assert_eq!(Value::from("x").as_i64(), None);
        assert_eq!(Value::Null.as_i64(), None);
    }

    #[test]
    fn test_value_serializes_untagged() {
        let mut row = Row::new();
        row.insert("name".to_string(), Value::from("Main St"));
        row.insert("lanes".to_string(), Value::Integer(2));
        row.insert("note".to_string(), Value::Null);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"name":"Main St","lanes":2,"note":null}"#);
    }
}
