//! Native column type names to canonical kinds, and the reverse mapping used
//! for DDL. Also holds the value preparation rules applied before binding.

use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::{
    date_parser::DateParser,
    schema::{CanonicalType, Value},
    DatumError, Result,
};

/// An ordered native-type → canonical-type table.
#[derive(Debug, Clone, Copy)]
pub struct TypeMap {
    entries: &'static [(&'static str, CanonicalType)],
    ddl: DdlTypes,
}

/// Native type emitted by `create_table` for each canonical kind.
#[derive(Debug, Clone, Copy)]
pub struct DdlTypes {
    pub num: &'static str,
    pub text: &'static str,
    pub date: &'static str,
    pub geom: &'static str,
    pub lob: &'static str,
}

pub const POSTGIS_TYPES: TypeMap = TypeMap {
    entries: &[
        ("integer", CanonicalType::Num),
        ("smallint", CanonicalType::Num),
        ("bigint", CanonicalType::Num),
        ("numeric", CanonicalType::Num),
        ("real", CanonicalType::Num),
        ("double precision", CanonicalType::Num),
        ("text", CanonicalType::Text),
        ("character varying", CanonicalType::Text),
        ("character", CanonicalType::Text),
        ("date", CanonicalType::Date),
        ("timestamp without time zone", CanonicalType::Date),
        ("timestamp with time zone", CanonicalType::Date),
        // information_schema reports PostGIS columns as USER-DEFINED; the
        // introspector substitutes the udt name so other extension types
        // stay unmapped.
        ("geometry", CanonicalType::Geom),
    ],
    ddl: DdlTypes {
        num: "numeric",
        text: "text",
        date: "date",
        geom: "geometry",
        lob: "text",
    },
};

pub const ORACLE_STGEOM_TYPES: TypeMap = TypeMap {
    entries: &[
        ("NUMBER", CanonicalType::Num),
        ("INTEGER", CanonicalType::Num),
        ("FLOAT", CanonicalType::Num),
        ("BINARY_FLOAT", CanonicalType::Num),
        ("BINARY_DOUBLE", CanonicalType::Num),
        ("VARCHAR2", CanonicalType::Text),
        ("NVARCHAR2", CanonicalType::Text),
        ("CHAR", CanonicalType::Text),
        ("NCHAR", CanonicalType::Text),
        ("DATE", CanonicalType::Date),
        ("TIMESTAMP", CanonicalType::Date),
        ("TIMESTAMP WITH TIME ZONE", CanonicalType::Date),
        ("TIMESTAMP WITH LOCAL TIME ZONE", CanonicalType::Date),
        ("ST_GEOMETRY", CanonicalType::Geom),
        ("CLOB", CanonicalType::Lob),
        ("NCLOB", CanonicalType::Lob),
        ("BLOB", CanonicalType::Lob),
        ("LONG", CanonicalType::Lob),
    ],
    ddl: DdlTypes {
        num: "NUMBER",
        text: "NVARCHAR2(2000)",
        date: "TIMESTAMP",
        geom: "SDE.ST_GEOMETRY",
        lob: "CLOB",
    },
};

fn precision_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\(\s*\d+\s*(,\s*\d+\s*)?\)").expect("valid precision regex"))
}

impl TypeMap {
    /// Case-insensitive lookup; length/precision suffixes such as
    /// `TIMESTAMP(6)` are ignored.
    pub fn lookup(&self, native_type: &str) -> Option<CanonicalType> {
        let normalized = precision_suffix().replace_all(native_type.trim(), "");
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&normalized))
            .map(|(_, kind)| *kind)
    }

    /// Maps a column's native type, failing when the type has no mapping.
    pub fn resolve(&self, field: &str, native_type: &str) -> Result<CanonicalType> {
        self.lookup(native_type)
            .ok_or_else(|| DatumError::UnknownFieldType {
                field: field.to_string(),
                native_type: native_type.to_string(),
            })
    }

    pub fn native_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    pub fn ddl_type(&self, kind: CanonicalType) -> &'static str {
        match kind {
            CanonicalType::Num => self.ddl.num,
            CanonicalType::Text => self.ddl.text,
            CanonicalType::Date => self.ddl.date,
            CanonicalType::Geom => self.ddl.geom,
            CanonicalType::Lob => self.ddl.lob,
        }
    }
}

/// Converts a row value into the text that gets bound for a column of the
/// given kind. `None` binds SQL NULL.
///
/// Geometry never passes through here; it goes through the geometry codec.
pub fn prepare_value(field: &str, kind: CanonicalType, value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }

    match kind {
        CanonicalType::Text | CanonicalType::Lob => Ok(Some(match value {
            Value::Date(dt) => DateParser::to_iso(dt),
            other => other.to_string(),
        })),
        CanonicalType::Num => prepare_number(field, value),
        CanonicalType::Date => prepare_date(field, value),
        CanonicalType::Geom => Err(DatumError::UnhandledValueType(format!(
            "{} value for field '{}' must be encoded as geometry",
            kind, field
        ))),
    }
}

/// Types a value the driver returned as text, by its field's kind. Text that
/// does not parse comes back unchanged.
pub fn typed_value(kind: CanonicalType, value: Value) -> Value {
    let Value::String(text) = value else {
        return value;
    };
    let parsed = match kind {
        CanonicalType::Num => parse_number(&text),
        CanonicalType::Date => DateParser::parse(&text).map(Value::Date),
        _ => None,
    };
    parsed.unwrap_or(Value::String(text))
}

fn parse_number(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::Integer(i));
    }
    // Oracle renders fractions without the leading zero: ".5", "-.5"
    let normalized = if let Some(rest) = trimmed.strip_prefix("-.") {
        format!("-0.{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix('.') {
        format!("0.{}", rest)
    } else {
        trimmed.to_string()
    };
    Decimal::from_str(&normalized)
        .or_else(|_| Decimal::from_scientific(&normalized))
        .ok()
        .map(Value::Decimal)
}

fn prepare_number(field: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Integer(i) => Ok(Some(i.to_string())),
        Value::Decimal(d) => Ok(Some(d.to_string())),
        Value::Float(f) if f.is_finite() => Ok(Some(f.to_string())),
        Value::Float(f) => Err(DatumError::InvalidValue {
            field: field.to_string(),
            message: format!("non-finite number {}", f),
        }),
        Value::Boolean(b) => Ok(Some(if *b { "1" } else { "0" }.to_string())),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if Decimal::from_str(trimmed).is_ok() || Decimal::from_scientific(trimmed).is_ok() {
                Ok(Some(trimmed.to_string()))
            } else {
                Err(DatumError::InvalidValue {
                    field: field.to_string(),
                    message: format!("'{}' is not a number", trimmed),
                })
            }
        }
        Value::Date(_) => Err(DatumError::InvalidValue {
            field: field.to_string(),
            message: "date given for a numeric field".to_string(),
        }),
        Value::Null => Ok(None),
    }
}

fn prepare_date(field: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Date(dt) => Ok(Some(DateParser::to_iso(dt))),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => DateParser::parse(s)
            .map(|dt| Some(DateParser::to_iso(&dt)))
            .ok_or_else(|| DatumError::InvalidValue {
                field: field.to_string(),
                message: format!("'{}' is not a recognizable date", s),
            }),
        other => Err(DatumError::InvalidValue {
            field: field.to_string(),
            message: format!("'{}' is not a date", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_mapped_type_resolves() {
        for map in [POSTGIS_TYPES, ORACLE_STGEOM_TYPES] {
            for native in map.native_types() {
                let kind = map.resolve("f", native).unwrap();
                assert!(CanonicalType::ALL.contains(&kind));
            }
        }
    }

    #[test]
    fn test_unmapped_type_fails() {
        let err = POSTGIS_TYPES.resolve("payload", "jsonb").unwrap_err();
        match err {
            DatumError::UnknownFieldType { field, native_type } => {
                assert_eq!(field, "payload");
                assert_eq!(native_type, "jsonb");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(ORACLE_STGEOM_TYPES.resolve("raw", "RAW").is_err());
    }

    #[test]
    fn test_lookup_ignores_case_and_precision() {
        assert_eq!(ORACLE_STGEOM_TYPES.lookup("timestamp(6)"), Some(CanonicalType::Date));
        assert_eq!(
            ORACLE_STGEOM_TYPES.lookup("TIMESTAMP(6) WITH TIME ZONE"),
            Some(CanonicalType::Date)
        );
        assert_eq!(ORACLE_STGEOM_TYPES.lookup("NUMBER(38, 8)"), Some(CanonicalType::Num));
        assert_eq!(POSTGIS_TYPES.lookup("Character Varying"), Some(CanonicalType::Text));
        assert_eq!(POSTGIS_TYPES.lookup("geometry"), Some(CanonicalType::Geom));
        assert_eq!(POSTGIS_TYPES.lookup("USER-DEFINED"), None);
    }

    #[test]
    fn test_ddl_types() {
        assert_eq!(POSTGIS_TYPES.ddl_type(CanonicalType::Num), "numeric");
        assert_eq!(POSTGIS_TYPES.ddl_type(CanonicalType::Geom), "geometry");
        assert_eq!(ORACLE_STGEOM_TYPES.ddl_type(CanonicalType::Lob), "CLOB");
    }

    #[test]
    fn test_prepare_text_keeps_quotes_for_binding() {
        let prepared = prepare_value("name", CanonicalType::Text, &Value::from("O'Hara")).unwrap();
        assert_eq!(prepared.as_deref(), Some("O'Hara"));
        assert_eq!(prepare_value("name", CanonicalType::Text, &Value::Null).unwrap(), None);
        assert_eq!(
            prepare_value("name", CanonicalType::Text, &Value::Integer(7)).unwrap().as_deref(),
            Some("7")
        );
    }

    #[test]
    fn test_prepare_numbers() {
        let cases = vec![
            (Value::Integer(12), Some("12")),
            (Value::Float(2.5), Some("2.5")),
            (Value::from(" 3.25 "), Some("3.25")),
            (Value::from("1e3"), Some("1e3")),
            (Value::from(""), None),
            (Value::Boolean(true), Some("1")),
        ];
        for (value, expected) in cases {
            let prepared = prepare_value("n", CanonicalType::Num, &value).unwrap();
            assert_eq!(prepared.as_deref(), expected, "{:?}", value);
        }

        assert!(matches!(
            prepare_value("n", CanonicalType::Num, &Value::from("abc")),
            Err(DatumError::InvalidValue { .. })
        ));
        assert!(prepare_value("n", CanonicalType::Num, &Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_prepare_dates_as_iso() {
        let dt = chrono::Utc.with_ymd_and_hms(2020, 2, 29, 8, 15, 0).unwrap();
        assert_eq!(
            prepare_value("d", CanonicalType::Date, &Value::Date(dt)).unwrap().as_deref(),
            Some("2020-02-29T08:15:00")
        );
        assert_eq!(
            prepare_value("d", CanonicalType::Date, &Value::from("02/29/2020")).unwrap().as_deref(),
            Some("2020-02-29T00:00:00")
        );
        assert!(prepare_value("d", CanonicalType::Date, &Value::from("someday")).is_err());
    }

    #[test]
    fn test_prepare_geometry_is_unhandled() {
        let err = prepare_value("shape", CanonicalType::Geom, &Value::from("POINT (1 2)")).unwrap_err();
        assert!(matches!(err, DatumError::UnhandledValueType(_)));
    }

    #[test]
    fn test_typed_value_from_driver_text() {
        assert_eq!(typed_value(CanonicalType::Num, Value::from("42")), Value::Integer(42));
        assert_eq!(
            typed_value(CanonicalType::Num, Value::from("-.25")),
            Value::Decimal(Decimal::from_str("-0.25").unwrap())
        );
        assert_eq!(
            typed_value(CanonicalType::Num, Value::from("1234.5")),
            Value::Decimal(Decimal::from_str("1234.5").unwrap())
        );
        assert_eq!(
            typed_value(CanonicalType::Date, Value::from("2024-03-01 12:30:00")),
            Value::Date(DateParser::parse("2024-03-01T12:30:00Z").unwrap())
        );
        assert_eq!(typed_value(CanonicalType::Num, Value::from("n/a")), Value::from("n/a"));
        assert_eq!(typed_value(CanonicalType::Text, Value::from("42")), Value::from("42"));
        assert_eq!(typed_value(CanonicalType::Num, Value::Null), Value::Null);
    }
}
