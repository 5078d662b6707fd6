use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Format used when a date is handed to the database as text.
pub const ISO_DATETIME: &str = "%Y-%m-%dT%H:%M:%S";

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",  // 2023-12-25
    "%Y/%m/%d",  // 2023/12/25
    "%m/%d/%Y",  // 12/25/2023
    "%m-%d-%Y",  // 12-25-2023
    "%b %d, %Y", // Dec 25, 2023
    "%d %b %Y",  // 25 Dec 2023
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%Y/%m/%d %H:%M:%S",
];

/// Normalizes the date and datetime spellings found in delimited files and
/// driver output into UTC timestamps.
pub struct DateParser;

impl DateParser {
    /// Parses `value` in any supported format. Values without an offset are
    /// taken as UTC; date-only values land on midnight.
    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(dt.with_timezone(&Utc));
        }

        for format in DATETIME_FORMATS {
            if let Ok(ndt) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Some(Utc.from_utc_datetime(&ndt));
            }
        }

        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return date
                    .and_hms_opt(0, 0, 0)
                    .map(|ndt| Utc.from_utc_datetime(&ndt));
            }
        }

        None
    }

    /// ISO-8601 text for binding, without offset (the value is already UTC).
    pub fn to_iso(dt: &DateTime<Utc>) -> String {
        dt.format(ISO_DATETIME).to_string()
    }
}
