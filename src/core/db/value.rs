/// Value Module
///
/// Application-side values passed in and out of the query layer, and the
/// temporal type that remembers whether it came from a date-only source.
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use std::fmt;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats tried when parsing a date/time expression that carries a time of day.
const DATETIME_PATTERNS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%m-%d-%Y %H:%M:%S%.f",
    "%m-%d-%Y %H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
];

/// Formats tried when parsing a date-only expression.
const DATE_PATTERNS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m-%d-%Y",
    "%m/%d/%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
];

/// A point in time tagged with its date-only/date-time origin.
///
/// A value parsed from `2024-03-01` formats back as `2024-03-01`, never as
/// `2024-03-01 00:00:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temporal {
    value: NaiveDateTime,
    date_only: bool,
}

impl Temporal {
    pub fn new(value: NaiveDateTime, date_only: bool) -> Self {
        let value = if date_only {
            value.date().and_time(NaiveTime::MIN)
        } else {
            value
        };
        Temporal { value, date_only }
    }

    pub fn date(date: NaiveDate) -> Self {
        Temporal::new(date.and_time(NaiveTime::MIN), true)
    }

    pub fn datetime(value: NaiveDateTime) -> Self {
        Temporal::new(value, false)
    }

    /// The current UTC time, matching SQLite's `CURRENT_TIMESTAMP` and the
    /// Unix timestamp conversion.
    pub fn now(date_only: bool) -> Self {
        Temporal::new(Utc::now().naive_utc(), date_only)
    }

    /// Interprets `seconds` as a UTC Unix timestamp, keeping any fractional part.
    pub fn from_timestamp(seconds: f64, date_only: bool) -> Option<Self> {
        if !seconds.is_finite() {
            return None;
        }
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1_000_000_000.0).round().min(999_999_999.0) as u32;
        let utc = DateTime::from_timestamp(whole as i64, nanos)?;
        Some(Temporal::new(utc.naive_utc(), date_only))
    }

    /// Parses a free-form date or date-time expression.
    ///
    /// Accepts RFC 3339 (offsets are normalized to UTC), ISO-8601 with `T` or a
    /// space separator, slash and `MM-DD-YYYY` variants, month-name forms and the
    /// keywords `now` and `today`.
    pub fn parse(input: &str) -> Option<Self> {
        let text = input.trim();
        if text.is_empty() {
            return None;
        }
        if text.eq_ignore_ascii_case("now") {
            return Some(Temporal::now(false));
        }
        if text.eq_ignore_ascii_case("today") {
            return Some(Temporal::now(true));
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Some(Temporal::datetime(parsed.naive_utc()));
        }
        for pattern in DATETIME_PATTERNS {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(text, pattern) {
                return Some(Temporal::datetime(parsed));
            }
        }
        for pattern in DATE_PATTERNS {
            if let Ok(parsed) = NaiveDate::parse_from_str(text, pattern) {
                return Some(Temporal::date(parsed));
            }
        }
        None
    }

    pub fn is_date_only(&self) -> bool {
        self.date_only
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.value
    }

    /// Unix seconds of the value read as UTC.
    pub fn timestamp(&self) -> i64 {
        self.value.and_utc().timestamp()
    }

    /// Re-tags the value. Converting to date-only drops the time of day.
    pub fn with_date_only(self, date_only: bool) -> Self {
        Temporal::new(self.value, date_only)
    }

    /// Renders `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS[.ffffff]`.
    pub fn format(&self) -> String {
        if self.date_only {
            return self.value.format(DATE_FORMAT).to_string();
        }
        let nanos = self.value.nanosecond();
        if nanos == 0 {
            self.value.format(DATETIME_FORMAT).to_string()
        } else if nanos % 1_000_000 == 0 {
            self.value.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            self.value.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
        }
    }
}

impl fmt::Display for Temporal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// An application value.
///
/// `Structured` holds composite data (arrays, objects) which cannot be
/// written to a column.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Temporal(Temporal),
    Blob(Vec<u8>),
    Structured(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_empty_string(&self) -> bool {
        matches!(self, Value::Text(s) if s.is_empty())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_temporal(&self) -> Option<&Temporal> {
        match self {
            Value::Temporal(t) => Some(t),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Temporal(_) => "temporal",
            Value::Blob(_) => "blob",
            Value::Structured(_) => "structured",
        }
    }

    /// Renders the value as a SQL literal for diagnostics. Never used to build
    /// executable SQL.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Temporal(t) => format!("'{}'", t),
            Value::Blob(b) => format!("<BLOB: {} bytes>", b.len()),
            Value::Structured(v) => v.to_string(),
        }
    }

    /// Converts to JSON for display and export.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Temporal(t) => serde_json::Value::String(t.format()),
            Value::Blob(b) => serde_json::Value::from(b.clone()),
            Value::Structured(v) => v.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Temporal(t) => write!(f, "{}", t),
            Value::Blob(b) => write!(f, "<BLOB: {} bytes>", b.len()),
            Value::Structured(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Temporal> for Value {
    fn from(v: Temporal) -> Self {
        Value::Temporal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Temporal(Temporal::date(v))
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Temporal(Temporal::datetime(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Structured(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_from_timestamp() {
        let t = Temporal::from_timestamp(1_700_000_000.0, false).unwrap();
        assert_eq!(t.format(), "2023-11-14 22:13:20");
        assert!(!t.is_date_only());

        let d = Temporal::from_timestamp(1_700_000_000.0, true).unwrap();
        assert_eq!(d.format(), "2023-11-14");

        let fractional = Temporal::from_timestamp(1_700_000_000.25, false).unwrap();
        assert_eq!(fractional.format(), "2023-11-14 22:13:20.250");

        assert!(Temporal::from_timestamp(f64::NAN, false).is_none());
    }

    #[test]
    fn test_temporal_parse_variants() {
        let iso = Temporal::parse("2024-03-01T10:30:00").unwrap();
        assert_eq!(iso.format(), "2024-03-01 10:30:00");

        let spaced = Temporal::parse("2024-03-01 10:30").unwrap();
        assert_eq!(spaced.format(), "2024-03-01 10:30:00");

        let date_only = Temporal::parse("2024-03-01").unwrap();
        assert!(date_only.is_date_only());
        assert_eq!(date_only.format(), "2024-03-01");

        let us = Temporal::parse("03-01-2024").unwrap();
        assert_eq!(us.format(), "2024-03-01");

        let us_slash = Temporal::parse("03/01/2024 08:15:00").unwrap();
        assert_eq!(us_slash.format(), "2024-03-01 08:15:00");

        let rfc = Temporal::parse("2024-03-01T10:30:00+02:00").unwrap();
        assert_eq!(rfc.format(), "2024-03-01 08:30:00");

        let named = Temporal::parse("March 1, 2024").unwrap();
        assert_eq!(named.format(), "2024-03-01");

        assert!(Temporal::parse("today").unwrap().is_date_only());
        assert!(Temporal::parse("not a date").is_none());
        assert!(Temporal::parse("   ").is_none());
    }

    #[test]
    fn test_now_is_utc() {
        let before = Utc::now().timestamp();
        let now = Temporal::now(false).timestamp();
        let after = Utc::now().timestamp();
        assert!(before <= now && now <= after);
    }

    #[test]
    fn test_date_only_truncates_time() {
        let t = Temporal::parse("2024-03-01 10:30:00").unwrap().with_date_only(true);
        assert_eq!(t.format(), "2024-03-01");
        assert_eq!(t.naive().time(), NaiveTime::MIN);
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from(serde_json::json!(3)), Value::Int(3));
        assert_eq!(Value::from(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(serde_json::json!("x")), Value::Text("x".into()));
        assert!(matches!(
            Value::from(serde_json::json!({"a": 1})),
            Value::Structured(_)
        ));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(Value::from("O'Brien").to_sql_literal(), "'O''Brien'");
        assert_eq!(Value::Null.to_sql_literal(), "NULL");
    }
}
