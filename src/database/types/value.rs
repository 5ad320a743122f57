//! Unified SQL value type for all database operations
//!
//! `SqlValue` is the single currency between entity accessors, restriction
//! parameters, type policies and the drivers. Entity fields convert into it
//! through [`FieldValue`](super::FieldValue), and the drivers bind and decode it.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generic SQL value type for parameter binding and result extraction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,

    Bool(bool),

    // Integer variants (for precise type mapping)
    SmallInt(i16),
    Int(i32),
    BigInt(i64),

    // Floating point
    Float(f32),
    Double(f64),
    Decimal(Decimal),

    String(String),

    Bytes(Vec<u8>),

    // Temporal types, always without zone; UTC columns store UTC wall time
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Short variant name used in conversion errors
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Bool(_) => "BOOL",
            SqlValue::SmallInt(_) => "SMALLINT",
            SqlValue::Int(_) => "INT",
            SqlValue::BigInt(_) => "BIGINT",
            SqlValue::Float(_) => "FLOAT",
            SqlValue::Double(_) => "DOUBLE",
            SqlValue::Decimal(_) => "DECIMAL",
            SqlValue::String(_) => "STRING",
            SqlValue::Bytes(_) => "BYTES",
            SqlValue::Date(_) => "DATE",
            SqlValue::Time(_) => "TIME",
            SqlValue::Timestamp(_) => "TIMESTAMP",
        }
    }

    /// Convert to a boolean if possible
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::SmallInt(i) => Some(*i != 0),
            SqlValue::Int(i) => Some(*i != 0),
            SqlValue::BigInt(i) => Some(*i != 0),
            SqlValue::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Convert to an i64 if possible without losing information
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::SmallInt(i) => Some(i64::from(*i)),
            SqlValue::Int(i) => Some(i64::from(*i)),
            SqlValue::BigInt(i) => Some(*i),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            SqlValue::Double(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to an f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::SmallInt(i) => Some(f64::from(*i)),
            SqlValue::Int(i) => Some(f64::from(*i)),
            SqlValue::BigInt(i) => Some(*i as f64),
            SqlValue::Float(f) => Some(f64::from(*f)),
            SqlValue::Double(f) => Some(*f),
            SqlValue::Decimal(d) => d.to_f64(),
            SqlValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to a decimal if possible
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::SmallInt(i) => Some(Decimal::from(*i)),
            SqlValue::Int(i) => Some(Decimal::from(*i)),
            SqlValue::BigInt(i) => Some(Decimal::from(*i)),
            // Shortest round-trip text first, so a stored 0.1 reads back as 0.1
            SqlValue::Float(f) => f
                .to_string()
                .parse()
                .ok()
                .or_else(|| Decimal::from_f32_retain(*f)),
            SqlValue::Double(f) => f
                .to_string()
                .parse()
                .ok()
                .or_else(|| Decimal::from_f64_retain(*f)),
            SqlValue::Decimal(d) => Some(*d),
            SqlValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Borrow the text content, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value as an SQL literal
    ///
    /// Only used for DDL defaults and log output. Statements always bind values
    /// as parameters.
    pub fn to_sql_string(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            SqlValue::SmallInt(i) => i.to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::BigInt(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Double(f) => f.to_string(),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::String(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Bytes(b) => format!("X'{}'", hex_encode(b)),
            SqlValue::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
            SqlValue::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
            SqlValue::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::SmallInt(i) => write!(f, "{}", i),
            SqlValue::Int(i) => write!(f, "{}", i),
            SqlValue::BigInt(i) => write!(f, "{}", i),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Double(v) => write!(f, "{}", v),
            SqlValue::Decimal(d) => write!(f, "{}", d),
            SqlValue::String(s) => write!(f, "{}", s),
            SqlValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            SqlValue::Date(d) => write!(f, "{}", d),
            SqlValue::Time(t) => write!(f, "{}", t),
            SqlValue::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

// From trait implementations for common types
impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::SmallInt(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::BigInt(i64::from(v))
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        SqlValue::Float(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Double(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::String(s)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::String(s.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(s: &String) -> Self {
        SqlValue::String(s.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(date: NaiveDate) -> Self {
        SqlValue::Date(date)
    }
}

impl From<NaiveTime> for SqlValue {
    fn from(time: NaiveTime) -> Self {
        SqlValue::Time(time)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(ts: NaiveDateTime) -> Self {
        SqlValue::Timestamp(ts)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for SqlValue {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        SqlValue::Timestamp(dt.naive_utc())
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => SqlValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening() {
        assert_eq!(SqlValue::SmallInt(-3).as_i64(), Some(-3));
        assert_eq!(SqlValue::Decimal(Decimal::new(4200, 2)).as_i64(), Some(42));
        assert_eq!(SqlValue::Decimal(Decimal::new(4201, 2)).as_i64(), None);
        assert_eq!(SqlValue::String(" 17 ".into()).as_i64(), Some(17));
    }

    #[test]
    fn test_floats_become_their_shortest_decimal() {
        assert_eq!(SqlValue::Double(0.1).as_decimal(), Some(Decimal::new(1, 1)));
        assert_eq!(SqlValue::Double(99.5).as_decimal(), Some(Decimal::new(995, 1)));
        assert_eq!(SqlValue::Float(-1.25).as_decimal(), Some(Decimal::new(-125, 2)));
        assert_eq!(SqlValue::Double(f64::NAN).as_decimal(), None);
    }

    #[test]
    fn test_sql_literals_are_escaped() {
        assert_eq!(SqlValue::from("O'Brien").to_sql_string(), "'O''Brien'");
        assert_eq!(SqlValue::Bytes(vec![0xde, 0xad]).to_sql_string(), "X'DEAD'");
        assert_eq!(SqlValue::Null.to_sql_string(), "NULL");
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i32> = None;
        assert!(SqlValue::from(none).is_null());
        assert_eq!(SqlValue::from(Some(5i64)), SqlValue::BigInt(5));
    }
}
