//! Column type policies
//!
//! A policy owns everything a dialect needs to know about one [`ColumnType`]:
//! how the column is spelled in DDL, how a value is prepared for binding and
//! how a raw driver value is coerced back into the logical representation.

use super::column::ColumnType;
use super::value::SqlValue;
use crate::error::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;

/// Marshaling policy for a single logical column type
pub trait SqlDataTypePolicy: Send + Sync + fmt::Debug {
    fn column_type(&self) -> ColumnType;

    /// Append the column type spelling, e.g. `VARCHAR(64)` or `DECIMAL(18,2)`
    fn append_type_sql(&self, sql: &mut String, length: u32, precision: u32, scale: u32);

    /// Append a ` DEFAULT ...` clause for the given SQL literal
    fn append_default_sql(&self, sql: &mut String, default: &str) {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }

    /// Prepare a logical value for binding
    fn bind(&self, value: &SqlValue) -> Result<SqlValue> {
        coerce(value.clone(), self.column_type())
    }

    /// Turn a raw driver value into the logical value
    fn read(&self, raw: SqlValue) -> Result<SqlValue> {
        coerce(raw, self.column_type())
    }
}

/// Coerce a value into the canonical `SqlValue` variant for a column type
pub fn coerce(value: SqlValue, column_type: ColumnType) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    // Drivers report some computed columns as binary strings
    let value = match value {
        SqlValue::Bytes(bytes) if column_type != ColumnType::Blob && !column_type.is_textual() => {
            match String::from_utf8(bytes) {
                Ok(text) => SqlValue::String(text),
                Err(e) => SqlValue::Bytes(e.into_bytes()),
            }
        }
        other => other,
    };

    let converted = match column_type {
        ColumnType::Boolean => value.as_bool().map(SqlValue::Bool),
        ColumnType::Short => value
            .as_i64()
            .and_then(|i| i16::try_from(i).ok())
            .map(SqlValue::SmallInt),
        ColumnType::Integer => value
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(SqlValue::Int),
        ColumnType::Long => value.as_i64().map(SqlValue::BigInt),
        ColumnType::Float => value.as_f64().map(|f| SqlValue::Float(f as f32)),
        ColumnType::Double => value.as_f64().map(SqlValue::Double),
        ColumnType::Decimal => value.as_decimal().map(SqlValue::Decimal),
        ColumnType::String | ColumnType::Char | ColumnType::Text => match &value {
            SqlValue::String(_) => Some(value.clone()),
            SqlValue::Bytes(b) => String::from_utf8(b.clone()).ok().map(SqlValue::String),
            other => Some(SqlValue::String(other.to_string())),
        },
        ColumnType::Blob => match &value {
            SqlValue::Bytes(_) => Some(value.clone()),
            SqlValue::String(s) => Some(SqlValue::Bytes(s.as_bytes().to_vec())),
            _ => None,
        },
        ColumnType::Date => match &value {
            SqlValue::Date(_) => Some(value.clone()),
            SqlValue::Timestamp(ts) => Some(SqlValue::Date(ts.date())),
            SqlValue::String(s) => parse_date(s).map(SqlValue::Date),
            _ => None,
        },
        ColumnType::Time => match &value {
            SqlValue::Time(_) => Some(value.clone()),
            SqlValue::Timestamp(ts) => Some(SqlValue::Time(ts.time())),
            SqlValue::String(s) => parse_time(s).map(SqlValue::Time),
            _ => None,
        },
        ColumnType::Timestamp | ColumnType::TimestampUtc => match &value {
            SqlValue::Timestamp(_) => Some(value.clone()),
            SqlValue::Date(d) => Some(SqlValue::Timestamp(d.and_time(NaiveTime::MIN))),
            SqlValue::String(s) => parse_timestamp(s).map(SqlValue::Timestamp),
            _ => None,
        },
    };

    converted.ok_or_else(|| {
        Error::conversion(format!(
            "cannot coerce {} value '{}' into column type {}",
            value.type_name(),
            value,
            column_type
        ))
    })
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok()
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Policy for types spelled as a bare name (`BIGINT`, `DATE`, `TEXT`, ...)
#[derive(Debug, Clone)]
pub struct PlainTypePolicy {
    column_type: ColumnType,
    type_name: &'static str,
}

impl PlainTypePolicy {
    pub fn new(column_type: ColumnType, type_name: &'static str) -> Self {
        Self {
            column_type,
            type_name,
        }
    }
}

impl SqlDataTypePolicy for PlainTypePolicy {
    fn column_type(&self) -> ColumnType {
        self.column_type
    }

    fn append_type_sql(&self, sql: &mut String, _length: u32, _precision: u32, _scale: u32) {
        sql.push_str(self.type_name);
    }
}

/// Policy for length-bounded character columns
#[derive(Debug, Clone)]
pub struct SizedStringPolicy {
    column_type: ColumnType,
    type_name: &'static str,
    default_length: u32,
}

impl SizedStringPolicy {
    pub fn new(column_type: ColumnType, type_name: &'static str) -> Self {
        Self {
            column_type,
            type_name,
            default_length: 255,
        }
    }
}

impl SqlDataTypePolicy for SizedStringPolicy {
    fn column_type(&self) -> ColumnType {
        self.column_type
    }

    fn append_type_sql(&self, sql: &mut String, length: u32, _precision: u32, _scale: u32) {
        let length = if length == 0 {
            self.default_length
        } else {
            length
        };
        sql.push_str(&format!("{}({})", self.type_name, length));
    }
}

/// Policy for exact numeric columns
///
/// When `bind_as_text` is set the value travels as its canonical decimal string
/// and the column is declared with the bare type name. Engines without a
/// native decimal storage class convert the text through the column affinity.
#[derive(Debug, Clone)]
pub struct DecimalPolicy {
    type_name: &'static str,
    bind_as_text: bool,
}

impl DecimalPolicy {
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            bind_as_text: false,
        }
    }

    pub fn as_text(type_name: &'static str) -> Self {
        Self {
            type_name,
            bind_as_text: true,
        }
    }
}

impl SqlDataTypePolicy for DecimalPolicy {
    fn column_type(&self) -> ColumnType {
        ColumnType::Decimal
    }

    fn append_type_sql(&self, sql: &mut String, _length: u32, precision: u32, scale: u32) {
        if self.bind_as_text {
            sql.push_str(self.type_name);
        } else if precision > 0 {
            sql.push_str(&format!("{}({},{})", self.type_name, precision, scale));
        } else {
            sql.push_str(self.type_name);
        }
    }

    fn bind(&self, value: &SqlValue) -> Result<SqlValue> {
        let decimal = coerce(value.clone(), ColumnType::Decimal)?;
        match decimal {
            SqlValue::Decimal(d) if self.bind_as_text => Ok(SqlValue::String(d.to_string())),
            other => Ok(other),
        }
    }
}
