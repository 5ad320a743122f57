//! Conversion between Rust field types and [`SqlValue`]
//!
//! Entity accessors are typed; the engine moves values around as `SqlValue`.
//! `FieldValue` is the bridge, implemented for the scalar types an entity
//! field can hold.

use super::value::SqlValue;
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

/// A Rust type that can be stored in a persisted field
pub trait FieldValue: Sized + Send + Sync + 'static {
    fn to_sql_value(&self) -> SqlValue;

    fn from_sql_value(value: SqlValue) -> Result<Self>;
}

fn mismatch<T>(value: &SqlValue, target: &str) -> Result<T> {
    Err(Error::conversion(format!(
        "cannot convert {} value '{}' into {}",
        value.type_name(),
        value,
        target
    )))
}

impl FieldValue for SqlValue {
    fn to_sql_value(&self) -> SqlValue {
        self.clone()
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        Ok(value)
    }
}

impl FieldValue for bool {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Bool(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value.as_bool() {
            Some(b) => Ok(b),
            None => mismatch(&value, "bool"),
        }
    }
}

macro_rules! integral_field_value {
    ($ty:ty, $variant:ident) => {
        impl FieldValue for $ty {
            fn to_sql_value(&self) -> SqlValue {
                SqlValue::$variant((*self).into())
            }

            fn from_sql_value(value: SqlValue) -> Result<Self> {
                match value.as_i64().and_then(|i| <$ty>::try_from(i).ok()) {
                    Some(v) => Ok(v),
                    None => mismatch(&value, stringify!($ty)),
                }
            }
        }
    };
}

integral_field_value!(i16, SmallInt);
integral_field_value!(i32, Int);
integral_field_value!(i64, BigInt);
integral_field_value!(u32, BigInt);

impl FieldValue for f32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Float(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value.as_f64() {
            Some(f) => Ok(f as f32),
            None => mismatch(&value, "f32"),
        }
    }
}

impl FieldValue for f64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Double(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value.as_f64() {
            Some(f) => Ok(f),
            None => mismatch(&value, "f64"),
        }
    }
}

impl FieldValue for Decimal {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Decimal(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value.as_decimal() {
            Some(d) => Ok(d),
            None => mismatch(&value, "Decimal"),
        }
    }
}

impl FieldValue for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::String(self.clone())
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value {
            SqlValue::String(s) => Ok(s),
            SqlValue::Null => mismatch(&value, "String"),
            SqlValue::Bytes(b) => String::from_utf8(b)
                .map_err(|e| Error::conversion(format!("invalid UTF-8 text: {}", e))),
            other => Ok(other.to_string()),
        }
    }
}

impl FieldValue for Vec<u8> {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Bytes(self.clone())
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value {
            SqlValue::Bytes(b) => Ok(b),
            SqlValue::String(s) => Ok(s.into_bytes()),
            other => mismatch(&other, "bytes"),
        }
    }
}

impl FieldValue for NaiveDate {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Date(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value {
            SqlValue::Date(d) => Ok(d),
            SqlValue::Timestamp(ts) => Ok(ts.date()),
            other => mismatch(&other, "NaiveDate"),
        }
    }
}

impl FieldValue for NaiveTime {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Time(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value {
            SqlValue::Time(t) => Ok(t),
            SqlValue::Timestamp(ts) => Ok(ts.time()),
            other => mismatch(&other, "NaiveTime"),
        }
    }
}

impl FieldValue for NaiveDateTime {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Timestamp(*self)
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match value {
            SqlValue::Timestamp(ts) => Ok(ts),
            SqlValue::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            other => mismatch(&other, "NaiveDateTime"),
        }
    }
}

impl FieldValue for DateTime<Utc> {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Timestamp(self.naive_utc())
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        NaiveDateTime::from_sql_value(value).map(|ts| ts.and_utc())
    }
}

impl FieldValue for uuid::Uuid {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::String(self.to_string())
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        match &value {
            SqlValue::String(s) => uuid::Uuid::parse_str(s)
                .map_err(|e| Error::conversion(format!("invalid UUID '{}': {}", s, e))),
            SqlValue::Bytes(b) => uuid::Uuid::from_slice(b)
                .map_err(|e| Error::conversion(format!("invalid UUID bytes: {}", e))),
            _ => mismatch(&value, "Uuid"),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(v) => v.to_sql_value(),
            None => SqlValue::Null,
        }
    }

    fn from_sql_value(value: SqlValue) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_sql_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_only_fits_optional() {
        assert!(i64::from_sql_value(SqlValue::Null).is_err());
        assert_eq!(Option::<i64>::from_sql_value(SqlValue::Null).unwrap(), None);
        assert_eq!(
            Option::<i64>::from_sql_value(SqlValue::Int(9)).unwrap(),
            Some(9)
        );
    }

    #[test]
    fn test_narrowing_checks_range() {
        assert!(i16::from_sql_value(SqlValue::BigInt(70_000)).is_err());
        assert_eq!(i32::from_sql_value(SqlValue::BigInt(70_000)).unwrap(), 70_000);
    }

    #[test]
    fn test_uuid_as_text() {
        let id = uuid::Uuid::new_v4();
        let stored = id.to_sql_value();
        assert!(matches!(stored, SqlValue::String(_)));
        assert_eq!(uuid::Uuid::from_sql_value(stored).unwrap(), id);
    }
}
