//! Logical column types
//!
//! Every persisted field declares one of these. Dialects map each variant to a
//! [`SqlDataTypePolicy`](super::SqlDataTypePolicy) that knows the DDL spelling
//! and how values travel to and from the driver.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Short,
    Integer,
    Long,
    Float,
    Double,
    Decimal,
    /// Variable length string bounded by the field length
    String,
    /// Fixed length string
    Char,
    /// Unbounded character data
    Text,
    Blob,
    Date,
    Time,
    Timestamp,
    /// Timestamp holding UTC wall time
    TimestampUtc,
}

impl ColumnType {
    pub const ALL: [ColumnType; 15] = [
        ColumnType::Boolean,
        ColumnType::Short,
        ColumnType::Integer,
        ColumnType::Long,
        ColumnType::Float,
        ColumnType::Double,
        ColumnType::Decimal,
        ColumnType::String,
        ColumnType::Char,
        ColumnType::Text,
        ColumnType::Blob,
        ColumnType::Date,
        ColumnType::Time,
        ColumnType::Timestamp,
        ColumnType::TimestampUtc,
    ];

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            ColumnType::Short | ColumnType::Integer | ColumnType::Long
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integral()
            || matches!(
                self,
                ColumnType::Float | ColumnType::Double | ColumnType::Decimal
            )
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            ColumnType::String | ColumnType::Char | ColumnType::Text
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ColumnType::Date | ColumnType::Time | ColumnType::Timestamp | ColumnType::TimestampUtc
        )
    }

    /// Types whose DDL spelling takes a length argument
    pub fn is_sized(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Char)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
