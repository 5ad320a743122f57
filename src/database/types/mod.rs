//! Unified type system for database operations
//!
//! Values ([`SqlValue`]), logical column types ([`ColumnType`]), the bridge to
//! Rust field types ([`FieldValue`]) and the per-column marshaling policies
//! that dialects register ([`SqlDataTypePolicy`]).

pub mod column;
pub mod convert;
pub mod policy;
pub mod value;

pub use column::ColumnType;
pub use convert::FieldValue;
pub use policy::{coerce, DecimalPolicy, PlainTypePolicy, SizedStringPolicy, SqlDataTypePolicy};
pub use value::SqlValue;

use std::collections::HashMap;
use std::sync::Arc;

/// Type policy lookup built once at dialect construction
pub type TypePolicyMap = HashMap<ColumnType, Arc<dyn SqlDataTypePolicy>>;
