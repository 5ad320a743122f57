//! sqlweave - schema-driven, dialect-portable SQL persistence
//!
//! sqlweave maps plain Rust structs onto relational tables and views and
//! runs portable queries against MySQL, PostgreSQL and SQLite:
//! - Entity schemas declared once, with owned children, constraints and views
//! - Backend-neutral criteria translated per dialect
//! - Per-dialect column type policies
//! - Sessions with cascading writes, optimistic locking and savepoints
//! - Data sources that can be configured and replaced at runtime

// Enforce error handling best practices
#![cfg_attr(
    not(test),
    warn(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
    )
)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used,))]

pub mod callable;
pub mod criteria;
pub mod database;
pub mod dialects;
pub mod error;
pub mod executor;
pub mod schema;
pub mod session;

// Re-export main types for public API
pub use callable::{CallableProc, CallableResult, ParameterMode};
pub use criteria::{
    AggregateFunction, AggregateType, Aggregation, Criteria, GroupAggregation, OrderDirection,
    Query, Restriction, RestrictionType, Update,
};
pub use database::{
    create_data_source, ColumnType, DataSource, DataSourceConfig, DataSourcesConfig,
    DynamicDataSourceManager, FieldValue, SqlConnection, SqlValue,
};
pub use dialects::{create_dialect, DatabaseBackend, SqlDialect, SqlStatement};
pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use schema::{Entity, EntityDef, EntityPolicy, EntityRegistry, EntitySchema, NamingRules};
pub use session::DatabaseSession;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::*;
    pub use crate::schema::{
        EntityRecord, FieldTransformer, NoopEntityPolicy, SequencedEntityPolicy, UuidEntityPolicy,
    };
    pub use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    pub use rust_decimal::Decimal;
    pub use uuid::Uuid;
}
