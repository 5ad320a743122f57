//! Data source layer
//!
//! Connection and data source traits, the sqlx-backed implementations for
//! each backend, data source configuration, the runtime data source manager
//! and the value/type-policy system shared with the dialects.

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod registry;
pub mod types;

pub use adapter::{DataSource, Row, SqlConnection};
pub use adapters::{create_data_source, MySqlDataSource, PostgresDataSource, SqliteDataSource};
pub use config::{DataSourceConfig, DataSourceConfigBuilder, DataSourcesConfig};
pub use registry::DynamicDataSourceManager;
pub use types::{ColumnType, FieldValue, SqlDataTypePolicy, SqlValue};
