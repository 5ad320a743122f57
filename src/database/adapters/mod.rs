//! sqlx-backed data sources, one per supported backend

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mysql::{MySqlDataSource, MySqlPooledConnection};
pub use postgres::{PostgresDataSource, PostgresPooledConnection};
pub use sqlite::{SqliteDataSource, SqlitePooledConnection};

use crate::database::adapter::DataSource;
use crate::database::config::DataSourceConfig;
use crate::dialects::DatabaseBackend;
use crate::error::{Error, Result};
use crate::schema::NamingRules;
use sqlx::pool::PoolOptions;
use std::sync::Arc;
use std::time::Duration;

/// Build the data source for a configuration, picking the backend from its URL
///
/// Pools connect lazily; use [`DataSource::test_connection`] to check the
/// database is reachable.
pub fn create_data_source(config: &DataSourceConfig) -> Result<Arc<dyn DataSource>> {
    config.validate()?;
    let data_source: Arc<dyn DataSource> = match config.backend()? {
        DatabaseBackend::MySQL => Arc::new(MySqlDataSource::new(config)?),
        DatabaseBackend::Postgres => Arc::new(PostgresDataSource::new(config)?),
        DatabaseBackend::SQLite => Arc::new(SqliteDataSource::new(config)?),
    };
    log::info!(
        "Created {} data source '{}' ({})",
        data_source.backend(),
        config.name,
        config.sanitized_url()
    );
    Ok(data_source)
}

pub(crate) fn pool_options<DB: sqlx::Database>(config: &DataSourceConfig) -> PoolOptions<DB> {
    let seconds = |s: u64| (s > 0).then(|| Duration::from_secs(s));
    PoolOptions::<DB>::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout))
        .idle_timeout(seconds(config.idle_timeout))
        .max_lifetime(seconds(config.max_lifetime))
}

pub(crate) fn naming_rules(config: &DataSourceConfig) -> NamingRules {
    NamingRules::new(config.all_objects_in_lowercase, config.schema.clone())
}

pub(crate) fn decode_error(index: usize, e: sqlx::Error) -> Error {
    Error::conversion(format!("failed to decode column {}: {}", index, e))
}

pub(crate) fn unsupported_column(index: usize, type_name: &str) -> Error {
    Error::conversion(format!(
        "column {} has unsupported database type {}",
        index, type_name
    ))
}
