//! SQLite data source
//!
//! SQLite reports the storage class of each value rather than the declared
//! column type, so rows are decoded by storage class and left to the column
//! type policies to coerce.

use super::{decode_error, naming_rules, pool_options};
use crate::database::adapter::{DataSource, Row, SqlConnection};
use crate::database::config::DataSourceConfig;
use crate::database::types::SqlValue;
use crate::dialects::{create_dialect, BindValue, DatabaseBackend, SqlDialect};
use crate::error::{Error, Result};
use crate::schema::NamingRules;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Either, Row as _, Sqlite, SqlitePool, TypeInfo, ValueRef};
use std::sync::Arc;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub struct SqliteDataSource {
    name: String,
    pool: SqlitePool,
    dialect: Arc<dyn SqlDialect>,
}

impl SqliteDataSource {
    pub fn new(config: &DataSourceConfig) -> Result<Self> {
        let pool = pool_options::<Sqlite>(config)
            .connect_lazy(&config.url)
            .map_err(|e| Error::driver(&config.name, "creating connection pool", e))?;
        Ok(Self::from_pool(&config.name, pool, naming_rules(config)))
    }

    /// Wrap an existing pool
    pub fn from_pool(name: impl Into<String>, pool: SqlitePool, rules: NamingRules) -> Self {
        Self {
            name: name.into(),
            pool,
            dialect: create_dialect(DatabaseBackend::SQLite, rules),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for SqliteDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::SQLite
    }

    fn dialect(&self) -> Arc<dyn SqlDialect> {
        self.dialect.clone()
    }

    async fn get_connection(&self) -> Result<Box<dyn SqlConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::driver(&self.name, "acquiring connection", e))?;
        Ok(Box::new(SqlitePooledConnection {
            data_source: self.name.clone(),
            conn,
        }))
    }

    async fn terminate(&self) {
        self.pool.close().await;
        log::info!("Terminated SQLite data source '{}'", self.name);
    }

    fn is_terminated(&self) -> bool {
        self.pool.is_closed()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct SqlitePooledConnection {
    data_source: String,
    conn: PoolConnection<Sqlite>,
}

fn bind_value<'q>(query: SqliteQuery<'q>, param: &BindValue) -> SqliteQuery<'q> {
    match &param.value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::SmallInt(i) => query.bind(*i),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::BigInt(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Double(f) => query.bind(*f),
        // No native decimal storage class
        SqlValue::Decimal(d) => query.bind(d.to_string()),
        SqlValue::String(s) => query.bind(s.clone()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Time(t) => query.bind(*t),
        SqlValue::Timestamp(ts) => query.bind(*ts),
    }
}

fn decode_column(row: &SqliteRow, index: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(index).map_err(|e| decode_error(index, e))?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let storage_class = raw.type_info().name().to_string();
    let value = match storage_class.as_str() {
        "INTEGER" | "BOOLEAN" => SqlValue::BigInt(
            row.try_get_unchecked::<i64, _>(index)
                .map_err(|e| decode_error(index, e))?,
        ),
        "REAL" => SqlValue::Double(
            row.try_get_unchecked::<f64, _>(index)
                .map_err(|e| decode_error(index, e))?,
        ),
        "BLOB" => SqlValue::Bytes(
            row.try_get_unchecked::<Vec<u8>, _>(index)
                .map_err(|e| decode_error(index, e))?,
        ),
        _ => SqlValue::String(
            row.try_get_unchecked::<String, _>(index)
                .map_err(|e| decode_error(index, e))?,
        ),
    };
    log::trace!("Decoded column {} ({}) as {:?}", index, storage_class, value);
    Ok(value)
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
    (0..row.len()).map(|index| decode_column(row, index)).collect()
}

impl SqlitePooledConnection {
    fn query<'q>(sql: &'q str, params: &[BindValue]) -> SqliteQuery<'q> {
        log::trace!("SQLite bind: {:?}", params);
        params
            .iter()
            .fold(sqlx::query(sql), |query, param| bind_value(query, param))
    }

    fn driver_error(&self, context: &str, e: sqlx::Error) -> Error {
        log::error!("SQLite error on '{}' while {}: {}", self.data_source, context, e);
        Error::driver(&self.data_source, context, e)
    }
}

#[async_trait]
impl SqlConnection for SqlitePooledConnection {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::SQLite
    }

    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64> {
        let result = Self::query(sql, params)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| self.driver_error("executing statement", e))?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[BindValue]) -> Result<Vec<Row>> {
        let rows = Self::query(sql, params)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| self.driver_error("fetching rows", e))?;
        rows.iter().map(decode_row).collect()
    }

    async fn fetch_result_sets(
        &mut self,
        sql: &str,
        params: &[BindValue],
    ) -> Result<Vec<Vec<Row>>> {
        let mut sets = Vec::new();
        let mut current = Vec::new();
        let outcome: std::result::Result<(), sqlx::Error> = async {
            #[allow(deprecated)]
            let mut stream = Self::query(sql, params).fetch_many(&mut *self.conn);
            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(_) => sets.push(std::mem::take(&mut current)),
                    Either::Right(row) => current.push(row),
                }
            }
            Ok(())
        }
        .await;
        outcome.map_err(|e| self.driver_error("fetching result sets", e))?;
        if !current.is_empty() {
            sets.push(current);
        }
        sets.iter()
            .map(|set| set.iter().map(decode_row).collect())
            .collect()
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<u64> {
        log::debug!("SQLite raw: {}", sql);
        let result = sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| self.driver_error("executing raw statement", e))?;
        Ok(result.rows_affected())
    }

    fn close_on_drop(&mut self) {
        self.conn.close_on_drop();
    }
}
