//! PostgreSQL data source
//!
//! PostgreSQL checks parameter types strictly, so NULLs are bound with the
//! Rust type matching the column type of the parameter. Rows are decoded by
//! the type name the server reports for each column.

use super::{decode_error, naming_rules, pool_options, unsupported_column};
use crate::database::adapter::{DataSource, Row, SqlConnection};
use crate::database::config::DataSourceConfig;
use crate::database::types::{ColumnType, SqlValue};
use crate::dialects::{create_dialect, BindValue, DatabaseBackend, SqlDialect};
use crate::error::{Error, Result};
use crate::schema::NamingRules;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Either, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub struct PostgresDataSource {
    name: String,
    pool: PgPool,
    dialect: Arc<dyn SqlDialect>,
}

impl PostgresDataSource {
    pub fn new(config: &DataSourceConfig) -> Result<Self> {
        let pool = pool_options::<Postgres>(config)
            .connect_lazy(&config.url)
            .map_err(|e| Error::driver(&config.name, "creating connection pool", e))?;
        Ok(Self::from_pool(&config.name, pool, naming_rules(config)))
    }

    /// Wrap an existing pool
    pub fn from_pool(name: impl Into<String>, pool: PgPool, rules: NamingRules) -> Self {
        Self {
            name: name.into(),
            pool,
            dialect: create_dialect(DatabaseBackend::Postgres, rules),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for PostgresDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
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
        Ok(Box::new(PostgresPooledConnection {
            data_source: self.name.clone(),
            conn,
        }))
    }

    async fn terminate(&self) {
        self.pool.close().await;
        log::info!("Terminated PostgreSQL data source '{}'", self.name);
    }

    fn is_terminated(&self) -> bool {
        self.pool.is_closed()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct PostgresPooledConnection {
    data_source: String,
    conn: PoolConnection<Postgres>,
}

fn bind_null(query: PgQuery<'_>, column_type: Option<ColumnType>) -> PgQuery<'_> {
    match column_type {
        Some(ColumnType::Boolean) => query.bind(None::<bool>),
        Some(ColumnType::Short) => query.bind(None::<i16>),
        Some(ColumnType::Integer) => query.bind(None::<i32>),
        Some(ColumnType::Long) => query.bind(None::<i64>),
        Some(ColumnType::Float) => query.bind(None::<f32>),
        Some(ColumnType::Double) => query.bind(None::<f64>),
        Some(ColumnType::Decimal) => query.bind(None::<Decimal>),
        Some(ColumnType::Blob) => query.bind(None::<Vec<u8>>),
        Some(ColumnType::Date) => query.bind(None::<NaiveDate>),
        Some(ColumnType::Time) => query.bind(None::<NaiveTime>),
        Some(ColumnType::Timestamp) | Some(ColumnType::TimestampUtc) => {
            query.bind(None::<NaiveDateTime>)
        }
        Some(ColumnType::String) | Some(ColumnType::Char) | Some(ColumnType::Text) | None => {
            query.bind(None::<String>)
        }
    }
}

fn bind_value<'q>(query: PgQuery<'q>, param: &BindValue) -> PgQuery<'q> {
    match &param.value {
        SqlValue::Null => bind_null(query, param.column_type),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::SmallInt(i) => query.bind(*i),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::BigInt(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Double(f) => query.bind(*f),
        SqlValue::Decimal(d) => query.bind(*d),
        SqlValue::String(s) => query.bind(s.clone()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Time(t) => query.bind(*t),
        SqlValue::Timestamp(ts) => query.bind(*ts),
    }
}

fn decode_column(row: &PgRow, index: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(index).map_err(|e| decode_error(index, e))?;
    let type_name = raw.type_info().name().to_string();
    if raw.is_null() || type_name == "VOID" {
        return Ok(SqlValue::Null);
    }
    let err = |e| decode_error(index, e);
    let value = match type_name.as_str() {
        "BOOL" => SqlValue::Bool(row.try_get(index).map_err(err)?),
        "INT2" => SqlValue::SmallInt(row.try_get(index).map_err(err)?),
        "INT4" => SqlValue::Int(row.try_get(index).map_err(err)?),
        "INT8" => SqlValue::BigInt(row.try_get(index).map_err(err)?),
        "FLOAT4" => SqlValue::Float(row.try_get(index).map_err(err)?),
        "FLOAT8" => SqlValue::Double(row.try_get(index).map_err(err)?),
        "NUMERIC" => SqlValue::Decimal(row.try_get(index).map_err(err)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            SqlValue::String(row.try_get(index).map_err(err)?)
        }
        "BYTEA" => SqlValue::Bytes(row.try_get(index).map_err(err)?),
        "DATE" => SqlValue::Date(row.try_get(index).map_err(err)?),
        "TIME" => SqlValue::Time(row.try_get(index).map_err(err)?),
        "TIMESTAMP" => SqlValue::Timestamp(row.try_get(index).map_err(err)?),
        "TIMESTAMPTZ" => {
            let ts: DateTime<Utc> = row.try_get(index).map_err(err)?;
            SqlValue::Timestamp(ts.naive_utc())
        }
        "UUID" => {
            let id: uuid::Uuid = row.try_get(index).map_err(err)?;
            SqlValue::String(id.to_string())
        }
        other => return Err(unsupported_column(index, other)),
    };
    log::trace!("Decoded column {} ({}) as {:?}", index, type_name, value);
    Ok(value)
}

fn decode_row(row: &PgRow) -> Result<Row> {
    (0..row.len()).map(|index| decode_column(row, index)).collect()
}

impl PostgresPooledConnection {
    fn query<'q>(sql: &'q str, params: &[BindValue]) -> PgQuery<'q> {
        log::trace!("PostgreSQL bind: {:?}", params);
        params
            .iter()
            .fold(sqlx::query(sql), |query, param| bind_value(query, param))
    }

    fn driver_error(&self, context: &str, e: sqlx::Error) -> Error {
        log::error!(
            "PostgreSQL error on '{}' while {}: {}",
            self.data_source,
            context,
            e
        );
        Error::driver(&self.data_source, context, e)
    }
}

#[async_trait]
impl SqlConnection for PostgresPooledConnection {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
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
        log::debug!("PostgreSQL raw: {}", sql);
        let result = sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| self.driver_error("executing raw statement", e))?;
        Ok(result.rows_affected())
    }

    fn close_on_drop(&mut self) {
        self.conn.close_on_drop();
    }
}
