//! MySQL/MariaDB data source

use super::{decode_error, naming_rules, pool_options, unsupported_column};
use crate::database::adapter::{DataSource, Row, SqlConnection};
use crate::database::config::DataSourceConfig;
use crate::database::types::SqlValue;
use crate::dialects::{create_dialect, BindValue, DatabaseBackend, SqlDialect};
use crate::error::{Error, Result};
use crate::schema::NamingRules;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Either, MySql, MySqlPool, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

pub struct MySqlDataSource {
    name: String,
    pool: MySqlPool,
    dialect: Arc<dyn SqlDialect>,
}

impl MySqlDataSource {
    pub fn new(config: &DataSourceConfig) -> Result<Self> {
        let pool = pool_options::<MySql>(config)
            .connect_lazy(&config.url)
            .map_err(|e| Error::driver(&config.name, "creating connection pool", e))?;
        Ok(Self::from_pool(&config.name, pool, naming_rules(config)))
    }

    /// Wrap an existing pool
    pub fn from_pool(name: impl Into<String>, pool: MySqlPool, rules: NamingRules) -> Self {
        Self {
            name: name.into(),
            pool,
            dialect: create_dialect(DatabaseBackend::MySQL, rules),
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for MySqlDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::MySQL
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
        Ok(Box::new(MySqlPooledConnection {
            data_source: self.name.clone(),
            conn,
        }))
    }

    async fn terminate(&self) {
        self.pool.close().await;
        log::info!("Terminated MySQL data source '{}'", self.name);
    }

    fn is_terminated(&self) -> bool {
        self.pool.is_closed()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct MySqlPooledConnection {
    data_source: String,
    conn: PoolConnection<MySql>,
}

fn bind_value<'q>(query: MySqlQuery<'q>, param: &BindValue) -> MySqlQuery<'q> {
    match &param.value {
        SqlValue::Null => query.bind(None::<String>),
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

fn decode_column(row: &MySqlRow, index: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(index).map_err(|e| decode_error(index, e))?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let err = |e| decode_error(index, e);
    let value = match type_name.as_str() {
        "BOOLEAN" => SqlValue::Bool(row.try_get(index).map_err(err)?),
        "TINYINT" => SqlValue::SmallInt(i16::from(row.try_get::<i8, _>(index).map_err(err)?)),
        "SMALLINT" => SqlValue::SmallInt(row.try_get(index).map_err(err)?),
        "MEDIUMINT" | "INT" => SqlValue::Int(row.try_get(index).map_err(err)?),
        "BIGINT" => SqlValue::BigInt(row.try_get(index).map_err(err)?),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "YEAR" => SqlValue::BigInt(i64::from(
            row.try_get_unchecked::<u32, _>(index).map_err(err)?,
        )),
        "BIGINT UNSIGNED" => {
            let v: u64 = row.try_get(index).map_err(err)?;
            match i64::try_from(v) {
                Ok(v) => SqlValue::BigInt(v),
                Err(_) => SqlValue::Decimal(Decimal::from(v)),
            }
        }
        "FLOAT" => SqlValue::Float(row.try_get(index).map_err(err)?),
        "DOUBLE" => SqlValue::Double(row.try_get(index).map_err(err)?),
        "DECIMAL" => SqlValue::Decimal(row.try_get(index).map_err(err)?),
        "VARCHAR" | "CHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET"
        | "JSON" => SqlValue::String(row.try_get_unchecked(index).map_err(err)?),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            SqlValue::Bytes(row.try_get_unchecked(index).map_err(err)?)
        }
        "DATE" => SqlValue::Date(row.try_get(index).map_err(err)?),
        "TIME" => SqlValue::Time(row.try_get(index).map_err(err)?),
        "DATETIME" => SqlValue::Timestamp(row.try_get(index).map_err(err)?),
        "TIMESTAMP" => {
            let ts: DateTime<Utc> = row.try_get(index).map_err(err)?;
            SqlValue::Timestamp(ts.naive_utc())
        }
        other => return Err(unsupported_column(index, other)),
    };
    log::trace!("Decoded column {} ({}) as {:?}", index, type_name, value);
    Ok(value)
}

fn decode_row(row: &MySqlRow) -> Result<Row> {
    (0..row.len()).map(|index| decode_column(row, index)).collect()
}

impl MySqlPooledConnection {
    fn query<'q>(sql: &'q str, params: &[BindValue]) -> MySqlQuery<'q> {
        log::trace!("MySQL bind: {:?}", params);
        params
            .iter()
            .fold(sqlx::query(sql), |query, param| bind_value(query, param))
    }

    fn driver_error(&self, context: &str, e: sqlx::Error) -> Error {
        log::error!("MySQL error on '{}' while {}: {}", self.data_source, context, e);
        Error::driver(&self.data_source, context, e)
    }
}

#[async_trait]
impl SqlConnection for MySqlPooledConnection {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::MySQL
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

    /// A CALL yields one result per SELECT it runs and a trailing status result
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
        log::debug!("MySQL raw: {}", sql);
        let result = sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| self.driver_error("executing raw statement", e))?;
        Ok(result.rows_affected())
    }

    fn close_on_drop(&mut self) {
        self.conn.close_on_drop();
    }
}
