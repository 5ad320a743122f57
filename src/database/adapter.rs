//! Connection and data source abstractions
//!
//! The engine talks to the database through two traits. A [`DataSource`]
//! owns a pool and the dialect matching its backend; a [`SqlConnection`] is
//! one pooled connection checked out of it. Sessions hold a connection for
//! their whole unit of work and hand it back through
//! [`DataSource::restore_connection`].

use crate::database::types::SqlValue;
use crate::dialects::{BindValue, DatabaseBackend, SqlDialect};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// One decoded result row, in select-list order
pub type Row = Vec<SqlValue>;

/// A connection checked out of a data source pool
#[async_trait]
pub trait SqlConnection: Send {
    /// Name of the data source the connection belongs to
    fn data_source(&self) -> &str;

    fn backend(&self) -> DatabaseBackend;

    /// Run a statement and return the number of rows affected
    async fn execute(&mut self, sql: &str, params: &[BindValue]) -> Result<u64>;

    /// Run a query and decode every row
    async fn fetch_all(&mut self, sql: &str, params: &[BindValue]) -> Result<Vec<Row>>;

    /// Run a statement that may produce several result sets
    ///
    /// Every result set is read to the end before this returns, so values
    /// that only become visible afterwards (OUT parameters) can be queried
    /// next on the same connection.
    async fn fetch_result_sets(&mut self, sql: &str, params: &[BindValue])
        -> Result<Vec<Vec<Row>>>;

    /// Run unprepared SQL, used for transaction control
    async fn execute_raw(&mut self, sql: &str) -> Result<u64>;

    /// Close the connection instead of returning it to the pool when dropped
    fn close_on_drop(&mut self);
}

/// A named, pooled source of connections for one database
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> DatabaseBackend;

    fn dialect(&self) -> Arc<dyn SqlDialect>;

    async fn get_connection(&self) -> Result<Box<dyn SqlConnection>>;

    /// Roll back pending work and return the connection to the pool
    ///
    /// A connection whose rollback fails is closed rather than pooled.
    async fn restore_connection(&self, mut connection: Box<dyn SqlConnection>) {
        let rollback = self.dialect().rollback_sql();
        if let Err(e) = connection.execute_raw(&rollback).await {
            log::warn!(
                "Discarding connection of data source '{}' after failed rollback: {}",
                self.name(),
                e
            );
            connection.close_on_drop();
        }
    }

    /// Check a connection can be obtained and answers the dialect's test query
    async fn test_connection(&self) -> Result<()> {
        let mut connection = self.get_connection().await?;
        let sql = self.dialect().generate_test_sql();
        connection.fetch_all(&sql, &[]).await?;
        Ok(())
    }

    /// Run a native query and return its rows
    async fn native_query(&self, sql: &str) -> Result<Vec<Row>> {
        let mut connection = self.get_connection().await?;
        connection.fetch_all(sql, &[]).await
    }

    /// Run a native query and return the number of rows it produced
    async fn test_native_query(&self, sql: &str) -> Result<usize> {
        Ok(self.native_query(sql).await?.len())
    }

    /// Run a native update and return the number of rows affected
    async fn test_native_update(&self, sql: &str) -> Result<u64> {
        let mut connection = self.get_connection().await?;
        connection.execute(sql, &[]).await
    }

    /// Close the pool; connections still checked out close when returned
    async fn terminate(&self);

    fn is_terminated(&self) -> bool;

    fn as_any(&self) -> &dyn std::any::Any;
}
