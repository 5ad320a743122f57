//! Dynamic data source manager
//!
//! Keeps named data sources that can be configured, replaced and terminated
//! while the application runs. Lookups take the read lock; configuration
//! changes take the write lock. Pools are closed outside the lock because
//! closing waits for checked-out connections to come back.

use crate::database::adapter::{DataSource, Row, SqlConnection};
use crate::database::adapters::create_data_source;
use crate::database::config::{DataSourceConfig, DataSourcesConfig};
use crate::error::{Error, Result};
use crate::session::DatabaseSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of data sources configured at runtime
pub struct DynamicDataSourceManager {
    data_sources: Arc<RwLock<HashMap<String, Arc<dyn DataSource>>>>,
}

impl DynamicDataSourceManager {
    pub fn new() -> Self {
        Self {
            data_sources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create and register a data source
    ///
    /// Fails with [`Error::AlreadyConfigured`] if the name is taken.
    pub async fn configure(&self, config: &DataSourceConfig) -> Result<()> {
        let mut data_sources = self.data_sources.write().await;
        if data_sources.contains_key(&config.name) {
            return Err(Error::AlreadyConfigured(config.name.clone()));
        }
        let data_source = create_data_source(config)?;
        data_sources.insert(config.name.clone(), data_source);
        log::info!("Configured data source '{}'", config.name);
        Ok(())
    }

    /// Register every data source of a loaded configuration file
    pub async fn configure_all(&self, configs: &DataSourcesConfig) -> Result<()> {
        for config in configs.iter() {
            self.configure(config).await?;
        }
        Ok(())
    }

    /// Replace the data source registered under the config's name
    ///
    /// Returns false, and registers nothing, if the name is not configured.
    /// The replaced pool is terminated once the new one is in place.
    pub async fn reconfigure(&self, config: &DataSourceConfig) -> Result<bool> {
        let replaced = {
            let mut data_sources = self.data_sources.write().await;
            if !data_sources.contains_key(&config.name) {
                return Ok(false);
            }
            let data_source = create_data_source(config)?;
            data_sources.insert(config.name.clone(), data_source)
        };
        if let Some(old) = replaced {
            old.terminate().await;
        }
        log::info!("Reconfigured data source '{}'", config.name);
        Ok(true)
    }

    /// Unregister and terminate a data source
    pub async fn terminate_configuration(&self, name: &str) -> Result<()> {
        let removed = self.data_sources.write().await.remove(name);
        match removed {
            Some(data_source) => {
                data_source.terminate().await;
                Ok(())
            }
            None => Err(Error::UnknownConfiguration(name.to_string())),
        }
    }

    /// Unregister and terminate every data source
    pub async fn terminate_all(&self) {
        let drained: Vec<_> = self.data_sources.write().await.drain().collect();
        for (name, data_source) in drained {
            log::debug!("Terminating data source '{}'", name);
            data_source.terminate().await;
        }
    }

    /// Check a configuration can connect, without registering it
    pub async fn test_configuration(&self, config: &DataSourceConfig) -> Result<()> {
        let data_source = create_data_source(config)?;
        let result = data_source.test_connection().await;
        data_source.terminate().await;
        result
    }

    /// Run a query against a throwaway data source and count the rows
    pub async fn test_native_query(&self, config: &DataSourceConfig, sql: &str) -> Result<usize> {
        let data_source = create_data_source(config)?;
        let result = data_source.test_native_query(sql).await;
        data_source.terminate().await;
        result
    }

    /// Run an update against a throwaway data source and count the affected rows
    pub async fn test_native_update(&self, config: &DataSourceConfig, sql: &str) -> Result<u64> {
        let data_source = create_data_source(config)?;
        let result = data_source.test_native_update(sql).await;
        data_source.terminate().await;
        result
    }

    pub async fn is_configured(&self, name: &str) -> bool {
        self.data_sources.read().await.contains_key(name)
    }

    pub async fn data_source_count(&self) -> usize {
        self.data_sources.read().await.len()
    }

    /// Names of the registered data sources, sorted
    pub async fn data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.data_sources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn data_source(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        self.data_sources
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownConfiguration(name.to_string()))
    }

    pub async fn get_connection(&self, name: &str) -> Result<Box<dyn SqlConnection>> {
        self.data_source(name).await?.get_connection().await
    }

    /// Hand a connection back to the data source it came from
    pub async fn restore_connection(
        &self,
        name: &str,
        connection: Box<dyn SqlConnection>,
    ) -> Result<()> {
        self.data_source(name)
            .await?
            .restore_connection(connection)
            .await;
        Ok(())
    }

    /// Run a native query on a registered data source
    pub async fn rows(&self, name: &str, sql: &str) -> Result<Vec<Row>> {
        self.data_source(name).await?.native_query(sql).await
    }

    /// Open a session on a registered data source
    pub async fn open_session(&self, name: &str) -> Result<DatabaseSession> {
        DatabaseSession::open(self.data_source(name).await?).await
    }
}

impl Default for DynamicDataSourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::types::SqlValue;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir, name: &str) -> DataSourceConfig {
        let path = dir.path().join(format!("{}.db", name));
        DataSourceConfig::builder(name)
            .url(format!("sqlite://{}?mode=rwc", path.display()))
            .max_connections(2)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let manager = DynamicDataSourceManager::new();
        assert_eq!(manager.data_source_count().await, 0);
        assert!(!manager.is_configured("main").await);
        assert!(manager.data_source_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_configure_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let manager = DynamicDataSourceManager::new();
        let config = sqlite_config(&dir, "main");

        manager.configure(&config).await.unwrap();
        let err = manager.configure(&config).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConfigured(ref name) if name == "main"));
        assert_eq!(manager.data_source_count().await, 1);

        manager.terminate_all().await;
    }

    #[tokio::test]
    async fn test_reconfigure_only_known_names() {
        let dir = TempDir::new().unwrap();
        let manager = DynamicDataSourceManager::new();
        let config = sqlite_config(&dir, "main");

        assert!(!manager.reconfigure(&config).await.unwrap());
        assert!(!manager.is_configured("main").await);

        manager.configure(&config).await.unwrap();
        let before = manager.data_source("main").await.unwrap();
        assert!(manager.reconfigure(&config).await.unwrap());
        let after = manager.data_source("main").await.unwrap();

        assert!(before.is_terminated());
        assert!(!after.is_terminated());
        manager.terminate_all().await;
    }

    #[tokio::test]
    async fn test_terminate_unknown_configuration() {
        let manager = DynamicDataSourceManager::new();
        let err = manager.terminate_configuration("missing").await.unwrap_err();
        assert!(matches!(err, Error::UnknownConfiguration(ref name) if name == "missing"));
        assert!(manager.get_connection("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_all_empties_registry() {
        let dir = TempDir::new().unwrap();
        let manager = DynamicDataSourceManager::new();
        manager.configure(&sqlite_config(&dir, "a")).await.unwrap();
        manager.configure(&sqlite_config(&dir, "b")).await.unwrap();
        assert_eq!(manager.data_source_names().await, vec!["a", "b"]);

        let a = manager.data_source("a").await.unwrap();
        manager.terminate_all().await;

        assert_eq!(manager.data_source_count().await, 0);
        assert!(a.is_terminated());
    }

    #[tokio::test]
    async fn test_throwaway_checks() {
        let dir = TempDir::new().unwrap();
        let manager = DynamicDataSourceManager::new();
        let config = sqlite_config(&dir, "scratch");

        manager.test_configuration(&config).await.unwrap();
        assert_eq!(
            manager
                .test_native_update(&config, "CREATE TABLE scratch (id INTEGER)")
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            manager
                .test_native_update(&config, "INSERT INTO scratch (id) VALUES (1), (2)")
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            manager
                .test_native_query(&config, "SELECT id FROM scratch")
                .await
                .unwrap(),
            2
        );
        assert!(!manager.is_configured("scratch").await);
    }

    #[tokio::test]
    async fn test_connection_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = DynamicDataSourceManager::new();
        manager.configure(&sqlite_config(&dir, "main")).await.unwrap();

        let mut connection = manager.get_connection("main").await.unwrap();
        let rows = connection.fetch_all("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows, vec![vec![SqlValue::BigInt(1)]]);
        manager.restore_connection("main", connection).await.unwrap();

        let rows = manager.rows("main", "SELECT 2").await.unwrap();
        assert_eq!(rows.len(), 1);
        manager.terminate_configuration("main").await.unwrap();
        assert!(!manager.is_configured("main").await);
    }
}
