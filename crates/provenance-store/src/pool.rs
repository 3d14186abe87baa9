//! Database connection pool management
//!
//! This module provides connection pooling for SQLite using SQLx's built-in
//! pooling capabilities with additional configuration and health checking.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Default maximum number of connections in the pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Configuration for the journal connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Database URL (e.g., sqlite://data/journal.db or sqlite::memory:)
    pub database_url: String,

    /// Maximum number of connections allowed in the pool
    pub max_connections: u32,

    /// Timeout for acquiring a connection
    pub connect_timeout: Duration,

    /// Create the database file when it does not exist
    pub create_if_missing: bool,

    /// Whether to enable SQL statement logging
    pub enable_logging: bool,
}

impl PoolConfig {
    /// Create a new pool configuration with sensible defaults
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            create_if_missing: true,
            enable_logging: false,
        }
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable SQL logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Whether the URL names a private in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    /// Validate the configuration
    pub fn validate(&self) -> StoreResult<()> {
        if self.database_url.is_empty() {
            return Err(StoreError::Configuration(
                "Database URL cannot be empty".to_string(),
            ));
        }

        if !self.database_url.starts_with("sqlite:") {
            return Err(StoreError::Configuration(format!(
                "Unsupported database URL '{}', expected a sqlite: URL",
                self.database_url
            )));
        }

        if self.max_connections == 0 {
            return Err(StoreError::Configuration(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new("sqlite://provenance.db")
    }
}

/// Create a SQLite connection pool from configuration
pub async fn create_pool(config: &PoolConfig) -> StoreResult<SqlitePool> {
    config.validate()?;

    info!(
        "Creating journal connection pool: max={}, database={}",
        config.max_connections, config.database_url
    );

    let mut connect_opts = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(|e| StoreError::Configuration(format!("Invalid database URL: {}", e)))?
        .create_if_missing(config.create_if_missing)
        .foreign_keys(true);

    if !config.is_in_memory() {
        connect_opts = connect_opts.journal_mode(SqliteJournalMode::Wal);
    }

    if !config.enable_logging {
        connect_opts = connect_opts.disable_statement_logging();
    }

    // Each connection to :memory: opens its own database
    let max_connections = if config.is_in_memory() {
        1
    } else {
        config.max_connections
    };

    let mut options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.connect_timeout);
    if config.is_in_memory() {
        options = options.idle_timeout(None).max_lifetime(None);
    }

    let pool = options
        .connect_with(connect_opts)
        .await
        .map_err(|e| StoreError::Connection(format!("Failed to create pool: {}", e)))?;

    info!("Journal connection pool created successfully");

    verify_pool_health(&pool).await?;

    Ok(pool)
}

/// Verify that the connection pool is healthy
pub async fn verify_pool_health(pool: &SqlitePool) -> StoreResult<()> {
    debug!("Verifying journal pool health");

    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| StoreError::Connection(format!("Health check failed: {}", e)))?;

    debug!("Journal pool health check passed");
    Ok(())
}

/// Gracefully close the connection pool
pub async fn close_pool(pool: SqlitePool) {
    info!("Closing journal connection pool");
    pool.close().await;
    info!("Journal connection pool closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_validation() {
        let config = PoolConfig::new("sqlite::memory:");
        assert!(config.validate().is_ok());
        assert!(config.is_in_memory());

        assert!(PoolConfig::new("").validate().is_err());
        assert!(PoolConfig::new("postgres://localhost/db").validate().is_err());
        assert!(PoolConfig::new("sqlite://journal.db")
            .max_connections(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("sqlite://journal.db")
            .max_connections(8)
            .connect_timeout(Duration::from_secs(5))
            .enable_logging(true);

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.enable_logging);
        assert!(!config.is_in_memory());
    }

    #[tokio::test]
    async fn test_create_in_memory_pool() {
        let pool = create_pool(&PoolConfig::new("sqlite::memory:")).await.unwrap();
        verify_pool_health(&pool).await.unwrap();
        close_pool(pool).await;
    }
}
