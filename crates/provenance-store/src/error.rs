//! Journal and entity runtime error types
//!
//! `StoreError` covers the durable journal, `EntityError` covers command and
//! query delivery through the entity runtime.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for journal operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for entity runtime operations
pub type EntityResult<T> = Result<T, EntityError>;

/// Journal-specific errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection error
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Connection pool error
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// SQL query error
    #[error("Query error: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Another writer appended to the same journal first
    #[error("Sequence conflict for {persistence_id}: expected {expected}, found {actual}")]
    SequenceConflict {
        persistence_id: String,
        expected: u64,
        actual: u64,
    },

    /// Unique constraint violation
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Invalid data format
    #[error("Invalid data format: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal database error
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Check if another writer won the race for the same journal
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::SequenceConflict { .. } | StoreError::UniqueViolation(_)
        )
    }

    /// Check if this is a transient error that could be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Pool(_) | StoreError::Transaction(_)
        )
    }
}

/// Convert SQLx database errors to our error type
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                // SQLite extended codes: 1555 primary key, 2067 unique
                match db_err.code().as_deref() {
                    Some("1555") | Some("2067") => StoreError::UniqueViolation(message),
                    Some("5") | Some("6") => StoreError::Transaction(message),
                    _ => StoreError::Query(message),
                }
            }

            sqlx::Error::PoolTimedOut => StoreError::Pool("Connection pool timeout".to_string()),

            sqlx::Error::PoolClosed => StoreError::Pool("Connection pool closed".to_string()),

            sqlx::Error::Io(io_err) => StoreError::Connection(format!("I/O error: {}", io_err)),

            sqlx::Error::Protocol(msg) => {
                StoreError::Connection(format!("Protocol error: {}", msg))
            }

            sqlx::Error::ColumnNotFound(col) => {
                StoreError::InvalidData(format!("Column not found: {}", col))
            }

            sqlx::Error::Decode(msg) => StoreError::Serialization(format!("Decode error: {}", msg)),

            sqlx::Error::Migrate(migrate_err) => StoreError::Migration(format!("{}", migrate_err)),

            _ => StoreError::Internal(format!("{}", err)),
        }
    }
}

/// Convert serde_json errors
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(format!("{}", err))
    }
}

/// Convert URL parse errors
impl From<url::ParseError> for StoreError {
    fn from(err: url::ParseError) -> Self {
        StoreError::Configuration(format!("Invalid URL: {}", err))
    }
}

/// Errors surfaced to callers of the entity runtime
#[derive(Debug, Error)]
pub enum EntityError {
    /// The journal rejected or failed the operation; no events were applied
    #[error("Journal error: {0}")]
    Store(#[from] StoreError),

    /// An event or snapshot could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No reply arrived within the allotted time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The owning shard is no longer running
    #[error("Entity runtime unavailable: {0}")]
    Unavailable(String),

    /// The command handler panicked; state was left untouched
    #[error("Command handler panicked: {0}")]
    HandlerPanicked(String),
}

impl EntityError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EntityError::Timeout(_))
    }
}

impl From<serde_json::Error> for EntityError {
    fn from(err: serde_json::Error) -> Self {
        EntityError::Serialization(err.to_string())
    }
}
