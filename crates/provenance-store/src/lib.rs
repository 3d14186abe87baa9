//! Persistence layer for the provenance synchronizer
//!
//! This crate provides the durable side of the event-sourced aggregates:
//! - An append-only [`Journal`] of per-entity event streams with snapshots
//! - SQLite ([`SqliteJournal`]) and in-memory ([`InMemoryJournal`]) backends
//! - Connection pool management for SQLite
//! - The [`EntityRuntime`], which serializes commands per entity key and
//!   persists emitted events before replying
//!
//! # Example
//!
//! ```rust,no_run
//! use provenance_store::{create_pool, PoolConfig, SqliteJournal};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = create_pool(&PoolConfig::new("sqlite://provenance.db")).await?;
//! let journal = SqliteJournal::new(pool);
//! journal.init().await?;
//! # Ok(())
//! # }
//! ```

// Re-export core domain types for convenience
pub use provenance_core;

pub mod entity;
pub mod error;
pub mod journal;
pub mod memory;
pub mod pool;
pub mod sqlite;

// Re-exports for convenience
pub use entity::{Aggregate, Effect, EntityRuntime, EventEnvelope, RuntimeConfig};
pub use error::{EntityError, EntityResult, StoreError, StoreResult};
pub use journal::{Journal, NewEvent, PersistedEvent, SnapshotRecord};
pub use memory::InMemoryJournal;
pub use pool::{close_pool, create_pool, verify_pool_health, PoolConfig};
pub use sqlite::SqliteJournal;

// Re-export sqlx types that users may need
pub use sqlx::sqlite::SqlitePool;

/// Persistence layer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Journal URL that selects the in-memory backend
pub const IN_MEMORY_URL: &str = "memory";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
