//! Append-only event journal
//!
//! Every entity owns one journal stream addressed by its persistence id.
//! Streams are append-only, sequence numbers start at 1 and are gap free, and
//! an append either stores every event of the batch or none of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::StoreResult;

/// An event waiting to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Event name, kept alongside the payload for inspection
    pub event_type: String,
    pub payload: JsonValue,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// An event read back from the journal
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub persistence_id: String,
    pub sequence: u64,
    pub event_type: String,
    pub payload: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

/// Serialized entity state as of `sequence`
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub persistence_id: String,
    pub sequence: u64,
    pub state: JsonValue,
    pub taken_at: DateTime<Utc>,
}

/// Durable storage for entity event streams and snapshots
#[async_trait]
pub trait Journal: Send + Sync {
    /// Atomically append `events` to a stream.
    ///
    /// # Arguments
    /// * `persistence_id` - Stream to append to
    /// * `expected_sequence` - Highest sequence the writer has observed
    /// * `events` - Events to append, in order
    ///
    /// # Returns
    /// * The new highest sequence number of the stream
    ///
    /// Fails with `StoreError::SequenceConflict` when the stream has moved
    /// past `expected_sequence`; nothing is written in that case.
    async fn append(
        &self,
        persistence_id: &str,
        expected_sequence: u64,
        events: Vec<NewEvent>,
    ) -> StoreResult<u64>;

    /// Load events with a sequence strictly greater than `after_sequence`, in order
    async fn load(&self, persistence_id: &str, after_sequence: u64)
        -> StoreResult<Vec<PersistedEvent>>;

    /// Highest sequence number of a stream, 0 when the stream is empty
    async fn highest_sequence(&self, persistence_id: &str) -> StoreResult<u64>;

    /// Store a snapshot and prune all but the newest `keep` snapshots of the stream
    async fn save_snapshot(&self, snapshot: SnapshotRecord, keep: usize) -> StoreResult<()>;

    /// Latest snapshot of a stream, if any
    async fn load_snapshot(&self, persistence_id: &str) -> StoreResult<Option<SnapshotRecord>>;

    /// All persistence ids starting with `prefix`, sorted
    async fn persistence_ids(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Health check for the journal backend
    async fn health_check(&self) -> StoreResult<()>;
}
