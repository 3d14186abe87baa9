//! In-memory journal
//!
//! Used for tests and for running the synchronizer without a database. State
//! lives only as long as the process.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, NewEvent, PersistedEvent, SnapshotRecord};

/// Journal that keeps every stream in process memory
#[derive(Default)]
pub struct InMemoryJournal {
    events: RwLock<BTreeMap<String, Vec<PersistedEvent>>>,
    snapshots: RwLock<HashMap<String, Vec<SnapshotRecord>>>,
    fail_on_append: AtomicBool,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail with a transient error
    pub fn set_fail_on_append(&self, fail: bool) {
        self.fail_on_append.store(fail, Ordering::SeqCst);
    }

    /// Total number of events across all streams
    pub async fn event_count(&self) -> usize {
        self.events.read().await.values().map(Vec::len).sum()
    }

    /// Number of snapshots currently retained for a stream
    pub async fn snapshot_count(&self, persistence_id: &str) -> usize {
        self.snapshots
            .read()
            .await
            .get(persistence_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(
        &self,
        persistence_id: &str,
        expected_sequence: u64,
        events: Vec<NewEvent>,
    ) -> StoreResult<u64> {
        if self.fail_on_append.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("append rejected".to_string()));
        }

        let mut store = self.events.write().await;
        let stream = store.entry(persistence_id.to_string()).or_default();
        let actual = stream.last().map(|e| e.sequence).unwrap_or(0);
        if actual != expected_sequence {
            return Err(StoreError::SequenceConflict {
                persistence_id: persistence_id.to_string(),
                expected: expected_sequence,
                actual,
            });
        }

        let recorded_at = Utc::now();
        let mut sequence = actual;
        for event in events {
            sequence += 1;
            stream.push(PersistedEvent {
                persistence_id: persistence_id.to_string(),
                sequence,
                event_type: event.event_type,
                payload: event.payload,
                recorded_at,
            });
        }
        Ok(sequence)
    }

    async fn load(
        &self,
        persistence_id: &str,
        after_sequence: u64,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let store = self.events.read().await;
        Ok(store
            .get(persistence_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn highest_sequence(&self, persistence_id: &str) -> StoreResult<u64> {
        let store = self.events.read().await;
        Ok(store
            .get(persistence_id)
            .and_then(|s| s.last())
            .map(|e| e.sequence)
            .unwrap_or(0))
    }

    async fn save_snapshot(&self, snapshot: SnapshotRecord, keep: usize) -> StoreResult<()> {
        let mut store = self.snapshots.write().await;
        let retained = store.entry(snapshot.persistence_id.clone()).or_default();
        retained.retain(|s| s.sequence != snapshot.sequence);
        retained.push(snapshot);
        retained.sort_by_key(|s| s.sequence);
        let keep = keep.max(1);
        if retained.len() > keep {
            let excess = retained.len() - keep;
            retained.drain(..excess);
        }
        Ok(())
    }

    async fn load_snapshot(&self, persistence_id: &str) -> StoreResult<Option<SnapshotRecord>> {
        let store = self.snapshots.read().await;
        Ok(store.get(persistence_id).and_then(|s| s.last()).cloned())
    }

    async fn persistence_ids(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let store = self.events.read().await;
        Ok(store
            .iter()
            .filter(|(id, stream)| id.starts_with(prefix) && !stream.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
