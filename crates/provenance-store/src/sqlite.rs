//! SQLite implementation of the event journal

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, NewEvent, PersistedEvent, SnapshotRecord};

/// SQL for creating the events table.
pub const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS journal_events (
    persistence_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (persistence_id, sequence)
);
"#;

/// SQL for creating the snapshots table.
pub const CREATE_SNAPSHOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS journal_snapshots (
    persistence_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    state TEXT NOT NULL,
    taken_at TEXT NOT NULL,
    PRIMARY KEY (persistence_id, sequence)
);
"#;

/// Journal backed by a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Create a new SQLite journal
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the journal tables if they do not exist yet
    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(CREATE_EVENTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(format!("events table: {}", e)))?;
        sqlx::query(CREATE_SNAPSHOTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(format!("snapshots table: {}", e)))?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        persistence_id: &str,
        expected_sequence: u64,
        events: Vec<NewEvent>,
    ) -> StoreResult<u64> {
        debug!("Appending events to journal");

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) AS highest FROM journal_events WHERE persistence_id = ?",
        )
        .bind(persistence_id)
        .fetch_one(&mut *tx)
        .await?;
        let actual: i64 = row.get("highest");
        let actual = actual as u64;

        if actual != expected_sequence {
            return Err(StoreError::SequenceConflict {
                persistence_id: persistence_id.to_string(),
                expected: expected_sequence,
                actual,
            });
        }

        let recorded_at = Utc::now();
        let mut sequence = actual;
        for event in &events {
            sequence += 1;
            sqlx::query(
                r#"
                INSERT INTO journal_events (
                    persistence_id, sequence, event_id, event_type, payload, recorded_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(persistence_id)
            .bind(sequence as i64)
            .bind(ulid::Ulid::new().to_string())
            .bind(&event.event_type)
            .bind(serde_json::to_string(&event.payload)?)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(sequence, "Events appended successfully");
        Ok(sequence)
    }

    #[instrument(skip(self))]
    async fn load(
        &self,
        persistence_id: &str,
        after_sequence: u64,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT persistence_id, sequence, event_type, payload, recorded_at
            FROM journal_events
            WHERE persistence_id = ? AND sequence > ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(persistence_id)
        .bind(after_sequence as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn highest_sequence(&self, persistence_id: &str) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) AS highest FROM journal_events WHERE persistence_id = ?",
        )
        .bind(persistence_id)
        .fetch_one(&self.pool)
        .await?;
        let highest: i64 = row.get("highest");
        Ok(highest as u64)
    }

    #[instrument(skip(self, snapshot), fields(persistence_id = %snapshot.persistence_id, sequence = snapshot.sequence))]
    async fn save_snapshot(&self, snapshot: SnapshotRecord, keep: usize) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO journal_snapshots (persistence_id, sequence, state, taken_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.persistence_id)
        .bind(snapshot.sequence as i64)
        .bind(serde_json::to_string(&snapshot.state)?)
        .bind(snapshot.taken_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM journal_snapshots
            WHERE persistence_id = ?
              AND sequence NOT IN (
                SELECT sequence FROM journal_snapshots
                WHERE persistence_id = ?
                ORDER BY sequence DESC
                LIMIT ?
              )
            "#,
        )
        .bind(&snapshot.persistence_id)
        .bind(&snapshot.persistence_id)
        .bind(keep.max(1) as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_snapshot(&self, persistence_id: &str) -> StoreResult<Option<SnapshotRecord>> {
        let row = sqlx::query(
            r#"
            SELECT persistence_id, sequence, state, taken_at
            FROM journal_snapshots
            WHERE persistence_id = ?
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(persistence_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let state: String = row.get("state");
                let sequence: i64 = row.get("sequence");
                let taken_at: DateTime<Utc> = row.get("taken_at");
                Ok(Some(SnapshotRecord {
                    persistence_id: row.get("persistence_id"),
                    sequence: sequence as u64,
                    state: serde_json::from_str(&state)?,
                    taken_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn persistence_ids(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT persistence_id
            FROM journal_events
            WHERE substr(persistence_id, 1, length(?)) = ?
            ORDER BY persistence_id ASC
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("persistence_id")).collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }
}

/// Convert database row to PersistedEvent
fn row_to_event(row: SqliteRow) -> StoreResult<PersistedEvent> {
    let payload: String = row.get("payload");
    let payload = serde_json::from_str(&payload)
        .map_err(|e| StoreError::Serialization(format!("Failed to parse event payload: {}", e)))?;
    let sequence: i64 = row.get("sequence");

    Ok(PersistedEvent {
        persistence_id: row.get("persistence_id"),
        sequence: sequence as u64,
        event_type: row.get("event_type"),
        payload,
        recorded_at: row.get("recorded_at"),
    })
}
