//! Event-sourced entity runtime
//!
//! Each entity is addressed by a stable string key. Keys are hashed onto a
//! fixed set of shard tasks; a shard owns the folded state of every entity
//! mapped to it and processes its mailbox one message at a time, so commands
//! for the same key never run concurrently while distinct shards proceed in
//! parallel.
//!
//! A command handler is a pure function from `(state, command)` to an
//! [`Effect`]. The events of an effect are appended to the journal as one
//! batch before they are applied and before the reply is released; when the
//! append fails, state is left as it was and the caller receives the error.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{EntityError, EntityResult};
use crate::journal::{Journal, NewEvent, SnapshotRecord};

/// Default number of shard tasks
pub const DEFAULT_SHARDS: usize = 16;

/// Default number of events between snapshots
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 5;

/// Default number of snapshots retained per entity
pub const DEFAULT_SNAPSHOTS_KEPT: usize = 2;

/// Result of handling one command: events to persist and the reply to send
#[derive(Debug, Clone, PartialEq)]
pub struct Effect<E, R> {
    pub events: Vec<E>,
    pub reply: R,
}

impl<E, R> Effect<E, R> {
    /// Reply without changing state
    pub fn reply(reply: R) -> Self {
        Self {
            events: Vec::new(),
            reply,
        }
    }

    /// Persist `events`, then reply
    pub fn persist(events: Vec<E>, reply: R) -> Self {
        Self { events, reply }
    }
}

/// An event-sourced state machine
pub trait Aggregate:
    Default + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Prefix of every persistence id owned by this aggregate
    const TYPE_NAME: &'static str;

    type Command: Send + 'static;
    type Event: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
    type Reply: Send + 'static;

    /// Fold one event into the state. Must be deterministic.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events a command produces. Must not perform I/O.
    fn handle(&self, command: Self::Command) -> Effect<Self::Event, Self::Reply>;

    /// Name recorded with each journal entry
    fn event_name(event: &Self::Event) -> &str;
}

/// A persisted event as seen by subscribers of the live feed
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    pub persistence_id: String,
    pub entity_id: String,
    pub sequence: u64,
    pub event: E,
}

/// Tuning for an [`EntityRuntime`]
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of shard tasks
    pub shards: usize,
    /// Write a snapshot every this many events; 0 disables snapshots
    pub snapshot_every: u64,
    /// Snapshots retained per entity
    pub snapshots_kept: usize,
    /// Queued messages per shard before senders wait
    pub mailbox_capacity: usize,
    /// Timeout applied by [`EntityRuntime::invoke`]
    pub invoke_timeout: Duration,
    /// Buffered envelopes per live-feed subscriber
    pub feed_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            snapshots_kept: DEFAULT_SNAPSHOTS_KEPT,
            mailbox_capacity: 256,
            invoke_timeout: Duration::from_secs(10),
            feed_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }

    pub fn snapshots_kept(mut self, kept: usize) -> Self {
        self.snapshots_kept = kept.max(1);
        self
    }

    pub fn invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }
}

type QueryFn<A> = Box<dyn FnOnce(EntityResult<&A>) + Send>;

enum ShardMessage<A: Aggregate> {
    Command {
        entity_id: String,
        command: A::Command,
        reply_to: oneshot::Sender<EntityResult<A::Reply>>,
    },
    Query {
        entity_id: String,
        read: QueryFn<A>,
    },
}

impl<A: Aggregate> ShardMessage<A> {
    fn entity_id(&self) -> &str {
        match self {
            ShardMessage::Command { entity_id, .. } | ShardMessage::Query { entity_id, .. } => {
                entity_id
            }
        }
    }

    fn fail(self, err: EntityError) {
        match self {
            ShardMessage::Command { reply_to, .. } => {
                let _ = reply_to.send(Err(err));
            }
            ShardMessage::Query { read, .. } => read(Err(err)),
        }
    }
}

/// Handle to a running set of shards for aggregate `A`. Cheap to clone.
pub struct EntityRuntime<A: Aggregate> {
    shards: Arc<Vec<mpsc::Sender<ShardMessage<A>>>>,
    feed: broadcast::Sender<EventEnvelope<A::Event>>,
    journal: Arc<dyn Journal>,
    config: RuntimeConfig,
}

impl<A: Aggregate> Clone for EntityRuntime<A> {
    fn clone(&self) -> Self {
        Self {
            shards: Arc::clone(&self.shards),
            feed: self.feed.clone(),
            journal: Arc::clone(&self.journal),
            config: self.config.clone(),
        }
    }
}

impl<A: Aggregate> EntityRuntime<A> {
    /// Spawn the shard tasks. Must be called from within a tokio runtime.
    pub fn start(journal: Arc<dyn Journal>, config: RuntimeConfig) -> Self {
        let (feed, _) = broadcast::channel(config.feed_capacity.max(1));
        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);

        for index in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
            let shard = Shard::<A> {
                index,
                journal: Arc::clone(&journal),
                feed: feed.clone(),
                snapshot_every: config.snapshot_every,
                snapshots_kept: config.snapshots_kept,
                entities: HashMap::new(),
            };
            tokio::spawn(shard.run(rx));
            shards.push(tx);
        }

        debug!(aggregate = A::TYPE_NAME, shards = shard_count, "Entity runtime started");

        Self {
            shards: Arc::new(shards),
            feed,
            journal,
            config,
        }
    }

    /// Persistence id of the entity addressed by `entity_id`
    pub fn persistence_id(entity_id: &str) -> String {
        format!("{}|{}", A::TYPE_NAME, entity_id)
    }

    /// Send a command and wait for its reply, bounded by the configured timeout
    pub async fn invoke(&self, entity_id: &str, command: A::Command) -> EntityResult<A::Reply> {
        self.invoke_with_timeout(entity_id, command, self.config.invoke_timeout)
            .await
    }

    /// Send a command and wait at most `timeout` for its reply.
    ///
    /// A lapsed timeout abandons interest in the reply; the command may still
    /// be applied.
    pub async fn invoke_with_timeout(
        &self,
        entity_id: &str,
        command: A::Command,
        timeout: Duration,
    ) -> EntityResult<A::Reply> {
        let (reply_to, reply) = oneshot::channel();
        let message = ShardMessage::Command {
            entity_id: entity_id.to_string(),
            command,
            reply_to,
        };
        self.deliver(message, reply, timeout).await?
    }

    /// Read the current folded state of an entity.
    ///
    /// The read runs on the owning shard, in mailbox order with commands.
    pub async fn query<R, F>(&self, entity_id: &str, read: F) -> EntityResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&A) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let message = ShardMessage::Query {
            entity_id: entity_id.to_string(),
            read: Box::new(move |state: EntityResult<&A>| {
                let _ = tx.send(state.map(read));
            }),
        };
        self.deliver(message, rx, self.config.invoke_timeout).await?
    }

    /// Ids of every entity of this aggregate with at least one persisted event
    pub async fn entity_ids(&self) -> EntityResult<Vec<String>> {
        let prefix = format!("{}|", A::TYPE_NAME);
        let ids = self.journal.persistence_ids(&prefix).await?;
        Ok(ids
            .into_iter()
            .filter_map(|id| id.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Subscribe to events persisted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<A::Event>> {
        self.feed.subscribe()
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    async fn deliver<T>(
        &self,
        message: ShardMessage<A>,
        reply: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> EntityResult<T> {
        let shard = &self.shards[shard_for(message.entity_id(), self.shards.len())];
        let exchange = async {
            shard
                .send(message)
                .await
                .map_err(|_| EntityError::Unavailable(format!("{} shard stopped", A::TYPE_NAME)))?;
            reply.await.map_err(|_| {
                EntityError::Unavailable(format!("{} shard dropped the reply", A::TYPE_NAME))
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EntityError::Timeout(timeout)),
        }
    }
}

fn shard_for(entity_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    entity_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

struct EntityCell<A> {
    state: A,
    sequence: u64,
}

struct Shard<A: Aggregate> {
    index: usize,
    journal: Arc<dyn Journal>,
    feed: broadcast::Sender<EventEnvelope<A::Event>>,
    snapshot_every: u64,
    snapshots_kept: usize,
    entities: HashMap<String, EntityCell<A>>,
}

impl<A: Aggregate> Shard<A> {
    async fn run(mut self, mut mailbox: mpsc::Receiver<ShardMessage<A>>) {
        while let Some(message) = mailbox.recv().await {
            let entity_id = message.entity_id().to_string();
            if !self.entities.contains_key(&entity_id) {
                match self.recover(&entity_id).await {
                    Ok(cell) => {
                        self.entities.insert(entity_id.clone(), cell);
                    }
                    Err(err) => {
                        error!(
                            aggregate = A::TYPE_NAME,
                            entity_id = %entity_id,
                            error = %err,
                            "Failed to recover entity"
                        );
                        message.fail(err);
                        continue;
                    }
                }
            }

            match message {
                ShardMessage::Query { entity_id, read } => {
                    if let Some(cell) = self.entities.get(&entity_id) {
                        read(Ok(&cell.state));
                    }
                }
                ShardMessage::Command {
                    entity_id,
                    command,
                    reply_to,
                } => {
                    let result = self.execute(&entity_id, command).await;
                    let _ = reply_to.send(result);
                }
            }
        }
        debug!(aggregate = A::TYPE_NAME, shard = self.index, "Shard stopped");
    }

    /// Rebuild an entity from its latest snapshot plus the events after it
    async fn recover(&self, entity_id: &str) -> EntityResult<EntityCell<A>> {
        let persistence_id = EntityRuntime::<A>::persistence_id(entity_id);

        let (mut state, mut sequence) = match self.journal.load_snapshot(&persistence_id).await? {
            Some(snapshot) => (
                serde_json::from_value::<A>(snapshot.state)?,
                snapshot.sequence,
            ),
            None => (A::default(), 0),
        };

        for persisted in self.journal.load(&persistence_id, sequence).await? {
            let event: A::Event = serde_json::from_value(persisted.payload)?;
            state.apply(&event);
            sequence = persisted.sequence;
        }

        debug!(
            aggregate = A::TYPE_NAME,
            entity_id = %entity_id,
            sequence,
            "Entity recovered"
        );
        Ok(EntityCell { state, sequence })
    }

    async fn execute(&mut self, entity_id: &str, command: A::Command) -> EntityResult<A::Reply> {
        let persistence_id = EntityRuntime::<A>::persistence_id(entity_id);
        let (effect, expected_sequence) = {
            let cell = self
                .entities
                .get(entity_id)
                .ok_or_else(|| EntityError::Unavailable("entity not loaded".to_string()))?;
            let state = &cell.state;
            let effect = std::panic::catch_unwind(AssertUnwindSafe(|| state.handle(command)))
                .map_err(|panic| EntityError::HandlerPanicked(panic_message(&panic)))?;
            (effect, cell.sequence)
        };

        if effect.events.is_empty() {
            return Ok(effect.reply);
        }

        let encoded = effect
            .events
            .iter()
            .map(|event| {
                serde_json::to_value(event).map(|payload| NewEvent::new(A::event_name(event), payload))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let new_sequence = match self
            .journal
            .append(&persistence_id, expected_sequence, encoded)
            .await
        {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!(
                    aggregate = A::TYPE_NAME,
                    entity_id = %entity_id,
                    error = %err,
                    "Journal append failed; discarding in-memory state"
                );
                // Reload on next access in case another writer moved the stream
                self.entities.remove(entity_id);
                return Err(err.into());
            }
        };

        let cell = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| EntityError::Unavailable("entity not loaded".to_string()))?;
        let first_sequence = new_sequence + 1 - effect.events.len() as u64;
        for (offset, event) in effect.events.iter().enumerate() {
            cell.state.apply(event);
            let _ = self.feed.send(EventEnvelope {
                persistence_id: persistence_id.clone(),
                entity_id: entity_id.to_string(),
                sequence: first_sequence + offset as u64,
                event: event.clone(),
            });
        }
        let previous_sequence = cell.sequence;
        cell.sequence = new_sequence;

        if self.snapshot_every > 0
            && new_sequence / self.snapshot_every > previous_sequence / self.snapshot_every
        {
            let snapshot = serde_json::to_value(&cell.state).map(|state| SnapshotRecord {
                persistence_id: persistence_id.clone(),
                sequence: new_sequence,
                state,
                taken_at: Utc::now(),
            });
            match snapshot {
                Ok(snapshot) => {
                    if let Err(err) = self.journal.save_snapshot(snapshot, self.snapshots_kept).await
                    {
                        warn!(persistence_id = %persistence_id, error = %err, "Failed to save snapshot");
                    }
                }
                Err(err) => {
                    warn!(persistence_id = %persistence_id, error = %err, "Failed to encode snapshot");
                }
            }
        }

        Ok(effect.reply)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJournal;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: i64,
        history: Vec<i64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum TallyEvent {
        Added(i64),
    }

    enum TallyCommand {
        Add(Vec<i64>),
        Read,
        Explode,
    }

    impl Aggregate for Tally {
        const TYPE_NAME: &'static str = "tally";
        type Command = TallyCommand;
        type Event = TallyEvent;
        type Reply = i64;

        fn apply(&mut self, event: &TallyEvent) {
            match event {
                TallyEvent::Added(n) => {
                    self.total += n;
                    self.history.push(*n);
                }
            }
        }

        fn handle(&self, command: TallyCommand) -> Effect<TallyEvent, i64> {
            match command {
                TallyCommand::Add(values) => {
                    let sum: i64 = values.iter().sum();
                    Effect::persist(
                        values.into_iter().map(TallyEvent::Added).collect(),
                        self.total + sum,
                    )
                }
                TallyCommand::Read => Effect::reply(self.total),
                TallyCommand::Explode => panic!("boom"),
            }
        }

        fn event_name(_event: &TallyEvent) -> &str {
            "added"
        }
    }

    fn runtime(journal: Arc<InMemoryJournal>, snapshot_every: u64) -> EntityRuntime<Tally> {
        EntityRuntime::start(
            journal,
            RuntimeConfig::new().shards(4).snapshot_every(snapshot_every),
        )
    }

    #[tokio::test]
    async fn test_commands_are_serialized_per_key() {
        let journal = Arc::new(InMemoryJournal::new());
        let runtime = runtime(journal.clone(), 0);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let runtime = runtime.clone();
            handles.push(tokio::spawn(async move {
                runtime.invoke("a", TallyCommand::Add(vec![1])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(runtime.invoke("a", TallyCommand::Read).await.unwrap(), 50);
        assert_eq!(journal.highest_sequence("tally|a").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_reply_only_commands_persist_nothing() {
        let journal = Arc::new(InMemoryJournal::new());
        let runtime = runtime(journal.clone(), 0);
        assert_eq!(runtime.invoke("a", TallyCommand::Read).await.unwrap(), 0);
        assert_eq!(journal.event_count().await, 0);
        assert!(runtime.entity_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_append_leaves_state_untouched() {
        let journal = Arc::new(InMemoryJournal::new());
        let runtime = runtime(journal.clone(), 0);
        runtime.invoke("a", TallyCommand::Add(vec![2])).await.unwrap();

        journal.set_fail_on_append(true);
        let err = runtime
            .invoke("a", TallyCommand::Add(vec![5, 7]))
            .await
            .unwrap_err();
        assert!(matches!(err, EntityError::Store(_)));

        journal.set_fail_on_append(false);
        assert_eq!(runtime.invoke("a", TallyCommand::Read).await.unwrap(), 2);
        assert_eq!(journal.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_recovery_matches_full_replay() {
        let journal = Arc::new(InMemoryJournal::new());
        {
            let runtime = runtime(journal.clone(), 3);
            for n in 1..=8 {
                runtime.invoke("a", TallyCommand::Add(vec![n])).await.unwrap();
            }
        }
        assert!(journal.snapshot_count("tally|a").await >= 1);
        assert!(journal.snapshot_count("tally|a").await <= DEFAULT_SNAPSHOTS_KEPT);

        let from_snapshot = runtime(journal.clone(), 3)
            .query("a", |state: &Tally| serde_json::to_vec(state).unwrap())
            .await
            .unwrap();

        let mut replayed = Tally::default();
        for persisted in journal.load("tally|a", 0).await.unwrap() {
            let event: TallyEvent = serde_json::from_value(persisted.payload).unwrap();
            replayed.apply(&event);
        }

        assert_eq!(from_snapshot, serde_json::to_vec(&replayed).unwrap());
        assert_eq!(replayed.total, 36);
    }

    #[tokio::test]
    async fn test_live_feed_receives_persisted_events() {
        let journal = Arc::new(InMemoryJournal::new());
        let runtime = runtime(journal, 0);
        let mut feed = runtime.subscribe();

        runtime.invoke("a", TallyCommand::Add(vec![4, 6])).await.unwrap();

        let first = feed.recv().await.unwrap();
        let second = feed.recv().await.unwrap();
        assert_eq!(first.event, TallyEvent::Added(4));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.entity_id, "a");
        assert_eq!(second.persistence_id, "tally|a");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error() {
        let journal = Arc::new(InMemoryJournal::new());
        let runtime = runtime(journal, 0);
        runtime.invoke("a", TallyCommand::Add(vec![1])).await.unwrap();

        let err = runtime.invoke("a", TallyCommand::Explode).await.unwrap_err();
        assert!(matches!(err, EntityError::HandlerPanicked(ref msg) if msg == "boom"));
        assert_eq!(runtime.invoke("a", TallyCommand::Read).await.unwrap(), 1);
    }
}
