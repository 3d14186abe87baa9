//! Supervised worker pools
//!
//! A [`WorkerPool`] runs a fixed number of [`Worker`]s that pull messages from
//! one shared FIFO queue, so a busy worker never holds work an idle peer
//! could take. Each worker runs under a [`SupervisionStrategy`]: when its
//! handler panics it is either resumed with its state intact or replaced by
//! a fresh instance after an exponential backoff. A worker that spends its
//! restart budget cools down for one restart window and then starts over
//! with a fresh budget. The queue outlives any single worker, so queued
//! messages survive a crash; only the message being handled is lost.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::FutureExt;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult};

/// A unit of work processed one message at a time
#[async_trait]
pub trait Worker: Send + 'static {
    type Message: Send + 'static;

    async fn handle(&mut self, message: Self::Message);
}

/// Bounds for restart-with-backoff supervision
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSettings {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Extra random delay, as a fraction of the computed delay
    pub jitter: f64,
    /// Restarts allowed within `within` before the worker cools down for
    /// `within` and gets a fresh budget
    pub max_restarts: usize,
    pub within: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(40),
            jitter: 0.1,
            max_restarts: 10,
            within: Duration::from_secs(60),
        }
    }
}

impl BackoffSettings {
    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_restarts.max(1))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(factor).min(self.max_backoff.mul_f64(1.0 + self.jitter))
    }
}

/// What happens to a worker whose handler panicked
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisionStrategy {
    /// Keep the same worker instance and continue with the next message
    Resume,
    /// Replace the worker with a fresh instance after a backoff delay
    RestartWithBackoff(BackoffSettings),
}

/// Counters shared by every worker of a pool
#[derive(Debug, Default)]
pub struct SupervisorStats {
    pub handled: AtomicU64,
    pub resumed: AtomicU64,
    pub restarts: AtomicU64,
    /// Times a worker spent its restart budget and cooled down
    pub exhausted: AtomicU64,
    pub stopped: AtomicU64,
}

impl SupervisorStats {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn resumed(&self) -> u64 {
        self.resumed.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn stopped(&self) -> u64 {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Run a future, converting a panic into its message
pub async fn catch_panic<F: Future>(future: F) -> Result<F::Output, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(&panic))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Fixed-size pool of supervised workers behind one bounded queue
pub struct WorkerPool<M> {
    name: String,
    sender: mpsc::Sender<M>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SupervisorStats>,
    closing: CancellationToken,
}

impl<M: Send + 'static> WorkerPool<M> {
    /// Start `size` workers built by `factory`.
    ///
    /// `factory` receives the worker's index and is called again on every
    /// restart. Submitting waits while `queue_capacity` messages are queued.
    pub fn spawn<W, F>(
        name: impl Into<String>,
        size: usize,
        queue_capacity: usize,
        strategy: SupervisionStrategy,
        factory: F,
    ) -> Self
    where
        W: Worker<Message = M>,
        F: Fn(usize) -> ServiceResult<W> + Send + Sync + 'static,
    {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let mailbox = Arc::new(Mutex::new(receiver));
        let factory = Arc::new(factory);
        let stats = Arc::new(SupervisorStats::default());
        let closing = CancellationToken::new();

        let handles = (0..size.max(1))
            .map(|index| {
                let supervisor = Supervisor {
                    name: name.clone(),
                    index,
                    strategy: strategy.clone(),
                    factory: Arc::clone(&factory),
                    mailbox: Arc::clone(&mailbox),
                    stats: Arc::clone(&stats),
                    closing: closing.clone(),
                };
                tokio::spawn(supervisor.run())
            })
            .collect();

        info!(pool = %name, size = size.max(1), "Worker pool started");

        Self {
            name,
            sender,
            handles,
            stats,
            closing,
        }
    }

    /// Queue a message, waiting while the queue is full
    pub async fn submit(&self, message: M) -> ServiceResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ServiceError::WorkerUnavailable(format!("{} pool is closed", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        &self.stats
    }

    /// Workers that have not stopped
    pub fn running_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Close the queue and wait for workers to drain it.
    ///
    /// Workers waiting out a backoff or a cool-down exit right away.
    pub async fn shutdown(self) {
        self.closing.cancel();
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.await;
        }
        debug!(pool = %self.name, "Worker pool stopped");
    }
}

struct Supervisor<W: Worker, F> {
    name: String,
    index: usize,
    strategy: SupervisionStrategy,
    factory: Arc<F>,
    mailbox: Arc<Mutex<mpsc::Receiver<W::Message>>>,
    stats: Arc<SupervisorStats>,
    closing: CancellationToken,
}

impl<W, F> Supervisor<W, F>
where
    W: Worker,
    F: Fn(usize) -> ServiceResult<W> + Send + Sync + 'static,
{
    async fn run(self) {
        let mut budget = match &self.strategy {
            SupervisionStrategy::RestartWithBackoff(settings) => Some(RestartBudget::new(settings)),
            SupervisionStrategy::Resume => None,
        };

        let mut worker = match (self.factory)(self.index) {
            Ok(worker) => worker,
            Err(e) => {
                error!(pool = %self.name, worker = self.index, error = %e, "Worker failed to start");
                match self.restart(budget.as_mut()).await {
                    Some(worker) => worker,
                    None => return,
                }
            }
        };

        loop {
            let message = {
                let mut mailbox = self.mailbox.lock().await;
                mailbox.recv().await
            };
            let Some(message) = message else {
                debug!(pool = %self.name, worker = self.index, "Queue closed, worker exiting");
                return;
            };

            match catch_panic(worker.handle(message)).await {
                Ok(()) => {
                    self.stats.handled.fetch_add(1, Ordering::Relaxed);
                    if let Some(budget) = budget.as_mut() {
                        budget.reset_backoff();
                    }
                }
                Err(reason) => match &self.strategy {
                    SupervisionStrategy::Resume => {
                        self.stats.resumed.fetch_add(1, Ordering::Relaxed);
                        warn!(pool = %self.name, worker = self.index, reason = %reason, "Worker panicked, resuming");
                    }
                    SupervisionStrategy::RestartWithBackoff(_) => {
                        warn!(pool = %self.name, worker = self.index, reason = %reason, "Worker panicked, restarting");
                        match self.restart(budget.as_mut()).await {
                            Some(fresh) => worker = fresh,
                            None => return,
                        }
                    }
                },
            }
        }
    }

    /// Build a replacement worker, backing off between attempts.
    ///
    /// Returns `None` only for pools without a restart budget or when the
    /// pool shuts down while waiting.
    async fn restart(&self, budget: Option<&mut RestartBudget>) -> Option<W> {
        let Some(budget) = budget else {
            self.stats.stopped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        loop {
            let delay = match budget.next_delay() {
                Some(delay) => {
                    self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.name, worker = self.index, backoff_ms = %delay.as_millis(), "Restarting worker after backoff");
                    delay
                }
                None => {
                    self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    let cooldown = budget.start_over();
                    error!(pool = %self.name, worker = self.index, cooldown = ?cooldown, "Restart budget exhausted, cooling down");
                    cooldown
                }
            };

            tokio::select! {
                _ = self.closing.cancelled() => {
                    self.stats.stopped.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.name, worker = self.index, "Pool closing, worker not restarted");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match (self.factory)(self.index) {
                Ok(worker) => return Some(worker),
                Err(e) => {
                    warn!(pool = %self.name, worker = self.index, error = %e, "Worker restart failed");
                }
            }
        }
    }
}

/// Sliding-window restart limit plus the current backoff sequence
struct RestartBudget {
    settings: BackoffSettings,
    recent: VecDeque<Instant>,
    delays: ExponentialBackoff,
}

impl RestartBudget {
    fn new(settings: &BackoffSettings) -> Self {
        Self {
            settings: settings.clone(),
            recent: VecDeque::new(),
            delays: settings.builder().build(),
        }
    }

    /// Delay before the next restart, or `None` once the window is full
    fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > self.settings.within {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.settings.max_restarts {
            return None;
        }
        self.recent.push_back(now);

        let delay = self.delays.next().unwrap_or(self.settings.max_backoff);
        Some(self.settings.jittered(delay))
    }

    fn reset_backoff(&mut self) {
        self.delays = self.settings.builder().build();
    }

    /// Forget every recorded restart, returning the cool-down to wait first
    fn start_over(&mut self) -> Duration {
        self.recent.clear();
        self.reset_backoff();
        self.settings.within
    }
}
