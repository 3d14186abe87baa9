//! Timer-driven resync of every tracked artifact
//!
//! A round enumerates the catalog's groups and artifacts, resyncs each
//! artifact against the registry, and registers the versions a changed
//! manifest added over the previous one. Each fan-out has its own
//! parallelism bound.

use futures::stream::{self, StreamExt};
use provenance_core::{ArtifactCoordinates, MavenCoordinates};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::ArtifactCatalog;
use crate::error::{ServiceError, ServiceResult};
use crate::synchronizer::{ArtifactSynchronizer, SyncReply, SyncStatus};
use crate::versioned::{VersionReply, VersionedArtifacts};

/// Scheduling and fan-out settings
#[derive(Debug, Clone)]
pub struct ResyncConfig {
    pub startup_delay: Duration,
    pub interval: Duration,
    pub group_parallelism: usize,
    pub artifact_parallelism: usize,
    pub registration_parallelism: usize,
    /// Deadline for one artifact's resync
    pub artifact_timeout: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(60),
            interval: Duration::from_secs(300),
            group_parallelism: 4,
            artifact_parallelism: 4,
            registration_parallelism: 4,
            artifact_timeout: Duration::from_secs(30),
        }
    }
}

/// Summary of one resync round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Artifacts resynced
    pub artifacts: usize,
    /// Artifacts whose manifest changed
    pub changed: usize,
    /// Versions submitted for registration
    pub versions: usize,
    /// Versions that were not registered before
    pub registered: usize,
    /// Groups, artifacts and versions that failed
    pub failures: usize,
    pub elapsed: Duration,
}

/// Totals across all rounds
#[derive(Debug, Default)]
pub struct ResyncStats {
    pub rounds: AtomicU64,
    pub failed_rounds: AtomicU64,
    pub artifacts: AtomicU64,
    pub changed: AtomicU64,
    pub versions_registered: AtomicU64,
    pub failures: AtomicU64,
}

impl ResyncStats {
    fn record(&self, report: &ResyncReport) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.artifacts.fetch_add(report.artifacts as u64, Ordering::Relaxed);
        self.changed.fetch_add(report.changed as u64, Ordering::Relaxed);
        self.versions_registered
            .fetch_add(report.registered as u64, Ordering::Relaxed);
        self.failures.fetch_add(report.failures as u64, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Drives periodic resync rounds
pub struct ResyncManager {
    catalog: Arc<dyn ArtifactCatalog>,
    synchronizer: ArtifactSynchronizer,
    versioned: VersionedArtifacts,
    config: ResyncConfig,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    stats: Arc<ResyncStats>,
}

impl ResyncManager {
    pub fn new(
        catalog: Arc<dyn ArtifactCatalog>,
        synchronizer: ArtifactSynchronizer,
        versioned: VersionedArtifacts,
        config: ResyncConfig,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            catalog,
            synchronizer,
            versioned,
            config,
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
            stats: Arc::new(ResyncStats::default()),
        }
    }

    pub fn config(&self) -> &ResyncConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ResyncStats> {
        Arc::clone(&self.stats)
    }

    /// Request a round outside the schedule.
    ///
    /// Returns `false` when a requested round is already pending.
    pub fn trigger(&self) -> bool {
        self.trigger_tx.try_send(()).is_ok()
    }

    /// Run rounds until `shutdown` fires.
    ///
    /// The first round starts after the startup delay, then one per
    /// interval. Ticks missed while a round is running are skipped.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut triggers = self.trigger_rx.lock().await;

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.startup_delay) => {}
            _ = triggers.recv() => {}
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Resync scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
                _ = triggers.recv() => {
                    ticker.reset();
                }
            }

            match self.run_once().await {
                Ok(report) => info!(
                    artifacts = report.artifacts,
                    changed = report.changed,
                    registered = report.registered,
                    failures = report.failures,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Resync round finished"
                ),
                Err(e) => {
                    self.stats.failed_rounds.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Resync round failed");
                }
            }
        }
    }

    /// Run a single round.
    ///
    /// Fails only when the group list itself cannot be read; everything below
    /// that is counted in the report's failures.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> ServiceResult<ResyncReport> {
        let started = Instant::now();
        let mut report = ResyncReport::default();

        let groups = self.catalog.groups().await?;
        debug!(groups = groups.len(), "Enumerating catalog");

        let listings: Vec<ServiceResult<Vec<ArtifactCoordinates>>> = stream::iter(groups)
            .map(|group| async move {
                let artifacts = self.catalog.artifacts(&group).await.map_err(|e| {
                    warn!(group_id = %group, error = %e, "Failed to list artifacts");
                    e
                })?;
                Ok(artifacts.into_iter().map(|a| a.coordinates).collect())
            })
            .buffer_unordered(self.config.group_parallelism.max(1))
            .collect()
            .await;

        let mut artifacts = Vec::new();
        for listing in listings {
            match listing {
                Ok(found) => artifacts.extend(found),
                Err(_) => report.failures += 1,
            }
        }
        report.artifacts = artifacts.len();

        let replies: Vec<(ArtifactCoordinates, SyncReply)> = stream::iter(artifacts)
            .map(|artifact| async move {
                let reply = self.resync_with_timeout(&artifact).await;
                (artifact, reply)
            })
            .buffer_unordered(self.config.artifact_parallelism.max(1))
            .collect()
            .await;

        let mut discovered: Vec<MavenCoordinates> = Vec::new();
        for (artifact, reply) in replies {
            match reply.status {
                SyncStatus::Discovered => {
                    report.changed += 1;
                    discovered.extend(reply.added);
                }
                SyncStatus::Unchanged => {}
                SyncStatus::Failed(reason) => {
                    debug!(artifact = %artifact, reason = %reason, "Resync produced no versions");
                    report.failures += 1;
                }
            }
        }
        report.versions = discovered.len();

        let registrations: Vec<ServiceResult<VersionReply>> = stream::iter(discovered)
            .map(|version| async move { self.versioned.register(&version).await })
            .buffer_unordered(self.config.registration_parallelism.max(1))
            .collect()
            .await;

        for registration in registrations {
            match registration {
                Ok(VersionReply::Applied) => report.registered += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Version registration failed");
                    report.failures += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        self.stats.record(&report);
        Ok(report)
    }

    async fn resync_with_timeout(&self, artifact: &ArtifactCoordinates) -> SyncReply {
        let timeout = self.config.artifact_timeout;
        match tokio::time::timeout(timeout, self.synchronizer.resync(artifact)).await {
            Ok(reply) => reply,
            Err(_) => {
                let reason = ServiceError::Timeout(timeout).to_string();
                warn!(artifact = %artifact, reason = %reason, "Resync timed out");
                SyncReply::failed(reason)
            }
        }
    }
}
