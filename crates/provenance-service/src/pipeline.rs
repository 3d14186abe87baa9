//! Event-driven follow-up work for registered versions
//!
//! The pipeline consumes the versioned artifact feed and routes each event:
//!
//! - `Registered` fans out to asset discovery and repository association
//! - `AssetsUpdated` scans the new archives for a commit id
//! - `RawCommitRegistered` and `RepositoryAssociated` resolve the raw commit
//!   against repositories not tried yet
//!
//! Results flow back into the versioned aggregate as commands, which emit the
//! next events.
//!
//! The live feed only carries events persisted while the pipeline listens.
//! A sweep over every registered version covers the rest: it runs when the
//! pipeline starts, after the feed overflowed, and on a fixed interval, and
//! re-runs each stage a version has not completed. Lookups and downloads
//! that failed on a transient fault are picked up again by the next sweep.

use futures::stream::{self, StreamExt};
use provenance_core::{Asset, MavenCoordinates, VersionedArtifactEvent, VersionedAsset};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::catalog::ArtifactCatalog;
use crate::error::{ServiceError, ServiceResult};
use crate::extraction::{ExtractionPool, ExtractionResult};
use crate::registry_client::ArtifactRegistry;
use crate::resolution::{CommitResolution, ResolutionPool};
use crate::routing::{handler_fn, Broadcast, Handler, Partition};
use crate::versioned::{VersionReply, VersionedArtifact, VersionedArtifacts};

/// Parallelism bounds of the pipeline stages
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Events handled at once
    pub event_parallelism: usize,
    /// Versions scanning archives at once
    pub extraction_parallelism: usize,
    /// Versions resolving a commit at once
    pub resolution_parallelism: usize,
    /// Versions a sweep works on at once
    pub sweep_parallelism: usize,
    /// Time between two sweeps of the running pipeline
    pub sweep_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_parallelism: 16,
            extraction_parallelism: 4,
            resolution_parallelism: 4,
            sweep_parallelism: 4,
            sweep_interval: Duration::from_secs(900),
        }
    }
}

/// Outcome counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub registrations: AtomicU64,
    pub assets_added: AtomicU64,
    pub repositories_associated: AtomicU64,
    pub commits_discovered: AtomicU64,
    pub commits_absent: AtomicU64,
    pub extraction_failures: AtomicU64,
    pub commits_resolved: AtomicU64,
    pub commits_unresolved: AtomicU64,
    /// Resolutions where some repository could not be asked
    pub lookup_failures: AtomicU64,
    pub stage_failures: AtomicU64,
    pub lagged: AtomicU64,
    pub sweeps: AtomicU64,
    /// Versions a sweep found unfinished
    pub swept_versions: AtomicU64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

struct Stages {
    versioned: VersionedArtifacts,
    registry: Arc<dyn ArtifactRegistry>,
    catalog: Arc<dyn ArtifactCatalog>,
    extraction: Arc<ExtractionPool>,
    resolution: Arc<ResolutionPool>,
    extraction_permits: Semaphore,
    resolution_permits: Semaphore,
    stats: Arc<PipelineStats>,
}

impl Stages {
    #[instrument(skip(self), fields(coordinates = %coordinates))]
    async fn discover_assets(&self, coordinates: MavenCoordinates) -> ServiceResult<()> {
        let assets = self.registry.fetch_assets(&coordinates).await?;
        if assets.is_empty() {
            debug!("Registry lists no assets");
            return Ok(());
        }
        if self.versioned.add_assets(&coordinates, assets).await? == VersionReply::Applied {
            PipelineStats::bump(&self.stats.assets_added);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(coordinates = %coordinates))]
    async fn associate_repositories(&self, coordinates: MavenCoordinates) -> ServiceResult<()> {
        let repositories = self.catalog.repositories(&coordinates.artifact()).await?;
        for repository in repositories {
            if self.versioned.register_repo(&coordinates, repository).await? == VersionReply::Applied {
                PipelineStats::bump(&self.stats.repositories_associated);
            }
        }
        Ok(())
    }

    /// Scan new archives one at a time until a commit id turns up
    #[instrument(skip(self, assets), fields(coordinates = %coordinates, assets = assets.len()))]
    async fn scan_assets(&self, coordinates: MavenCoordinates, assets: Vec<Asset>) -> ServiceResult<()> {
        let state = self.versioned.get_version(&coordinates).await?;
        let Some(record) = state.record() else {
            return Ok(());
        };
        let candidates: Vec<Asset> = assets.into_iter().filter(|a| record.should_scan(a)).collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let _permit = self
            .extraction_permits
            .acquire()
            .await
            .map_err(|_| ServiceError::WorkerUnavailable("extraction stage closed".to_string()))?;

        for asset in candidates {
            let target = VersionedAsset::new(coordinates.clone(), asset.clone());
            match self.extraction.attempt(target).await {
                ExtractionResult::DiscoveredCommitFromFile { sha, .. } => {
                    PipelineStats::bump(&self.stats.commits_discovered);
                    self.versioned.register_raw_commit(&coordinates, sha).await?;
                    return Ok(());
                }
                ExtractionResult::NoCommitsFound { .. } => {
                    PipelineStats::bump(&self.stats.commits_absent);
                    debug!(asset = %asset.key(), "Archive carries no commit, marking as errored");
                    self.versioned.mark_files_errored(&coordinates, vec![asset]).await?;
                }
                ExtractionResult::FailedToRetrieveCommit {
                    reason,
                    transient: true,
                    ..
                } => {
                    PipelineStats::bump(&self.stats.extraction_failures);
                    debug!(asset = %asset.key(), reason = %reason, "Asset left for a later sweep");
                }
                ExtractionResult::FailedToRetrieveCommit { reason, .. } => {
                    PipelineStats::bump(&self.stats.extraction_failures);
                    debug!(asset = %asset.key(), reason = %reason, "Marking asset as errored");
                    self.versioned.mark_files_errored(&coordinates, vec![asset]).await?;
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(coordinates = %coordinates))]
    async fn resolve_commit(&self, coordinates: MavenCoordinates) -> ServiceResult<()> {
        let state = self.versioned.get_version(&coordinates).await?;
        let Some(record) = state.record() else {
            return Ok(());
        };
        let Some(sha) = record.raw_commit().cloned() else {
            return Ok(());
        };
        let candidates = record.pending_repositories();
        if candidates.is_empty() {
            debug!("No untried repositories for the raw commit");
            return Ok(());
        }

        let _permit = self
            .resolution_permits
            .acquire()
            .await
            .map_err(|_| ServiceError::WorkerUnavailable("resolution stage closed".to_string()))?;

        match self
            .resolution
            .resolve(coordinates.clone(), sha.clone(), candidates)
            .await?
        {
            CommitResolution::Resolved { repository, details } => {
                PipelineStats::bump(&self.stats.commits_resolved);
                self.versioned
                    .register_resolved_commit(&coordinates, details, repository)
                    .await?;
            }
            CommitResolution::NotFound { attempted, failed } => {
                if !failed.is_empty() {
                    // still pending, so the next sweep asks them again
                    PipelineStats::bump(&self.stats.lookup_failures);
                    debug!(failed = failed.len(), "Repositories left for a later sweep");
                }
                if !attempted.is_empty() {
                    PipelineStats::bump(&self.stats.commits_unresolved);
                    self.versioned
                        .register_failed_commit(&coordinates, sha, attempted)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Re-run the stages a version has not completed.
    ///
    /// Returns whether anything was outstanding. Stages are idempotent, so
    /// racing the live feed on the same version only repeats work.
    #[instrument(skip(self), fields(coordinates = %coordinates))]
    async fn sweep_version(&self, coordinates: MavenCoordinates) -> bool {
        let record = match self.versioned.get_version(&coordinates).await {
            Ok(VersionedArtifact::Registered(record)) => record,
            Ok(VersionedArtifact::Unregistered) => return false,
            Err(e) => {
                PipelineStats::bump(&self.stats.stage_failures);
                warn!(error = %e, "Could not read version for sweep");
                return false;
            }
        };

        let mut outcomes = Vec::new();
        if record.repositories.is_empty() {
            outcomes.push(("repositories", self.associate_repositories(coordinates.clone()).await));
        }
        if record.assets.is_empty() {
            outcomes.push(("assets", self.discover_assets(coordinates.clone()).await));
        } else if record.assets.iter().any(|a| record.should_scan(a)) {
            outcomes.push(("scan", self.scan_assets(coordinates.clone(), record.assets.clone()).await));
        }
        if !record.pending_repositories().is_empty() {
            outcomes.push(("resolve", self.resolve_commit(coordinates.clone()).await));
        }

        for (stage, outcome) in &outcomes {
            if let Err(e) = outcome {
                PipelineStats::bump(&self.stats.stage_failures);
                warn!(stage, error = %e, "Sweep stage failed");
            }
        }
        !outcomes.is_empty()
    }

    /// Sweep every registered version, returning how many were unfinished
    async fn sweep(&self, parallelism: usize) -> ServiceResult<usize> {
        let versions = self.versioned.all_versions().await?;
        let total = versions.len();
        let outstanding = stream::iter(versions)
            .map(|coordinates| self.sweep_version(coordinates))
            .buffer_unordered(parallelism.max(1))
            .filter(|unfinished| futures::future::ready(*unfinished))
            .count()
            .await;

        PipelineStats::bump(&self.stats.sweeps);
        self.stats
            .swept_versions
            .fetch_add(outstanding as u64, Ordering::Relaxed);
        info!(versions = total, outstanding, "Sweep finished");
        Ok(outstanding)
    }
}

/// Router from versioned artifact events to pipeline stages
pub struct Pipeline {
    stages: Arc<Stages>,
    router: Arc<dyn Handler<VersionedArtifactEvent>>,
    event_permits: Arc<Semaphore>,
    sweep_parallelism: usize,
    sweep_interval: Duration,
}

impl Pipeline {
    pub fn new(
        versioned: VersionedArtifacts,
        registry: Arc<dyn ArtifactRegistry>,
        catalog: Arc<dyn ArtifactCatalog>,
        extraction: Arc<ExtractionPool>,
        resolution: Arc<ResolutionPool>,
        config: PipelineConfig,
    ) -> Self {
        let stages = Arc::new(Stages {
            versioned,
            registry,
            catalog,
            extraction,
            resolution,
            extraction_permits: Semaphore::new(config.extraction_parallelism.max(1)),
            resolution_permits: Semaphore::new(config.resolution_parallelism.max(1)),
            stats: Arc::new(PipelineStats::default()),
        });
        let router = Arc::new(Self::router(&stages));
        Self {
            stages,
            router,
            event_permits: Arc::new(Semaphore::new(config.event_parallelism.max(1))),
            sweep_parallelism: config.sweep_parallelism.max(1),
            sweep_interval: config.sweep_interval.max(Duration::from_secs(1)),
        }
    }

    fn router(stages: &Arc<Stages>) -> Partition<VersionedArtifactEvent> {
        let assets = {
            let stages = Arc::clone(stages);
            handler_fn(move |coordinates: MavenCoordinates| {
                let stages = Arc::clone(&stages);
                async move { stages.discover_assets(coordinates).await }
            })
        };
        let repositories = {
            let stages = Arc::clone(stages);
            handler_fn(move |coordinates: MavenCoordinates| {
                let stages = Arc::clone(&stages);
                async move { stages.associate_repositories(coordinates).await }
            })
        };
        let registered: Arc<dyn Handler<MavenCoordinates>> = Arc::new(
            Broadcast::<MavenCoordinates>::new("registered")
                .branch("assets", Arc::new(assets))
                .branch("repositories", Arc::new(repositories)),
        );

        let scan: Arc<dyn Handler<(MavenCoordinates, Vec<Asset>)>> = {
            let stages = Arc::clone(stages);
            Arc::new(handler_fn(move |(coordinates, assets): (MavenCoordinates, Vec<Asset>)| {
                let stages = Arc::clone(&stages);
                async move { stages.scan_assets(coordinates, assets).await }
            }))
        };
        let resolve: Arc<dyn Handler<MavenCoordinates>> = {
            let stages = Arc::clone(stages);
            Arc::new(handler_fn(move |coordinates: MavenCoordinates| {
                let stages = Arc::clone(&stages);
                async move { stages.resolve_commit(coordinates).await }
            }))
        };

        let counted = Arc::clone(&stages.stats);
        Partition::<VersionedArtifactEvent>::new("version-events")
            .route(
                move |event: VersionedArtifactEvent| match event {
                    VersionedArtifactEvent::Registered { coordinates } => {
                        PipelineStats::bump(&counted.registrations);
                        Ok(coordinates)
                    }
                    other => Err(other),
                },
                registered,
            )
            .route(
                |event: VersionedArtifactEvent| match event {
                    VersionedArtifactEvent::AssetsUpdated { coordinates, assets } => Ok((coordinates, assets)),
                    other => Err(other),
                },
                scan,
            )
            .route(
                |event: VersionedArtifactEvent| match event {
                    VersionedArtifactEvent::RawCommitRegistered { coordinates, .. }
                    | VersionedArtifactEvent::RepositoryAssociated { coordinates, .. } => Ok(coordinates),
                    other => Err(other),
                },
                resolve,
            )
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stages.stats)
    }

    /// Route one event and wait for its stage to finish
    pub async fn handle(&self, event: VersionedArtifactEvent) -> ServiceResult<()> {
        self.router.handle(event).await
    }

    /// Re-run the unfinished stages of every registered version.
    ///
    /// Returns the number of versions that had work outstanding.
    pub async fn sweep(&self) -> ServiceResult<usize> {
        self.stages.sweep(self.sweep_parallelism).await
    }

    /// Consume the live feed until `shutdown` fires.
    ///
    /// The subscription is taken before this returns, so events persisted
    /// afterwards are seen. Everything persisted earlier is caught up by a
    /// sweep started right away, and the feed overflowing triggers another
    /// one. On shutdown, events already being handled are waited for.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut feed = self.stages.versioned.subscribe();
        let router = Arc::clone(&self.router);
        let permits = Arc::clone(&self.event_permits);
        let stats = Arc::clone(&self.stages.stats);
        let stages = Arc::clone(&self.stages);
        let (sweep_parallelism, sweep_interval) = (self.sweep_parallelism, self.sweep_interval);

        tokio::spawn(async move {
            let tracker = TaskTracker::new();
            let stop = shutdown.child_token();
            let sweep_requested = Arc::new(Notify::new());
            tracker.spawn(run_sweeps(
                stages,
                Arc::clone(&sweep_requested),
                sweep_parallelism,
                sweep_interval,
                stop.clone(),
            ));
            info!("Pipeline started");

            loop {
                let envelope = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = feed.recv() => match received {
                        Ok(envelope) => envelope,
                        Err(RecvError::Lagged(skipped)) => {
                            PipelineStats::bump(&stats.lagged);
                            warn!(skipped, "Pipeline fell behind the event feed, requesting a sweep");
                            sweep_requested.notify_one();
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                let permit = tokio::select! {
                    _ = stop.cancelled() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let router = Arc::clone(&router);
                let stats = Arc::clone(&stats);
                tracker.spawn(async move {
                    let name = envelope.event.event_name().to_string();
                    if let Err(e) = router.handle(envelope.event).await {
                        PipelineStats::bump(&stats.stage_failures);
                        warn!(entity_id = %envelope.entity_id, event = %name, error = %e, "Pipeline stage failed");
                    }
                    drop(permit);
                });
            }

            stop.cancel();
            tracker.close();
            tracker.wait().await;
            info!("Pipeline stopped");
        })
    }
}

/// Sweep once right away, then on every tick or request until `stop` fires
async fn run_sweeps(
    stages: Arc<Stages>,
    requested: Arc<Notify>,
    parallelism: usize,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
            _ = requested.notified() => {}
        }
        tokio::select! {
            _ = stop.cancelled() => return,
            swept = stages.sweep(parallelism) => {
                if let Err(e) = swept {
                    PipelineStats::bump(&stages.stats.stage_failures);
                    warn!(error = %e, "Sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogArtifact, StaticCatalog};
    use crate::extraction::ExtractionConfig;
    use crate::resolution::{MockCommitSource, ResolutionConfig};
    use crate::versioned::CommitState;
    use async_trait::async_trait;
    use provenance_core::{ArtifactCoordinates, RegistryManifest, RepositoryUrl};
    use provenance_store::{EntityRuntime, InMemoryJournal, RuntimeConfig};
    use std::time::Duration;
    use url::Url;

    struct UnreachableAssets {
        url: Url,
    }

    #[async_trait]
    impl ArtifactRegistry for UnreachableAssets {
        async fn fetch_manifest(&self, artifact: &ArtifactCoordinates) -> ServiceResult<RegistryManifest> {
            Err(ServiceError::RegistryStatus {
                url: artifact.key(),
                status: 404,
            })
        }

        async fn fetch_assets(&self, _coordinates: &MavenCoordinates) -> ServiceResult<Vec<Asset>> {
            Ok(vec![
                Asset::new(None, "jar", self.url.clone()),
                Asset::new(Some("sources".to_string()), "jar", self.url.clone()),
            ])
        }
    }

    fn coordinates() -> MavenCoordinates {
        MavenCoordinates::new("org.example", "demo", "1.0").unwrap()
    }

    struct Harness {
        versioned: VersionedArtifacts,
        pipeline: Pipeline,
        repo: RepositoryUrl,
        _work_dir: tempfile::TempDir,
    }

    fn harness(jar_url: Url) -> Harness {
        let work_dir = tempfile::tempdir().unwrap();
        let versioned = VersionedArtifacts::new(EntityRuntime::start(
            Arc::new(InMemoryJournal::new()),
            RuntimeConfig::default(),
        ));
        let repo = RepositoryUrl::parse("https://github.com/example/demo.git").unwrap();
        let catalog = StaticCatalog::new().with_artifact(CatalogArtifact::new(
            coordinates().artifact(),
            vec![repo.clone()],
        ));
        let extraction = ExtractionPool::start(ExtractionConfig {
            pool_size: 1,
            work_dir: Some(work_dir.path().to_path_buf()),
            timeout: Duration::from_secs(5),
            ..ExtractionConfig::default()
        })
        .unwrap();
        let resolution = ResolutionPool::start(ResolutionConfig::default(), Arc::new(MockCommitSource::new()));

        let pipeline = Pipeline::new(
            versioned.clone(),
            Arc::new(UnreachableAssets { url: jar_url }),
            Arc::new(catalog),
            Arc::new(extraction),
            Arc::new(resolution),
            PipelineConfig::default(),
        );
        Harness {
            versioned,
            pipeline,
            repo,
            _work_dir: work_dir,
        }
    }

    impl Harness {
        /// Start the pipeline and wait for its startup sweep
        async fn start(&self, shutdown: &CancellationToken) -> JoinHandle<()> {
            let running = self.pipeline.spawn(shutdown.clone());
            let stats = self.pipeline.stats();
            for _ in 0..200 {
                if PipelineStats::get(&stats.sweeps) > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(PipelineStats::get(&stats.sweeps), 1);
            running
        }
    }

    #[tokio::test]
    async fn test_broken_archive_marks_asset_errored() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(b"not a zip".to_vec()))
            .mount(&server)
            .await;
        let h = harness(Url::parse(&format!("{}/demo-1.0.jar", server.uri())).unwrap());
        let shutdown = CancellationToken::new();
        let running = h.start(&shutdown).await;

        h.versioned.register(&coordinates()).await.unwrap();

        let mut errored = 0;
        for _ in 0..200 {
            let state = h.versioned.get_version(&coordinates()).await.unwrap();
            let record = state.record().unwrap();
            errored = record.errored_assets.len();
            if errored == 1 && record.repositories == vec![h.repo.clone()] {
                assert_eq!(record.assets.len(), 2);
                assert_eq!(record.commit, CommitState::Unknown);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(errored, 1);

        let stats = h.pipeline.stats();
        assert_eq!(PipelineStats::get(&stats.registrations), 1);
        assert_eq!(PipelineStats::get(&stats.extraction_failures), 1);

        // Nothing left for a sweep to retry
        assert_eq!(h.pipeline.sweep().await.unwrap(), 0);

        shutdown.cancel();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_archive_stays_eligible() {
        let h = harness(Url::parse("http://127.0.0.1:9/demo-1.0.jar").unwrap());
        let shutdown = CancellationToken::new();
        let running = h.start(&shutdown).await;

        h.versioned.register(&coordinates()).await.unwrap();

        let stats = h.pipeline.stats();
        for _ in 0..200 {
            if PipelineStats::get(&stats.extraction_failures) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(PipelineStats::get(&stats.extraction_failures), 1);

        let state = h.versioned.get_version(&coordinates()).await.unwrap();
        let record = state.record().unwrap();
        assert!(record.errored_assets.is_empty());
        assert!(record.assets.iter().any(|a| record.should_scan(a)));

        // The next sweep tries the download again
        assert_eq!(h.pipeline.sweep().await.unwrap(), 1);
        assert_eq!(PipelineStats::get(&stats.extraction_failures), 2);

        shutdown.cancel();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_unrouted_events_are_discarded() {
        let versioned = VersionedArtifacts::new(EntityRuntime::start(
            Arc::new(InMemoryJournal::new()),
            RuntimeConfig::default(),
        ));
        let pipeline = Pipeline::new(
            versioned,
            Arc::new(UnreachableAssets {
                url: Url::parse("http://127.0.0.1:9/x.jar").unwrap(),
            }),
            Arc::new(StaticCatalog::new()),
            Arc::new(ExtractionPool::start(ExtractionConfig::default()).unwrap()),
            Arc::new(ResolutionPool::start(ResolutionConfig::default(), Arc::new(MockCommitSource::new()))),
            PipelineConfig::default(),
        );

        let event = VersionedArtifactEvent::FilesErrored {
            coordinates: coordinates(),
            assets: vec![],
        };
        pipeline.handle(event).await.unwrap();
        assert_eq!(PipelineStats::get(&pipeline.stats().stage_failures), 0);
    }
}
