//! Service layer of the provenance synchronizer
//!
//! This crate turns registry manifests into registered versions and follows
//! each version back to the source commit it was built from.
//!
//! # Architecture
//!
//! - **ArtifactSynchronizer**: records registry manifests per artifact and
//!   reports the versions they list
//! - **ResyncManager**: periodically resyncs every catalog artifact and
//!   registers newly discovered versions
//! - **VersionedArtifacts**: per-version state machine from registration to
//!   resolved commit
//! - **Pipeline**: routes version events to asset discovery, commit
//!   extraction and commit resolution
//! - **ExtractionPool** / **ResolutionPool**: supervised worker pools doing
//!   the slow I/O
//!
//! # Example
//!
//! ```rust,no_run
//! use provenance_service::{GitCli, RegistryClient, RegistryClientConfig, ServiceSettings, Services, StaticCatalog};
//! use provenance_store::{InMemoryJournal, Journal};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> provenance_service::ServiceResult<()> {
//! let journal: Arc<dyn Journal> = Arc::new(InMemoryJournal::new());
//! let registry = RegistryClient::new(RegistryClientConfig::new(
//!     "https://repo1.maven.org/maven2/".parse()?,
//! ))?;
//! let services = Services::new(
//!     journal,
//!     Arc::new(registry),
//!     Arc::new(StaticCatalog::new()),
//!     Arc::new(GitCli::new("/var/cache/provenance", Duration::from_secs(600))),
//!     ServiceSettings::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod error;
pub mod extraction;
pub mod orchestrator;
pub mod pipeline;
pub mod registry_client;
pub mod resolution;
pub mod routing;
pub mod supervision;
pub mod synchronizer;
pub mod versioned;

// Re-export main types for convenience
pub use catalog::{ArtifactCatalog, CatalogArtifact, HttpCatalog, StaticCatalog};
pub use error::{ServiceError, ServiceResult};
pub use extraction::{ExtractionConfig, ExtractionPool, ExtractionResult};
pub use orchestrator::{ResyncConfig, ResyncManager, ResyncReport, ResyncStats};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStats};
pub use registry_client::{ArtifactRegistry, RegistryClient, RegistryClientConfig};
pub use resolution::{CommitResolution, CommitSource, GitCli, ResolutionConfig, ResolutionPool};
pub use routing::{handler_fn, Broadcast, Handler, Partition};
pub use supervision::{BackoffSettings, SupervisionStrategy, SupervisorStats, Worker, WorkerPool};
pub use synchronizer::{ArtifactSynchronizer, SyncReply, SyncState, SyncStatus};
pub use versioned::{CommitState, VersionRecord, VersionReply, VersionedArtifact, VersionedArtifacts};

use provenance_store::{EntityRuntime, Journal, RuntimeConfig};
use std::sync::Arc;
use std::time::Duration;

/// Settings for every service built by [`Services::new`]
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub runtime: RuntimeConfig,
    /// Deadline for one manifest fetch
    pub fetch_timeout: Duration,
    pub resync: ResyncConfig,
    pub extraction: ExtractionConfig,
    pub resolution: ResolutionConfig,
    pub pipeline: PipelineConfig,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            fetch_timeout: Duration::from_secs(30),
            resync: ResyncConfig::default(),
            extraction: ExtractionConfig::default(),
            resolution: ResolutionConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Holds all service instances wired to one journal
#[derive(Clone)]
pub struct Services {
    pub synchronizer: ArtifactSynchronizer,
    pub versioned: VersionedArtifacts,
    pub resync: Arc<ResyncManager>,
    pub pipeline: Arc<Pipeline>,
    pub extraction: Arc<ExtractionPool>,
    pub resolution: Arc<ResolutionPool>,
}

impl Services {
    /// Start the entity runtimes and worker pools
    pub fn new(
        journal: Arc<dyn Journal>,
        registry: Arc<dyn ArtifactRegistry>,
        catalog: Arc<dyn ArtifactCatalog>,
        commits: Arc<dyn CommitSource>,
        settings: ServiceSettings,
    ) -> ServiceResult<Self> {
        let synchronizer = ArtifactSynchronizer::new(
            EntityRuntime::start(Arc::clone(&journal), settings.runtime.clone()),
            Arc::clone(&registry),
            settings.fetch_timeout,
        );
        let versioned = VersionedArtifacts::new(EntityRuntime::start(journal, settings.runtime));

        let extraction = Arc::new(ExtractionPool::start(settings.extraction)?);
        let resolution = Arc::new(ResolutionPool::start(settings.resolution, commits));

        let resync = Arc::new(ResyncManager::new(
            Arc::clone(&catalog),
            synchronizer.clone(),
            versioned.clone(),
            settings.resync,
        ));
        let pipeline = Arc::new(Pipeline::new(
            versioned.clone(),
            registry,
            catalog,
            Arc::clone(&extraction),
            Arc::clone(&resolution),
            settings.pipeline,
        ));

        Ok(Self {
            synchronizer,
            versioned,
            resync,
            pipeline,
            extraction,
            resolution,
        })
    }

    pub fn versioned(&self) -> &VersionedArtifacts {
        &self.versioned
    }

    pub fn resync(&self) -> &Arc<ResyncManager> {
        &self.resync
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}
