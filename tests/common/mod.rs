//! Common test utilities and helpers
//!
//! Wires the services to an in-memory journal, a mock registry and a
//! scripted commit source.

use async_trait::async_trait;
use provenance_core::{CommitDetails, CommitId, MavenCoordinates, RepositoryUrl};
use provenance_service::{
    CatalogArtifact, CommitSource, RegistryClient, RegistryClientConfig, ServiceError,
    ServiceResult, ServiceSettings, Services, StaticCatalog, VersionRecord,
};
use provenance_store::{Aggregate, EntityRuntime, InMemoryJournal, Journal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::MockServer;

pub mod fixtures;

use fixtures::{commit_details, demo};

/// Commit source answering from a fixed table of repositories
#[derive(Default)]
pub struct ScriptedCommits {
    known: HashMap<RepositoryUrl, Vec<CommitId>>,
    /// Lookups still to fail, per repository
    failures: Mutex<HashMap<RepositoryUrl, usize>>,
    lookups: Mutex<Vec<RepositoryUrl>>,
}

impl ScriptedCommits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit(mut self, repository: RepositoryUrl, sha: CommitId) -> Self {
        self.known.entry(repository).or_default().push(sha);
        self
    }

    /// Fail the first `times` lookups in `repository`
    pub fn failing(self, repository: RepositoryUrl, times: usize) -> Self {
        self.failures.lock().unwrap().insert(repository, times);
        self
    }

    /// Repositories looked up so far, in call order
    pub fn lookups(&self) -> Vec<RepositoryUrl> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommitSource for ScriptedCommits {
    async fn lookup(
        &self,
        repository: &RepositoryUrl,
        sha: &CommitId,
    ) -> ServiceResult<Option<CommitDetails>> {
        self.lookups.lock().unwrap().push(repository.clone());
        if let Some(left) = self.failures.lock().unwrap().get_mut(repository) {
            if *left > 0 {
                *left -= 1;
                return Err(ServiceError::Git(format!("cannot reach {}", repository)));
            }
        }
        let found = self
            .known
            .get(repository)
            .is_some_and(|shas| shas.contains(sha));
        Ok(found.then(|| commit_details(repository, sha)))
    }
}

/// Test application state
pub struct TestApp {
    pub server: MockServer,
    pub journal: Arc<InMemoryJournal>,
    pub services: Services,
    pub commits: Arc<ScriptedCommits>,
    pub work_dir: TempDir,
    pub shutdown: CancellationToken,
    repositories: Vec<RepositoryUrl>,
    settings: ServiceSettings,
}

impl TestApp {
    /// Create a new test application tracking `demo` in `repositories`
    pub async fn new(repositories: Vec<RepositoryUrl>, commits: ScriptedCommits) -> Self {
        Self::with_settings(repositories, commits, |_| {}).await
    }

    /// Same as [`TestApp::new`], with test settings adjusted by `configure`
    pub async fn with_settings<F>(
        repositories: Vec<RepositoryUrl>,
        commits: ScriptedCommits,
        configure: F,
    ) -> Self
    where
        F: FnOnce(&mut ServiceSettings),
    {
        let server = MockServer::start().await;
        let journal = Arc::new(InMemoryJournal::new());
        let work_dir = tempfile::tempdir().expect("Failed to create work dir");
        let commits = Arc::new(commits);

        let mut settings = ServiceSettings::default();
        settings.fetch_timeout = Duration::from_secs(5);
        settings.extraction.pool_size = 2;
        settings.extraction.timeout = Duration::from_secs(10);
        settings.extraction.work_dir = Some(work_dir.path().to_path_buf());
        settings.resolution.lookup_timeout = Duration::from_secs(5);
        settings.resync.startup_delay = Duration::from_secs(3600);
        configure(&mut settings);

        let services = build_services(&server, &journal, &commits, &repositories, &settings);

        Self {
            server,
            journal,
            services,
            commits,
            work_dir,
            shutdown: CancellationToken::new(),
            repositories,
            settings,
        }
    }

    /// Replace the services with fresh ones on the same journal, as a
    /// process restart would. A running pipeline is stopped first.
    pub fn restart(&mut self) {
        self.shutdown.cancel();
        self.shutdown = CancellationToken::new();
        self.services = build_services(
            &self.server,
            &self.journal,
            &self.commits,
            &self.repositories,
            &self.settings,
        );
    }

    /// Start consuming version events
    pub fn start_pipeline(&self) -> tokio::task::JoinHandle<()> {
        self.services.pipeline.spawn(self.shutdown.clone())
    }

    /// Number of events journaled for one entity
    pub async fn event_count<A: Aggregate>(&self, entity_id: &str) -> u64 {
        self.journal
            .highest_sequence(&EntityRuntime::<A>::persistence_id(entity_id))
            .await
            .expect("Failed to read journal")
    }

    /// Poll a version until `done` holds, failing after a few seconds
    pub async fn wait_for<F>(&self, coordinates: &MavenCoordinates, done: F) -> VersionRecord
    where
        F: Fn(&VersionRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let state = self
                .services
                .versioned
                .get_version(coordinates)
                .await
                .expect("Failed to read version");
            if let Some(record) = state.record() {
                if done(record) {
                    return record.clone();
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("{} did not reach the expected state: {:?}", coordinates, state);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Files left behind in the extraction work directory
    pub fn leftover_files(&self) -> usize {
        std::fs::read_dir(self.work_dir.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn build_services(
    server: &MockServer,
    journal: &Arc<InMemoryJournal>,
    commits: &Arc<ScriptedCommits>,
    repositories: &[RepositoryUrl],
    settings: &ServiceSettings,
) -> Services {
    let base_url = Url::parse(&format!("{}/maven2/", server.uri())).unwrap();
    let registry = RegistryClient::new(
        RegistryClientConfig::new(base_url).timeout(Duration::from_secs(5)),
    )
    .expect("Failed to create registry client");
    let catalog =
        StaticCatalog::new().with_artifact(CatalogArtifact::new(demo(), repositories.to_vec()));

    Services::new(
        journal.clone(),
        Arc::new(registry),
        Arc::new(catalog),
        commits.clone(),
        settings.clone(),
    )
    .expect("Failed to create services")
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
