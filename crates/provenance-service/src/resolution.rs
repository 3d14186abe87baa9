//! Commit resolution against candidate source repositories
//!
//! A raw commit id found in an archive is resolved by looking it up in the
//! repositories associated with its version, in order, stopping at the first
//! repository that knows it.

use async_trait::async_trait;
use chrono::DateTime;
use provenance_core::{CommitDetails, CommitId, MavenCoordinates, RepositoryUrl, Signature};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::supervision::{BackoffSettings, SupervisionStrategy, SupervisorStats, Worker, WorkerPool};

/// Field separator used in `git show` output
const FIELD_SEPARATOR: char = '\u{1f}';
const SHOW_FORMAT: &str = "--format=%an%x1f%ae%x1f%cn%x1f%ce%x1f%cI%x1f%B";

/// Lookup of commit metadata in one repository
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// `Ok(None)` when the repository does not contain `sha`
    async fn lookup(
        &self,
        repository: &RepositoryUrl,
        sha: &CommitId,
    ) -> ServiceResult<Option<CommitDetails>>;
}

/// [`CommitSource`] backed by the `git` executable and local bare clones
pub struct GitCli {
    program: String,
    checkout_root: PathBuf,
    command_timeout: Duration,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitCli {
    pub fn new(checkout_root: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            program: "git".to_string(),
            checkout_root: checkout_root.into(),
            command_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use a different git executable
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Local clone directory of a repository
    pub fn checkout_dir(&self, repository: &RepositoryUrl) -> PathBuf {
        let name: String = repository
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.checkout_root.join(name)
    }

    async fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> ServiceResult<Output> {
        let mut command = Command::new(&self.program);
        if let Some(dir) = dir {
            command.arg("-C").arg(dir);
        }
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        debug!(args = ?args, "Running git");
        tokio::time::timeout(self.command_timeout, command.output())
            .await
            .map_err(|_| ServiceError::Timeout(self.command_timeout))?
            .map_err(|e| ServiceError::Git(format!("failed to run {}: {}", self.program, e)))
    }

    async fn git_ok(&self, dir: Option<&Path>, args: &[&str]) -> ServiceResult<Output> {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            return Err(ServiceError::Git(format!(
                "git {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    async fn has_commit(&self, dir: &Path, sha: &CommitId) -> ServiceResult<bool> {
        let object = format!("{}^{{commit}}", sha);
        Ok(self.git(Some(dir), &["cat-file", "-e", &object]).await?.status.success())
    }

    /// Clone the repository, or fetch into an existing clone
    async fn sync(&self, repository: &RepositoryUrl, dir: &Path) -> ServiceResult<()> {
        if tokio::fs::try_exists(dir).await? {
            self.git_ok(
                Some(dir),
                &[
                    "fetch",
                    "--quiet",
                    "--filter=blob:none",
                    "--no-tags",
                    repository.as_str(),
                    "+refs/heads/*:refs/heads/*",
                ],
            )
            .await?;
        } else {
            tokio::fs::create_dir_all(&self.checkout_root).await?;
            let target = dir.to_string_lossy();
            self.git_ok(
                None,
                &[
                    "clone",
                    "--quiet",
                    "--bare",
                    "--filter=blob:none",
                    "--no-tags",
                    repository.as_str(),
                    target.as_ref(),
                ],
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommitSource for GitCli {
    #[instrument(skip(self), fields(repository = %repository, sha = %sha.short()))]
    async fn lookup(
        &self,
        repository: &RepositoryUrl,
        sha: &CommitId,
    ) -> ServiceResult<Option<CommitDetails>> {
        let dir = self.checkout_dir(repository);
        let lock = self.lock_for(&dir).await;
        let _guard = lock.lock().await;

        let known = tokio::fs::try_exists(&dir).await? && self.has_commit(&dir, sha).await?;
        if !known {
            self.sync(repository, &dir).await?;
            if !self.has_commit(&dir, sha).await? {
                return Ok(None);
            }
        }

        let output = self
            .git_ok(Some(&dir), &["show", "-s", SHOW_FORMAT, sha.as_str()])
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_show_output(sha, repository, &text).map(Some)
    }
}

/// Build commit details from `git show` output in [`SHOW_FORMAT`]
fn parse_show_output(
    sha: &CommitId,
    repository: &RepositoryUrl,
    text: &str,
) -> ServiceResult<CommitDetails> {
    let fields: Vec<&str> = text.splitn(6, FIELD_SEPARATOR).collect();
    let &[author_name, author_email, committer_name, committer_email, date, message] = fields.as_slice() else {
        return Err(ServiceError::Git(format!(
            "unexpected git show output for {}",
            sha.short()
        )));
    };

    let timestamp = DateTime::parse_from_rfc3339(date.trim())
        .map_err(|e| ServiceError::Git(format!("invalid commit date {:?}: {}", date, e)))?;

    Ok(CommitDetails::new(
        sha.clone(),
        Signature::new(author_name.trim(), author_email.trim()),
        Signature::new(committer_name.trim(), committer_email.trim()),
        repository.clone(),
        timestamp,
        message,
    ))
}

/// Outcome of resolving one commit id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResolution {
    Resolved {
        repository: RepositoryUrl,
        details: CommitDetails,
    },
    /// `attempted` answered that the commit is absent. `failed` could not
    /// be asked and stay candidates for a later attempt.
    NotFound {
        attempted: Vec<RepositoryUrl>,
        failed: Vec<RepositoryUrl>,
    },
}

/// Request handled by a resolution worker
#[derive(Debug)]
pub struct ResolveCommitDetails {
    pub coordinates: MavenCoordinates,
    pub sha: CommitId,
    pub candidates: Vec<RepositoryUrl>,
    pub reply_to: oneshot::Sender<CommitResolution>,
}

/// Worker trying candidate repositories in order
pub struct CommitResolver {
    source: Arc<dyn CommitSource>,
    lookup_timeout: Duration,
}

impl CommitResolver {
    pub fn new(source: Arc<dyn CommitSource>, lookup_timeout: Duration) -> Self {
        Self {
            source,
            lookup_timeout,
        }
    }

    #[instrument(skip(self, candidates), fields(sha = %sha.short(), candidates = candidates.len()))]
    pub async fn resolve(&self, sha: &CommitId, candidates: &[RepositoryUrl]) -> CommitResolution {
        let mut attempted = Vec::with_capacity(candidates.len());
        let mut failed = Vec::new();
        for repository in candidates {
            let lookup = tokio::time::timeout(self.lookup_timeout, self.source.lookup(repository, sha));
            match lookup.await {
                Ok(Ok(Some(details))) => {
                    debug!(repository = %repository, "Commit resolved");
                    return CommitResolution::Resolved {
                        repository: repository.clone(),
                        details,
                    };
                }
                Ok(Ok(None)) => {
                    debug!(repository = %repository, "Commit not in repository");
                    attempted.push(repository.clone());
                }
                Ok(Err(e)) => {
                    warn!(repository = %repository, error = %e, "Commit lookup failed");
                    failed.push(repository.clone());
                }
                Err(_) => {
                    warn!(repository = %repository, timeout = ?self.lookup_timeout, "Commit lookup timed out");
                    failed.push(repository.clone());
                }
            }
        }
        CommitResolution::NotFound { attempted, failed }
    }
}

#[async_trait]
impl Worker for CommitResolver {
    type Message = ResolveCommitDetails;

    async fn handle(&mut self, message: ResolveCommitDetails) {
        debug!(coordinates = %message.coordinates, "Resolving commit");
        let resolution = self.resolve(&message.sha, &message.candidates).await;
        let _ = message.reply_to.send(resolution);
    }
}

/// Resolution settings
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
    pub lookup_timeout: Duration,
    pub backoff: BackoffSettings,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            queue_capacity: 64,
            lookup_timeout: Duration::from_secs(300),
            backoff: BackoffSettings::default(),
        }
    }
}

/// Pool of [`CommitResolver`]s restarted with backoff after a crash
pub struct ResolutionPool {
    pool: WorkerPool<ResolveCommitDetails>,
}

impl ResolutionPool {
    pub fn start(config: ResolutionConfig, source: Arc<dyn CommitSource>) -> Self {
        info!(size = config.pool_size, "Starting resolution pool");
        let lookup_timeout = config.lookup_timeout;
        let pool = WorkerPool::spawn(
            "resolution",
            config.pool_size,
            config.queue_capacity,
            SupervisionStrategy::RestartWithBackoff(config.backoff),
            move |_index| Ok(CommitResolver::new(Arc::clone(&source), lookup_timeout)),
        );
        Self { pool }
    }

    /// Queue a resolution and wait for it.
    ///
    /// Fails only when no worker produced an answer, in which case nothing
    /// should be recorded for the commit.
    pub async fn resolve(
        &self,
        coordinates: MavenCoordinates,
        sha: CommitId,
        candidates: Vec<RepositoryUrl>,
    ) -> ServiceResult<CommitResolution> {
        let (reply_to, reply) = oneshot::channel();
        self.pool
            .submit(ResolveCommitDetails {
                coordinates,
                sha,
                candidates,
                reply_to,
            })
            .await?;
        reply
            .await
            .map_err(|_| ServiceError::WorkerUnavailable("resolution worker dropped the request".to_string()))
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        self.pool.stats()
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
