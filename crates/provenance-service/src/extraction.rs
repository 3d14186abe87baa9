//! Commit extraction from published archives
//!
//! Build tooling commonly stamps the commit a jar was built from into its
//! `META-INF/MANIFEST.MF`. Extraction downloads the archive to a private
//! temporary file, reads the manifest's main section and looks for one of
//! the configured commit attributes. The temporary file is removed when
//! processing ends, whatever the outcome.

use async_trait::async_trait;
use provenance_core::{CommitId, VersionedAsset};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{ServiceError, ServiceResult};
use crate::supervision::{SupervisionStrategy, SupervisorStats, Worker, WorkerPool};

/// Manifest location inside a jar
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Attribute read when none are configured
pub const DEFAULT_COMMIT_ATTRIBUTE: &str = "Git-Commit";

const TEMP_PREFIX: &str = "commit-check-";
const TEMP_SUFFIX: &str = ".jar";

/// Outcome of one extraction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionResult {
    DiscoveredCommitFromFile { sha: CommitId, asset: VersionedAsset },
    NoCommitsFound { asset: VersionedAsset },
    /// `transient` failures say nothing about the archive itself
    FailedToRetrieveCommit {
        asset: VersionedAsset,
        reason: String,
        transient: bool,
    },
}

impl ExtractionResult {
    pub fn asset(&self) -> &VersionedAsset {
        match self {
            ExtractionResult::DiscoveredCommitFromFile { asset, .. }
            | ExtractionResult::NoCommitsFound { asset }
            | ExtractionResult::FailedToRetrieveCommit { asset, .. } => asset,
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionResult::DiscoveredCommitFromFile { .. } => "discovered",
            ExtractionResult::NoCommitsFound { .. } => "not_found",
            ExtractionResult::FailedToRetrieveCommit { .. } => "failed",
        }
    }

    /// Whether a later attempt on the same asset could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractionResult::FailedToRetrieveCommit { transient: true, .. }
        )
    }
}

/// Local faults and registry hiccups, as opposed to a broken or missing archive
fn transient_fault(err: &ServiceError) -> bool {
    err.is_transient() || matches!(err, ServiceError::Io(_) | ServiceError::Internal(_))
}

/// Request handled by an extraction worker
#[derive(Debug)]
pub struct AttemptFileCommit {
    pub asset: VersionedAsset,
    pub reply_to: oneshot::Sender<ExtractionResult>,
}

/// Extraction settings
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
    /// Download and parse deadline for one asset
    pub timeout: Duration,
    /// Directory for temporary archives, the system default when unset
    pub work_dir: Option<PathBuf>,
    /// Manifest attributes holding a commit id, tried in order
    pub commit_attributes: Vec<String>,
    pub user_agent: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 64,
            timeout: Duration::from_secs(1200),
            work_dir: None,
            commit_attributes: vec![DEFAULT_COMMIT_ATTRIBUTE.to_string()],
            user_agent: crate::registry_client::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Worker that downloads and inspects one archive at a time
pub struct CommitExtractor {
    http: reqwest::Client,
    config: Arc<ExtractionConfig>,
}

impl CommitExtractor {
    pub fn new(http: reqwest::Client, config: Arc<ExtractionConfig>) -> Self {
        Self { http, config }
    }

    /// Look for a commit id in `asset`, never failing
    #[instrument(skip(self), fields(asset = %asset))]
    pub async fn extract(&self, asset: &VersionedAsset) -> ExtractionResult {
        let outcome = tokio::time::timeout(self.config.timeout, self.find_commit(asset)).await;
        let result = match outcome {
            Ok(Ok(Some(sha))) => ExtractionResult::DiscoveredCommitFromFile {
                sha,
                asset: asset.clone(),
            },
            Ok(Ok(None)) => ExtractionResult::NoCommitsFound {
                asset: asset.clone(),
            },
            Ok(Err(e)) => {
                let transient = transient_fault(&e);
                warn!(error = %e, transient, "Commit extraction failed");
                ExtractionResult::FailedToRetrieveCommit {
                    asset: asset.clone(),
                    reason: e.to_string(),
                    transient,
                }
            }
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "Commit extraction timed out");
                ExtractionResult::FailedToRetrieveCommit {
                    asset: asset.clone(),
                    reason: format!("timed out after {:?}", self.config.timeout),
                    transient: true,
                }
            }
        };
        debug!(outcome = result.kind(), "Extraction finished");
        result
    }

    async fn find_commit(&self, asset: &VersionedAsset) -> ServiceResult<Option<CommitId>> {
        let archive = self.download(asset.download_url()).await?;
        let attributes = self.config.commit_attributes.clone();

        // The temporary file moves into the blocking task and is removed when it ends
        let raw = tokio::task::spawn_blocking(move || {
            let found = read_commit_attribute(archive.as_file(), &attributes);
            drop(archive);
            found
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("archive reader failed: {}", e)))??;

        raw.map(|value| CommitId::parse(&value).map_err(ServiceError::from))
            .transpose()
    }

    async fn download(&self, url: &Url) -> ServiceResult<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX).suffix(TEMP_SUFFIX);
        let temp = match &self.config.work_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let mut response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ServiceError::RegistryStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut out = tokio::fs::File::from_std(temp.reopen()?);
        let mut written = 0usize;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len();
        }
        out.flush().await?;
        debug!(bytes = written, path = %temp.path().display(), "Archive downloaded");
        Ok(temp)
    }
}

#[async_trait]
impl Worker for CommitExtractor {
    type Message = AttemptFileCommit;

    async fn handle(&mut self, message: AttemptFileCommit) {
        let result = self.extract(&message.asset).await;
        let _ = message.reply_to.send(result);
    }
}

/// Read the first configured commit attribute from a jar's manifest.
///
/// Returns `None` when the archive has no manifest or none of the attributes
/// is present in its main section.
pub fn read_commit_attribute(file: &File, attributes: &[String]) -> ServiceResult<Option<String>> {
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entry = match archive.by_name(MANIFEST_PATH) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut text = String::new();
    entry.read_to_string(&mut text)?;
    let main = main_attributes(&text);

    Ok(attributes
        .iter()
        .find_map(|name| main.get(&name.to_ascii_lowercase()))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty()))
}

/// Main-section attributes of a manifest, keyed by lowercased name.
///
/// Lines starting with a single space continue the previous value; the main
/// section ends at the first blank line.
fn main_attributes(text: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if let Some(continued) = line.strip_prefix(' ') {
            if let Some((_, value)) = current.as_mut() {
                value.push_str(continued);
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            attributes.insert(name, value);
        }
        if let Some((name, value)) = line.split_once(':') {
            current = Some((
                name.trim().to_ascii_lowercase(),
                value.strip_prefix(' ').unwrap_or(value).to_string(),
            ));
        }
    }
    if let Some((name, value)) = current {
        attributes.insert(name, value);
    }
    attributes
}

/// Resumable pool of [`CommitExtractor`]s
pub struct ExtractionPool {
    pool: WorkerPool<AttemptFileCommit>,
}

impl ExtractionPool {
    pub fn start(config: ExtractionConfig) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ServiceError::Configuration(format!("HTTP client: {}", e)))?;
        let size = config.pool_size;
        let queue = config.queue_capacity;
        let config = Arc::new(config);

        info!(size, "Starting extraction pool");
        let pool = WorkerPool::spawn(
            "extraction",
            size,
            queue,
            SupervisionStrategy::Resume,
            move |_index| Ok(CommitExtractor::new(http.clone(), Arc::clone(&config))),
        );
        Ok(Self { pool })
    }

    /// Queue an asset and wait for its result
    pub async fn attempt(&self, asset: VersionedAsset) -> ExtractionResult {
        let (reply_to, reply) = oneshot::channel();
        let request = AttemptFileCommit {
            asset: asset.clone(),
            reply_to,
        };
        if let Err(e) = self.pool.submit(request).await {
            return ExtractionResult::FailedToRetrieveCommit {
                asset,
                reason: e.to_string(),
                transient: true,
            };
        }
        reply
            .await
            .unwrap_or_else(|_| ExtractionResult::FailedToRetrieveCommit {
                asset,
                reason: "extraction worker dropped the request".to_string(),
                transient: true,
            })
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        self.pool.stats()
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
