//! Server configuration
//!
//! This module handles hierarchical configuration loading from multiple sources:
//! - Default configuration file
//! - Environment-specific configuration file
//! - Environment variables
//! - Command-line arguments

use config::{Config, ConfigError, Environment, File};
use provenance_core::{ArtifactCoordinates, RepositoryUrl};
use provenance_service::{
    BackoffSettings, CatalogArtifact, ExtractionConfig, PipelineConfig, RegistryClientConfig,
    ResolutionConfig, ResyncConfig, ServiceSettings, StaticCatalog,
};
use provenance_store::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Rejected configuration values
#[derive(Debug, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{field} is not a valid URL: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("catalog entry {entry} is invalid: {reason}")]
    InvalidCatalogEntry { entry: String, reason: String },
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub resync: ResyncSettings,

    #[serde(default)]
    pub extraction: ExtractionSettings,

    #[serde(default)]
    pub resolution: ResolutionSettings,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable graceful shutdown
    #[serde(default = "default_true")]
    pub graceful_shutdown: bool,

    /// Time allowed for background work to stop, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            graceful_shutdown: default_true(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

/// Artifact registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Repository root holding `maven-metadata.xml` documents
    #[serde(default = "default_registry_url")]
    pub base_url: String,

    /// REST search endpoint listing a version's assets
    #[serde(default)]
    pub search_url: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
}

fn default_registry_url() -> String {
    "https://repo1.maven.org/maven2/".to_string()
}

fn default_user_agent() -> String {
    provenance_service::registry_client::DEFAULT_USER_AGENT.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            search_url: None,
            user_agent: default_user_agent(),
            timeout_seconds: default_request_timeout(),
        }
    }
}

/// Source of tracked groups and artifacts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// HTTP catalog endpoint; the static list is used when unset
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub groups: Vec<CatalogGroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogGroupConfig {
    pub group_id: String,
    #[serde(default)]
    pub artifacts: Vec<CatalogArtifactConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogArtifactConfig {
    pub artifact_id: String,
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// Resync scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncSettings {
    #[serde(default = "default_startup_delay")]
    pub startup_delay_seconds: u64,

    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_parallelism")]
    pub group_parallelism: usize,

    #[serde(default = "default_parallelism")]
    pub artifact_parallelism: usize,

    #[serde(default = "default_parallelism")]
    pub registration_parallelism: usize,

    /// Deadline for one artifact's resync
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,

    /// Period of the sweep re-submitting unfinished versions to the pipeline
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_sweep_interval() -> u64 {
    900
}

fn default_startup_delay() -> u64 {
    60
}

fn default_interval() -> u64 {
    300
}

fn default_parallelism() -> usize {
    4
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            startup_delay_seconds: default_startup_delay(),
            interval_seconds: default_interval(),
            group_parallelism: default_parallelism(),
            artifact_parallelism: default_parallelism(),
            registration_parallelism: default_parallelism(),
            timeout_seconds: default_request_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Commit extraction pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    #[serde(default = "default_parallelism")]
    pub pool_size: usize,

    /// Versions scanned at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_extraction_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    #[serde(default = "default_commit_attributes")]
    pub commit_attributes: Vec<String>,
}

fn default_extraction_timeout() -> u64 {
    1200
}

fn default_commit_attributes() -> Vec<String> {
    vec![provenance_service::extraction::DEFAULT_COMMIT_ATTRIBUTE.to_string()]
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            pool_size: default_parallelism(),
            parallelism: default_parallelism(),
            timeout_seconds: default_extraction_timeout(),
            work_dir: None,
            commit_attributes: default_commit_attributes(),
        }
    }
}

/// Commit resolution pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSettings {
    #[serde(default = "default_parallelism")]
    pub pool_size: usize,

    #[serde(default = "default_resolution_timeout")]
    pub timeout_seconds: u64,

    /// Where bare clones of source repositories are kept
    #[serde(default = "default_checkout_dir")]
    pub checkout_dir: PathBuf,

    #[serde(default = "default_min_backoff")]
    pub min_backoff_millis: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    #[serde(default = "default_restart_window")]
    pub restart_window_seconds: u64,
}

fn default_resolution_timeout() -> u64 {
    600
}

fn default_checkout_dir() -> PathBuf {
    std::env::temp_dir().join("provenance-checkouts")
}

fn default_min_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    40
}

fn default_jitter() -> f64 {
    0.1
}

fn default_max_restarts() -> usize {
    10
}

fn default_restart_window() -> u64 {
    60
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            pool_size: default_parallelism(),
            timeout_seconds: default_resolution_timeout(),
            checkout_dir: default_checkout_dir(),
            min_backoff_millis: default_min_backoff(),
            max_backoff_seconds: default_max_backoff(),
            jitter: default_jitter(),
            max_restarts: default_max_restarts(),
            restart_window_seconds: default_restart_window(),
        }
    }
}

/// Journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `memory` or a `sqlite:` URL
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,

    #[serde(default = "default_shards")]
    pub shards: usize,

    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_seconds: u64,
}

fn default_store_url() -> String {
    provenance_store::IN_MEMORY_URL.to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_snapshot_every() -> u64 {
    5
}

fn default_shards() -> usize {
    16
}

fn default_invoke_timeout() -> u64 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
            snapshot_every: default_snapshot_every(),
            shards: default_shards(),
            invoke_timeout_seconds: default_invoke_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting
    #[serde(default)]
    pub json_format: bool,

    /// Include thread IDs
    #[serde(default)]
    pub include_thread_ids: bool,

    /// Include target module
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from files and environment
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default configuration file (config/default.toml)
    /// 2. Environment-specific file (config/{env}.toml)
    /// 3. Environment variables (PROVENANCE_*)
    pub fn load(config_dir: impl Into<PathBuf>, environment: &str) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();

        let config = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", environment))).required(false))
            // e.g., PROVENANCE_RESYNC__INTERVAL_SECONDS=600
            .add_source(
                Environment::with_prefix("PROVENANCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration with defaults if files don't exist
    pub fn load_or_default(config_dir: impl Into<PathBuf>, environment: &str) -> Self {
        Self::load(config_dir, environment).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load configuration: {}", e);
            eprintln!("Using default configuration");
            Self::default()
        })
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let counts = [
            ("resync.group_parallelism", self.resync.group_parallelism),
            ("resync.artifact_parallelism", self.resync.artifact_parallelism),
            ("resync.registration_parallelism", self.resync.registration_parallelism),
            ("extraction.pool_size", self.extraction.pool_size),
            ("extraction.parallelism", self.extraction.parallelism),
            ("resolution.pool_size", self.resolution.pool_size),
            ("store.shards", self.store.shards),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigValidationError::Zero(field));
        }
        if self.resync.interval_seconds == 0 {
            return Err(ConfigValidationError::Zero("resync.interval_seconds"));
        }
        if self.resync.sweep_interval_seconds == 0 {
            return Err(ConfigValidationError::Zero("resync.sweep_interval_seconds"));
        }

        parse_url("registry.base_url", &self.registry.base_url)?;
        if let Some(search) = &self.registry.search_url {
            parse_url("registry.search_url", search)?;
        }
        if let Some(catalog) = &self.catalog.base_url {
            parse_url("catalog.base_url", catalog)?;
        }
        self.static_catalog()?;
        Ok(())
    }

    pub fn registry_client_config(&self) -> Result<RegistryClientConfig, ConfigValidationError> {
        let mut client = RegistryClientConfig::new(parse_url("registry.base_url", &self.registry.base_url)?)
            .user_agent(self.registry.user_agent.clone())
            .timeout(Duration::from_secs(self.registry.timeout_seconds));
        if let Some(search) = &self.registry.search_url {
            client = client.search_url(parse_url("registry.search_url", search)?);
        }
        Ok(client)
    }

    /// Catalog built from the `catalog.groups` list
    pub fn static_catalog(&self) -> Result<StaticCatalog, ConfigValidationError> {
        let mut catalog = StaticCatalog::new();
        for group in &self.catalog.groups {
            for artifact in &group.artifacts {
                let entry = format!("{}:{}", group.group_id, artifact.artifact_id);
                let invalid = |reason: String| ConfigValidationError::InvalidCatalogEntry {
                    entry: entry.clone(),
                    reason,
                };
                let coordinates = ArtifactCoordinates::new(group.group_id.as_str(), artifact.artifact_id.as_str())
                    .map_err(|e| invalid(e.to_string()))?;
                let repositories = artifact
                    .repositories
                    .iter()
                    .map(|raw| RepositoryUrl::parse(raw).map_err(|e| invalid(e.to_string())))
                    .collect::<Result<Vec<_>, _>>()?;
                catalog.insert(CatalogArtifact::new(coordinates, repositories));
            }
        }
        Ok(catalog)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        let runtime = RuntimeConfig::default()
            .shards(self.store.shards)
            .snapshot_every(self.store.snapshot_every)
            .invoke_timeout(Duration::from_secs(self.store.invoke_timeout_seconds));

        ServiceSettings {
            runtime,
            fetch_timeout: Duration::from_secs(self.registry.timeout_seconds),
            resync: ResyncConfig {
                startup_delay: Duration::from_secs(self.resync.startup_delay_seconds),
                interval: Duration::from_secs(self.resync.interval_seconds),
                group_parallelism: self.resync.group_parallelism,
                artifact_parallelism: self.resync.artifact_parallelism,
                registration_parallelism: self.resync.registration_parallelism,
                artifact_timeout: Duration::from_secs(self.resync.timeout_seconds),
            },
            extraction: ExtractionConfig {
                pool_size: self.extraction.pool_size,
                timeout: Duration::from_secs(self.extraction.timeout_seconds),
                work_dir: self.extraction.work_dir.clone(),
                commit_attributes: self.extraction.commit_attributes.clone(),
                user_agent: self.registry.user_agent.clone(),
                ..ExtractionConfig::default()
            },
            resolution: ResolutionConfig {
                pool_size: self.resolution.pool_size,
                lookup_timeout: Duration::from_secs(self.resolution.timeout_seconds),
                backoff: BackoffSettings {
                    min_backoff: Duration::from_millis(self.resolution.min_backoff_millis),
                    max_backoff: Duration::from_secs(self.resolution.max_backoff_seconds),
                    jitter: self.resolution.jitter,
                    max_restarts: self.resolution.max_restarts,
                    within: Duration::from_secs(self.resolution.restart_window_seconds),
                },
                ..ResolutionConfig::default()
            },
            pipeline: PipelineConfig {
                extraction_parallelism: self.extraction.parallelism,
                resolution_parallelism: self.resolution.pool_size,
                sweep_interval: Duration::from_secs(self.resync.sweep_interval_seconds),
                ..PipelineConfig::default()
            },
        }
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigValidationError> {
    Url::parse(raw).map_err(|e| ConfigValidationError::InvalidUrl {
        field,
        reason: e.to_string(),
    })
}
