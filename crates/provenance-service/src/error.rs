//! Service-layer error types
//!
//! This module defines error types specific to the service layer,
//! mapping domain, journal and transport errors to service-level errors.

use provenance_core::CoreError;
use provenance_store::{EntityError, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for service operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Service-layer error types
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The registry answered with an unexpected status
    #[error("Registry request to {url} failed with status {status}")]
    RegistryStatus { url: String, status: u16 },

    /// The registry or catalog could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// A fetched document could not be parsed
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Domain validation failed
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Entity runtime or journal failure
    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    /// A cross-boundary request exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// Archive could not be opened or read
    #[error("Archive error: {0}")]
    Archive(String),

    /// Source repository operation failed
    #[error("Git error: {0}")]
    Git(String),

    /// A worker pool or stage is no longer accepting work
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// One or more broadcast branches failed
    #[error("Branches failed: {0}")]
    BranchesFailed(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal service error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Failures the next scheduled cycle may recover from
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::RegistryStatus { status, .. } => *status >= 500 || *status == 429,
            ServiceError::Transport(_) | ServiceError::Timeout(_) => true,
            ServiceError::Entity(EntityError::Store(err)) => err.is_transient(),
            ServiceError::Entity(EntityError::Timeout(_)) => true,
            _ => false,
        }
    }
}

impl From<CoreError> for ServiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MalformedManifest(msg) => ServiceError::MalformedDocument(msg),
            CoreError::SerializationError(msg) => ServiceError::MalformedDocument(msg),
            other => ServiceError::ValidationFailed(other.to_string()),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::Entity(EntityError::Store(err))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::MalformedDocument(err.to_string())
        } else if let Some(status) = err.status() {
            ServiceError::RegistryStatus {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            }
        } else {
            ServiceError::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for ServiceError {
    fn from(err: url::ParseError) -> Self {
        ServiceError::Configuration(format!("Invalid URL: {}", err))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

impl From<zip::result::ZipError> for ServiceError {
    fn from(err: zip::result::ZipError) -> Self {
        ServiceError::Archive(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::MalformedDocument(err.to_string())
    }
}
