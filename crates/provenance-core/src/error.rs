//! Error types for the provenance domain model

use thiserror::Error;

/// Result type alias for domain operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised while constructing or parsing domain values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Coordinates could not be parsed or failed validation
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    /// Version string is empty or malformed
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Commit identifier is not a hex-encoded object id
    #[error("Invalid commit id: {0}")]
    InvalidCommitId(String),

    /// Registry manifest document could not be parsed
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    /// Generic validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<quick_xml::DeError> for CoreError {
    fn from(err: quick_xml::DeError) -> Self {
        CoreError::MalformedManifest(err.to_string())
    }
}

impl From<url::ParseError> for CoreError {
    fn from(err: url::ParseError) -> Self {
        CoreError::ValidationError(format!("Invalid URL: {}", err))
    }
}
