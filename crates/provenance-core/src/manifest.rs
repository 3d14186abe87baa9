//! Registry version manifests
//!
//! `RegistryManifest` is the parsed form of a registry's
//! `maven-metadata.xml` document for one artifact.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::coordinates::{ArtifactCoordinates, MavenCoordinates};
use crate::error::{CoreError, CoreResult};

/// `yyyyMMddHHmmss`, the format registries stamp `lastUpdated` with
pub const LAST_UPDATED_FORMAT: &str = "%Y%m%d%H%M%S";

/// Opaque `lastUpdated` token with the registry's comparison order.
///
/// Tokens that parse as [`LAST_UPDATED_FORMAT`] compare chronologically.
/// Anything else falls back to comparing length first, then lexically, which
/// agrees with chronological order for zero-padded numeric stamps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LastUpdated(String);

impl LastUpdated {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed timestamp, if the token follows the registry format
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, LAST_UPDATED_FORMAT).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Ord for LastUpdated {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_time = match (self.timestamp(), other.timestamp()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.len().cmp(&other.0.len()),
        };
        by_time.then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for LastUpdated {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LastUpdated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest snapshot build advertised by a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub timestamp: String,
    pub build_number: u32,
}

/// Version listing for one artifact, as published by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub group_id: String,
    pub artifact_id: String,
    pub last_updated: LastUpdated,
    pub versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotInfo>,
}

impl RegistryManifest {
    /// Parse a `maven-metadata.xml` document
    pub fn from_xml(document: &str) -> CoreResult<Self> {
        let raw: xml::Metadata = quick_xml::de::from_str(document)?;

        let group_id = raw
            .group_id
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| CoreError::MalformedManifest("missing groupId".to_string()))?;
        let artifact_id = raw
            .artifact_id
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| CoreError::MalformedManifest("missing artifactId".to_string()))?;
        let versioning = raw
            .versioning
            .ok_or_else(|| CoreError::MalformedManifest("missing versioning".to_string()))?;
        let last_updated = versioning
            .last_updated
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoreError::MalformedManifest("missing lastUpdated".to_string()))?;

        let versions = versioning
            .versions
            .map(|v| v.version)
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        let snapshot = versioning.snapshot.and_then(|s| {
            Some(SnapshotInfo {
                timestamp: s.timestamp?.trim().to_string(),
                build_number: s.build_number?.trim().parse().ok()?,
            })
        });

        Ok(Self {
            group_id: group_id.trim().to_string(),
            artifact_id: artifact_id.trim().to_string(),
            last_updated: LastUpdated::new(last_updated),
            versions,
            snapshot,
        })
    }

    /// Artifact identity named by the document
    pub fn artifact(&self) -> CoreResult<ArtifactCoordinates> {
        ArtifactCoordinates::new(self.group_id.clone(), self.artifact_id.clone())
    }

    /// Coordinates for every listed version, in manifest order.
    ///
    /// Version strings that do not form valid coordinates are skipped.
    pub fn coordinates(&self) -> Vec<MavenCoordinates> {
        self.versions
            .iter()
            .filter_map(|v| {
                MavenCoordinates::new(self.group_id.clone(), self.artifact_id.clone(), v.clone())
                    .ok()
            })
            .collect()
    }
}

mod xml {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub(super) struct Metadata {
        #[serde(rename = "groupId")]
        pub group_id: Option<String>,
        #[serde(rename = "artifactId")]
        pub artifact_id: Option<String>,
        pub versioning: Option<Versioning>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Versioning {
        #[serde(rename = "lastUpdated")]
        pub last_updated: Option<String>,
        pub versions: Option<Versions>,
        pub snapshot: Option<Snapshot>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Versions {
        #[serde(default)]
        pub version: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Snapshot {
        pub timestamp: Option<String>,
        #[serde(rename = "buildNumber")]
        pub build_number: Option<String>,
    }
}
