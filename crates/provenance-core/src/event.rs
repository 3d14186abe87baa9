//! Journal events
//!
//! Events are the only way aggregate state changes. Each enum here is the
//! complete event vocabulary of one aggregate and is stored as tagged JSON,
//! so adding a variant forces every fold over it to be revisited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::asset::Asset;
use crate::commit::{CommitDetails, CommitId, RepositoryUrl};
use crate::coordinates::MavenCoordinates;
use crate::manifest::RegistryManifest;

/// Events of the per-artifact registry synchronization aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A manifest with a newer `lastUpdated` than the stored one was fetched
    VersionDiscovered {
        manifest: RegistryManifest,
        discovered_at: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn event_name(&self) -> &str {
        match self {
            SyncEvent::VersionDiscovered { .. } => "version_discovered",
        }
    }
}

/// Events of the per-version artifact aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersionedArtifactEvent {
    /// The version became known to the system
    Registered { coordinates: MavenCoordinates },

    /// A candidate source repository was linked to the version
    RepositoryAssociated {
        coordinates: MavenCoordinates,
        repository: RepositoryUrl,
    },

    /// Assets were added or replaced, keyed by `(classifier, extension)`
    AssetsUpdated {
        coordinates: MavenCoordinates,
        assets: Vec<Asset>,
    },

    /// The listed assets could not be scanned for a commit
    FilesErrored {
        coordinates: MavenCoordinates,
        assets: Vec<Asset>,
    },

    /// A commit id was read from one of the version's archives
    RawCommitRegistered {
        coordinates: MavenCoordinates,
        sha: CommitId,
        /// Repositories known at registration time, in resolution order
        repositories: Vec<RepositoryUrl>,
    },

    /// The raw commit was found in `repository`
    CommitResolved {
        coordinates: MavenCoordinates,
        repository: RepositoryUrl,
        commit: CommitDetails,
    },

    /// No candidate repository contained the raw commit
    CommitUnresolved {
        coordinates: MavenCoordinates,
        sha: CommitId,
        repositories: Vec<RepositoryUrl>,
    },
}

impl VersionedArtifactEvent {
    /// Get the event name as a string
    pub fn event_name(&self) -> &str {
        match self {
            VersionedArtifactEvent::Registered { .. } => "registered",
            VersionedArtifactEvent::RepositoryAssociated { .. } => "repository_associated",
            VersionedArtifactEvent::AssetsUpdated { .. } => "assets_updated",
            VersionedArtifactEvent::FilesErrored { .. } => "files_errored",
            VersionedArtifactEvent::RawCommitRegistered { .. } => "raw_commit_registered",
            VersionedArtifactEvent::CommitResolved { .. } => "commit_resolved",
            VersionedArtifactEvent::CommitUnresolved { .. } => "commit_unresolved",
        }
    }

    /// Version the event belongs to
    pub fn coordinates(&self) -> &MavenCoordinates {
        match self {
            VersionedArtifactEvent::Registered { coordinates }
            | VersionedArtifactEvent::RepositoryAssociated { coordinates, .. }
            | VersionedArtifactEvent::AssetsUpdated { coordinates, .. }
            | VersionedArtifactEvent::FilesErrored { coordinates, .. }
            | VersionedArtifactEvent::RawCommitRegistered { coordinates, .. }
            | VersionedArtifactEvent::CommitResolved { coordinates, .. }
            | VersionedArtifactEvent::CommitUnresolved { coordinates, .. } => coordinates,
        }
    }
}

impl fmt::Display for VersionedArtifactEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.event_name(), self.coordinates())
    }
}
