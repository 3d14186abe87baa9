//! Core domain models for the provenance synchronizer
//!
//! This crate contains the data structures that describe published
//! artifacts, the registry manifests they are discovered from, the commits
//! they were built from, and the journal events recording all of it. It
//! performs no I/O.

pub mod asset;
pub mod commit;
pub mod coordinates;
pub mod error;
pub mod event;
pub mod manifest;

// Re-exports for convenience
pub use asset::{merge_assets, Asset, AssetKey, VersionedAsset};
pub use commit::{CommitDetails, CommitId, RepositoryUrl, Signature};
pub use coordinates::{compare_versions, ArtifactCoordinates, MavenCoordinates, VersionType};
pub use error::{CoreError, CoreResult};
pub use event::{SyncEvent, VersionedArtifactEvent};
pub use manifest::{LastUpdated, RegistryManifest, SnapshotInfo};
