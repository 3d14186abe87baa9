//! Downloadable files attached to an artifact version

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::coordinates::MavenCoordinates;

/// Extension of the binary archives scanned for build metadata
pub const SCANNABLE_EXTENSION: &str = "jar";

/// One file published for a version, such as the main jar or its sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Optional classifier (`sources`, `javadoc`, ...); empty classifiers are normalized to `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,

    /// File extension without the leading dot
    pub extension: String,

    /// Where the file can be fetched from
    pub download_url: Url,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

impl Asset {
    /// Create an asset, normalizing an empty classifier to none
    pub fn new(classifier: Option<String>, extension: impl Into<String>, download_url: Url) -> Self {
        Self {
            classifier: classifier.filter(|c| !c.trim().is_empty()),
            extension: extension.into(),
            download_url,
            md5: None,
            sha1: None,
        }
    }

    /// Attach checksums reported by the registry
    pub fn with_checksums(mut self, md5: Option<String>, sha1: Option<String>) -> Self {
        self.md5 = md5;
        self.sha1 = sha1;
        self
    }

    /// Identity used when merging asset lists
    pub fn key(&self) -> AssetKey {
        AssetKey {
            classifier: self.classifier.clone(),
            extension: self.extension.clone(),
        }
    }

    /// Whether the asset is the primary binary archive of its version
    pub fn is_scannable(&self) -> bool {
        self.classifier.is_none() && self.extension.eq_ignore_ascii_case(SCANNABLE_EXTENSION)
    }
}

/// `(classifier, extension)` merge key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub classifier: Option<String>,
    pub extension: String,
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.classifier {
            Some(classifier) => write!(f, "{}.{}", classifier, self.extension),
            None => write!(f, "{}", self.extension),
        }
    }
}

/// Merge `incoming` into `existing`, replacing entries with the same key and
/// appending the rest in their original order.
pub fn merge_assets(existing: &[Asset], incoming: &[Asset]) -> Vec<Asset> {
    let mut merged: Vec<Asset> = existing.to_vec();
    for asset in incoming {
        let key = asset.key();
        match merged.iter_mut().find(|a| a.key() == key) {
            Some(slot) => *slot = asset.clone(),
            None => merged.push(asset.clone()),
        }
    }
    merged
}

/// An asset paired with the version it belongs to, handed to extraction workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedAsset {
    pub coordinates: MavenCoordinates,
    pub asset: Asset,
}

impl VersionedAsset {
    pub fn new(coordinates: MavenCoordinates, asset: Asset) -> Self {
        Self { coordinates, asset }
    }

    pub fn download_url(&self) -> &Url {
        &self.asset.download_url
    }
}

impl fmt::Display for VersionedAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.coordinates, self.asset.key())
    }
}
