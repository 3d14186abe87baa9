//! Group/artifact catalog
//!
//! The catalog names which artifacts the synchronizer keeps track of and the
//! source repositories each one is built from. It is consumed read-only.

use async_trait::async_trait;
use provenance_core::{ArtifactCoordinates, RepositoryUrl};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{ServiceError, ServiceResult};
use crate::registry_client::directory;

/// One tracked artifact and its candidate source repositories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogArtifact {
    pub coordinates: ArtifactCoordinates,
    pub repositories: Vec<RepositoryUrl>,
}

impl CatalogArtifact {
    pub fn new(coordinates: ArtifactCoordinates, repositories: Vec<RepositoryUrl>) -> Self {
        Self {
            coordinates,
            repositories,
        }
    }
}

/// Read-only source of tracked groups and artifacts
#[async_trait]
pub trait ArtifactCatalog: Send + Sync {
    /// All known group ids
    async fn groups(&self) -> ServiceResult<Vec<String>>;

    /// Artifacts tracked under a group
    async fn artifacts(&self, group_id: &str) -> ServiceResult<Vec<CatalogArtifact>>;

    /// Candidate repositories of one artifact, empty when it is unknown
    async fn repositories(&self, artifact: &ArtifactCoordinates) -> ServiceResult<Vec<RepositoryUrl>> {
        Ok(self
            .artifacts(&artifact.group_id)
            .await?
            .into_iter()
            .find(|entry| entry.coordinates == *artifact)
            .map(|entry| entry.repositories)
            .unwrap_or_default())
    }
}

/// Catalog fixed at construction time
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    groups: BTreeMap<String, Vec<CatalogArtifact>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, artifact: CatalogArtifact) -> Self {
        self.insert(artifact);
        self
    }

    /// Add or replace an artifact
    pub fn insert(&mut self, artifact: CatalogArtifact) {
        let entries = self
            .groups
            .entry(artifact.coordinates.group_id.clone())
            .or_default();
        entries.retain(|e| e.coordinates != artifact.coordinates);
        entries.push(artifact);
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactCatalog for StaticCatalog {
    async fn groups(&self) -> ServiceResult<Vec<String>> {
        Ok(self.groups.keys().cloned().collect())
    }

    async fn artifacts(&self, group_id: &str) -> ServiceResult<Vec<CatalogArtifact>> {
        Ok(self.groups.get(group_id).cloned().unwrap_or_default())
    }
}

/// Catalog served over HTTP.
///
/// `GET {base}/groups` answers `{"groups": [...]}` and
/// `GET {base}/groups/{groupId}/artifacts` answers `{"artifacts": [...]}`.
/// Entries are either bare identifiers or objects.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpCatalog {
    pub fn new(base_url: Url, user_agent: &str, timeout: Duration) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: directory(base_url),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> ServiceResult<T> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::RegistryStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ArtifactCatalog for HttpCatalog {
    #[instrument(skip(self))]
    async fn groups(&self) -> ServiceResult<Vec<String>> {
        let url = self.base_url.join("groups")?;
        let body: GroupsResponse = self.get(url).await?;
        let groups: Vec<String> = body
            .groups
            .into_iter()
            .map(GroupEntry::into_id)
            .filter(|g| !g.trim().is_empty())
            .collect();
        debug!(count = groups.len(), "Fetched catalog groups");
        Ok(groups)
    }

    #[instrument(skip(self))]
    async fn artifacts(&self, group_id: &str) -> ServiceResult<Vec<CatalogArtifact>> {
        let url = self.base_url.join(&format!("groups/{}/artifacts", group_id))?;
        let body: ArtifactsResponse = self.get(url).await?;

        let artifacts = body
            .artifacts
            .into_iter()
            .filter_map(|entry| {
                let (artifact_id, repositories) = entry.into_parts();
                let coordinates = match ArtifactCoordinates::new(group_id, artifact_id.as_str()) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(group_id, artifact_id = %artifact_id, error = %e, "Skipping catalog entry");
                        return None;
                    }
                };
                let repositories = repositories
                    .iter()
                    .filter_map(|raw| match RepositoryUrl::parse(raw) {
                        Ok(repo) => Some(repo),
                        Err(e) => {
                            warn!(artifact = %coordinates, repository = %raw, error = %e, "Skipping repository");
                            None
                        }
                    })
                    .collect();
                Some(CatalogArtifact::new(coordinates, repositories))
            })
            .collect();
        Ok(artifacts)
    }
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    #[serde(default)]
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GroupEntry {
    Id(String),
    Detailed {
        #[serde(rename = "groupId")]
        group_id: String,
    },
}

impl GroupEntry {
    fn into_id(self) -> String {
        match self {
            GroupEntry::Id(id) | GroupEntry::Detailed { group_id: id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactsResponse {
    #[serde(default)]
    artifacts: Vec<ArtifactEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArtifactEntry {
    Id(String),
    Detailed {
        #[serde(rename = "artifactId")]
        artifact_id: String,
        #[serde(default)]
        repositories: Vec<String>,
    },
}

impl ArtifactEntry {
    fn into_parts(self) -> (String, Vec<String>) {
        match self {
            ArtifactEntry::Id(id) => (id, Vec::new()),
            ArtifactEntry::Detailed {
                artifact_id,
                repositories,
            } => (artifact_id, repositories),
        }
    }
}
