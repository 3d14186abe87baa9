//! Registry synchronization
//!
//! One [`SyncState`] entity exists per artifact. It remembers the newest
//! manifest seen for that artifact; a resync fetches the current manifest
//! and only records it when its `lastUpdated` moved forward.

use chrono::{DateTime, Utc};
use provenance_core::{
    ArtifactCoordinates, LastUpdated, MavenCoordinates, RegistryManifest, SyncEvent,
};
use provenance_store::{Aggregate, Effect, EntityRuntime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::ServiceResult;
use crate::registry_client::ArtifactRegistry;

/// Folded synchronization state of one artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub artifact: Option<ArtifactCoordinates>,
    pub manifest: Option<RegistryManifest>,
}

impl SyncState {
    pub fn last_updated(&self) -> Option<&LastUpdated> {
        self.manifest.as_ref().map(|m| &m.last_updated)
    }
}

/// Commands accepted by [`SyncState`]
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Offer a freshly fetched manifest
    RecordManifest {
        artifact: ArtifactCoordinates,
        manifest: RegistryManifest,
        observed_at: DateTime<Utc>,
    },
}

/// How a resync ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// A newer manifest was recorded
    Discovered,
    /// The stored manifest is current
    Unchanged,
    /// The manifest could not be fetched or recorded
    Failed(String),
}

/// Versions known after a resync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReply {
    pub versions: Vec<MavenCoordinates>,
    /// Versions absent from the previously recorded manifest
    pub added: Vec<MavenCoordinates>,
    pub status: SyncStatus,
}

impl SyncReply {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            versions: Vec::new(),
            added: Vec::new(),
            status: SyncStatus::Failed(reason.into()),
        }
    }

    pub fn is_changed(&self) -> bool {
        self.status == SyncStatus::Discovered
    }
}

fn versions_of(artifact: &ArtifactCoordinates, manifest: &RegistryManifest) -> Vec<MavenCoordinates> {
    manifest
        .versions
        .iter()
        .filter_map(|v| artifact.version(v.as_str()).ok())
        .collect()
}

impl Aggregate for SyncState {
    const TYPE_NAME: &'static str = "sync";

    type Command = SyncCommand;
    type Event = SyncEvent;
    type Reply = SyncReply;

    fn apply(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::VersionDiscovered { manifest, .. } => {
                if self.artifact.is_none() {
                    self.artifact = manifest.artifact().ok();
                }
                self.manifest = Some(manifest.clone());
            }
        }
    }

    fn handle(&self, command: SyncCommand) -> Effect<SyncEvent, SyncReply> {
        match command {
            SyncCommand::RecordManifest {
                artifact,
                manifest,
                observed_at,
            } => {
                let artifact = self.artifact.clone().unwrap_or(artifact);

                // lastUpdated never moves backwards
                if let Some(stored) = &self.manifest {
                    if manifest.last_updated <= stored.last_updated {
                        return Effect::reply(SyncReply {
                            versions: versions_of(&artifact, stored),
                            added: Vec::new(),
                            status: SyncStatus::Unchanged,
                        });
                    }
                }

                let versions = versions_of(&artifact, &manifest);
                let added = match &self.manifest {
                    Some(stored) => versions
                        .iter()
                        .filter(|c| !stored.versions.iter().any(|v| v.as_str() == c.version))
                        .cloned()
                        .collect(),
                    None => versions.clone(),
                };
                Effect::persist(
                    vec![SyncEvent::VersionDiscovered {
                        manifest,
                        discovered_at: observed_at,
                    }],
                    SyncReply {
                        versions,
                        added,
                        status: SyncStatus::Discovered,
                    },
                )
            }
        }
    }

    fn event_name(event: &SyncEvent) -> &str {
        event.event_name()
    }
}

/// Drives [`SyncState`] entities from registry fetches
#[derive(Clone)]
pub struct ArtifactSynchronizer {
    runtime: EntityRuntime<SyncState>,
    registry: Arc<dyn ArtifactRegistry>,
    fetch_timeout: Duration,
}

impl ArtifactSynchronizer {
    pub fn new(
        runtime: EntityRuntime<SyncState>,
        registry: Arc<dyn ArtifactRegistry>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            fetch_timeout,
        }
    }

    pub fn runtime(&self) -> &EntityRuntime<SyncState> {
        &self.runtime
    }

    /// Fetch the artifact's manifest and record it if it is newer.
    ///
    /// Never fails: fetch and journal errors are logged and yield an empty
    /// version list with [`SyncStatus::Failed`], leaving state untouched.
    #[instrument(skip(self), fields(artifact = %artifact))]
    pub async fn resync(&self, artifact: &ArtifactCoordinates) -> SyncReply {
        let key = artifact.key();

        let target = match self
            .runtime
            .query(&key, |state: &SyncState| state.artifact.clone())
            .await
        {
            Ok(stored) => stored.unwrap_or_else(|| artifact.clone()),
            Err(e) => {
                warn!(error = %e, "Could not read synchronization state");
                return SyncReply::failed(e.to_string());
            }
        };

        let manifest =
            match tokio::time::timeout(self.fetch_timeout, self.registry.fetch_manifest(&target))
                .await
            {
                Ok(Ok(manifest)) => manifest,
                Ok(Err(e)) => {
                    warn!(error = %e, "Manifest fetch failed");
                    return SyncReply::failed(e.to_string());
                }
                Err(_) => {
                    warn!(timeout = ?self.fetch_timeout, "Manifest fetch timed out");
                    return SyncReply::failed(format!("timed out after {:?}", self.fetch_timeout));
                }
            };

        if manifest.group_id != target.group_id || manifest.artifact_id != target.artifact_id {
            warn!(
                manifest_group = %manifest.group_id,
                manifest_artifact = %manifest.artifact_id,
                "Manifest names a different artifact than requested"
            );
        }

        let command = SyncCommand::RecordManifest {
            artifact: target,
            manifest,
            observed_at: Utc::now(),
        };
        match self.runtime.invoke(&key, command).await {
            Ok(reply) => {
                match reply.status {
                    SyncStatus::Discovered => {
                        info!(versions = reply.versions.len(), added = reply.added.len(), "Recorded newer manifest")
                    }
                    _ => debug!(versions = reply.versions.len(), "Manifest unchanged"),
                }
                reply
            }
            Err(e) => {
                warn!(error = %e, "Could not record manifest");
                SyncReply::failed(e.to_string())
            }
        }
    }

    /// Current synchronization state of an artifact
    pub async fn state(&self, artifact: &ArtifactCoordinates) -> ServiceResult<SyncState> {
        Ok(self
            .runtime
            .query(&artifact.key(), |state: &SyncState| state.clone())
            .await?)
    }
}
