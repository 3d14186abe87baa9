//! Per-version artifact state
//!
//! A [`VersionedArtifact`] entity exists for every exact version that was
//! discovered. It collects the version's assets and candidate repositories
//! and tracks the commit it was built from, from the raw id read out of an
//! archive to the resolved commit metadata. Progress is monotonic: a
//! resolved commit is never replaced by a raw one.

use provenance_core::{
    compare_versions, merge_assets, ArtifactCoordinates, Asset, CommitDetails, CommitId, MavenCoordinates,
    RepositoryUrl, VersionedArtifactEvent,
};
use provenance_store::{Aggregate, Effect, EntityRuntime, EventEnvelope};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::error::ServiceResult;

/// Where a version stands on its way to a resolved commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommitState {
    #[default]
    Unknown,
    /// Read from an archive, not yet looked up
    Raw { sha: CommitId },
    /// None of the attempted repositories contain the commit
    Unresolved {
        sha: CommitId,
        attempted: Vec<RepositoryUrl>,
    },
    Resolved { details: CommitDetails },
}

/// State of a registered version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub coordinates: MavenCoordinates,
    /// Candidate repositories in association order, without duplicates
    pub repositories: Vec<RepositoryUrl>,
    pub assets: Vec<Asset>,
    /// Assets that cannot yield a commit: missing, malformed or without a
    /// commit attribute. Transient download failures are not recorded here.
    pub errored_assets: Vec<Asset>,
    pub commit: CommitState,
}

impl VersionRecord {
    fn new(coordinates: MavenCoordinates) -> Self {
        Self {
            coordinates,
            repositories: Vec::new(),
            assets: Vec::new(),
            errored_assets: Vec::new(),
            commit: CommitState::Unknown,
        }
    }

    pub fn raw_commit(&self) -> Option<&CommitId> {
        match &self.commit {
            CommitState::Raw { sha } | CommitState::Unresolved { sha, .. } => Some(sha),
            _ => None,
        }
    }

    pub fn resolved_commit(&self) -> Option<&CommitDetails> {
        match &self.commit {
            CommitState::Resolved { details } => Some(details),
            _ => None,
        }
    }

    /// Whether archives should still be scanned for a commit id
    pub fn needs_scan(&self) -> bool {
        self.commit == CommitState::Unknown
    }

    /// Whether `asset` is a scannable archive that has not failed before
    pub fn should_scan(&self, asset: &Asset) -> bool {
        self.needs_scan()
            && asset.is_scannable()
            && !self.errored_assets.iter().any(|e| e.key() == asset.key())
    }

    /// Repositories not yet tried for the current raw commit
    pub fn pending_repositories(&self) -> Vec<RepositoryUrl> {
        match &self.commit {
            CommitState::Raw { .. } => self.repositories.clone(),
            CommitState::Unresolved { attempted, .. } => self
                .repositories
                .iter()
                .filter(|r| !attempted.contains(r))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Event-sourced state of one exact version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VersionedArtifact {
    #[default]
    Unregistered,
    Registered(VersionRecord),
}

impl VersionedArtifact {
    pub fn record(&self) -> Option<&VersionRecord> {
        match self {
            VersionedArtifact::Registered(record) => Some(record),
            VersionedArtifact::Unregistered => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.record().is_some()
    }
}

/// Commands accepted by [`VersionedArtifact`]
#[derive(Debug, Clone)]
pub enum VersionCommand {
    Register {
        coordinates: MavenCoordinates,
    },
    RegisterRepo {
        repository: RepositoryUrl,
    },
    /// Registers the version first when it is unknown
    AddAssets {
        coordinates: MavenCoordinates,
        assets: Vec<Asset>,
    },
    MarkFilesErrored {
        assets: Vec<Asset>,
    },
    RegisterRawCommit {
        sha: CommitId,
    },
    RegisterResolvedCommit {
        repository: RepositoryUrl,
        details: CommitDetails,
    },
    RegisterFailedCommit {
        sha: CommitId,
        attempted: Vec<RepositoryUrl>,
    },
}

/// Outcome of a [`VersionCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionReply {
    /// Events were persisted
    Applied,
    /// Nothing to change
    Unchanged,
    /// The version has not been registered
    NotRegistered,
    /// The command contradicts itself and was refused
    Rejected,
}

impl Aggregate for VersionedArtifact {
    const TYPE_NAME: &'static str = "version";

    type Command = VersionCommand;
    type Event = VersionedArtifactEvent;
    type Reply = VersionReply;

    fn apply(&mut self, event: &VersionedArtifactEvent) {
        if let VersionedArtifactEvent::Registered { coordinates } = event {
            if !self.is_registered() {
                *self = VersionedArtifact::Registered(VersionRecord::new(coordinates.clone()));
            }
            return;
        }

        let VersionedArtifact::Registered(record) = self else {
            return;
        };

        match event {
            VersionedArtifactEvent::Registered { .. } => {}
            VersionedArtifactEvent::RepositoryAssociated { repository, .. } => {
                if !record.repositories.contains(repository) {
                    record.repositories.push(repository.clone());
                }
            }
            VersionedArtifactEvent::AssetsUpdated { assets, .. } => {
                record.assets = merge_assets(&record.assets, assets);
            }
            VersionedArtifactEvent::FilesErrored { assets, .. } => {
                record.errored_assets = merge_assets(&record.errored_assets, assets);
            }
            VersionedArtifactEvent::RawCommitRegistered { sha, .. } => {
                record.commit = CommitState::Raw { sha: sha.clone() };
            }
            VersionedArtifactEvent::CommitResolved { commit, .. } => {
                record.commit = CommitState::Resolved {
                    details: commit.clone(),
                };
            }
            VersionedArtifactEvent::CommitUnresolved {
                sha, repositories, ..
            } => {
                record.commit = CommitState::Unresolved {
                    sha: sha.clone(),
                    attempted: repositories.clone(),
                };
            }
        }
    }

    fn handle(&self, command: VersionCommand) -> Effect<VersionedArtifactEvent, VersionReply> {
        let (record, command) = match (self, command) {
            (VersionedArtifact::Unregistered, VersionCommand::Register { coordinates }) => {
                return Effect::persist(
                    vec![VersionedArtifactEvent::Registered { coordinates }],
                    VersionReply::Applied,
                );
            }
            (VersionedArtifact::Unregistered, VersionCommand::AddAssets { coordinates, assets }) => {
                let mut events = vec![VersionedArtifactEvent::Registered {
                    coordinates: coordinates.clone(),
                }];
                if !assets.is_empty() {
                    events.push(VersionedArtifactEvent::AssetsUpdated {
                        coordinates,
                        assets,
                    });
                }
                return Effect::persist(events, VersionReply::Applied);
            }
            (VersionedArtifact::Unregistered, _) => {
                return Effect::reply(VersionReply::NotRegistered);
            }
            (VersionedArtifact::Registered(record), command) => (record, command),
        };

        let coordinates = record.coordinates.clone();
        let event = match command {
            VersionCommand::Register { .. } => None,

            VersionCommand::RegisterRepo { repository } => (!record
                .repositories
                .contains(&repository))
            .then_some(VersionedArtifactEvent::RepositoryAssociated {
                coordinates,
                repository,
            }),

            VersionCommand::AddAssets { assets, .. } => {
                let merged = merge_assets(&record.assets, &assets);
                (merged != record.assets)
                    .then_some(VersionedArtifactEvent::AssetsUpdated { coordinates, assets })
            }

            VersionCommand::MarkFilesErrored { assets } => {
                let fresh: Vec<Asset> = assets
                    .into_iter()
                    .filter(|a| !record.errored_assets.contains(a))
                    .collect();
                (!fresh.is_empty()).then_some(VersionedArtifactEvent::FilesErrored {
                    coordinates,
                    assets: fresh,
                })
            }

            VersionCommand::RegisterRawCommit { sha } => match &record.commit {
                // a resolved commit always wins over a raw one
                CommitState::Resolved { .. } => None,
                CommitState::Raw { sha: known } | CommitState::Unresolved { sha: known, .. }
                    if *known == sha =>
                {
                    None
                }
                _ => Some(VersionedArtifactEvent::RawCommitRegistered {
                    coordinates,
                    sha,
                    repositories: record.repositories.clone(),
                }),
            },

            VersionCommand::RegisterResolvedCommit {
                repository,
                details,
            } if details.repository != repository => {
                warn!(
                    coordinates = %coordinates,
                    repository = %repository,
                    found_in = %details.repository,
                    "Resolved commit names another repository"
                );
                return Effect::reply(VersionReply::Rejected);
            }

            VersionCommand::RegisterResolvedCommit {
                repository,
                details,
            } => match &record.commit {
                CommitState::Resolved { details: known } if known.repository == repository => None,
                _ => Some(VersionedArtifactEvent::CommitResolved {
                    coordinates,
                    repository,
                    commit: details,
                }),
            },

            VersionCommand::RegisterFailedCommit { sha, attempted } => match &record.commit {
                CommitState::Raw { sha: known } if *known == sha => {
                    Some(VersionedArtifactEvent::CommitUnresolved {
                        coordinates,
                        sha,
                        repositories: attempted,
                    })
                }
                CommitState::Unresolved {
                    sha: known,
                    attempted: tried,
                } if *known == sha => {
                    let mut all = tried.clone();
                    for repository in attempted {
                        if !all.contains(&repository) {
                            all.push(repository);
                        }
                    }
                    (all != *tried).then_some(VersionedArtifactEvent::CommitUnresolved {
                        coordinates,
                        sha,
                        repositories: all,
                    })
                }
                // stale report for a commit that is no longer pending
                _ => None,
            },
        };

        match event {
            Some(event) => Effect::persist(vec![event], VersionReply::Applied),
            None => Effect::reply(VersionReply::Unchanged),
        }
    }

    fn event_name(event: &VersionedArtifactEvent) -> &str {
        event.event_name()
    }
}

/// Command and query surface over [`VersionedArtifact`] entities
#[derive(Clone)]
pub struct VersionedArtifacts {
    runtime: EntityRuntime<VersionedArtifact>,
}

impl VersionedArtifacts {
    pub fn new(runtime: EntityRuntime<VersionedArtifact>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &EntityRuntime<VersionedArtifact> {
        &self.runtime
    }

    async fn send(
        &self,
        coordinates: &MavenCoordinates,
        command: VersionCommand,
    ) -> ServiceResult<VersionReply> {
        let key = coordinates.to_string();
        let reply = self.runtime.invoke(&key, command).await?;
        debug!(coordinates = %key, reply = ?reply, "Version command handled");
        Ok(reply)
    }

    #[instrument(skip(self), fields(coordinates = %coordinates))]
    pub async fn register(&self, coordinates: &MavenCoordinates) -> ServiceResult<VersionReply> {
        self.send(
            coordinates,
            VersionCommand::Register {
                coordinates: coordinates.clone(),
            },
        )
        .await
    }

    pub async fn register_repo(
        &self,
        coordinates: &MavenCoordinates,
        repository: RepositoryUrl,
    ) -> ServiceResult<VersionReply> {
        self.send(coordinates, VersionCommand::RegisterRepo { repository })
            .await
    }

    pub async fn add_assets(
        &self,
        coordinates: &MavenCoordinates,
        assets: Vec<Asset>,
    ) -> ServiceResult<VersionReply> {
        self.send(
            coordinates,
            VersionCommand::AddAssets {
                coordinates: coordinates.clone(),
                assets,
            },
        )
        .await
    }

    pub async fn mark_files_errored(
        &self,
        coordinates: &MavenCoordinates,
        assets: Vec<Asset>,
    ) -> ServiceResult<VersionReply> {
        self.send(coordinates, VersionCommand::MarkFilesErrored { assets })
            .await
    }

    pub async fn register_raw_commit(
        &self,
        coordinates: &MavenCoordinates,
        sha: CommitId,
    ) -> ServiceResult<VersionReply> {
        self.send(coordinates, VersionCommand::RegisterRawCommit { sha })
            .await
    }

    pub async fn register_resolved_commit(
        &self,
        coordinates: &MavenCoordinates,
        details: CommitDetails,
        repository: RepositoryUrl,
    ) -> ServiceResult<VersionReply> {
        self.send(
            coordinates,
            VersionCommand::RegisterResolvedCommit {
                repository,
                details,
            },
        )
        .await
    }

    pub async fn register_failed_commit(
        &self,
        coordinates: &MavenCoordinates,
        sha: CommitId,
        attempted: Vec<RepositoryUrl>,
    ) -> ServiceResult<VersionReply> {
        self.send(
            coordinates,
            VersionCommand::RegisterFailedCommit { sha, attempted },
        )
        .await
    }

    /// Every version with persisted events, across all artifacts
    pub async fn all_versions(&self) -> ServiceResult<Vec<MavenCoordinates>> {
        Ok(self
            .runtime
            .entity_ids()
            .await?
            .into_iter()
            .filter_map(|id| id.parse().ok())
            .collect())
    }

    /// Registered versions of an artifact, oldest release first
    pub async fn get_versions(
        &self,
        artifact: &ArtifactCoordinates,
    ) -> ServiceResult<Vec<MavenCoordinates>> {
        let mut versions: Vec<MavenCoordinates> = self
            .all_versions()
            .await?
            .into_iter()
            .filter(|c| c.group_id == artifact.group_id && c.artifact_id == artifact.artifact_id)
            .collect();
        versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(versions)
    }

    /// Assets collected for a version
    pub async fn get_collections(&self, coordinates: &MavenCoordinates) -> ServiceResult<Vec<Asset>> {
        Ok(self
            .runtime
            .query(&coordinates.to_string(), |state: &VersionedArtifact| {
                state
                    .record()
                    .map(|record| record.assets.clone())
                    .unwrap_or_default()
            })
            .await?)
    }

    /// Full folded state of a version
    pub async fn get_version(&self, coordinates: &MavenCoordinates) -> ServiceResult<VersionedArtifact> {
        Ok(self
            .runtime
            .query(&coordinates.to_string(), |state: &VersionedArtifact| state.clone())
            .await?)
    }

    /// Live feed of persisted version events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<VersionedArtifactEvent>> {
        self.runtime.subscribe()
    }
}
