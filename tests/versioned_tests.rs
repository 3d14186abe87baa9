//! Version state tests against the journal

mod common;

use common::fixtures::{commit_details, demo, demo_version, repo, sha, REPO_A, REPO_B};
use provenance_core::{Asset, CommitId};
use provenance_service::{CommitState, VersionReply, VersionedArtifact, VersionedArtifacts};
use provenance_store::{EntityRuntime, InMemoryJournal, RuntimeConfig};
use std::sync::Arc;
use url::Url;

fn versioned(journal: &Arc<InMemoryJournal>) -> VersionedArtifacts {
    VersionedArtifacts::new(EntityRuntime::start(
        journal.clone(),
        RuntimeConfig::default().snapshot_every(3),
    ))
}

fn asset(classifier: Option<&str>, extension: &str, file: &str) -> Asset {
    Asset::new(
        classifier.map(str::to_string),
        extension,
        Url::parse(&format!("https://repo.example.org/maven2/{}", file)).unwrap(),
    )
}

#[tokio::test]
async fn test_assets_merge_by_classifier_and_extension() {
    let journal = Arc::new(InMemoryJournal::new());
    let versions = versioned(&journal);
    let version = demo_version("1.0");

    versions
        .add_assets(
            &version,
            vec![asset(None, "jar", "demo-1.0.jar"), asset(None, "pom", "demo-1.0.pom")],
        )
        .await
        .unwrap();
    versions
        .add_assets(
            &version,
            vec![
                asset(None, "jar", "mirror/demo-1.0.jar"),
                asset(Some("sources"), "jar", "demo-1.0-sources.jar"),
            ],
        )
        .await
        .unwrap();

    let assets = versions.get_collections(&version).await.unwrap();
    assert_eq!(assets.len(), 3);
    let primary = assets
        .iter()
        .find(|a| a.classifier.is_none() && a.extension == "jar")
        .unwrap();
    assert!(primary.download_url.as_str().ends_with("mirror/demo-1.0.jar"));

    // Offering the same list again changes nothing
    let reply = versions
        .add_assets(&version, vec![asset(Some("sources"), "jar", "demo-1.0-sources.jar")])
        .await
        .unwrap();
    assert_eq!(reply, VersionReply::Unchanged);
}

#[tokio::test]
async fn test_resolved_commit_is_never_replaced_by_raw() {
    let journal = Arc::new(InMemoryJournal::new());
    let versions = versioned(&journal);
    let version = demo_version("1.1");
    versions.register(&version).await.unwrap();
    versions.register_repo(&version, repo(REPO_B)).await.unwrap();

    versions.register_raw_commit(&version, sha()).await.unwrap();
    versions
        .register_resolved_commit(&version, commit_details(&repo(REPO_B), &sha()), repo(REPO_B))
        .await
        .unwrap();

    let other = CommitId::parse("1111111111111111111111111111111111111111").unwrap();
    let reply = versions.register_raw_commit(&version, other).await.unwrap();
    assert_eq!(reply, VersionReply::Unchanged);

    let reply = versions
        .register_failed_commit(&version, sha(), vec![repo(REPO_A)])
        .await
        .unwrap();
    assert_eq!(reply, VersionReply::Unchanged);

    let state = versions.get_version(&version).await.unwrap();
    let record = state.record().unwrap();
    assert_eq!(record.resolved_commit().map(|d| &d.sha), Some(&sha()));
    assert!(!record.needs_scan());
}

#[tokio::test]
async fn test_commands_on_unregistered_version_are_rejected() {
    let journal = Arc::new(InMemoryJournal::new());
    let versions = versioned(&journal);
    let version = demo_version("3.0");

    let reply = versions.register_repo(&version, repo(REPO_A)).await.unwrap();
    assert_eq!(reply, VersionReply::NotRegistered);
    assert_eq!(
        versions.get_version(&version).await.unwrap(),
        VersionedArtifact::Unregistered
    );
    assert!(versions.get_versions(&demo()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let journal = Arc::new(InMemoryJournal::new());
    let version = demo_version("1.2");
    {
        let versions = versioned(&journal);
        versions.register(&version).await.unwrap();
        versions.register_repo(&version, repo(REPO_A)).await.unwrap();
        versions.register_repo(&version, repo(REPO_B)).await.unwrap();
        versions.register_raw_commit(&version, sha()).await.unwrap();
        versions
            .register_failed_commit(&version, sha(), vec![repo(REPO_A)])
            .await
            .unwrap();
    }

    let restarted = versioned(&journal);
    let state = restarted.get_version(&version).await.unwrap();
    let record = state.record().unwrap();
    assert_eq!(record.repositories, vec![repo(REPO_A), repo(REPO_B)]);
    assert_eq!(
        record.commit,
        CommitState::Unresolved {
            sha: sha(),
            attempted: vec![repo(REPO_A)],
        }
    );
    assert_eq!(record.pending_repositories(), vec![repo(REPO_B)]);
    assert_eq!(
        restarted.get_versions(&demo()).await.unwrap(),
        vec![version.clone()]
    );
}
