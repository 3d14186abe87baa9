//! Registry resynchronization tests

mod common;

use common::fixtures::{demo, demo_version, manifest_path, manifest_xml};
use common::{ScriptedCommits, TestApp};
use provenance_service::{SyncState, SyncStatus};
use provenance_store::Journal;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

async fn serve_manifest(app: &TestApp, last_updated: &str, versions: &[&str]) {
    app.server.reset().await;
    Mock::given(method("GET"))
        .and(path(manifest_path()))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest_xml(last_updated, versions)))
        .mount(&app.server)
        .await;
}

#[tokio::test]
async fn test_resync_records_only_newer_manifests() {
    let app = TestApp::new(Vec::new(), ScriptedCommits::new()).await;
    let key = demo().key();

    serve_manifest(&app, "20240101120000", &["1.0", "1.1"]).await;
    let first = app.services.synchronizer.resync(&demo()).await;
    assert_eq!(first.status, SyncStatus::Discovered);
    assert_eq!(first.versions, vec![demo_version("1.0"), demo_version("1.1")]);
    assert_eq!(app.event_count::<SyncState>(&key).await, 1);

    // Same lastUpdated: reported unchanged with the stored versions
    let second = app.services.synchronizer.resync(&demo()).await;
    assert_eq!(second.status, SyncStatus::Unchanged);
    assert_eq!(second.versions, first.versions);
    assert_eq!(app.event_count::<SyncState>(&key).await, 1);

    serve_manifest(&app, "20240201120000", &["1.0", "1.1", "1.2"]).await;
    let third = app.services.synchronizer.resync(&demo()).await;
    assert_eq!(third.status, SyncStatus::Discovered);
    assert_eq!(
        third.versions,
        vec![demo_version("1.0"), demo_version("1.1"), demo_version("1.2")]
    );
    assert_eq!(app.event_count::<SyncState>(&key).await, 2);
}

#[tokio::test]
async fn test_older_manifest_is_ignored() {
    let app = TestApp::new(Vec::new(), ScriptedCommits::new()).await;

    serve_manifest(&app, "20240201120000", &["1.0", "1.1"]).await;
    app.services.synchronizer.resync(&demo()).await;

    // A stale mirror answering with an older document
    serve_manifest(&app, "20240101120000", &["1.0"]).await;
    let reply = app.services.synchronizer.resync(&demo()).await;
    assert_eq!(reply.status, SyncStatus::Unchanged);
    assert_eq!(reply.versions, vec![demo_version("1.0"), demo_version("1.1")]);

    let state = app.services.synchronizer.state(&demo()).await.unwrap();
    assert_eq!(
        state.last_updated().map(|t| t.as_str().to_string()),
        Some("20240201120000".to_string())
    );
}

#[tokio::test]
async fn test_registry_failure_leaves_state_untouched() {
    let app = TestApp::new(Vec::new(), ScriptedCommits::new()).await;
    Mock::given(method("GET"))
        .and(path(manifest_path()))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.server)
        .await;

    let reply = app.services.synchronizer.resync(&demo()).await;
    assert!(matches!(reply.status, SyncStatus::Failed(_)));
    assert!(reply.versions.is_empty());

    let state = app.services.synchronizer.state(&demo()).await.unwrap();
    assert!(state.manifest.is_none());
    assert!(app
        .journal
        .persistence_ids("sync|")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_resync_round_registers_discovered_versions() {
    let app = TestApp::new(Vec::new(), ScriptedCommits::new()).await;
    serve_manifest(&app, "20240101120000", &["1.0", "1.1"]).await;

    let report = app.services.resync.run_once().await.unwrap();
    assert_eq!(report.artifacts, 1);
    assert_eq!(report.changed, 1);
    assert_eq!(report.registered, 2);
    assert_eq!(report.failures, 0);

    let versions = app.services.versioned.get_versions(&demo()).await.unwrap();
    assert_eq!(versions, vec![demo_version("1.0"), demo_version("1.1")]);

    // Nothing moved, nothing registered
    let again = app.services.resync.run_once().await.unwrap();
    assert_eq!(again.changed, 0);
    assert_eq!(again.registered, 0);
}

#[tokio::test]
async fn test_changed_manifest_submits_only_added_versions() {
    let app = TestApp::new(Vec::new(), ScriptedCommits::new()).await;
    serve_manifest(&app, "20240101120000", &["1.0", "1.1"]).await;
    app.services.resync.run_once().await.unwrap();

    serve_manifest(&app, "20240301120000", &["1.0", "1.1", "1.2"]).await;
    let report = app.services.resync.run_once().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.versions, 1);
    assert_eq!(report.registered, 1);

    let versions = app.services.versioned.get_versions(&demo()).await.unwrap();
    assert_eq!(
        versions,
        vec![demo_version("1.0"), demo_version("1.1"), demo_version("1.2")]
    );
}
