//! End-to-end tests from version registration to resolved commit

mod common;

use common::fixtures::{
    demo_version, jar, jar_path, manifest_path, manifest_xml, repo, sha, REPO_A, REPO_B, SHA,
};
use common::{ScriptedCommits, TestApp};
use provenance_core::Asset;
use provenance_service::{CommitState, PipelineStats};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

async fn serve_jar(app: &TestApp, version: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(jar_path(version)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&app.server)
        .await;
}

#[tokio::test]
async fn test_version_resolves_to_repository_containing_commit() {
    let commits = ScriptedCommits::new().with_commit(repo(REPO_B), sha());
    let app = TestApp::new(vec![repo(REPO_A), repo(REPO_B)], commits).await;
    serve_jar(&app, "1.1", jar(Some(SHA))).await;
    let _pipeline = app.start_pipeline();

    let version = demo_version("1.1");
    app.services.versioned.register(&version).await.unwrap();

    let record = app
        .wait_for(&version, |r| matches!(r.commit, CommitState::Resolved { .. }))
        .await;

    let details = record.resolved_commit().unwrap();
    assert_eq!(details.sha, sha());
    assert_eq!(details.repository, repo(REPO_B));
    assert_eq!(details.message, "Release 1.1");
    assert_eq!(
        details.body.as_deref(),
        Some("Bumps the parser to the new format.")
    );
    assert_eq!(record.repositories, vec![repo(REPO_A), repo(REPO_B)]);
    assert_eq!(record.assets.len(), 1);
    assert!(record.errored_assets.is_empty());

    // The fork is always tried before the upstream repository
    let lookups = app.commits.lookups();
    assert_eq!(lookups.first(), Some(&repo(REPO_A)));
    assert!(lookups.contains(&repo(REPO_B)));

    let stats = app.services.pipeline.stats();
    assert_eq!(PipelineStats::get(&stats.commits_discovered), 1);
    assert!(PipelineStats::get(&stats.commits_resolved) >= 1);
    assert_eq!(app.leftover_files(), 0);
}

#[tokio::test]
async fn test_commit_missing_from_every_repository_stays_unresolved() {
    let app = TestApp::new(vec![repo(REPO_A)], ScriptedCommits::new()).await;
    serve_jar(&app, "1.0", jar(Some(SHA))).await;
    let _pipeline = app.start_pipeline();

    let version = demo_version("1.0");
    app.services.versioned.register(&version).await.unwrap();

    let record = app
        .wait_for(&version, |r| matches!(r.commit, CommitState::Unresolved { .. }))
        .await;
    assert_eq!(
        record.commit,
        CommitState::Unresolved {
            sha: sha(),
            attempted: vec![repo(REPO_A)],
        }
    );
    assert_eq!(record.raw_commit(), Some(&sha()));
    assert!(record.pending_repositories().is_empty());
}

#[tokio::test]
async fn test_archive_without_commit_leaves_version_unknown() {
    let app = TestApp::new(vec![repo(REPO_B)], ScriptedCommits::new()).await;
    serve_jar(&app, "1.0", jar(None)).await;
    let _pipeline = app.start_pipeline();

    let version = demo_version("1.0");
    app.services.versioned.register(&version).await.unwrap();

    let stats = app.services.pipeline.stats();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while PipelineStats::get(&stats.commits_absent) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "archive was never scanned");
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    // An archive without a commit attribute is not downloaded again
    let record = app.wait_for(&version, |r| !r.errored_assets.is_empty()).await;
    assert_eq!(record.commit, CommitState::Unknown);
    assert_eq!(record.errored_assets, record.assets);
    assert!(app.commits.lookups().is_empty());
    assert_eq!(app.leftover_files(), 0);
}

#[tokio::test]
async fn test_missing_archive_is_marked_errored() {
    let app = TestApp::new(Vec::new(), ScriptedCommits::new()).await;
    Mock::given(method("GET"))
        .and(path(jar_path("2.0")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&app.server)
        .await;
    let _pipeline = app.start_pipeline();

    let version = demo_version("2.0");
    app.services.versioned.register(&version).await.unwrap();

    let record = app.wait_for(&version, |r| !r.errored_assets.is_empty()).await;
    assert_eq!(record.errored_assets, record.assets);
    assert_eq!(record.commit, CommitState::Unknown);
    assert!(!record.should_scan(&record.assets[0]));
    assert_eq!(app.leftover_files(), 0);
}

async fn wait_for_sweep(app: &TestApp) {
    let stats = app.services.pipeline.stats();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while PipelineStats::get(&stats.sweeps) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "pipeline never swept");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_failed_lookup_is_retried_on_next_sweep() {
    let commits = ScriptedCommits::new()
        .with_commit(repo(REPO_A), sha())
        .failing(repo(REPO_A), 1);
    let app = TestApp::new(vec![repo(REPO_A)], commits).await;
    serve_jar(&app, "1.0", jar(Some(SHA))).await;
    let pipeline = &app.services.pipeline;

    let version = demo_version("1.0");
    app.services.versioned.register(&version).await.unwrap();

    // Association and discovery, then the scan, then the failing lookup
    for _ in 0..3 {
        assert_eq!(pipeline.sweep().await.unwrap(), 1);
    }
    let state = app.services.versioned.get_version(&version).await.unwrap();
    let record = state.record().unwrap();
    assert_eq!(record.commit, CommitState::Raw { sha: sha() });
    assert_eq!(record.pending_repositories(), vec![repo(REPO_A)]);
    assert_eq!(PipelineStats::get(&pipeline.stats().lookup_failures), 1);

    assert_eq!(pipeline.sweep().await.unwrap(), 1);
    let record = app
        .wait_for(&version, |r| matches!(r.commit, CommitState::Resolved { .. }))
        .await;
    assert_eq!(record.resolved_commit().unwrap().repository, repo(REPO_A));
    assert_eq!(app.commits.lookups(), vec![repo(REPO_A), repo(REPO_A)]);

    assert_eq!(pipeline.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unavailable_archive_is_rescanned_later() {
    let commits = ScriptedCommits::new().with_commit(repo(REPO_B), sha());
    let app = TestApp::new(vec![repo(REPO_B)], commits).await;
    Mock::given(method("GET"))
        .and(path(jar_path("1.0")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.server)
        .await;
    let pipeline = &app.services.pipeline;

    let version = demo_version("1.0");
    app.services.versioned.register(&version).await.unwrap();
    assert_eq!(pipeline.sweep().await.unwrap(), 1);
    assert_eq!(pipeline.sweep().await.unwrap(), 1);

    let state = app.services.versioned.get_version(&version).await.unwrap();
    let record = state.record().unwrap();
    assert_eq!(record.commit, CommitState::Unknown);
    assert!(record.errored_assets.is_empty());
    assert!(record.should_scan(&record.assets[0]));
    assert_eq!(PipelineStats::get(&pipeline.stats().extraction_failures), 1);

    // The registry recovers
    app.server.reset().await;
    serve_jar(&app, "1.0", jar(Some(SHA))).await;
    assert_eq!(pipeline.sweep().await.unwrap(), 1);
    assert_eq!(pipeline.sweep().await.unwrap(), 1);

    let record = app
        .wait_for(&version, |r| matches!(r.commit, CommitState::Resolved { .. }))
        .await;
    assert_eq!(record.resolved_commit().unwrap().repository, repo(REPO_B));
    assert_eq!(app.leftover_files(), 0);
}

#[tokio::test]
async fn test_restart_picks_up_versions_registered_earlier() {
    let commits = ScriptedCommits::new().with_commit(repo(REPO_B), sha());
    let mut app = TestApp::new(vec![repo(REPO_A), repo(REPO_B)], commits).await;
    Mock::given(method("GET"))
        .and(path(manifest_path()))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(manifest_xml("20240101120000", &["1.0"])),
        )
        .mount(&app.server)
        .await;
    serve_jar(&app, "1.0", jar(Some(SHA))).await;

    // Registered while no pipeline listens, then the process goes away
    let report = app.services.resync.run_once().await.unwrap();
    assert_eq!(report.registered, 1);
    app.restart();

    let version = demo_version("1.0");
    let state = app.services.versioned.get_version(&version).await.unwrap();
    assert!(state.record().unwrap().assets.is_empty());

    let _pipeline = app.start_pipeline();
    let record = app
        .wait_for(&version, |r| matches!(r.commit, CommitState::Resolved { .. }))
        .await;
    assert_eq!(record.resolved_commit().unwrap().repository, repo(REPO_B));
    assert_eq!(record.repositories, vec![repo(REPO_A), repo(REPO_B)]);
    assert!(PipelineStats::get(&app.services.pipeline.stats().sweeps) >= 1);
}

#[tokio::test]
async fn test_overflowed_feed_is_caught_up() {
    let commits = ScriptedCommits::new().with_commit(repo(REPO_A), sha());
    let app = TestApp::with_settings(vec![repo(REPO_A)], commits, |settings| {
        settings.runtime = settings.runtime.clone().feed_capacity(1);
        settings.pipeline.event_parallelism = 1;
    })
    .await;
    let versions = ["1.0", "1.1", "1.2"];
    for v in versions {
        serve_jar(&app, v, jar(Some(SHA))).await;
    }
    let _pipeline = app.start_pipeline();
    wait_for_sweep(&app).await;

    // Each command emits two events at once, more than the feed buffers
    for v in versions {
        let url = Url::parse(&format!("{}{}", app.server.uri(), jar_path(v))).unwrap();
        app.services
            .versioned
            .add_assets(&demo_version(v), vec![Asset::new(None, "jar", url)])
            .await
            .unwrap();
    }

    for v in versions {
        let record = app
            .wait_for(&demo_version(v), |r| matches!(r.commit, CommitState::Resolved { .. }))
            .await;
        assert_eq!(record.repositories, vec![repo(REPO_A)]);
    }
    let stats = app.services.pipeline.stats();
    assert!(PipelineStats::get(&stats.lagged) >= 1);
    assert!(PipelineStats::get(&stats.sweeps) >= 2);
}
