//! Test fixtures
//!
//! Registry documents, archives and commits shared by the integration tests.

use chrono::DateTime;
use provenance_core::{
    ArtifactCoordinates, CommitDetails, CommitId, MavenCoordinates, RepositoryUrl, Signature,
};
use std::io::{Cursor, Write};

pub const GROUP: &str = "org.example";
pub const ARTIFACT: &str = "demo";
pub const SHA: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
pub const REPO_A: &str = "https://github.com/example/demo-fork";
pub const REPO_B: &str = "https://github.com/example/demo";

pub fn demo() -> ArtifactCoordinates {
    ArtifactCoordinates::new(GROUP, ARTIFACT).unwrap()
}

pub fn demo_version(version: &str) -> MavenCoordinates {
    demo().version(version).unwrap()
}

pub fn repo(url: &str) -> RepositoryUrl {
    RepositoryUrl::parse(url).unwrap()
}

pub fn sha() -> CommitId {
    CommitId::parse(SHA).unwrap()
}

/// A `maven-metadata.xml` document listing `versions`
pub fn manifest_xml(last_updated: &str, versions: &[&str]) -> String {
    let versions: String = versions
        .iter()
        .map(|v| format!("      <version>{}</version>\n", v))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata>
  <groupId>{GROUP}</groupId>
  <artifactId>{ARTIFACT}</artifactId>
  <versioning>
    <versions>
{versions}    </versions>
    <lastUpdated>{last_updated}</lastUpdated>
  </versioning>
</metadata>"#
    )
}

/// Path of the manifest document below the registry root
pub fn manifest_path() -> String {
    format!("/maven2/org/example/{}/maven-metadata.xml", ARTIFACT)
}

/// Path of the primary jar of `version` below the registry root
pub fn jar_path(version: &str) -> String {
    format!(
        "/maven2/org/example/{a}/{v}/{a}-{v}.jar",
        a = ARTIFACT,
        v = version
    )
}

/// A jar whose manifest optionally carries a `Git-Commit` attribute
pub fn jar(commit: Option<&str>) -> Vec<u8> {
    let mut manifest = String::from("Manifest-Version: 1.0\r\nCreated-By: 17 (Eclipse Adoptium)\r\n");
    if let Some(commit) = commit {
        manifest.push_str(&format!("Git-Commit: {}\r\n", commit));
    }
    manifest.push_str("\r\n");

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    writer.start_file("META-INF/MANIFEST.MF", options).unwrap();
    writer.write_all(manifest.as_bytes()).unwrap();
    writer.start_file("org/example/demo/Main.class", options).unwrap();
    writer.write_all(&[0xCA, 0xFE, 0xBA, 0xBE]).unwrap();
    writer.finish().unwrap().into_inner()
}

/// Commit metadata as a repository would report it
pub fn commit_details(repository: &RepositoryUrl, sha: &CommitId) -> CommitDetails {
    let author = Signature::new("Ada Example", "ada@example.org");
    CommitDetails::new(
        sha.clone(),
        author.clone(),
        author,
        repository.clone(),
        DateTime::parse_from_rfc3339("2024-03-01T09:30:00+01:00").unwrap(),
        "Release 1.1\n\nBumps the parser to the new format.\n",
    )
}
