//! Artifact identity types
//!
//! `ArtifactCoordinates` names a package family, `MavenCoordinates` names one
//! exact published version of it. Both are immutable once constructed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.\-]+$").expect("identifier pattern is valid"));

static TIMESTAMPED_SNAPSHOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*)-(\d{8}.\d{6})-(\d+)$").expect("timestamp pattern is valid")
});

const SNAPSHOT_SUFFIX: &str = "SNAPSHOT";

fn validate_identifier(kind: &str, value: &str) -> CoreResult<()> {
    if value.is_empty() {
        return Err(CoreError::InvalidCoordinates(format!("{} cannot be empty", kind)));
    }
    if !IDENTIFIER.is_match(value) {
        return Err(CoreError::InvalidCoordinates(format!(
            "{} '{}' contains characters outside [A-Za-z0-9_.-]",
            kind, value
        )));
    }
    Ok(())
}

/// Identity of a package family: `{groupId, artifactId}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawArtifactCoordinates")]
pub struct ArtifactCoordinates {
    pub group_id: String,
    pub artifact_id: String,
}

#[derive(Deserialize)]
struct RawArtifactCoordinates {
    group_id: String,
    artifact_id: String,
}

impl TryFrom<RawArtifactCoordinates> for ArtifactCoordinates {
    type Error = CoreError;

    fn try_from(raw: RawArtifactCoordinates) -> CoreResult<Self> {
        Self::new(raw.group_id, raw.artifact_id)
    }
}

impl ArtifactCoordinates {
    /// Create validated coordinates
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>) -> CoreResult<Self> {
        let group_id = group_id.into();
        let artifact_id = artifact_id.into();
        validate_identifier("groupId", &group_id)?;
        validate_identifier("artifactId", &artifact_id)?;
        Ok(Self {
            group_id,
            artifact_id,
        })
    }

    /// Group id with dots replaced by path separators, as laid out in a repository
    pub fn group_path(&self) -> String {
        self.group_id.replace('.', "/")
    }

    /// Stable key used to address this artifact's entities
    pub fn key(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }

    /// Attach a version to these coordinates
    pub fn version(&self, version: impl Into<String>) -> CoreResult<MavenCoordinates> {
        MavenCoordinates::new(self.group_id.clone(), self.artifact_id.clone(), version)
    }
}

impl fmt::Display for ArtifactCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.artifact_id)
    }
}

impl FromStr for ArtifactCoordinates {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((group, artifact)) if !artifact.contains(':') => Self::new(group, artifact),
            _ => Err(CoreError::InvalidCoordinates(format!(
                "expected 'groupId:artifactId', got '{}'",
                s
            ))),
        }
    }
}

/// Release or snapshot classification derived from a version string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    /// Final, singular version such as `1.0.0`
    Release,
    /// Moving snapshot such as `1.0.0-SNAPSHOT`
    Snapshot,
    /// One concrete snapshot build such as `1.0.0-20210118.163210-1`
    TimestampSnapshot,
}

impl VersionType {
    /// Classify a version string; empty versions are rejected
    pub fn from_version(version: &str) -> CoreResult<Self> {
        if version.is_empty() {
            return Err(CoreError::InvalidVersion("version cannot be empty".to_string()));
        }
        let ends_with_snapshot = version.len() >= SNAPSHOT_SUFFIX.len()
            && version.is_char_boundary(version.len() - SNAPSHOT_SUFFIX.len())
            && version[version.len() - SNAPSHOT_SUFFIX.len()..]
                .eq_ignore_ascii_case(SNAPSHOT_SUFFIX);
        if ends_with_snapshot {
            return Ok(Self::Snapshot);
        }
        if TIMESTAMPED_SNAPSHOT.is_match(version) {
            return Ok(Self::TimestampSnapshot);
        }
        Ok(Self::Release)
    }

    pub fn is_snapshot(&self) -> bool {
        !matches!(self, Self::Release)
    }

    /// Map a version to the form a build tool would request.
    ///
    /// Timestamped snapshots drop their `date.time-build` suffix in favour of
    /// `SNAPSHOT`; every other version is returned as is.
    pub fn as_standard_version(&self, version: &str) -> String {
        match self {
            Self::TimestampSnapshot => {
                let parts: Vec<&str> = version.split('-').collect();
                let keep = parts.len().saturating_sub(2);
                let mut standard = parts[..keep].join("-");
                if !standard.is_empty() {
                    standard.push('-');
                }
                standard.push_str(SNAPSHOT_SUFFIX);
                standard
            }
            Self::Snapshot | Self::Release => version.to_string(),
        }
    }
}

impl fmt::Display for VersionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::TimestampSnapshot => write!(f, "timestamp_snapshot"),
        }
    }
}

/// Identity of one exact artifact version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawMavenCoordinates")]
pub struct MavenCoordinates {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub version_type: VersionType,
}

#[derive(Deserialize)]
struct RawMavenCoordinates {
    group_id: String,
    artifact_id: String,
    version: String,
}

impl TryFrom<RawMavenCoordinates> for MavenCoordinates {
    type Error = CoreError;

    fn try_from(raw: RawMavenCoordinates) -> CoreResult<Self> {
        Self::new(raw.group_id, raw.artifact_id, raw.version)
    }
}

impl MavenCoordinates {
    /// Create validated coordinates, deriving the version type
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> CoreResult<Self> {
        let artifact = ArtifactCoordinates::new(group_id, artifact_id)?;
        let version = version.into();
        if version.contains(':') || version.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidVersion(format!(
                "version '{}' contains a separator or whitespace",
                version
            )));
        }
        let version_type = VersionType::from_version(&version)?;
        Ok(Self {
            group_id: artifact.group_id,
            artifact_id: artifact.artifact_id,
            version,
            version_type,
        })
    }

    /// The artifact these coordinates belong to
    pub fn artifact(&self) -> ArtifactCoordinates {
        ArtifactCoordinates {
            group_id: self.group_id.clone(),
            artifact_id: self.artifact_id.clone(),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.version_type.is_snapshot()
    }

    /// Coordinates rendered with the standard (non-timestamped) version
    pub fn as_standard_coordinates(&self) -> String {
        format!(
            "{}:{}:{}",
            self.group_id,
            self.artifact_id,
            self.version_type.as_standard_version(&self.version)
        )
    }
}

impl fmt::Display for MavenCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

impl FromStr for MavenCoordinates {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [group, artifact, version] => Self::new(*group, *artifact, *version),
            _ => Err(CoreError::InvalidCoordinates(format!(
                "expected 'groupId:artifactId:version', got '{}'",
                s
            ))),
        }
    }
}

/// One comparable piece of a version string
#[derive(Debug, PartialEq, Eq)]
enum VersionToken {
    Number(u64),
    Qualifier(String),
}

/// Rank of a qualifier relative to a plain release, which ranks 5
fn qualifier_rank(qualifier: &str) -> u8 {
    match qualifier {
        "alpha" | "a" => 0,
        "beta" | "b" => 1,
        "milestone" | "m" => 2,
        "rc" | "cr" => 3,
        "snapshot" => 4,
        "" | "ga" | "final" | "release" => 5,
        "sp" => 6,
        _ => 7,
    }
}

fn version_tokens(version: &str) -> Vec<VersionToken> {
    let mut tokens = Vec::new();
    for part in version.split(['.', '-', '_']) {
        let mut rest = part;
        while let Some(first) = rest.chars().next() {
            let numeric = first.is_ascii_digit();
            let end = rest
                .find(|c: char| c.is_ascii_digit() != numeric)
                .unwrap_or(rest.len());
            let (piece, tail) = rest.split_at(end);
            tokens.push(match piece.parse::<u64>() {
                Ok(n) if numeric => VersionToken::Number(n),
                _ => VersionToken::Qualifier(piece.to_ascii_lowercase()),
            });
            rest = tail;
        }
    }
    tokens
}

fn compare_tokens(a: Option<&VersionToken>, b: Option<&VersionToken>) -> Ordering {
    use VersionToken::{Number, Qualifier};
    match (a, b) {
        (Some(Number(x)), Some(Number(y))) => x.cmp(y),
        (Some(Number(_)), Some(Qualifier(_))) => Ordering::Greater,
        (Some(Qualifier(_)), Some(Number(_))) => Ordering::Less,
        (Some(Qualifier(x)), Some(Qualifier(y))) => qualifier_rank(x)
            .cmp(&qualifier_rank(y))
            .then_with(|| x.cmp(y)),
        // a missing token reads as zero or as a plain release
        (Some(Number(x)), None) => x.cmp(&0),
        (None, Some(Number(y))) => 0.cmp(y),
        (Some(Qualifier(x)), None) => qualifier_rank(x).cmp(&5),
        (None, Some(Qualifier(y))) => 5.cmp(&qualifier_rank(y)),
        (None, None) => Ordering::Equal,
    }
}

/// Order two version strings the way Maven releases succeed each other.
///
/// Numeric pieces compare as numbers, so `1.9 < 1.10`, and pre-release
/// qualifiers sort before the release they lead to: `1.0-rc1 < 1.0 < 1.0-sp1`.
/// Versions that only differ in spelling fall back to a lexical comparison.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (left, right) = (version_tokens(a), version_tokens(b));
    (0..left.len().max(right.len()))
        .map(|i| compare_tokens(left.get(i), right.get(i)))
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maven_coordinates() {
        let coords: MavenCoordinates = "org.example:demo:1.0".parse().unwrap();
        assert_eq!(coords.group_id, "org.example");
        assert_eq!(coords.artifact_id, "demo");
        assert_eq!(coords.version, "1.0");
        assert_eq!(coords.version_type, VersionType::Release);
        assert_eq!(coords.to_string(), "org.example:demo:1.0");
    }

    #[test]
    fn test_parse_rejects_missing_parts() {
        assert!("org.example:demo".parse::<MavenCoordinates>().is_err());
        assert!("org.example:demo:".parse::<MavenCoordinates>().is_err());
        assert!("org.example::1.0".parse::<MavenCoordinates>().is_err());
        assert!("org example:demo:1.0".parse::<MavenCoordinates>().is_err());
        assert!("a:b:c:d".parse::<MavenCoordinates>().is_err());
    }

    #[test]
    fn test_hyphenated_identifiers_are_accepted() {
        let coords = MavenCoordinates::new("org.spongepowered", "spongeapi-extra", "8.0.0").unwrap();
        assert_eq!(coords.artifact_id, "spongeapi-extra");
    }

    #[test]
    fn test_version_type_detection() {
        assert_eq!(VersionType::from_version("1.0.0").unwrap(), VersionType::Release);
        assert_eq!(
            VersionType::from_version("1.0.0-SNAPSHOT").unwrap(),
            VersionType::Snapshot
        );
        assert_eq!(
            VersionType::from_version("1.0.0-snapshot").unwrap(),
            VersionType::Snapshot
        );
        assert_eq!(
            VersionType::from_version("1.0.0-20210118.163210-1").unwrap(),
            VersionType::TimestampSnapshot
        );
        assert!(VersionType::from_version("").is_err());
    }

    #[test]
    fn test_standard_version_for_timestamped_snapshot() {
        let coords = MavenCoordinates::new("org.example", "demo", "8.0.0-20210118.163210-12").unwrap();
        assert!(coords.is_snapshot());
        assert_eq!(coords.as_standard_coordinates(), "org.example:demo:8.0.0-SNAPSHOT");

        let release = MavenCoordinates::new("org.example", "demo", "8.0.0").unwrap();
        assert_eq!(release.as_standard_coordinates(), "org.example:demo:8.0.0");
    }

    #[test]
    fn test_versions_compare_numerically() {
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0-rc1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0-beta", "1.0-rc1"), Ordering::Less);
        assert_eq!(compare_versions("1.0-SNAPSHOT", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0-sp1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.1", "1.0-rc1"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0"), Ordering::Equal);

        let mut versions = vec!["1.10", "1.2", "1.2-rc1", "1.9.1", "1.9"];
        versions.sort_by(|a, b| compare_versions(a, b));
        assert_eq!(versions, vec!["1.2-rc1", "1.2", "1.9", "1.9.1", "1.10"]);
    }

    #[test]
    fn test_group_path_and_key() {
        let artifact = ArtifactCoordinates::new("org.example.tools", "demo").unwrap();
        assert_eq!(artifact.group_path(), "org/example/tools");
        assert_eq!(artifact.key(), "org.example.tools:demo");
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: MavenCoordinates = serde_json::from_str(
            r#"{"group_id":"org.example","artifact_id":"demo","version":"1.1-SNAPSHOT"}"#,
        )
        .unwrap();
        assert_eq!(ok.version_type, VersionType::Snapshot);

        let bad = serde_json::from_str::<MavenCoordinates>(
            r#"{"group_id":"org.example","artifact_id":"demo","version":""}"#,
        );
        assert!(bad.is_err());
    }
}
