//! Source-control provenance for artifact versions
//!
//! This module defines the commit identifier embedded in build archives, the
//! repository locations it may be resolved against, and the full commit
//! metadata produced by a successful resolution.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

/// Hex-encoded commit object id (SHA-1: 40 chars or SHA-256: 64 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Validate and normalize a commit id to lowercase
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let trimmed = raw.trim();
        let len = trimmed.len();
        if len != 40 && len != 64 {
            return Err(CoreError::InvalidCommitId(format!(
                "commit id must be 40 (SHA-1) or 64 (SHA-256) characters, got {}",
                len
            )));
        }
        if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidCommitId(
                "commit id must contain only hexadecimal characters".to_string(),
            ));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl TryFrom<String> for CommitId {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

impl FromStr for CommitId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of a source repository a commit may be resolved against.
///
/// Accepts URLs (`https://`, `http://`, `ssh://`, `git://`, `file://`) and
/// scp-style SSH strings (`git@host:org/repo.git`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryUrl(String);

const URL_SCHEMES: [&str; 5] = ["https://", "http://", "ssh://", "git://", "file://"];

impl RepositoryUrl {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::ValidationError(
                "Repository URL cannot be empty".to_string(),
            ));
        }
        let is_url = URL_SCHEMES.iter().any(|scheme| raw.starts_with(scheme));
        let is_scp = raw.starts_with("git@") && raw.contains(':');
        if !is_url && !is_scp {
            return Err(CoreError::ValidationError(format!(
                "Repository must be a URL or SSH connection string, got '{}'",
                raw
            )));
        }
        if is_url {
            url::Url::parse(raw)?;
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Browsable web location of `commit` in this repository, if one can be derived
    pub fn commit_link(&self, commit: &CommitId) -> Option<String> {
        let web = self.web_base()?;
        Some(format!("{}/commit/{}", web, commit))
    }

    fn web_base(&self) -> Option<String> {
        let raw = self.0.trim_end_matches('/');
        let raw = raw.strip_suffix(".git").unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix("git@") {
            let (host, path) = rest.split_once(':')?;
            return Some(format!("https://{}/{}", host, path.trim_start_matches('/')));
        }
        if let Some(rest) = raw.strip_prefix("ssh://") {
            let rest = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
            let (host, path) = rest.split_once('/')?;
            let host = host.split(':').next().unwrap_or(host);
            return Some(format!("https://{}/{}", host, path));
        }
        if raw.starts_with("https://") || raw.starts_with("http://") {
            return Some(raw.to_string());
        }
        None
    }
}

impl TryFrom<String> for RepositoryUrl {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<RepositoryUrl> for String {
    fn from(url: RepositoryUrl) -> Self {
        url.0
    }
}

impl FromStr for RepositoryUrl {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RepositoryUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name and email of a commit author or committer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Full metadata of a resolved commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDetails {
    pub sha: CommitId,
    pub author: Signature,
    pub committer: Signature,
    /// Repository the commit was found in
    pub repository: RepositoryUrl,
    /// Commit time in the committer's original offset
    pub timestamp: DateTime<FixedOffset>,
    /// Subject line
    pub message: String,
    /// Remainder of the message after the subject, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl CommitDetails {
    /// Split a raw commit message into subject and body and derive the web link
    pub fn new(
        sha: CommitId,
        author: Signature,
        committer: Signature,
        repository: RepositoryUrl,
        timestamp: DateTime<FixedOffset>,
        raw_message: &str,
    ) -> Self {
        let raw_message = raw_message.trim_end();
        let (message, body) = match raw_message.split_once('\n') {
            Some((subject, rest)) => {
                let rest = rest.trim();
                (subject.trim().to_string(), (!rest.is_empty()).then(|| rest.to_string()))
            }
            None => (raw_message.trim().to_string(), None),
        };
        let link = repository.commit_link(&sha);
        Self {
            sha,
            author,
            committer,
            repository,
            timestamp,
            message,
            body,
            link,
        }
    }
}

impl fmt::Display for CommitDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.sha.short(), self.repository, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_commit_id_validation() {
        assert!(CommitId::parse(SHA).is_ok());
        assert_eq!(
            CommitId::parse(&SHA.to_uppercase()).unwrap().as_str(),
            SHA
        );
        assert!(CommitId::parse(&"a".repeat(64)).is_ok());
        assert!(CommitId::parse("abc123").is_err());
        assert!(CommitId::parse(&"g".repeat(40)).is_err());
    }

    #[test]
    fn test_repository_validation() {
        assert!(RepositoryUrl::parse("https://github.com/example/demo.git").is_ok());
        assert!(RepositoryUrl::parse("git@github.com:example/demo.git").is_ok());
        assert!(RepositoryUrl::parse("file:///tmp/demo").is_ok());
        assert!(RepositoryUrl::parse("ftp://example.com/demo").is_err());
        assert!(RepositoryUrl::parse("").is_err());
    }

    #[test]
    fn test_commit_links() {
        let sha = CommitId::parse(SHA).unwrap();
        let scp = RepositoryUrl::parse("git@github.com:example/demo.git").unwrap();
        assert_eq!(
            scp.commit_link(&sha).unwrap(),
            format!("https://github.com/example/demo/commit/{}", SHA)
        );

        let https = RepositoryUrl::parse("https://github.com/example/demo.git").unwrap();
        assert_eq!(
            https.commit_link(&sha).unwrap(),
            format!("https://github.com/example/demo/commit/{}", SHA)
        );

        let local = RepositoryUrl::parse("file:///srv/git/demo").unwrap();
        assert!(local.commit_link(&sha).is_none());
    }

    #[test]
    fn test_commit_message_split() {
        let timestamp = DateTime::parse_from_rfc3339("2021-01-18T16:32:10+01:00").unwrap();
        let details = CommitDetails::new(
            CommitId::parse(SHA).unwrap(),
            Signature::new("Ada", "ada@example.com"),
            Signature::new("Bob", "bob@example.com"),
            RepositoryUrl::parse("https://github.com/example/demo").unwrap(),
            timestamp,
            "Fix the thing\n\nLonger explanation.\n",
        );
        assert_eq!(details.message, "Fix the thing");
        assert_eq!(details.body.as_deref(), Some("Longer explanation."));
        assert_eq!(details.timestamp.offset().local_minus_utc(), 3600);
    }
}
