//! HTTP client for the artifact registry
//!
//! Fetches `maven-metadata.xml` manifests and discovers the files published
//! for a version. Asset discovery uses the registry's REST search when one is
//! configured and otherwise assumes the standard repository layout.

use async_trait::async_trait;
use provenance_core::{ArtifactCoordinates, Asset, MavenCoordinates, RegistryManifest, VersionType};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{ServiceError, ServiceResult};

/// User agent sent with every registry request
pub const DEFAULT_USER_AGENT: &str = "Provenance-Synchronizer";

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on followed search continuation tokens
const MAX_SEARCH_PAGES: usize = 100;

/// Extensions of detached checksum and signature files
const SIDECAR_SUFFIXES: &[&str] = &["md5", "sha1", "sha256", "sha512", "asc"];

/// Read access to the artifact registry
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Fetch and parse the version manifest of an artifact
    async fn fetch_manifest(&self, artifact: &ArtifactCoordinates) -> ServiceResult<RegistryManifest>;

    /// List the files published for one version
    async fn fetch_assets(&self, coordinates: &MavenCoordinates) -> ServiceResult<Vec<Asset>>;
}

/// Settings for [`RegistryClient`]
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    pub base_url: Url,
    pub search_url: Option<Url>,
    pub user_agent: String,
    pub timeout: Duration,
}

impl RegistryClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            search_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn search_url(mut self, search_url: Url) -> Self {
        self.search_url = Some(search_url);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Registry client over `reqwest`
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Url,
    search_url: Option<Url>,
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: directory(config.base_url),
            search_url: config.search_url,
        })
    }

    /// Location of an artifact's `maven-metadata.xml`
    pub fn manifest_url(&self, artifact: &ArtifactCoordinates) -> ServiceResult<Url> {
        let path = format!(
            "{}/{}/maven-metadata.xml",
            artifact.group_path(),
            artifact.artifact_id
        );
        Ok(self.base_url.join(&path)?)
    }

    /// Location of a version's primary jar under the standard layout.
    ///
    /// Timestamped snapshots live in their `-SNAPSHOT` directory.
    pub fn primary_jar_url(&self, coordinates: &MavenCoordinates) -> ServiceResult<Url> {
        let directory = coordinates
            .version_type
            .as_standard_version(&coordinates.version);
        let path = format!(
            "{}/{}/{}/{}-{}.jar",
            coordinates.artifact().group_path(),
            coordinates.artifact_id,
            directory,
            coordinates.artifact_id,
            coordinates.version
        );
        Ok(self.base_url.join(&path)?)
    }

    fn search_page_url(
        &self,
        search_url: &Url,
        coordinates: &MavenCoordinates,
        continuation: Option<&str>,
    ) -> Url {
        let mut url = search_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("maven.groupId", &coordinates.group_id)
                .append_pair("maven.artifactId", &coordinates.artifact_id);
            match coordinates.version_type {
                VersionType::TimestampSnapshot => {
                    query.append_pair("version", &coordinates.version);
                }
                VersionType::Release | VersionType::Snapshot => {
                    query.append_pair("maven.baseVersion", &coordinates.version);
                }
            }
            if let Some(token) = continuation {
                query.append_pair("continuationToken", token);
            }
        }
        url
    }

    async fn search_assets(
        &self,
        search_url: &Url,
        coordinates: &MavenCoordinates,
    ) -> ServiceResult<Vec<Asset>> {
        let mut assets = Vec::new();
        let mut continuation: Option<String> = None;

        for _ in 0..MAX_SEARCH_PAGES {
            let url = self.search_page_url(search_url, coordinates, continuation.as_deref());
            let response = self.http.get(url.clone()).send().await?;
            let status = response.status();
            if status != StatusCode::OK {
                return Err(ServiceError::RegistryStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let page: SearchPage = response.json().await?;
            assets.extend(
                page.items
                    .into_iter()
                    .flat_map(|item| item.assets)
                    .filter_map(SearchAsset::into_asset),
            );

            match page.continuation_token.filter(|t| !t.is_empty()) {
                Some(token) => continuation = Some(token),
                None => return Ok(assets),
            }
        }

        warn!(coordinates = %coordinates, "Search paging limit reached, keeping partial asset list");
        Ok(assets)
    }
}

#[async_trait]
impl ArtifactRegistry for RegistryClient {
    #[instrument(skip(self), fields(artifact = %artifact))]
    async fn fetch_manifest(&self, artifact: &ArtifactCoordinates) -> ServiceResult<RegistryManifest> {
        let url = self.manifest_url(artifact)?;
        debug!(%url, "Fetching registry manifest");

        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ServiceError::RegistryStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        Ok(RegistryManifest::from_xml(&body)?)
    }

    #[instrument(skip(self), fields(coordinates = %coordinates))]
    async fn fetch_assets(&self, coordinates: &MavenCoordinates) -> ServiceResult<Vec<Asset>> {
        match &self.search_url {
            Some(search_url) => self.search_assets(search_url, coordinates).await,
            None => {
                let url = self.primary_jar_url(coordinates)?;
                debug!(%url, "No search endpoint configured, assuming primary jar");
                Ok(vec![Asset::new(None, "jar", url)])
            }
        }
    }
}

pub(crate) fn directory(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(default, rename = "continuationToken")]
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    assets: Vec<SearchAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchAsset {
    download_url: Url,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    checksum: Option<SearchChecksum>,
    #[serde(default)]
    maven2: Option<SearchMaven2>,
}

#[derive(Debug, Deserialize)]
struct SearchChecksum {
    sha1: Option<String>,
    md5: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchMaven2 {
    extension: Option<String>,
    classifier: Option<String>,
}

impl SearchAsset {
    fn into_asset(self) -> Option<Asset> {
        let (extension, classifier) = match self.maven2 {
            Some(maven2) => (maven2.extension, maven2.classifier),
            None => (None, None),
        };
        let extension = extension.or_else(|| {
            let path = self.path.as_deref().unwrap_or_else(|| self.download_url.path());
            path.rsplit('/')
                .next()
                .and_then(|file| file.rsplit_once('.'))
                .map(|(_, ext)| ext.to_string())
        })?;

        let last = extension.rsplit('.').next().unwrap_or(&extension);
        if SIDECAR_SUFFIXES.contains(&last) {
            return None;
        }

        let (md5, sha1) = match self.checksum {
            Some(c) => (c.md5, c.sha1),
            None => (None, None),
        };
        Some(Asset::new(classifier, extension, self.download_url).with_checksums(md5, sha1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata>
  <groupId>org.example</groupId>
  <artifactId>demo</artifactId>
  <versioning>
    <latest>1.1</latest>
    <release>1.1</release>
    <versions>
      <version>1.0</version>
      <version>1.1</version>
    </versions>
    <lastUpdated>20240101120000</lastUpdated>
  </versioning>
</metadata>"#;

    fn artifact() -> ArtifactCoordinates {
        ArtifactCoordinates::new("org.example", "demo").unwrap()
    }

    fn client(server: &MockServer, search: bool) -> RegistryClient {
        let base = Url::parse(&format!("{}/repository/maven", server.uri())).unwrap();
        let mut config = RegistryClientConfig::new(base).timeout(Duration::from_secs(5));
        if search {
            config = config
                .search_url(Url::parse(&format!("{}/service/rest/v1/search", server.uri())).unwrap());
        }
        RegistryClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_manifest_sends_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repository/maven/org/example/demo/maven-metadata.xml"))
            .and(header("user-agent", DEFAULT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
            .expect(1)
            .mount(&server)
            .await;

        let manifest = client(&server, false).fetch_manifest(&artifact()).await.unwrap();
        assert_eq!(manifest.versions, vec!["1.0", "1.1"]);
        assert_eq!(manifest.last_updated.as_str(), "20240101120000");
    }

    #[tokio::test]
    async fn test_fetch_manifest_non_200_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server, false).fetch_manifest(&artifact()).await.unwrap_err();
        assert!(matches!(err, ServiceError::RegistryStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_fetch_manifest_malformed_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<metadata><groupId>x</groupId></metadata>"))
            .mount(&server)
            .await;

        let err = client(&server, false).fetch_manifest(&artifact()).await.unwrap_err();
        assert!(matches!(err, ServiceError::MalformedDocument(_)));
    }

    #[tokio::test]
    async fn test_layout_derived_primary_jar() {
        let server = MockServer::start().await;
        let client = client(&server, false);

        let snapshot = MavenCoordinates::new("org.example", "demo", "1.2-20240101.120000-3").unwrap();
        let assets = client.fetch_assets(&snapshot).await.unwrap();
        assert_eq!(assets.len(), 1);
        assert!(assets[0].is_scannable());
        assert!(assets[0]
            .download_url
            .path()
            .ends_with("/org/example/demo/1.2-SNAPSHOT/demo-1.2-20240101.120000-3.jar"));
    }

    #[tokio::test]
    async fn test_search_follows_continuation_token() {
        let server = MockServer::start().await;
        let jar = format!("{}/repository/maven/org/example/demo/1.0/demo-1.0.jar", server.uri());
        let sources = format!(
            "{}/repository/maven/org/example/demo/1.0/demo-1.0-sources.jar",
            server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/service/rest/v1/search"))
            .and(query_param("maven.groupId", "org.example"))
            .and(query_param("maven.baseVersion", "1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "version": "1.0", "assets": [
                    { "downloadUrl": jar.clone(), "path": "org/example/demo/1.0/demo-1.0.jar",
                      "checksum": { "sha1": "abc", "md5": "def" },
                      "maven2": { "extension": "jar" } },
                    { "downloadUrl": format!("{}.sha1", jar),
                      "maven2": { "extension": "jar.sha1" } }
                ]}],
                "continuationToken": "page-2"
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/service/rest/v1/search"))
            .and(query_param("continuationToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "version": "1.0", "assets": [
                    { "downloadUrl": sources,
                      "maven2": { "extension": "jar", "classifier": "sources" } }
                ]}],
                "continuationToken": null
            })))
            .with_priority(1)
            .mount(&server)
            .await;

        let coordinates = MavenCoordinates::new("org.example", "demo", "1.0").unwrap();
        let assets = client(&server, true).fetch_assets(&coordinates).await.unwrap();

        assert_eq!(assets.len(), 2);
        assert!(assets[0].is_scannable());
        assert_eq!(assets[0].sha1.as_deref(), Some("abc"));
        assert_eq!(assets[1].classifier.as_deref(), Some("sources"));
        assert!(!assets[1].is_scannable());
    }
}
