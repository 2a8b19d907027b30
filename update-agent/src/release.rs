//! Release discovery against a GitHub-style host.
//!
//! Two modes:
//! - release assets: `GET {api}/repos/{repo}/releases/latest`, then pick the
//!   first `.tar.gz` asset whose name contains the repository short name,
//!   falling back to the tag's source archive;
//! - branch: `GET {raw}/{repo}/{branch}/{version_file}` for the version and
//!   the branch source archive for the payload.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::SourceConfig;
use crate::state::ReleaseInfo;
use crate::transfer::HttpFetcher;
use crate::utils::{Result, UpdateError};
use crate::version::normalize_tag;

const ARCHIVE_EXTENSION: &str = ".tar.gz";

#[derive(Debug, Clone, Deserialize)]
struct LatestRelease {
    tag_name: String,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Newest published release as seen by a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRelease {
    /// Normalized version (`1.4.0`, no leading `v`)
    pub version: String,
    pub info: ReleaseInfo,
}

#[derive(Debug, Clone)]
pub struct ReleaseSource {
    config: SourceConfig,
    fetcher: HttpFetcher,
}

impl ReleaseSource {
    pub fn new(config: SourceConfig, fetcher: HttpFetcher) -> Self {
        Self { config, fetcher }
    }

    /// Query the release host for the newest version.
    pub async fn latest(&self, timeout: Duration) -> Result<RemoteRelease> {
        let repository = self.repository()?;

        if self.config.use_release_assets {
            self.latest_release(repository, timeout).await
        } else {
            self.branch_version(repository, timeout).await
        }
    }

    /// Headers for API and download requests
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn repository(&self) -> Result<&str> {
        let repository = self.config.repository.trim();
        if repository.is_empty() {
            return Err(UpdateError::Config(
                "update.source.repository is not configured".to_string(),
            ));
        }
        Ok(repository)
    }

    async fn latest_release(&self, repository: &str, timeout: Duration) -> Result<RemoteRelease> {
        let url = format!(
            "{}/repos/{}/releases/latest",
            self.config.api_base.trim_end_matches('/'),
            repository
        );
        let release: LatestRelease = self.fetcher.fetch_json(&url, &self.headers(), timeout).await?;

        let version = normalize_tag(&release.tag_name).to_string();
        if version.is_empty() {
            return Err(UpdateError::Network(format!("release at {} has an empty tag", url)));
        }

        let download_url = match select_asset(&release.assets, self.config.short_name()) {
            Some(asset) => {
                debug!("Using release asset {}", asset.name);
                asset.browser_download_url.clone()
            }
            None => format!(
                "{}/{}/archive/refs/tags/{}{}",
                self.config.archive_base.trim_end_matches('/'),
                repository,
                release.tag_name,
                ARCHIVE_EXTENSION
            ),
        };

        Ok(RemoteRelease {
            version,
            info: ReleaseInfo {
                tag: release.tag_name,
                download_url,
                published_at: release.published_at,
            },
        })
    }

    async fn branch_version(&self, repository: &str, timeout: Duration) -> Result<RemoteRelease> {
        let url = format!(
            "{}/{}/{}/{}",
            self.config.raw_base.trim_end_matches('/'),
            repository,
            self.config.branch,
            self.config.version_file.trim_start_matches('/')
        );
        let body = self.fetcher.fetch_text(&url, &self.headers(), timeout).await?;

        let version = normalize_tag(body.lines().next().unwrap_or("")).to_string();
        if version.is_empty() {
            return Err(UpdateError::Network(format!("version file at {} is empty", url)));
        }

        Ok(RemoteRelease {
            info: ReleaseInfo {
                tag: version.clone(),
                download_url: format!(
                    "{}/{}/archive/refs/heads/{}{}",
                    self.config.archive_base.trim_end_matches('/'),
                    repository,
                    self.config.branch,
                    ARCHIVE_EXTENSION
                ),
                published_at: None,
            },
            version,
        })
    }
}

/// First `.tar.gz` asset whose name mentions the repository short name
pub fn select_asset<'a>(assets: &'a [ReleaseAsset], short_name: &str) -> Option<&'a ReleaseAsset> {
    assets
        .iter()
        .find(|a| a.name.ends_with(ARCHIVE_EXTENSION) && a.name.contains(short_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockReleaseServer;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn source_for(server: &MockReleaseServer, use_release_assets: bool) -> ReleaseSource {
        let config = SourceConfig {
            repository: "acme/hello".to_string(),
            use_release_assets,
            api_base: server.base_url.clone(),
            raw_base: server.base_url.clone(),
            archive_base: server.base_url.clone(),
            ..SourceConfig::default()
        };
        ReleaseSource::new(config, HttpFetcher::new().unwrap())
    }

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://example.com/{}", name),
        }
    }

    #[test]
    fn test_select_asset() {
        let assets = vec![
            asset("other-1.0.tar.gz"),
            asset("hello-1.0.zip"),
            asset("hello-1.0.tar.gz"),
            asset("hello-extra-1.0.tar.gz"),
        ];
        assert_eq!(select_asset(&assets, "hello").unwrap().name, "hello-1.0.tar.gz");
        assert!(select_asset(&assets, "missing").is_none());
    }

    #[tokio::test]
    async fn test_latest_release_uses_named_asset() {
        let server = MockReleaseServer::start("v1.3.0", Vec::new()).await;
        let release = source_for(&server, true).latest(TIMEOUT).await.unwrap();

        assert_eq!(release.version, "1.3.0");
        assert_eq!(release.info.tag, "v1.3.0");
        assert_eq!(release.info.download_url, server.url("/dl/hello-app.tar.gz"));
        assert_eq!(release.info.published_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_branch_mode_reads_version_file() {
        let server = MockReleaseServer::start("v2.0.1", Vec::new()).await;
        let release = source_for(&server, false).latest(TIMEOUT).await.unwrap();

        assert_eq!(release.version, "2.0.1");
        assert_eq!(
            release.info.download_url,
            server.url("/acme/hello/archive/refs/heads/main.tar.gz")
        );
    }

    #[tokio::test]
    async fn test_missing_repository_is_config_error() {
        let source = ReleaseSource::new(SourceConfig::default(), HttpFetcher::new().unwrap());
        let err = source.latest(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, UpdateError::Config(_)));
    }

    #[test]
    fn test_token_adds_authorization() {
        let config = SourceConfig {
            token: Some("secret".to_string()),
            ..SourceConfig::default()
        };
        let source = ReleaseSource::new(config, HttpFetcher::new().unwrap());
        let headers = source.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
    }
}
