//! HTTP(S) GET with manual redirect handling, streaming to disk.
//!
//! Redirects are followed by hand (the client's own policy is disabled) so
//! the hop count is bounded and credentials are dropped when a redirect
//! leaves the original host, as release asset links typically do.

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION, LOCATION};
use reqwest::{redirect, Client, Response, Url};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::progress::ProgressTracker;
use crate::utils::{Result, UpdateError};

/// Upper bound on redirect hops for a single request
pub const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = concat!("update-agent/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// GET `url`, following redirects, and return the final 2xx response.
    pub async fn get(&self, url: &str, headers: &HeaderMap, timeout: Duration) -> Result<Response> {
        let mut current = Url::parse(url)
            .map_err(|e| UpdateError::Config(format!("invalid URL {}: {}", url, e)))?;
        let mut headers = headers.clone();

        for _ in 0..=MAX_REDIRECTS {
            debug!("HTTP: GET {}", current);
            let response = self
                .client
                .get(current.clone())
                .headers(headers.clone())
                .timeout(timeout)
                .send()
                .await?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| UpdateError::Http {
                        status: status.as_u16(),
                        url: current.to_string(),
                    })?;

                let next = current.join(location).map_err(|e| {
                    UpdateError::Network(format!("invalid redirect target {}: {}", location, e))
                })?;
                if next.host_str() != current.host_str() {
                    headers.remove(AUTHORIZATION);
                }

                debug!("  -> {} redirect to {}", status.as_u16(), next);
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(UpdateError::Http {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }

            debug!("  -> {}", status.as_u16());
            return Ok(response);
        }

        Err(UpdateError::Network(format!(
            "too many redirects (>{}) fetching {}",
            MAX_REDIRECTS, url
        )))
    }

    pub async fn fetch_text(&self, url: &str, headers: &HeaderMap, timeout: Duration) -> Result<String> {
        let response = self.get(url, headers, timeout).await?;
        Ok(response.text().await?)
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<T> {
        let response = self.get(url, headers, timeout).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| UpdateError::Network(format!("unexpected response from {}: {}", url, e)))
    }

    /// Stream `url` into `dest`. A partial file is removed on any failure.
    pub async fn download_to_file(
        &self,
        url: &str,
        headers: &HeaderMap,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64> {
        match self.stream_to_file(url, headers, dest, timeout).await {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {}: {}", dest.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        headers: &HeaderMap,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64> {
        let response = self.get(url, headers, timeout).await?;
        let expected = response.content_length();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;

        let mut tracker = ProgressTracker::new(format!("Downloading {}", url), expected);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            tracker.advance(chunk.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;

        let written = tracker.progress().transferred_bytes;
        if let Some(expected) = expected {
            if written != expected {
                return Err(UpdateError::Integrity(format!(
                    "downloaded {} bytes from {}, expected {}",
                    written, url, expected
                )));
            }
        }

        tracker.finish();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockReleaseServer;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_download_follows_redirect() {
        let payload = vec![7u8; 4096];
        let server = MockReleaseServer::start("v1.0.0", payload.clone()).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("download.tar.gz");

        let fetcher = HttpFetcher::new().unwrap();
        let written = fetcher
            .download_to_file(&server.url("/dl/hello-app.tar.gz"), &HeaderMap::new(), &dest, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(written, 4096);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
        // redirect hop + final response
        assert_eq!(server.requests(), 2);
    }

    #[tokio::test]
    async fn test_http_error_removes_partial_file() {
        let server = MockReleaseServer::start("v1.0.0", Vec::new()).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("download.tar.gz");
        tokio::fs::write(&dest, b"stale").await.unwrap();

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .download_to_file(&server.url("/missing.tar.gz"), &HeaderMap::new(), &dest, TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Http { status: 404, .. }), "{err:?}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_redirect_loop_is_capped() {
        let server = MockReleaseServer::start("v1.0.0", Vec::new()).await;
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .get(&server.url("/loop"), &HeaderMap::new(), TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Network(_)), "{err:?}");
        assert_eq!(server.requests(), MAX_REDIRECTS + 1);
    }

    #[tokio::test]
    async fn test_fetch_text() {
        let server = MockReleaseServer::start("v2.1.0", Vec::new()).await;
        let fetcher = HttpFetcher::new().unwrap();

        let text = fetcher
            .fetch_text(&server.url("/acme/hello/main/app/VERSION"), &HeaderMap::new(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(text.trim(), "2.1.0");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let fetcher = HttpFetcher::new().unwrap();
        // Port 9 (discard) is essentially never bound on loopback
        let err = fetcher
            .get("http://127.0.0.1:9/", &HeaderMap::new(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
