//! Archive and usage transport.

use crate::error::{Result, StowageError};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::debug;

/// Fetches the bytes behind a URL.
pub trait Transport: Send + Sync {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// HTTP(S) transport on a shared `reqwest` client; `file://` URLs are read
/// from disk.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = reqwest::Url::parse(url).map_err(|e| StowageError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if parsed.scheme() == "file" {
            let path = parsed.to_file_path().map_err(|_| StowageError::Transport {
                url: url.to_string(),
                message: "not a local path".to_string(),
            })?;
            return tokio::fs::read(&path)
                .await
                .map_err(|e| StowageError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                });
        }

        debug!(url, "downloading");
        let response = self.client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StowageError::Transport {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

impl Transport for HttpTransport {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.fetch(url))
    }
}
