// Resource probe: a single HEAD request that learns size and range support.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::DownloadError;

/// What the probe learned about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    /// Size in bytes; 0 when the server did not say.
    pub size: u64,
    pub supports_ranges: bool,
}

impl ResourceInfo {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let supports_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"));
        Self {
            size,
            supports_ranges,
        }
    }
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Single attempt; any failure is a [`DownloadError::Probe`].
    async fn probe(&self, url: &Url) -> Result<ResourceInfo, DownloadError>;
}

pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ResourceProbe for HttpProber {
    #[instrument(skip_all, fields(url = %url), level = "debug")]
    async fn probe(&self, url: &Url) -> Result<ResourceInfo, DownloadError> {
        let response = self
            .client
            .head(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    format!("timed out after {:?}", self.timeout)
                } else {
                    e.to_string()
                };
                DownloadError::probe(url.as_str(), reason)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::probe(
                url.as_str(),
                format!("server answered HTTP {status}"),
            ));
        }

        let info = ResourceInfo::from_headers(response.headers());
        debug!(
            size = info.size,
            supports_ranges = info.supports_ranges,
            "Probed resource"
        );
        Ok(info)
    }
}
