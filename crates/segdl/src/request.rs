//! Download requests: target resolution and up-front validation.

use std::path::{Path, PathBuf};

use chrono::Utc;
use url::Url;

use crate::DownloadError;

/// What to download and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub target: PathBuf,
    /// Connection count; `None` takes the engine default.
    pub connections: Option<usize>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            target: target.into(),
            connections: None,
        }
    }

    /// Targets `dir/<file_name>`; without a file name, the last URL path
    /// segment is used, or `download_<unix millis>` when there is none.
    pub fn into_directory(
        url: impl Into<String>,
        dir: impl AsRef<Path>,
        file_name: Option<&str>,
    ) -> Self {
        let url = url.into();
        let name = match file_name {
            Some(name) if !name.trim().is_empty() => name.to_owned(),
            _ => file_name_from_url(&url),
        };
        let target = dir.as_ref().join(name);
        Self::new(url, target)
    }

    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Checks the request and returns the parsed URL.
    pub fn validate(&self) -> Result<Url, DownloadError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(DownloadError::invalid_request("URL is empty"));
        }
        let url = Url::parse(raw)
            .map_err(|e| DownloadError::invalid_request(format!("malformed URL '{raw}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_request(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if self.connections == Some(0) {
            return Err(DownloadError::invalid_request(
                "connection count must be at least 1",
            ));
        }
        if self.target.as_os_str().is_empty() {
            return Err(DownloadError::invalid_request("target path is empty"));
        }
        if self.target.file_name().is_none() {
            return Err(DownloadError::invalid_request(format!(
                "target '{}' has no file name",
                self.target.display()
            )));
        }
        Ok(url)
    }
}

/// Last non-empty path segment of `url`, percent-decoding left as is.
pub fn file_name_from_url(url: &str) -> String {
    Url::parse(url.trim())
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| format!("download_{}", Utc::now().timestamp_millis()))
}
