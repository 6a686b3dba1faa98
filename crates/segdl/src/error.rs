use std::path::PathBuf;

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("probe failed for {url}: {reason}")]
    Probe { url: String, reason: String },

    #[error("segment {index} failed after {downloaded} bytes: {reason}")]
    Segment {
        index: usize,
        downloaded: u64,
        reason: String,
        retryable: bool,
    },

    #[error("merge into {} failed: {reason}", path.display())]
    Merge { path: PathBuf, reason: String },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn probe(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Probe {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn segment(
        index: usize,
        downloaded: u64,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Segment {
            index,
            downloaded,
            reason: reason.into(),
            retryable,
        }
    }

    pub fn merge(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Merge {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Index of the segment this error belongs to, if any.
    pub fn segment_index(&self) -> Option<usize> {
        match self {
            Self::Segment { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidRequest { .. }
            | Self::Probe { .. }
            | Self::Merge { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Segment { retryable, .. } => *retryable,
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::Io { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_error_reports_index_and_bytes() {
        let err = DownloadError::segment(2, 100, "connection reset", true);
        assert_eq!(err.segment_index(), Some(2));
        assert_eq!(
            err.to_string(),
            "segment 2 failed after 100 bytes: connection reset"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = DownloadError::http_status(StatusCode::NOT_FOUND, "http://x/a", "fetch");
        assert!(!err.is_retryable());
        let err = DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://x/a", "fetch");
        assert!(err.is_retryable());
        let err = DownloadError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://x/a", "fetch");
        assert!(err.is_retryable());
    }

    #[test]
    fn merge_and_probe_errors_have_no_segment() {
        assert_eq!(DownloadError::merge("/tmp/out", "missing").segment_index(), None);
        assert_eq!(DownloadError::probe("http://x", "timeout").segment_index(), None);
    }
}
