//! HTTP client settings and engine-wide configuration, loadable from JSON.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::{DownloadError, proxy::ProxyConfig, retry::RetryPolicy};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Connection count used when a request does not name one.
pub const DEFAULT_CONNECTIONS: usize = 10;

/// HTTP client options shared by the probe and every segment fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Timeout for the metadata probe as a whole.
    #[serde(with = "duration_ms", rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,

    /// Time to establish a connection.
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    /// Maximum silence between two body chunks before a fetch fails.
    #[serde(with = "duration_ms", rename = "read_timeout_ms")]
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Extra headers sent with every request, as `(name, value)` pairs.
    pub headers: Vec<(String, String)>,

    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings when no proxy is configured.
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections kept per host. Segments of one session share a host.
    pub pool_max_idle_per_host: usize,

    #[serde(with = "duration_ms", rename = "pool_idle_timeout_ms")]
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: Vec::new(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: DEFAULT_CONNECTIONS,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    /// Default headers merged with the configured ones; configured headers win.
    ///
    /// `Accept-Encoding` is pinned to `identity` so ranges address raw bytes.
    pub fn header_map(&self) -> Result<HeaderMap, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                DownloadError::configuration(format!("invalid header name `{name}`: {e}"))
            })?;
            let value = HeaderValue::from_str(value.trim()).map_err(|e| {
                DownloadError::configuration(format!("invalid value for header `{name}`: {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// Engine-wide policy applied to every session the registry creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub http: DownloaderConfig,

    /// Connections per session when the request leaves it unset.
    pub default_connections: usize,

    /// Optional upper bound for requested connection counts; larger requests
    /// are clamped. Unset means requests are taken as given.
    pub max_connections: Option<usize>,

    pub retry: RetryPolicy,

    /// Capacity of each session's bounded event channel.
    pub event_channel_capacity: usize,

    /// Capacity of the observer broadcast channel; slow observers lag past it.
    pub broadcast_capacity: usize,

    /// Buffer size of the writers in front of segment sinks and the merge output.
    pub write_buffer_size: usize,

    /// Session temp dir is `<target dir>/<prefix><session id><suffix>`.
    pub temp_dir_prefix: String,
    pub temp_dir_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http: DownloaderConfig::default(),
            default_connections: DEFAULT_CONNECTIONS,
            max_connections: None,
            retry: RetryPolicy::default(),
            event_channel_capacity: 64,
            broadcast_capacity: 256,
            write_buffer_size: 64 * 1024,
            temp_dir_prefix: ".".to_owned(),
            temp_dir_suffix: "_temp".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DownloadError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            DownloadError::configuration(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.default_connections == 0 || self.max_connections == Some(0) {
            return Err(DownloadError::configuration(
                "connection counts must be at least 1",
            ));
        }
        if self.event_channel_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(DownloadError::configuration(
                "channel capacities must be at least 1",
            ));
        }
        if self.write_buffer_size == 0 {
            return Err(DownloadError::configuration(
                "write buffer size must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_http(mut self, http: DownloaderConfig) -> Self {
        self.http = http;
        self
    }

    pub fn with_default_connections(mut self, connections: usize) -> Self {
        self.default_connections = connections;
        self
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
