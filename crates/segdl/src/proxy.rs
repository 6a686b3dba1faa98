use reqwest::Proxy;
use serde::{Deserialize, Serialize};

use crate::DownloadError;

/// Proxy protocol used for every request of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy server URL, e.g. `http://proxy.local:8080`.
    pub url: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Infers the proxy type from the URL scheme; bare `host:port` means HTTP.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let proxy_type = match url.split_once("://").map(|(scheme, _)| scheme) {
            Some("https") => ProxyType::Https,
            Some("socks5") | Some("socks5h") => ProxyType::Socks5,
            _ => ProxyType::Http,
        };
        Self {
            url,
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(&config.url),
        ProxyType::Https => Proxy::https(&config.url),
        ProxyType::Socks5 => {
            let url = if config.url.starts_with("socks5://") || config.url.starts_with("socks5h://")
            {
                config.url.clone()
            } else {
                format!("socks5://{}", config.url)
            };
            Proxy::all(url)
        }
    }
    .map_err(|e| DownloadError::proxy_configuration(format!("{}: {e}", config.url)))?;

    Ok(match &config.auth {
        Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
        None => proxy,
    })
}
