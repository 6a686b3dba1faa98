use reqwest::{Client, redirect::Policy};
use tracing::debug;

use crate::{DownloadError, DownloaderConfig, proxy::build_proxy_from_config};

/// Builds the HTTP client shared by all sessions of a registry.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.header_map()?)
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs);

    if !config.follow_redirects {
        builder = builder.redirect(Policy::none());
    }

    if let Some(proxy) = &config.proxy {
        debug!(proxy = %proxy.url, proxy_type = ?proxy.proxy_type, "Using configured proxy");
        builder = builder.proxy(build_proxy_from_config(proxy)?);
    } else if !config.use_system_proxy {
        builder = builder.no_proxy();
    }

    Ok(builder.build()?)
}
