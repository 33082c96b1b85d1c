use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Settings shared by every HTTP client talking to upstream sites.
#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Explicit proxy for all requests; `None` keeps reqwest's env/system defaults.
    pub proxy_url: Option<String>,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            user_agent: concat!("livewatch/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy_url: None,
        }
    }
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a client bound to `local_address` when one is given.
pub fn build_client(
    settings: &HttpClientSettings,
    local_address: Option<IpAddr>,
) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(&settings.user_agent)
        .local_address(local_address)
        .pool_idle_timeout(Duration::from_secs(90));

    if settings.request_timeout > Duration::ZERO {
        builder = builder.timeout(settings.request_timeout);
    }

    if let Some(url) = settings.proxy_url.as_deref() {
        let proxy = reqwest::Proxy::all(url)
            .map_err(|e| Error::config(format!("invalid proxy URL {url}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}
