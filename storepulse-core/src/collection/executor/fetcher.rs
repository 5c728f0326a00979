//! Outbound HTTP for the scrape executor.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::collection::config::ScraperConfig;
use crate::collection::proxy::ProxyConfig;

/// Transport-level failure. HTTP error statuses are not errors at this layer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            // Strip the URL so query strings never leak into logs.
            FetchError::Connection(err.without_url().to_string())
        }
    }
}

/// Status, final URL and body of a completed request.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

/// Performs a single GET, optionally through an upstream proxy.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &Url,
        proxy: Option<&ProxyConfig>,
    ) -> Result<RawResponse, FetchError>;
}

/// reqwest-backed fetcher. Keeps one client per proxy so connection pools are
/// reused across requests routed through the same upstream.
pub struct HttpFetcher {
    config: ScraperConfig,
    direct: reqwest::Client,
    proxied: DashMap<ProxyConfig, reqwest::Client>,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("user_agent", &self.config.user_agent)
            .field("proxied_clients", &self.proxied.len())
            .finish()
    }
}

impl HttpFetcher {
    pub fn new(config: ScraperConfig) -> Result<Self, FetchError> {
        let direct = build_client(&config, None)?;
        Ok(Self {
            config,
            direct,
            proxied: DashMap::new(),
        })
    }

    fn client_for(&self, proxy: &ProxyConfig) -> Result<reqwest::Client, FetchError> {
        if let Some(client) = self.proxied.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, Some(proxy))?;
        debug!(proxy = %proxy, "built proxied HTTP client");
        Ok(self
            .proxied
            .entry(proxy.clone())
            .or_insert(client)
            .clone())
    }
}

fn build_client(
    config: &ScraperConfig,
    proxy: Option<&ProxyConfig>,
) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .user_agent(&config.user_agent)
        .gzip(true);

    if let Some(proxy) = proxy {
        let upstream = reqwest::Proxy::all(format!("http://{}", proxy.endpoint()))
            .map_err(|e| FetchError::Client(e.without_url().to_string()))?
            .basic_auth(&proxy.username, &proxy.password);
        builder = builder.proxy(upstream);
    }

    builder
        .build()
        .map_err(|e| FetchError::Client(e.to_string()))
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        proxy: Option<&ProxyConfig>,
    ) -> Result<RawResponse, FetchError> {
        let client = match proxy {
            Some(proxy) => self.client_for(proxy)?,
            None => self.direct.clone(),
        };

        let response = client.get(url.as_str()).send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            url: final_url,
            body,
        })
    }
}
