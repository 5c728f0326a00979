//! Single-fetch scrape execution with failure classification.
//!
//! The executor fetches one page, hands the body to the parser and turns
//! whatever happened into a [`ScrapeError`] the worker handlers can act on.
//! When a proxy was involved its outcome is always reported back to the pool,
//! and the metrics are always updated, whatever the result.

pub mod fetcher;
pub mod parser;
pub mod probe;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub use fetcher::{FetchError, HttpFetcher, PageFetcher, RawResponse};
pub use parser::{
    ExtensionPageParser, MetaTagParser, ParseError, extract_extension_ids,
};
pub use probe::ProxyProber;

use super::config::ScraperConfig;
use super::job::DiscoveryStrategy;
use super::proxy::{ProxyConfig, ProxyPool, ProxySelection};
use crate::error::{CollectorError, Result};
use crate::types::{ExtensionId, ExtensionRecord};

/// Classified outcome of a failed scrape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("listing not found")]
    NotFound,
    #[error("rate limited by the store")]
    RateLimited,
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("request timed out")]
    Timeout,
}

impl ScrapeError {
    /// Whether retrying later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::RateLimited
                | ScrapeError::ConnectionError(_)
                | ScrapeError::Timeout
        )
    }

    /// Whether the failure says something about the proxy that carried the
    /// request. A missing listing or an unparseable page does not.
    fn blames_proxy(&self) -> bool {
        self.is_transient()
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScrapeError::NotFound => "not_found",
            ScrapeError::RateLimited => "rate_limited",
            ScrapeError::ConnectionError(_) => "connection_error",
            ScrapeError::ParseError(_) => "parse_error",
            ScrapeError::Timeout => "timeout",
        }
    }
}

impl From<FetchError> for ScrapeError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout => ScrapeError::Timeout,
            other => ScrapeError::ConnectionError(other.to_string()),
        }
    }
}

impl From<ParseError> for ScrapeError {
    fn from(err: ParseError) -> Self {
        ScrapeError::ParseError(err.0)
    }
}

/// Snapshot of the executor counters. Every field only ever grows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeMetrics {
    pub total_requests: u64,
    pub successful_scrapes: u64,
    pub failed_scrapes: u64,
    /// Connection failures and timeouts.
    pub connection_errors: u64,
    pub total_duration: Duration,
}

impl ScrapeMetrics {
    pub fn average_duration(&self) -> Duration {
        let finished = self.successful_scrapes + self.failed_scrapes;
        if finished == 0 {
            return Duration::ZERO;
        }
        self.total_duration / finished.min(u32::MAX as u64) as u32
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.successful_scrapes + self.failed_scrapes;
        if finished == 0 {
            return 0.0;
        }
        self.successful_scrapes as f64 / finished as f64
    }
}

#[derive(Debug, Default)]
struct MetricCounters {
    total_requests: AtomicU64,
    successful_scrapes: AtomicU64,
    failed_scrapes: AtomicU64,
    connection_errors: AtomicU64,
    total_duration_micros: AtomicU64,
}

impl MetricCounters {
    fn record<T>(&self, result: &std::result::Result<T, ScrapeError>, elapsed: Duration) {
        self.total_duration_micros.fetch_add(
            elapsed.as_micros().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
        match result {
            Ok(_) => {
                self.successful_scrapes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed_scrapes.fetch_add(1, Ordering::Relaxed);
                if matches!(
                    err,
                    ScrapeError::ConnectionError(_) | ScrapeError::Timeout
                ) {
                    self.connection_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn snapshot(&self) -> ScrapeMetrics {
        ScrapeMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_scrapes: self.successful_scrapes.load(Ordering::Relaxed),
            failed_scrapes: self.failed_scrapes.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            total_duration: Duration::from_micros(
                self.total_duration_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Shared by every worker; holds no per-request state.
pub struct ScrapeExecutor {
    config: ScraperConfig,
    base_url: Url,
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn ExtensionPageParser>,
    proxies: Arc<ProxyPool>,
    metrics: MetricCounters,
}

impl fmt::Debug for ScrapeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeExecutor")
            .field("base_url", &self.base_url.as_str())
            .field("request_timeout", &self.config.request_timeout())
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl ScrapeExecutor {
    pub fn new(
        config: ScraperConfig,
        fetcher: Arc<dyn PageFetcher>,
        parser: Arc<dyn ExtensionPageParser>,
        proxies: Arc<ProxyPool>,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            CollectorError::Internal(format!(
                "invalid scraper base_url {}: {e}",
                config.base_url
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CollectorError::Internal(format!(
                "scraper base_url {} cannot carry a path",
                config.base_url
            )));
        }

        Ok(Self {
            config,
            base_url,
            fetcher,
            parser,
            proxies,
            metrics: MetricCounters::default(),
        })
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn metrics(&self) -> ScrapeMetrics {
        self.metrics.snapshot()
    }

    /// Fetch and parse one extension's detail page.
    pub async fn fetch_extension(
        &self,
        id: &ExtensionId,
        proxy: Option<&ProxyConfig>,
    ) -> std::result::Result<ExtensionRecord, ScrapeError> {
        let url = self.page_url(&["detail", id.as_str()], None);
        self.execute(url, proxy, |body| {
            Ok(self.parser.parse_extension(id, body)?)
        })
        .await
    }

    /// Fetch a listing page described by `strategy` and collect the extension
    /// ids it links to.
    pub async fn discover(
        &self,
        strategy: &DiscoveryStrategy,
        proxy: Option<&ProxyConfig>,
    ) -> std::result::Result<Vec<ExtensionId>, ScrapeError> {
        let url = self.listing_url(strategy);
        self.execute(url, proxy, |body| {
            let mut ids = self.parser.parse_listing(body);
            if let DiscoveryStrategy::Related { extension_id } = strategy {
                ids.retain(|id| id != extension_id);
            }
            Ok(ids)
        })
        .await
    }

    /// [`fetch_extension`](Self::fetch_extension) through the next proxy in
    /// rotation.
    pub async fn fetch_extension_with_rotation(
        &self,
        id: &ExtensionId,
    ) -> std::result::Result<ExtensionRecord, ScrapeError> {
        let proxy = self.rotate()?;
        self.fetch_extension(id, proxy.as_ref()).await
    }

    /// [`discover`](Self::discover) through the next proxy in rotation.
    pub async fn discover_with_rotation(
        &self,
        strategy: &DiscoveryStrategy,
    ) -> std::result::Result<Vec<ExtensionId>, ScrapeError> {
        let proxy = self.rotate()?;
        self.discover(strategy, proxy.as_ref()).await
    }

    /// Pick the proxy for the next request. `Ok(None)` means go direct.
    fn rotate(&self) -> std::result::Result<Option<ProxyConfig>, ScrapeError> {
        match self.proxies.select() {
            Ok(ProxySelection::Proxy(proxy)) => Ok(Some(proxy)),
            Ok(ProxySelection::Direct) => Ok(None),
            Err(CollectorError::NoHealthyProxy)
                if self.proxies.config().allow_direct_fallback =>
            {
                warn!("no healthy proxy available, falling back to direct");
                Ok(None)
            }
            Err(err) => {
                // Counted like any other failed request so the metrics reflect
                // work the pipeline could not do.
                self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
                let error = ScrapeError::ConnectionError(err.to_string());
                self.metrics.record::<()>(&Err(error.clone()), Duration::ZERO);
                Err(error)
            }
        }
    }

    async fn execute<T>(
        &self,
        url: Url,
        proxy: Option<&ProxyConfig>,
        parse: impl FnOnce(&str) -> std::result::Result<T, ScrapeError>,
    ) -> std::result::Result<T, ScrapeError> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = match self.fetch_body(&url, proxy).await {
            Ok(body) => parse(&body),
            Err(err) => Err(err),
        };
        let elapsed = started.elapsed();

        if let Some(proxy) = proxy {
            let proxy_ok = match &result {
                Ok(_) => true,
                Err(err) => !err.blames_proxy(),
            };
            self.proxies.report_outcome(proxy, proxy_ok);
        }
        self.metrics.record(&result, elapsed);

        match &result {
            Ok(_) => debug!(url = %url, elapsed_ms = elapsed.as_millis() as u64, "scrape succeeded"),
            Err(err) => debug!(
                url = %url,
                proxy = ?proxy.map(ProxyConfig::endpoint),
                outcome = err.label(),
                error = %err,
                "scrape failed"
            ),
        }
        result
    }

    async fn fetch_body(
        &self,
        url: &Url,
        proxy: Option<&ProxyConfig>,
    ) -> std::result::Result<String, ScrapeError> {
        let response = tokio::time::timeout(
            self.config.request_timeout(),
            self.fetcher.fetch(url, proxy),
        )
        .await
        .map_err(|_| ScrapeError::Timeout)??;

        match response.status {
            200..=299 => Ok(response.body),
            404 | 410 => Err(ScrapeError::NotFound),
            429 => Err(ScrapeError::RateLimited),
            status => Err(ScrapeError::ConnectionError(format!(
                "unexpected status {status}"
            ))),
        }
    }

    fn listing_url(&self, strategy: &DiscoveryStrategy) -> Url {
        match strategy {
            DiscoveryStrategy::Category { category, page } => {
                let mut segments = vec!["category", "extensions"];
                segments.extend(category.split('/').filter(|s| !s.is_empty()));
                self.page_url(&segments, Some(*page))
            }
            DiscoveryStrategy::Search { keyword, page } => {
                self.page_url(&["search", keyword.trim()], Some(*page))
            }
            DiscoveryStrategy::Related { extension_id } => {
                self.page_url(&["detail", extension_id.as_str(), "related"], None)
            }
            DiscoveryStrategy::Popular { page } => {
                let mut url = self.page_url(&["category", "extensions"], Some(*page));
                url.query_pairs_mut().append_pair("sortBy", "popular");
                url
            }
        }
    }

    fn page_url(&self, segments: &[&str], page: Option<u32>) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base URLs, so segments are always available.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if let Some(page) = page.filter(|page| *page > 1) {
            url.query_pairs_mut().append_pair("page", &page.to_string());
        }
        url
    }
}
