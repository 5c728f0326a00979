use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::fetcher::PageFetcher;
use crate::collection::config::{ProxyPoolConfig, ScraperConfig};
use crate::collection::proxy::{ProxyConfig, ProxyPool};
use crate::error::{CollectorError, Result};

/// Periodically fetches a lightweight URL through each unhealthy proxy and
/// returns the ones that answer to rotation.
pub struct ProxyProber {
    fetcher: Arc<dyn PageFetcher>,
    pool: Arc<ProxyPool>,
    probe_url: Url,
    timeout: Duration,
}

impl fmt::Debug for ProxyProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyProber")
            .field("probe_url", &self.probe_url.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProxyProber {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        pool: Arc<ProxyPool>,
        proxy_config: &ProxyPoolConfig,
        scraper_config: &ScraperConfig,
    ) -> Result<Self> {
        let probe_url = Url::parse(&proxy_config.probe_url).map_err(|e| {
            CollectorError::Internal(format!(
                "invalid probe_url {}: {e}",
                proxy_config.probe_url
            ))
        })?;
        Ok(Self {
            fetcher,
            pool,
            probe_url,
            timeout: scraper_config.connect_timeout(),
        })
    }

    /// Probe every unhealthy proxy once. Returns how many recovered.
    pub async fn probe_once(&self) -> usize {
        let unhealthy = self.pool.unhealthy_proxies();
        let outcomes = join_all(unhealthy.iter().map(|proxy| self.probe(proxy))).await;

        let mut recovered = 0;
        for (proxy, healthy) in unhealthy.iter().zip(outcomes) {
            if healthy {
                self.pool.mark_recovered(proxy);
                recovered += 1;
            } else {
                debug!(proxy = %proxy, "proxy still failing health probe");
            }
        }
        recovered
    }

    async fn probe(&self, proxy: &ProxyConfig) -> bool {
        let attempt = tokio::time::timeout(
            self.timeout,
            self.fetcher.fetch(&self.probe_url, Some(proxy)),
        )
        .await;

        matches!(
            attempt,
            Ok(Ok(response)) if (200..400).contains(&response.status)
        )
    }

    /// Probe on `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(every = ?interval, "proxy health probe started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing is unhealthy yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let recovered = self.probe_once().await;
                    if recovered > 0 {
                        info!(recovered, "health probe restored proxies");
                    }
                }
            }
        }
        info!("proxy health probe stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::executor::{FetchError, RawResponse};
    use async_trait::async_trait;

    /// Answers 200 for one host and fails for everything else.
    struct HostFilter {
        healthy_host: String,
    }

    #[async_trait]
    impl PageFetcher for HostFilter {
        async fn fetch(
            &self,
            url: &Url,
            proxy: Option<&ProxyConfig>,
        ) -> std::result::Result<RawResponse, FetchError> {
            match proxy {
                Some(p) if p.host == self.healthy_host => Ok(RawResponse {
                    status: 200,
                    url: url.to_string(),
                    body: String::new(),
                }),
                _ => Err(FetchError::Connection("refused".into())),
            }
        }
    }

    #[tokio::test]
    async fn probe_restores_only_answering_proxies() {
        let good = ProxyConfig::new("10.0.0.1", 8080, "u", "p");
        let bad = ProxyConfig::new("10.0.0.2", 8080, "u", "p");
        let pool = Arc::new(ProxyPool::new(
            vec![good.clone(), bad.clone()],
            ProxyPoolConfig::default(),
        ));
        for _ in 0..3 {
            pool.report_outcome(&good, false);
            pool.report_outcome(&bad, false);
        }
        assert_eq!(pool.stats().healthy, 0);

        let prober = ProxyProber::new(
            Arc::new(HostFilter {
                healthy_host: "10.0.0.1".into(),
            }),
            pool.clone(),
            &ProxyPoolConfig::default(),
            &ScraperConfig::default(),
        )
        .unwrap();

        assert_eq!(prober.probe_once().await, 1);
        assert_eq!(pool.unhealthy_proxies(), vec![bad]);
    }
}
