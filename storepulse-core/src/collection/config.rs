use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::JobKind;

/// Global knobs that tune the collection pipeline.
///
/// All fields carry defaults so deployments can override a handful of values
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollectorConfig {
    /// Retry policy, lease TTL and completed-job history bounds.
    pub queue: QueueConfig,
    /// Worker counts per job kind and worker loop pacing.
    pub workers: WorkerPoolConfig,
    /// Scheduling cadence and discovery seeds.
    pub scheduler: SchedulerConfig,
    /// Proxy health thresholds and probing.
    pub proxy: ProxyPoolConfig,
    /// Outbound request settings for the scrape executor.
    pub scraper: ScraperConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    pub lease: LeaseConfig,
    /// Completed and terminally failed jobs older than this are pruned by
    /// housekeeping.
    pub history_retention_hours: u64,
    /// Upper bound on finished jobs remembered by the in-memory queue.
    pub history_capacity: usize,
}

impl QueueConfig {
    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.history_retention_hours as i64)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease: LeaseConfig::default(),
            history_retention_hours: 7 * 24,
            history_capacity: 1_000,
        }
    }
}

/// Backoff policy applied when a job fails and is requeued.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts after which a job becomes terminally failed.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the anchor delay added as jitter on top of it.
    pub jitter_ratio: f32,
}

impl RetryPolicy {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
        }
    }
}

/// Claims on in-progress jobs expire after this TTL so a crashed worker's job
/// can be reclaimed by housekeeping.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub lease_ttl_secs: i64,
}

impl LeaseConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 5 * 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub discovery_workers: usize,
    pub update_workers: usize,
    /// Sleep between polls when the queue has nothing ready.
    pub poll_interval_ms: u64,
    /// Random jitter added to the poll sleep so idle workers spread out.
    pub poll_jitter_ms: u64,
    /// Sleep after a dequeue error before trying again.
    pub error_backoff_ms: u64,
    /// How long `stop` waits for in-flight jobs before abandoning workers.
    pub shutdown_grace_secs: u64,
    /// Politeness delay observed by handlers after every outbound fetch.
    pub request_delay_ms: u64,
    /// Cap on update jobs a single discovery job may enqueue.
    pub max_new_per_discovery: usize,
    /// Consecutive not-found results before an extension is marked invalid.
    pub not_found_confirmations: u32,
}

impl WorkerPoolConfig {
    pub fn workers_for(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Discovery => self.discovery_workers,
            JobKind::Update => self.update_workers,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            discovery_workers: 1,
            update_workers: 4,
            poll_interval_ms: 1_000,
            poll_jitter_ms: 250,
            error_backoff_ms: 2_000,
            shutdown_grace_secs: 30,
            request_delay_ms: 1_500,
            max_new_per_discovery: 100,
            not_found_confirmations: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the scheduling loop.
    pub tick_interval_secs: u64,
    /// Minimum spacing between discovery rounds.
    pub discovery_interval_secs: u64,
    /// Minimum spacing between housekeeping passes.
    pub cleanup_interval_secs: u64,
    /// Upper bound on update jobs enqueued per cycle.
    pub max_jobs_per_run: usize,
    /// Categories crawled in rotation, one per discovery round.
    pub discovery_categories: Vec<String>,
    /// Keywords searched in rotation, one per discovery round.
    pub discovery_keywords: Vec<String>,
    pub trending: TrendingPolicy,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.discovery_interval_secs as i64)
    }

    pub fn cleanup_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cleanup_interval_secs as i64)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            discovery_interval_secs: 60 * 60,
            cleanup_interval_secs: 24 * 60 * 60,
            max_jobs_per_run: 100,
            discovery_categories: vec![
                "productivity/workflow".into(),
                "productivity/tools".into(),
                "lifestyle/shopping".into(),
                "make_chrome_yours/privacy".into(),
            ],
            discovery_keywords: vec!["ad blocker".into(), "password".into()],
            trending: TrendingPolicy::default(),
        }
    }
}

/// An extension whose user count grew by at least `growth_ratio` and at least
/// `min_delta` users since its previous scrape is promoted to the high tier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendingPolicy {
    pub growth_ratio: f64,
    pub min_delta: u64,
}

impl Default for TrendingPolicy {
    fn default() -> Self {
        Self {
            growth_ratio: 0.2,
            min_delta: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Consecutive failures after which a proxy is taken out of rotation.
    pub failure_threshold: u32,
    /// Time an unhealthy proxy sits out before it is tried again.
    pub cooldown_ms: u64,
    /// Cadence of the health probe over unhealthy proxies. Zero disables it.
    pub probe_interval_secs: u64,
    /// Lightweight URL fetched through a proxy to check it has recovered.
    pub probe_url: String,
    /// Whether callers may go direct when every configured proxy is unhealthy.
    pub allow_direct_fallback: bool,
}

impl ProxyPoolConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.cooldown_ms as i64)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0)
            .then(|| Duration::from_secs(self.probe_interval_secs))
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 5 * 60 * 1_000,
            probe_interval_secs: 120,
            probe_url: "https://chromewebstore.google.com/".into(),
            allow_direct_fallback: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Hard per-fetch timeout enforced by the executor.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
}

impl ScraperConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chromewebstore.google.com".into(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0 Safari/537.36"
                .into(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            pool_max_idle_per_host: 8,
        }
    }
}
