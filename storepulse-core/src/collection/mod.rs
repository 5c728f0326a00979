//! Collection pipeline: job queue, proxy rotation, scrape execution, worker
//! pool, scheduler and the automation facade that wires them together.

pub mod automation;
pub mod backoff;
pub mod classification;
pub mod config;
pub mod executor;
pub mod handlers;
pub mod job;
pub mod memory;
#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod persistence;
pub mod proxy;
pub mod queue;
pub mod scheduler;
pub mod workers;

pub use automation::{AutomationContext, AutomationContextBuilder, AutomationStatus};
pub use classification::{classify, classify_with_trend, is_trending};
pub use config::{
    CollectorConfig, LeaseConfig, ProxyPoolConfig, QueueConfig, RetryPolicy, SchedulerConfig,
    ScraperConfig, TrendingPolicy, WorkerPoolConfig,
};
pub use executor::{ScrapeError, ScrapeExecutor, ScrapeMetrics};
pub use handlers::{DiscoveryHandler, JobError, JobHandler, JobHandlers, UpdateHandler};
pub use job::{
    DiscoveryStrategy, EnqueueRequest, JobHandle, JobId, JobKind, JobPayload, JobPriority,
    JobRecord, JobStatus, LeaseId, UpdateSource,
};
pub use memory::InMemoryJobQueue;
#[cfg(feature = "database")]
pub use persistence::PostgresJobQueue;
pub use proxy::{ProxyConfig, ProxyPool, ProxyPoolStats, parse_proxy_list};
pub use queue::{CompletedJobsStats, DequeueRequest, FailOutcome, JobQueue};
pub use scheduler::{CleanupReport, CycleReport, Scheduler, SchedulerStats};
pub use workers::{WorkerPool, WorkerPoolStats};
