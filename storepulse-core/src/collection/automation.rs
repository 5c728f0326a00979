//! Lifecycle controller that wires queue, workers, scheduler and proxy probe
//! together. Owned by the process entry point and handed to whatever drives
//! it; several independent contexts can coexist in one process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use super::config::CollectorConfig;
use super::executor::{
    ExtensionPageParser, HttpFetcher, MetaTagParser, PageFetcher, ProxyProber,
    ScrapeExecutor, ScrapeMetrics,
};
use super::handlers::{DiscoveryHandler, HandlerSettings, JobHandlers, UpdateHandler};
use super::job::{
    DiscoveryStrategy, EnqueueRequest, JobHandle, JobId, JobKind, JobPayload, JobPriority,
    JobRecord, UpdateSource,
};
use super::proxy::{ProxyConfig, ProxyPool, ProxyPoolStats};
use super::queue::{CompletedJobsStats, JobQueue};
use super::scheduler::{CleanupReport, Scheduler, SchedulerStats};
use super::workers::{WorkerPool, WorkerPoolStats};
use crate::error::{CollectorError, Result};
use crate::store::ExtensionStore;
use crate::types::ExtensionId;

/// Point-in-time view of the whole pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct AutomationStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: WorkerPoolStats,
    pub scheduler: SchedulerStats,
    pub proxies: ProxyPoolStats,
    pub scrape: ScrapeMetrics,
}

struct ProbeTask {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    started_at: Option<DateTime<Utc>>,
    probe: Option<ProbeTask>,
}

pub struct AutomationContext {
    config: CollectorConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ExtensionStore>,
    fetcher: Arc<dyn PageFetcher>,
    executor: Arc<ScrapeExecutor>,
    handlers: JobHandlers,
    workers: WorkerPool,
    scheduler: Arc<Scheduler>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for AutomationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .lifecycle
            .try_lock()
            .map(|lc| lc.started_at.is_some())
            .unwrap_or(true);
        f.debug_struct("AutomationContext")
            .field("running", &running)
            .field("executor", &self.executor)
            .field("workers", &self.workers)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl AutomationContext {
    pub fn builder(config: CollectorConfig) -> AutomationContextBuilder {
        AutomationContextBuilder::new(config)
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<dyn ExtensionStore> {
        Arc::clone(&self.store)
    }

    pub fn executor(&self) -> Arc<ScrapeExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Start workers, the scheduler loop and, when configured, the proxy
    /// health probe. Starting a running context only reports its status.
    pub async fn start(&self) -> Result<AutomationStatus> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.started_at.is_some() {
                info!("automation already running");
            } else {
                self.workers.start(self.handlers.clone()).await?;
                self.scheduler.start().await;
                lifecycle.probe = self.spawn_probe()?;
                lifecycle.started_at = Some(Utc::now());
                info!(
                    proxies = self.executor.proxies().stats().total,
                    "automation started"
                );
            }
        }
        self.status().await
    }

    /// Stop producing first, then drain workers. Stopping a stopped context
    /// only reports its status.
    pub async fn stop(&self) -> Result<AutomationStatus> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.started_at.take().is_none() {
                info!("automation already stopped");
            } else {
                self.scheduler.stop().await;
                self.workers.stop().await;
                if let Some(ProbeTask { shutdown, task }) = lifecycle.probe.take() {
                    shutdown.cancel();
                    if let Err(err) = task.await {
                        warn!(error = %err, "proxy probe task failed");
                    }
                }
                info!("automation stopped");
            }
        }
        self.status().await
    }

    fn spawn_probe(&self) -> Result<Option<ProbeTask>> {
        let pool = self.executor.proxies();
        let Some(every) = self.config.proxy.probe_interval() else {
            return Ok(None);
        };
        if !pool.is_enabled() {
            return Ok(None);
        }

        let prober = ProxyProber::new(
            Arc::clone(&self.fetcher),
            Arc::clone(pool),
            &self.config.proxy,
            &self.config.scraper,
        )?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            prober
                .run(every, shutdown.clone())
                .instrument(info_span!("proxy_probe")),
        );
        Ok(Some(ProbeTask { shutdown, task }))
    }

    pub async fn status(&self) -> Result<AutomationStatus> {
        let started_at = self.lifecycle.lock().await.started_at;
        Ok(AutomationStatus {
            running: started_at.is_some(),
            started_at,
            workers: self.workers.stats().await?,
            scheduler: self.scheduler.stats().await?,
            proxies: self.proxy_stats(),
            scrape: self.scrape_metrics(),
        })
    }

    /// Queue a refresh of one extension.
    pub async fn schedule_update(
        &self,
        extension_id: ExtensionId,
        priority: JobPriority,
    ) -> Result<JobHandle> {
        self.queue
            .enqueue(EnqueueRequest::new(
                priority,
                JobPayload::update(extension_id, UpdateSource::Manual),
            ))
            .await
    }

    pub async fn schedule_discovery(
        &self,
        strategy: DiscoveryStrategy,
        priority: JobPriority,
    ) -> Result<JobHandle> {
        self.queue
            .enqueue(EnqueueRequest::new(priority, JobPayload::discovery(strategy)))
            .await
    }

    /// Queue refreshes for many extensions at once. Duplicate ids in the
    /// batch merge into a single job.
    pub async fn schedule_bulk_updates(
        &self,
        extension_ids: Vec<ExtensionId>,
        priority: JobPriority,
    ) -> Result<Vec<JobHandle>> {
        if extension_ids.is_empty() {
            return Err(CollectorError::InvalidJob(
                "bulk update requires at least one extension".into(),
            ));
        }
        let requests = extension_ids
            .into_iter()
            .map(|id| {
                EnqueueRequest::new(priority, JobPayload::update(id, UpdateSource::Manual))
            })
            .collect();
        let handles = self.queue.enqueue_many(requests).await?;
        info!(
            jobs = handles.len(),
            accepted = handles.iter().filter(|h| h.accepted).count(),
            priority = %priority,
            "bulk updates scheduled"
        );
        Ok(handles)
    }

    pub async fn queue_stats(&self) -> Result<HashMap<JobKind, usize>> {
        self.queue.queue_stats().await
    }

    pub async fn completed_stats(&self, recent: usize) -> Result<CompletedJobsStats> {
        self.queue.completed_stats(recent).await
    }

    pub fn proxy_stats(&self) -> ProxyPoolStats {
        self.executor.proxies().stats()
    }

    pub fn scrape_metrics(&self) -> ScrapeMetrics {
        self.executor.metrics()
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<JobRecord> {
        self.queue.get_job(job_id).await
    }

    /// Run housekeeping now, independent of the scheduler cadence.
    pub async fn trigger_cleanup(&self) -> Result<CleanupReport> {
        self.scheduler.housekeeping().await
    }
}

/// Assembles an [`AutomationContext`]. Queue and store are required; the
/// fetcher defaults to [`HttpFetcher`] and the parser to [`MetaTagParser`].
pub struct AutomationContextBuilder {
    config: CollectorConfig,
    queue: Option<Arc<dyn JobQueue>>,
    store: Option<Arc<dyn ExtensionStore>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    parser: Option<Arc<dyn ExtensionPageParser>>,
    proxies: Vec<ProxyConfig>,
}

impl fmt::Debug for AutomationContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutomationContextBuilder")
            .field("config", &self.config)
            .field("queue_set", &self.queue.is_some())
            .field("store_set", &self.store.is_some())
            .field("fetcher_set", &self.fetcher.is_some())
            .field("parser_set", &self.parser.is_some())
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

impl AutomationContextBuilder {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            queue: None,
            store: None,
            fetcher: None,
            parser: None,
            proxies: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ExtensionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ExtensionPageParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<ProxyConfig>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn build(self) -> Result<AutomationContext> {
        let config = self.config;
        let queue = self
            .queue
            .ok_or_else(|| CollectorError::Internal("queue dependency missing".into()))?;
        let store = self
            .store
            .ok_or_else(|| CollectorError::Internal("store dependency missing".into()))?;
        let fetcher: Arc<dyn PageFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(config.scraper.clone()).map_err(|e| {
                CollectorError::Internal(format!("failed to build http client: {e}"))
            })?),
        };
        let parser = self.parser.unwrap_or_else(|| Arc::new(MetaTagParser));

        let proxies = Arc::new(ProxyPool::new(self.proxies, config.proxy.clone()));
        let executor = Arc::new(ScrapeExecutor::new(
            config.scraper.clone(),
            Arc::clone(&fetcher),
            parser,
            proxies,
        )?);

        let settings = HandlerSettings::from_config(&config);
        let handlers = JobHandlers::new(
            Arc::new(DiscoveryHandler::new(
                Arc::clone(&executor),
                Arc::clone(&store),
                Arc::clone(&queue),
                settings.clone(),
            )),
            Arc::new(UpdateHandler::new(
                Arc::clone(&executor),
                Arc::clone(&store),
                settings,
            )),
        );

        let workers = WorkerPool::new(
            config.workers.clone(),
            config.queue.lease.lease_ttl(),
            Arc::clone(&queue),
        );
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            &config.queue,
            Arc::clone(&queue),
            Arc::clone(&store),
        ));

        Ok(AutomationContext {
            config,
            queue,
            store,
            fetcher,
            executor,
            handlers,
            workers,
            scheduler,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::memory::InMemoryJobQueue;
    use crate::store::InMemoryExtensionStore;

    fn context() -> AutomationContext {
        let config = CollectorConfig::default();
        AutomationContext::builder(config.clone())
            .with_queue(Arc::new(InMemoryJobQueue::new(config.queue.clone())))
            .with_store(Arc::new(InMemoryExtensionStore::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_queue_and_store() {
        let err = AutomationContext::builder(CollectorConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, CollectorError::Internal(_)));
    }

    #[tokio::test]
    async fn manual_updates_merge_by_extension() {
        let ctx = context();
        let id = ExtensionId::new("aapbdbdomjkkjkaonfhkkikfgjllcleb").unwrap();

        let first = ctx.schedule_update(id.clone(), JobPriority::Low).await.unwrap();
        let second = ctx.schedule_update(id, JobPriority::High).await.unwrap();
        assert!(first.accepted);
        assert_eq!(second.merged_into, Some(first.job_id));

        let job = ctx.get_job(first.job_id).await.unwrap();
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(ctx.queue_stats().await.unwrap()[&JobKind::Update], 1);
    }

    #[tokio::test]
    async fn bulk_updates_reject_empty_batches() {
        let ctx = context();
        assert!(matches!(
            ctx.schedule_bulk_updates(Vec::new(), JobPriority::Medium).await,
            Err(CollectorError::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn blank_discovery_keyword_is_rejected() {
        let ctx = context();
        let err = ctx
            .schedule_discovery(
                DiscoveryStrategy::Search {
                    keyword: " ".into(),
                    page: 1,
                },
                JobPriority::Low,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn status_reports_direct_mode_without_proxies() {
        let ctx = context();
        let status = ctx.status().await.unwrap();
        assert!(!status.running);
        assert!(!status.proxies.enabled);
        assert_eq!(status.scrape.total_requests, 0);
    }
}
