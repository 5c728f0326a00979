//! Per-kind job execution: what a worker does with a claimed job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::{CollectorConfig, TrendingPolicy};
use super::executor::{ScrapeError, ScrapeExecutor};
use super::job::{
    DiscoveryStrategy, EnqueueRequest, JobKind, JobPayload, JobPriority,
    JobRecord, UpdateSource,
};
use super::queue::JobQueue;
use crate::error::CollectorError;
use crate::store::ExtensionStore;
use crate::types::ExtensionUpdateRecord;

/// How a job attempt failed, from the queue's point of view.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Worth another attempt after backoff.
    #[error("{0}")]
    Retryable(String),
    /// Retrying cannot help; the job fails terminally.
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(msg) | JobError::Permanent(msg) => msg,
        }
    }
}

impl From<CollectorError> for JobError {
    fn from(err: CollectorError) -> Self {
        match err {
            CollectorError::QueueUnavailable(_)
            | CollectorError::Store(_)
            | CollectorError::NoHealthyProxy => JobError::Retryable(err.to_string()),
            other => JobError::Permanent(other.to_string()),
        }
    }
}

/// Executes one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError>;
}

/// Handler registry keyed by job kind.
#[derive(Clone)]
pub struct JobHandlers {
    discovery: Arc<dyn JobHandler>,
    update: Arc<dyn JobHandler>,
}

impl fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandlers").finish_non_exhaustive()
    }
}

impl JobHandlers {
    pub fn new(discovery: Arc<dyn JobHandler>, update: Arc<dyn JobHandler>) -> Self {
        Self { discovery, update }
    }

    pub fn for_kind(&self, kind: JobKind) -> Arc<dyn JobHandler> {
        match kind {
            JobKind::Discovery => Arc::clone(&self.discovery),
            JobKind::Update => Arc::clone(&self.update),
        }
    }
}

/// Knobs shared by the scrape handlers.
#[derive(Clone, Debug)]
pub struct HandlerSettings {
    /// Pause after every outbound fetch, whatever its outcome.
    pub request_delay: Duration,
    pub max_new_per_discovery: usize,
    pub not_found_confirmations: u32,
    pub trending: TrendingPolicy,
}

impl HandlerSettings {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            request_delay: config.workers.request_delay(),
            max_new_per_discovery: config.workers.max_new_per_discovery,
            not_found_confirmations: config.workers.not_found_confirmations.max(1),
            trending: config.scheduler.trending,
        }
    }
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from_config(&CollectorConfig::default())
    }
}

async fn politeness_pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn scrape_failure(err: &ScrapeError) -> JobError {
    if err.is_transient() {
        JobError::Retryable(err.to_string())
    } else {
        JobError::Permanent(err.to_string())
    }
}

/// Runs a discovery strategy and turns unknown extensions into update jobs.
pub struct DiscoveryHandler {
    executor: Arc<ScrapeExecutor>,
    store: Arc<dyn ExtensionStore>,
    queue: Arc<dyn JobQueue>,
    settings: HandlerSettings,
}

impl fmt::Debug for DiscoveryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryHandler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DiscoveryHandler {
    pub fn new(
        executor: Arc<ScrapeExecutor>,
        store: Arc<dyn ExtensionStore>,
        queue: Arc<dyn JobQueue>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            executor,
            store,
            queue,
            settings,
        }
    }

    fn follow_up_priority(strategy: &DiscoveryStrategy) -> JobPriority {
        match strategy {
            DiscoveryStrategy::Popular { .. } => JobPriority::High,
            _ => JobPriority::Medium,
        }
    }
}

#[async_trait]
impl JobHandler for DiscoveryHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        let JobPayload::Discovery(discovery) = &job.payload else {
            return Err(JobError::Permanent(format!(
                "discovery handler received a {} job",
                job.kind()
            )));
        };
        let strategy = &discovery.strategy;

        let found = self.executor.discover_with_rotation(strategy).await;
        politeness_pause(self.settings.request_delay).await;
        let found = found.map_err(|err| scrape_failure(&err))?;

        let now = Utc::now();
        let priority = Self::follow_up_priority(strategy);
        let mut requests = Vec::new();
        for id in &found {
            if requests.len() >= self.settings.max_new_per_discovery {
                break;
            }
            if !id.is_store_id() {
                debug!(extension = %id, "ignoring malformed extension id");
                continue;
            }
            if self.store.insert_discovered(id, now).await? {
                requests.push(EnqueueRequest::new(
                    priority,
                    JobPayload::update(id.clone(), UpdateSource::Discovery),
                ));
            }
        }

        let new = requests.len();
        if new > 0 {
            self.queue.enqueue_many(requests).await?;
        }

        info!(
            job = %job.id,
            strategy = strategy.label(),
            found = found.len(),
            new,
            "discovery finished"
        );
        Ok(())
    }
}

/// Refreshes one extension's listing and reschedules it.
pub struct UpdateHandler {
    executor: Arc<ScrapeExecutor>,
    store: Arc<dyn ExtensionStore>,
    settings: HandlerSettings,
}

impl fmt::Debug for UpdateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHandler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl UpdateHandler {
    pub fn new(
        executor: Arc<ScrapeExecutor>,
        store: Arc<dyn ExtensionStore>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            executor,
            store,
            settings,
        }
    }
}

#[async_trait]
impl JobHandler for UpdateHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        let JobPayload::Update(update) = &job.payload else {
            return Err(JobError::Permanent(format!(
                "update handler received a {} job",
                job.kind()
            )));
        };
        let id = &update.extension_id;

        let scraped = self.executor.fetch_extension_with_rotation(id).await;
        politeness_pause(self.settings.request_delay).await;

        let now = Utc::now();
        let mut schedule = self
            .store
            .get_update_record(id)
            .await?
            .unwrap_or_else(|| ExtensionUpdateRecord::discovered(id.clone(), now));

        let record = match scraped {
            Ok(record) => record,
            Err(ScrapeError::NotFound) => {
                schedule.record_not_found();
                self.store.upsert_update_record(&schedule).await?;
                if schedule.consecutive_not_found < self.settings.not_found_confirmations {
                    return Err(JobError::Retryable(ScrapeError::NotFound.to_string()));
                }

                self.store.mark_invalid(id).await?;
                warn!(
                    extension = %id,
                    misses = schedule.consecutive_not_found,
                    "listing confirmed gone, marking invalid"
                );
                return Err(JobError::Permanent(format!(
                    "extension {id} not found after {} consecutive attempts",
                    schedule.consecutive_not_found
                )));
            }
            Err(err) => {
                schedule.record_failure();
                self.store.upsert_update_record(&schedule).await?;
                return Err(scrape_failure(&err));
            }
        };

        self.store.save_extension(&record).await?;
        schedule.record_success(record.user_count, &self.settings.trending, now);
        schedule.invalid = false;
        self.store.upsert_update_record(&schedule).await?;

        debug!(
            job = %job.id,
            extension = %id,
            users = record.user_count,
            tier = %schedule.priority_class,
            next_due = %schedule.next_update_due,
            "extension refreshed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::config::{ProxyPoolConfig, QueueConfig, ScraperConfig};
    use crate::collection::executor::{FetchError, MetaTagParser, PageFetcher, RawResponse};
    use crate::collection::memory::InMemoryJobQueue;
    use crate::collection::proxy::{ProxyConfig, ProxyPool};
    use crate::store::InMemoryExtensionStore;
    use crate::types::{ExtensionId, PriorityClass};
    use url::Url;

    const ID_A: &str = "aapbdbdomjkkjkaonfhkkikfgjllcleb";
    const ID_B: &str = "cjpalhdlnbpafiamejdnhcphjbkeiagm";

    struct FixedPage {
        status: u16,
        body: String,
    }

    #[async_trait]
    impl PageFetcher for FixedPage {
        async fn fetch(
            &self,
            url: &Url,
            _proxy: Option<&ProxyConfig>,
        ) -> Result<RawResponse, FetchError> {
            Ok(RawResponse {
                status: self.status,
                url: url.to_string(),
                body: self.body.clone(),
            })
        }
    }

    /// Replays one status per request, repeating the last one.
    struct StatusSequence {
        statuses: std::sync::Mutex<Vec<u16>>,
    }

    impl StatusSequence {
        fn new(mut statuses: Vec<u16>) -> Self {
            statuses.reverse();
            Self {
                statuses: std::sync::Mutex::new(statuses),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for StatusSequence {
        async fn fetch(
            &self,
            url: &Url,
            _proxy: Option<&ProxyConfig>,
        ) -> Result<RawResponse, FetchError> {
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop().unwrap()
            } else {
                statuses[0]
            };
            Ok(RawResponse {
                status,
                url: url.to_string(),
                body: String::new(),
            })
        }
    }

    fn executor_with(fetcher: Arc<dyn PageFetcher>) -> Arc<ScrapeExecutor> {
        Arc::new(
            ScrapeExecutor::new(
                ScraperConfig::default(),
                fetcher,
                Arc::new(MetaTagParser),
                Arc::new(ProxyPool::new(Vec::new(), ProxyPoolConfig::default())),
            )
            .unwrap(),
        )
    }

    fn executor(status: u16, body: &str) -> Arc<ScrapeExecutor> {
        executor_with(Arc::new(FixedPage {
            status,
            body: body.to_string(),
        }))
    }

    fn settings() -> HandlerSettings {
        HandlerSettings {
            request_delay: Duration::ZERO,
            ..HandlerSettings::default()
        }
    }

    fn update_job(id: &str) -> JobRecord {
        JobRecord::new(
            JobPayload::update(ExtensionId::new(id).unwrap(), UpdateSource::Manual),
            JobPriority::High,
        )
    }

    #[tokio::test]
    async fn update_saves_listing_and_reschedules() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let body = r#"<meta property="og:title" content="Big One"><b>2,000,000 users</b>"#;
        let handler = UpdateHandler::new(executor(200, body), store.clone(), settings());

        handler.handle(&update_job(ID_A)).await.unwrap();

        let id = ExtensionId::new(ID_A).unwrap();
        let saved = store.get_extension(&id).await.unwrap().unwrap();
        assert_eq!(saved.user_count, 2_000_000);
        let schedule = store.get_update_record(&id).await.unwrap().unwrap();
        assert_eq!(schedule.priority_class, PriorityClass::High);
        assert!(schedule.next_update_due > Utc::now());
        assert_eq!(schedule.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn not_found_is_retried_then_confirmed_invalid() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let handler = UpdateHandler::new(executor(404, ""), store.clone(), settings());
        let job = update_job(ID_A);

        for _ in 0..2 {
            let err = handler.handle(&job).await.unwrap_err();
            assert!(err.is_retryable());
        }
        let err = handler.handle(&job).await.unwrap_err();
        assert!(!err.is_retryable());

        let id = ExtensionId::new(ID_A).unwrap();
        let schedule = store.get_update_record(&id).await.unwrap().unwrap();
        assert!(schedule.invalid);
        assert_eq!(schedule.consecutive_failures, 3);
        assert_eq!(schedule.consecutive_not_found, 3);
    }

    #[tokio::test]
    async fn earlier_rate_limits_do_not_confirm_a_missing_listing() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let fetcher = Arc::new(StatusSequence::new(vec![429, 429, 404]));
        let handler = UpdateHandler::new(executor_with(fetcher), store.clone(), settings());
        let job = update_job(ID_A);

        for _ in 0..3 {
            let err = handler.handle(&job).await.unwrap_err();
            assert!(err.is_retryable(), "unexpected terminal failure: {err}");
        }

        let id = ExtensionId::new(ID_A).unwrap();
        let schedule = store.get_update_record(&id).await.unwrap().unwrap();
        assert!(!schedule.invalid);
        assert_eq!(schedule.consecutive_failures, 3);
        assert_eq!(schedule.consecutive_not_found, 1);
        assert_eq!(store.delete_invalid_extensions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unparseable_page_fails_permanently() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let handler = UpdateHandler::new(executor(200, "<html></html>"), store, settings());
        let err = handler.handle(&update_job(ID_A)).await.unwrap_err();
        assert!(matches!(err, JobError::Permanent(_)));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let handler = UpdateHandler::new(executor(429, ""), store, settings());
        let err = handler.handle(&update_job(ID_A)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn discovery_enqueues_only_new_extensions() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let known = ExtensionId::new(ID_B).unwrap();
        store.insert_discovered(&known, Utc::now()).await.unwrap();

        let body = format!(r#"<a href="/detail/a/{ID_A}"></a><a href="/detail/b/{ID_B}"></a>"#);
        let handler =
            DiscoveryHandler::new(executor(200, &body), store.clone(), queue.clone(), settings());
        let job = JobRecord::new(
            JobPayload::discovery(DiscoveryStrategy::Popular { page: 1 }),
            JobPriority::Low,
        );

        handler.handle(&job).await.unwrap();

        let pending = queue.queue_stats().await.unwrap();
        assert_eq!(pending[&JobKind::Update], 1);
        assert_eq!(store.schedule_len().await, 2);
    }

    #[tokio::test]
    async fn discovery_respects_the_per_job_cap() {
        let store = Arc::new(InMemoryExtensionStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let body = format!(r#"<a href="/detail/a/{ID_A}"></a><a href="/detail/b/{ID_B}"></a>"#);
        let handler = DiscoveryHandler::new(
            executor(200, &body),
            store,
            queue.clone(),
            HandlerSettings {
                max_new_per_discovery: 1,
                ..settings()
            },
        );
        let job = JobRecord::new(
            JobPayload::discovery(DiscoveryStrategy::Category {
                category: "productivity/tools".into(),
                page: 1,
            }),
            JobPriority::Low,
        );

        handler.handle(&job).await.unwrap();
        assert_eq!(queue.queue_stats().await.unwrap()[&JobKind::Update], 1);
    }

    #[test]
    fn store_outages_are_retryable() {
        assert!(JobError::from(CollectorError::Store("down".into())).is_retryable());
        assert!(!JobError::from(CollectorError::InvalidJob("bad".into())).is_retryable());
    }
}
