use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use storepulse_core::collection::executor::{
    FetchError, MetaTagParser, PageFetcher, RawResponse,
};
use storepulse_core::collection::handlers::HandlerSettings;
use storepulse_core::collection::{
    AutomationContext, CollectorConfig, DequeueRequest, DiscoveryHandler, DiscoveryStrategy,
    EnqueueRequest, InMemoryJobQueue, JobHandlers, JobKind, JobPayload, JobPriority, JobQueue,
    JobStatus, ProxyConfig, ProxyPool, ScrapeExecutor, UpdateHandler, UpdateSource, WorkerPool,
};
use storepulse_core::store::{ExtensionStore, InMemoryExtensionStore};
use storepulse_core::types::{ExtensionId, PriorityClass, UpdateFrequency};
use url::Url;

const POPULAR_ID: &str = "aapbdbdomjkkjkaonfhkkikfgjllcleb";
const NICHE_ID: &str = "cjpalhdlnbpafiamejdnhcphjbkeiagm";

/// Serves canned store pages keyed by the last path segment.
struct CannedStore {
    status: u16,
}

fn detail_page(name: &str, users: &str) -> String {
    format!(
        r#"<html><head><meta property="og:title" content="{name} - Chrome Web Store"></head>
        <body><div>{users} users</div></body></html>"#
    )
}

#[async_trait]
impl PageFetcher for CannedStore {
    async fn fetch(
        &self,
        url: &Url,
        _proxy: Option<&ProxyConfig>,
    ) -> Result<RawResponse, FetchError> {
        let body = match url.path_segments().and_then(|mut s| s.next_back()) {
            Some(POPULAR_ID) => detail_page("Popular Helper", "2,000,000"),
            Some(NICHE_ID) => detail_page("Niche Tool", "5,000"),
            _ => String::new(),
        };
        Ok(RawResponse {
            status: self.status,
            url: url.to_string(),
            body,
        })
    }
}

fn fast_config() -> CollectorConfig {
    let mut config = CollectorConfig::default();
    config.workers.discovery_workers = 0;
    config.workers.update_workers = 2;
    config.workers.poll_interval_ms = 10;
    config.workers.poll_jitter_ms = 5;
    config.workers.request_delay_ms = 0;
    config.queue.retry.backoff_base_ms = 10;
    config.queue.retry.backoff_max_ms = 20;
    config.scheduler.discovery_categories.clear();
    config.scheduler.discovery_keywords.clear();
    config
}

fn id(raw: &str) -> ExtensionId {
    ExtensionId::new(raw).unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn two_workers_drain_manual_updates() {
    let config = fast_config();
    let queue = Arc::new(InMemoryJobQueue::new(config.queue.clone()));
    let store = Arc::new(InMemoryExtensionStore::new());
    let ctx = AutomationContext::builder(config)
        .with_queue(queue.clone())
        .with_store(store.clone())
        .with_fetcher(Arc::new(CannedStore { status: 200 }))
        .build()
        .unwrap();

    ctx.schedule_bulk_updates(vec![id(POPULAR_ID), id(NICHE_ID)], JobPriority::High)
        .await
        .unwrap();

    let status = ctx.start().await.unwrap();
    assert!(status.running);
    assert_eq!(status.workers.workers_by_kind[&JobKind::Update], 2);

    eventually(|| {
        let queue = queue.clone();
        async move { queue.completed_stats(10).await.unwrap().total_completed == 2 }
    })
    .await;
    let status = ctx.stop().await.unwrap();
    assert!(!status.running);

    let stats = ctx.completed_stats(10).await.unwrap();
    assert_eq!(stats.total_completed, 2);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(ctx.scrape_metrics().successful_scrapes, 2);

    let popular = store.get_update_record(&id(POPULAR_ID)).await.unwrap().unwrap();
    assert_eq!(popular.priority_class, PriorityClass::High);
    assert_eq!(popular.frequency, UpdateFrequency::Daily);
    let niche = store.get_update_record(&id(NICHE_ID)).await.unwrap().unwrap();
    assert_eq!(niche.priority_class, PriorityClass::Low);
    assert_eq!(niche.frequency, UpdateFrequency::Monthly);

    let saved = store.get_extension(&id(POPULAR_ID)).await.unwrap().unwrap();
    assert_eq!(saved.name, "Popular Helper");
}

#[tokio::test]
async fn one_worker_per_kind_drains_discovery_and_update() {
    let mut config = fast_config();
    config.workers.discovery_workers = 1;
    config.workers.update_workers = 1;
    let queue = Arc::new(InMemoryJobQueue::new(config.queue.clone()));
    let store = Arc::new(InMemoryExtensionStore::new());
    let executor = Arc::new(
        ScrapeExecutor::new(
            config.scraper.clone(),
            Arc::new(CannedStore { status: 200 }),
            Arc::new(MetaTagParser),
            Arc::new(ProxyPool::new(Vec::new(), config.proxy.clone())),
        )
        .unwrap(),
    );
    let settings = HandlerSettings::from_config(&config);
    let handlers = JobHandlers::new(
        Arc::new(DiscoveryHandler::new(
            executor.clone(),
            store.clone(),
            queue.clone(),
            settings.clone(),
        )),
        Arc::new(UpdateHandler::new(executor, store.clone(), settings)),
    );

    queue
        .enqueue(EnqueueRequest::new(
            JobPriority::Medium,
            JobPayload::discovery(DiscoveryStrategy::Popular { page: 1 }),
        ))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new(
            JobPriority::High,
            JobPayload::update(id(POPULAR_ID), UpdateSource::Manual),
        ))
        .await
        .unwrap();

    let pool = WorkerPool::new(
        config.workers.clone(),
        config.queue.lease.lease_ttl(),
        queue.clone(),
    );
    pool.start(handlers).await.unwrap();
    let running = pool.stats().await.unwrap();
    assert_eq!(running.workers_by_kind[&JobKind::Discovery], 1);
    assert_eq!(running.workers_by_kind[&JobKind::Update], 1);

    eventually(|| {
        let queue = queue.clone();
        async move { queue.completed_stats(10).await.unwrap().total_completed == 2 }
    })
    .await;
    pool.stop().await;

    let stats = queue.completed_stats(10).await.unwrap();
    assert_eq!(stats.total_completed, 2);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.by_kind[&JobKind::Discovery], 1);
    assert_eq!(stats.by_kind[&JobKind::Update], 1);
    assert!(store.get_extension(&id(POPULAR_ID)).await.unwrap().is_some());
}

#[tokio::test]
async fn rate_limited_update_fails_after_retry_budget() {
    let mut config = fast_config();
    config.queue.retry.max_retries = 2;
    let queue = Arc::new(InMemoryJobQueue::new(config.queue.clone()));
    let ctx = AutomationContext::builder(config)
        .with_queue(queue.clone())
        .with_store(Arc::new(InMemoryExtensionStore::new()))
        .with_fetcher(Arc::new(CannedStore { status: 429 }))
        .build()
        .unwrap();

    let handle = ctx
        .schedule_update(id(POPULAR_ID), JobPriority::Medium)
        .await
        .unwrap();
    ctx.start().await.unwrap();

    eventually(|| {
        let queue = queue.clone();
        let job_id = handle.job_id;
        async move {
            queue
                .get_job(job_id)
                .await
                .is_ok_and(|job| job.status == JobStatus::Failed)
        }
    })
    .await;
    ctx.stop().await.unwrap();

    let job = ctx.get_job(handle.job_id).await.unwrap();
    assert_eq!(job.retry_count, 2);
    assert!(job.terminal_failure().is_some());
    assert_eq!(ctx.completed_stats(5).await.unwrap().total_failed, 1);
}

#[tokio::test]
async fn dequeue_hands_out_highest_priority_first() {
    let queue = InMemoryJobQueue::default();
    for (raw, priority) in [
        (NICHE_ID, JobPriority::Low),
        (POPULAR_ID, JobPriority::High),
    ] {
        queue
            .enqueue(EnqueueRequest::new(
                priority,
                JobPayload::update(id(raw), UpdateSource::Scheduler),
            ))
            .await
            .unwrap();
    }
    queue
        .enqueue(EnqueueRequest::new(
            JobPriority::Medium,
            JobPayload::discovery(DiscoveryStrategy::Popular { page: 1 }),
        ))
        .await
        .unwrap();

    let lease = chrono::Duration::seconds(30);
    let first = queue
        .dequeue(DequeueRequest::new(JobKind::Update, "w0", lease))
        .await
        .unwrap()
        .unwrap();
    let second = queue
        .dequeue(DequeueRequest::new(JobKind::Update, "w0", lease))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.priority, JobPriority::High);
    assert_eq!(second.priority, JobPriority::Low);
    assert!(
        queue
            .dequeue(DequeueRequest::new(JobKind::Update, "w0", lease))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_never_share_a_job() {
    let queue = Arc::new(InMemoryJobQueue::default());
    for page in 1..=20 {
        queue
            .enqueue(EnqueueRequest::new(
                JobPriority::Medium,
                JobPayload::discovery(DiscoveryStrategy::Popular { page }),
            ))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue
                .dequeue(DequeueRequest::new(
                    JobKind::Discovery,
                    format!("w{worker}"),
                    chrono::Duration::seconds(30),
                ))
                .await
                .unwrap()
            {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for job_id in task.await.unwrap() {
            assert!(seen.insert(job_id), "job {job_id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn rotation_spreads_requests_evenly_across_proxies() {
    let mut config = fast_config();
    config.proxy.probe_interval_secs = 0;
    let proxies: Vec<ProxyConfig> = (1..=3)
        .map(|i| ProxyConfig::new(format!("10.1.0.{i}"), 3128, "user", "pass"))
        .collect();
    let ctx = AutomationContext::builder(config)
        .with_queue(Arc::new(InMemoryJobQueue::default()))
        .with_store(Arc::new(InMemoryExtensionStore::new()))
        .with_fetcher(Arc::new(CannedStore { status: 200 }))
        .with_proxies(proxies)
        .build()
        .unwrap();

    let executor = ctx.executor();
    for _ in 0..9 {
        executor
            .fetch_extension_with_rotation(&id(POPULAR_ID))
            .await
            .unwrap();
    }

    let stats = ctx.proxy_stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.healthy, 3);
    for proxy in stats.per_proxy {
        assert_eq!(proxy.success_count, 3, "uneven use of {}", proxy.endpoint);
    }
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let config = fast_config();
    let ctx = AutomationContext::builder(config.clone())
        .with_queue(Arc::new(InMemoryJobQueue::new(config.queue.clone())))
        .with_store(Arc::new(InMemoryExtensionStore::new()))
        .with_fetcher(Arc::new(CannedStore { status: 200 }))
        .build()
        .unwrap();

    let first = ctx.start().await.unwrap();
    let second = ctx.start().await.unwrap();
    assert!(first.running && second.running);
    assert_eq!(first.started_at, second.started_at);
    assert_eq!(second.workers.total_workers, 2);

    assert!(!ctx.stop().await.unwrap().running);
    let again = ctx.stop().await.unwrap();
    assert!(!again.running);
    assert_eq!(again.workers.total_workers, 0);
}
