//! Needs a reachable `DATABASE_URL`; run with `cargo test -- --ignored`.

use chrono::Utc;
use sqlx::PgPool;
use storepulse_core::CollectorError;
use storepulse_core::collection::{
    DequeueRequest, DiscoveryStrategy, EnqueueRequest, FailOutcome, JobKind, JobPayload,
    JobPriority, JobQueue, JobStatus, PostgresJobQueue, QueueConfig, UpdateSource,
};
use storepulse_core::store::{ExtensionStore, PostgresExtensionStore};
use storepulse_core::types::{ExtensionId, ExtensionRecord, ExtensionUpdateRecord};

const EXT: &str = "aapbdbdomjkkjkaonfhkkikfgjllcleb";

fn update(priority: JobPriority) -> EnqueueRequest {
    EnqueueRequest::new(
        priority,
        JobPayload::update(ExtensionId::new(EXT).unwrap(), UpdateSource::Scheduler),
    )
}

fn lease(worker: &str) -> DequeueRequest {
    DequeueRequest::new(JobKind::Update, worker, chrono::Duration::seconds(30))
}

#[sqlx::test(migrator = "storepulse_core::MIGRATOR")]
#[ignore = "requires postgres"]
async fn duplicate_enqueue_merges_and_elevates(pool: PgPool) {
    let queue = PostgresJobQueue::new(pool, QueueConfig::default())
        .await
        .expect("queue init");

    let first = queue.enqueue(update(JobPriority::Low)).await.unwrap();
    let second = queue.enqueue(update(JobPriority::High)).await.unwrap();

    assert!(first.accepted);
    assert_eq!(second.merged_into, Some(first.job_id));
    let job = queue.get_job(first.job_id).await.unwrap();
    assert_eq!(job.priority, JobPriority::High);

    let err = queue
        .enqueue(update(JobPriority::Medium).without_merge())
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::InvalidJob(_)));
}

#[sqlx::test(migrator = "storepulse_core::MIGRATOR")]
#[ignore = "requires postgres"]
async fn claim_is_exclusive_and_priority_ordered(pool: PgPool) {
    let queue = PostgresJobQueue::new(pool, QueueConfig::default())
        .await
        .expect("queue init");
    queue
        .enqueue(EnqueueRequest::new(
            JobPriority::Low,
            JobPayload::discovery(DiscoveryStrategy::Popular { page: 1 }),
        ))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new(
            JobPriority::High,
            JobPayload::discovery(DiscoveryStrategy::Popular { page: 2 }),
        ))
        .await
        .unwrap();

    let request = |worker: &str| {
        DequeueRequest::new(JobKind::Discovery, worker, chrono::Duration::seconds(30))
    };
    let (a, b) = tokio::join!(queue.dequeue(request("a")), queue.dequeue(request("b")));
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();
    assert_ne!(a.id, b.id);
    assert!(queue.dequeue(request("c")).await.unwrap().is_none());

    let priorities = [a.priority, b.priority];
    assert!(priorities.contains(&JobPriority::High));
    assert!(priorities.contains(&JobPriority::Low));
}

#[sqlx::test(migrator = "storepulse_core::MIGRATOR")]
#[ignore = "requires postgres"]
async fn failures_back_off_then_turn_terminal(pool: PgPool) {
    let mut config = QueueConfig::default();
    config.retry.max_retries = 2;
    config.retry.backoff_base_ms = 0;
    config.retry.backoff_max_ms = 0;
    let queue = PostgresJobQueue::new(pool, config).await.expect("queue init");

    let handle = queue.enqueue(update(JobPriority::Medium)).await.unwrap();

    let job = queue.dequeue(lease("w")).await.unwrap().unwrap();
    let outcome = queue.fail(job.id, job.lease_id.unwrap(), "timeout", true).await.unwrap();
    assert!(matches!(outcome, FailOutcome::Requeued { retry_count: 1, .. }));

    let job = queue.dequeue(lease("w")).await.unwrap().unwrap();
    let outcome = queue.fail(job.id, job.lease_id.unwrap(), "timeout", true).await.unwrap();
    assert_eq!(outcome, FailOutcome::Terminal { retry_count: 2 });

    let stored = queue.get_job(handle.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(queue.completed_stats(5).await.unwrap().total_failed, 1);

    // The dedupe key is free again once the job is terminal.
    assert!(queue.enqueue(update(JobPriority::Low)).await.unwrap().accepted);
}

#[sqlx::test(migrator = "storepulse_core::MIGRATOR")]
#[ignore = "requires postgres"]
async fn expired_leases_are_reclaimed(pool: PgPool) {
    let queue = PostgresJobQueue::new(pool, QueueConfig::default())
        .await
        .expect("queue init");
    let handle = queue.enqueue(update(JobPriority::High)).await.unwrap();
    queue
        .dequeue(DequeueRequest::new(
            JobKind::Update,
            "crashed",
            chrono::Duration::milliseconds(-1),
        ))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(queue.reclaim_expired_leases().await.unwrap(), 1);
    let job = queue.get_job(handle.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
}

#[sqlx::test(migrator = "storepulse_core::MIGRATOR")]
#[ignore = "requires postgres"]
async fn reclaimed_job_rejects_the_previous_holder(pool: PgPool) {
    let mut config = QueueConfig::default();
    config.retry.backoff_base_ms = 0;
    config.retry.backoff_max_ms = 0;
    let queue = PostgresJobQueue::new(pool, config).await.expect("queue init");
    queue.enqueue(update(JobPriority::High)).await.unwrap();

    let stale = queue
        .dequeue(DequeueRequest::new(
            JobKind::Update,
            "worker-a",
            chrono::Duration::milliseconds(-1),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queue.reclaim_expired_leases().await.unwrap(), 1);
    let current = queue.dequeue(lease("worker-b")).await.unwrap().unwrap();
    assert_eq!(current.id, stale.id);

    let err = queue
        .complete(stale.id, stale.lease_id.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::LeaseLost { .. }));
    let err = queue
        .fail(stale.id, stale.lease_id.unwrap(), "late", true)
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::LeaseLost { .. }));

    queue
        .complete(current.id, current.lease_id.unwrap())
        .await
        .unwrap();
    let job = queue.get_job(current.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.lease_id.is_none());
}

#[sqlx::test(migrator = "storepulse_core::MIGRATOR")]
#[ignore = "requires postgres"]
async fn extension_store_round_trips_schedule(pool: PgPool) {
    let store = PostgresExtensionStore::new(pool);
    let id = ExtensionId::new(EXT).unwrap();
    let now = Utc::now();

    assert!(store.insert_discovered(&id, now).await.unwrap());
    assert!(!store.insert_discovered(&id, now).await.unwrap());
    assert_eq!(store.query_due(now, 10).await.unwrap().len(), 1);

    store
        .save_extension(&ExtensionRecord::new(id.clone(), "Helper", 42))
        .await
        .unwrap();
    let mut schedule: ExtensionUpdateRecord =
        store.get_update_record(&id).await.unwrap().unwrap();
    schedule.record_failure();
    schedule.record_not_found();
    store.upsert_update_record(&schedule).await.unwrap();
    let stored = store.get_update_record(&id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 2);
    assert_eq!(stored.consecutive_not_found, 1);

    store.mark_invalid(&id).await.unwrap();
    assert!(store.query_due(now, 10).await.unwrap().is_empty());
    assert_eq!(store.delete_invalid_extensions().await.unwrap(), 1);
    assert!(store.get_extension(&id).await.unwrap().is_none());
}
