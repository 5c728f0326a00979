//! Per-kind worker tasks that drain the job queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::config::WorkerPoolConfig;
use super::handlers::{JobHandler, JobHandlers};
use super::job::{JobKind, JobRecord};
use super::queue::{DequeueRequest, FailOutcome, JobQueue};
use crate::error::Result;

#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkerPoolStats {
    pub running: bool,
    pub total_workers: usize,
    pub workers_by_kind: HashMap<JobKind, usize>,
    /// Pending jobs per kind.
    pub queue_stats: HashMap<JobKind, usize>,
}

struct WorkerHandle {
    kind: JobKind,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct PoolRuntime {
    shutdown: Option<CancellationToken>,
    workers: Vec<WorkerHandle>,
}

/// Spawns `discovery_workers` and `update_workers` tasks that each loop over
/// dequeue, handle and report until stopped.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    lease_ttl: chrono::Duration,
    queue: Arc<dyn JobQueue>,
    runtime: Mutex<PoolRuntime>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .runtime
            .try_lock()
            .map(|rt| rt.workers.len())
            .unwrap_or_default();
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("lease_ttl", &self.lease_ttl)
            .field("worker_count", &worker_count)
            .finish_non_exhaustive()
    }
}

/// Everything one worker task owns.
struct WorkerLoop {
    worker_id: String,
    kind: JobKind,
    lease_ttl: chrono::Duration,
    poll_interval: Duration,
    poll_jitter_ms: u64,
    error_backoff: Duration,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        lease_ttl: chrono::Duration,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            config,
            lease_ttl,
            queue,
            runtime: Mutex::new(PoolRuntime::default()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.shutdown.is_some()
    }

    /// Spawn the configured workers. Calling this on a running pool is a
    /// no-op.
    pub async fn start(&self, handlers: JobHandlers) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.shutdown.is_some() {
            debug!("worker pool already running");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let group = std::process::id();
        for &kind in JobKind::all_kinds() {
            let count = self.config.workers_for(kind);
            for i in 0..count {
                let worker_id = format!("{kind}-{group}-w{i}");
                let span = info_span!("worker", worker = %worker_id, kind = %kind);
                let worker = WorkerLoop {
                    worker_id,
                    kind,
                    lease_ttl: self.lease_ttl,
                    poll_interval: self.config.poll_interval(),
                    poll_jitter_ms: self.config.poll_jitter_ms,
                    error_backoff: self.config.error_backoff(),
                    queue: Arc::clone(&self.queue),
                    handler: handlers.for_kind(kind),
                    shutdown: shutdown.clone(),
                };
                let task = tokio::spawn(worker.run().instrument(span));
                runtime.workers.push(WorkerHandle { kind, task });
            }
        }
        runtime.shutdown = Some(shutdown);

        info!(
            discovery = self.config.discovery_workers,
            update = self.config.update_workers,
            "worker pool started"
        );
        Ok(())
    }

    /// Signal every worker and wait up to `shutdown_grace` for in-flight jobs
    /// to report. Workers still busy after that are aborted; their leases
    /// expire and housekeeping requeues the jobs.
    pub async fn stop(&self) {
        let (shutdown, workers) = {
            let mut runtime = self.runtime.lock().await;
            let Some(shutdown) = runtime.shutdown.take() else {
                debug!("worker pool already stopped");
                return;
            };
            (shutdown, std::mem::take(&mut runtime.workers))
        };

        info!(workers = workers.len(), "stopping worker pool");
        shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let mut abandoned = 0usize;
        for WorkerHandle { kind, mut task } in workers {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(kind = %kind, error = %err, "worker task failed"),
                Err(_) => {
                    task.abort();
                    abandoned += 1;
                }
            }
        }

        if abandoned > 0 {
            warn!(abandoned, "workers did not finish within the shutdown grace period");
        }
        info!("worker pool stopped");
    }

    pub async fn stats(&self) -> Result<WorkerPoolStats> {
        let (running, workers_by_kind) = {
            let runtime = self.runtime.lock().await;
            let mut by_kind: HashMap<JobKind, usize> = HashMap::new();
            for worker in runtime.workers.iter().filter(|w| !w.task.is_finished()) {
                *by_kind.entry(worker.kind).or_default() += 1;
            }
            (runtime.shutdown.is_some(), by_kind)
        };

        Ok(WorkerPoolStats {
            running,
            total_workers: workers_by_kind.values().sum(),
            workers_by_kind,
            queue_stats: self.queue.queue_stats().await?,
        })
    }
}

impl WorkerLoop {
    async fn run(self) {
        debug!("worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let request =
                DequeueRequest::new(self.kind, self.worker_id.clone(), self.lease_ttl);
            match self.queue.dequeue(request).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {
                    let idle = self.poll_interval + self.poll_jitter();
                    if !self.pause(idle).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "dequeue failed");
                    if !self.pause(self.error_backoff).await {
                        break;
                    }
                }
            }
        }
        debug!("worker stopped");
    }

    /// Sleep unless shutdown fires first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn poll_jitter(&self) -> Duration {
        if self.poll_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=self.poll_jitter_ms))
    }

    async fn execute(&self, job: JobRecord) {
        debug!(job = %job.id, priority = %job.priority, attempt = job.retry_count + 1, "job claimed");
        let Some(lease_id) = job.lease_id else {
            error!(job = %job.id, "claimed job carries no lease; skipping");
            return;
        };

        match self.handler.handle(&job).await {
            Ok(()) => {
                if let Err(err) = self.queue.complete(job.id, lease_id).await {
                    error!(job = %job.id, error = %err, "queue complete error");
                } else {
                    debug!(job = %job.id, "job completed");
                }
            }
            Err(job_err) => {
                match self
                    .queue
                    .fail(job.id, lease_id, job_err.message(), job_err.is_retryable())
                    .await
                {
                    Ok(FailOutcome::Requeued {
                        retry_count,
                        available_at,
                    }) => warn!(
                        job = %job.id,
                        error = %job_err,
                        retry_count,
                        available_at = %available_at,
                        "job failed, requeued"
                    ),
                    Ok(FailOutcome::Terminal { retry_count }) => warn!(
                        job = %job.id,
                        error = %job_err,
                        retry_count,
                        "job failed terminally"
                    ),
                    Err(err) => error!(job = %job.id, error = %err, "queue fail error"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::config::QueueConfig;
    use crate::collection::handlers::JobError;
    use crate::collection::job::{
        DiscoveryStrategy, EnqueueRequest, JobPayload, JobPriority, JobStatus, UpdateSource,
    };
    use crate::collection::memory::InMemoryJobQueue;
    use crate::types::ExtensionId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
        outcome: std::result::Result<(), JobError>,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &JobRecord) -> std::result::Result<(), JobError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn counting(outcome: std::result::Result<(), JobError>) -> Arc<Counting> {
        Arc::new(Counting {
            seen: AtomicUsize::new(0),
            outcome,
        })
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            discovery_workers: 1,
            update_workers: 2,
            poll_interval_ms: 10,
            poll_jitter_ms: 5,
            error_backoff_ms: 10,
            shutdown_grace_secs: 5,
            ..WorkerPoolConfig::default()
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn workers_drain_both_kinds() {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let id = ExtensionId::new("aapbdbdomjkkjkaonfhkkikfgjllcleb").unwrap();
        queue
            .enqueue(EnqueueRequest::new(
                JobPriority::High,
                JobPayload::update(id, UpdateSource::Manual),
            ))
            .await
            .unwrap();
        queue
            .enqueue(EnqueueRequest::new(
                JobPriority::Low,
                JobPayload::discovery(DiscoveryStrategy::Popular { page: 1 }),
            ))
            .await
            .unwrap();

        let discovery = counting(Ok(()));
        let update = counting(Ok(()));
        let pool = WorkerPool::new(fast_config(), chrono::Duration::seconds(30), queue.clone());
        pool.start(JobHandlers::new(discovery.clone(), update.clone()))
            .await
            .unwrap();

        wait_until(|| {
            let queue = queue.clone();
            async move { queue.completed_stats(10).await.unwrap().total_completed == 2 }
        })
        .await;
        pool.stop().await;

        assert_eq!(discovery.seen.load(Ordering::SeqCst), 1);
        assert_eq!(update.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_handler_error_fails_the_job() {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let handle = queue
            .enqueue(EnqueueRequest::new(
                JobPriority::Medium,
                JobPayload::discovery(DiscoveryStrategy::Popular { page: 3 }),
            ))
            .await
            .unwrap();

        let pool = WorkerPool::new(fast_config(), chrono::Duration::seconds(30), queue.clone());
        pool.start(JobHandlers::new(
            counting(Err(JobError::Permanent("listing gone".into()))),
            counting(Ok(())),
        ))
        .await
        .unwrap();

        wait_until(|| {
            let queue = queue.clone();
            async move {
                queue
                    .get_job(handle.job_id)
                    .await
                    .is_ok_and(|job| job.status == JobStatus::Failed)
            }
        })
        .await;
        pool.stop().await;

        let job = queue.get_job(handle.job_id).await.unwrap();
        assert_eq!(job.last_error.as_deref(), Some("listing gone"));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let pool = WorkerPool::new(fast_config(), chrono::Duration::seconds(30), queue);
        let handlers = JobHandlers::new(counting(Ok(())), counting(Ok(())));

        pool.start(handlers.clone()).await.unwrap();
        pool.start(handlers).await.unwrap();
        let stats = pool.stats().await.unwrap();
        assert!(stats.running);
        assert_eq!(stats.total_workers, 3);
        assert_eq!(stats.workers_by_kind[&JobKind::Update], 2);

        pool.stop().await;
        pool.stop().await;
        let stats = pool.stats().await.unwrap();
        assert!(!stats.running);
        assert_eq!(stats.total_workers, 0);
    }
}
