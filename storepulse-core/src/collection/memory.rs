//! Process-local job queue used by tests and single-node development runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::backoff::plan_retry;
use super::config::QueueConfig;
use super::job::{
    EnqueueRequest, JobHandle, JobId, JobKind, JobRecord, JobStatus, LeaseId,
};
use super::queue::{
    CompletedJobEntry, CompletedJobsStats, DequeueRequest, FailOutcome,
    JobQueue, ensure_claimed,
};
use crate::error::{CollectorError, Result};

/// Job queue holding every record behind a single async mutex. Each state
/// transition happens entirely under the lock, so a claim can never be handed
/// to two workers.
pub struct InMemoryJobQueue {
    config: QueueConfig,
    inner: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    /// Insertion order for FIFO tie-breaking within a priority tier.
    sequence: HashMap<JobId, u64>,
    next_sequence: u64,
    /// Active (pending or in-progress) job per dedupe key.
    active_keys: HashMap<String, JobId>,
    /// Finished jobs, newest first, bounded by `history_capacity`.
    history: VecDeque<CompletedJobEntry>,
    total_completed: u64,
    total_failed: u64,
    completed_by_kind: HashMap<JobKind, u64>,
}

impl fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueState::default()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of records currently held, finished ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }
}

impl QueueState {
    fn insert_locked(&mut self, request: EnqueueRequest) -> Result<JobHandle> {
        let dedupe_key = request.dedupe_key().to_string();

        if let Some(existing_id) = self.active_keys.get(&dedupe_key).copied()
            && let Some(existing) = self.jobs.get_mut(&existing_id)
        {
            if !request.allow_merge {
                return Err(CollectorError::InvalidJob(format!(
                    "an active job already exists for {dedupe_key}"
                )));
            }
            if existing.status == JobStatus::Pending
                && request.priority < existing.priority
            {
                // A job waiting out its backoff keeps its available_at.
                existing.priority = request.priority;
                existing.updated_at = Utc::now();
            }
            trace!(job = %existing_id, key = %dedupe_key, "enqueue merged");
            return Ok(JobHandle::merged(
                existing_id,
                &request.payload,
                request.priority,
            ));
        }

        let record = JobRecord::new(request.payload, request.priority);
        let handle =
            JobHandle::accepted(record.id, &record.payload, record.priority);

        self.sequence.insert(record.id, self.next_sequence);
        self.next_sequence += 1;
        self.active_keys.insert(dedupe_key, record.id);
        self.jobs.insert(record.id, record);

        Ok(handle)
    }

    fn release_key(&mut self, job_id: JobId, dedupe_key: &str) {
        if self.active_keys.get(dedupe_key) == Some(&job_id) {
            self.active_keys.remove(dedupe_key);
        }
    }

    fn remember(&mut self, entry: CompletedJobEntry, capacity: usize) {
        match entry.status {
            JobStatus::Completed => {
                self.total_completed += 1;
                *self.completed_by_kind.entry(entry.kind).or_default() += 1;
            }
            JobStatus::Failed => self.total_failed += 1,
            _ => {}
        }
        self.history.push_front(entry);
        self.history.truncate(capacity.max(1));
    }

    /// Count a failed attempt against `job_id` and move it back to pending or
    /// to terminal failure. The record must currently be in progress and, when
    /// `lease` is given, held under that lease.
    fn fail_locked(
        &mut self,
        job_id: JobId,
        lease: Option<LeaseId>,
        error: &str,
        retryable: bool,
        config: &QueueConfig,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let record = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CollectorError::NotFound(format!("job {job_id}")))?;
        ensure_claimed(record, lease, "failed")?;

        let plan = plan_retry(&config.retry, record.retry_count, retryable, job_id, now);
        record.retry_count = plan.retry_count;
        record.last_error = Some(error.to_string());
        record.lease_id = None;
        record.lease_owner = None;
        record.lease_expires_at = None;
        record.updated_at = now;

        if let Some(available_at) = plan.requeue_at {
            record.status = JobStatus::Pending;
            record.available_at = available_at;
            return Ok(FailOutcome::Requeued {
                retry_count: plan.retry_count,
                available_at,
            });
        }

        record.status = JobStatus::Failed;
        record.completed_at = Some(now);
        let retry_count = record.retry_count;
        let dedupe_key = record.dedupe_key.clone();
        let entry = CompletedJobEntry::from_record(record, now);

        self.release_key(job_id, &dedupe_key);
        self.remember(entry, config.history_capacity);
        Ok(FailOutcome::Terminal { retry_count })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        request.validate()?;
        let mut state = self.inner.lock().await;
        state.insert_locked(request)
    }

    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobHandle>> {
        for request in &requests {
            request.validate()?;
        }
        let mut state = self.inner.lock().await;
        requests
            .into_iter()
            .map(|request| state.insert_locked(request))
            .collect()
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let mut state = self.inner.lock().await;

        let next = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.kind() == request.kind
                    && job.available_at <= now
            })
            .min_by_key(|job| {
                (
                    job.priority,
                    job.available_at,
                    state.sequence.get(&job.id).copied().unwrap_or(u64::MAX),
                )
            })
            .map(|job| job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.status = JobStatus::InProgress;
        job.lease_id = Some(LeaseId::new());
        job.lease_owner = Some(request.worker_id.clone());
        job.lease_expires_at = Some(now + request.lease_ttl);
        job.updated_at = now;

        debug!(
            job = %job_id,
            kind = %request.kind,
            worker = %request.worker_id,
            "job claimed"
        );
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: JobId, lease_id: LeaseId) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock().await;

        let record = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CollectorError::NotFound(format!("job {job_id}")))?;
        ensure_claimed(record, Some(lease_id), "completed")?;

        record.status = JobStatus::Completed;
        record.completed_at = Some(now);
        record.lease_id = None;
        record.lease_owner = None;
        record.lease_expires_at = None;
        record.updated_at = now;

        let dedupe_key = record.dedupe_key.clone();
        let entry = CompletedJobEntry::from_record(record, now);
        state.release_key(job_id, &dedupe_key);
        state.remember(entry, self.config.history_capacity);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let mut state = self.inner.lock().await;
        state.fail_locked(
            job_id,
            Some(lease_id),
            error,
            retryable,
            &self.config,
            Utc::now(),
        )
    }

    async fn get_job(&self, job_id: JobId) -> Result<JobRecord> {
        self.inner
            .lock()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CollectorError::NotFound(format!("job {job_id}")))
    }

    async fn queue_stats(&self) -> Result<HashMap<JobKind, usize>> {
        let state = self.inner.lock().await;
        let mut counts: HashMap<JobKind, usize> =
            JobKind::all_kinds().iter().map(|kind| (*kind, 0)).collect();
        for job in state.jobs.values() {
            if job.status == JobStatus::Pending {
                *counts.entry(job.kind()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn completed_stats(&self, recent: usize) -> Result<CompletedJobsStats> {
        let state = self.inner.lock().await;
        let window =
            CompletedJobsStats::from_entries(state.history.iter(), Utc::now(), recent);

        Ok(CompletedJobsStats {
            total_completed: state.total_completed,
            total_failed: state.total_failed,
            last_24h: window.last_24h,
            by_kind: state.completed_by_kind.clone(),
            recent: window.recent,
        })
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.inner.lock().await;

        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::InProgress
                    && job.lease_expires_at.is_some_and(|at| at < now)
            })
            .map(|job| job.id)
            .collect();

        let mut reclaimed = 0u64;
        for job_id in expired {
            match state.fail_locked(job_id, None, "lease expired", true, &self.config, now)
            {
                Ok(outcome) => {
                    warn!(job = %job_id, ?outcome, "reclaimed expired lease");
                    reclaimed += 1;
                }
                Err(err) => {
                    warn!(job = %job_id, error = %err, "lease reclaim skipped");
                }
            }
        }
        Ok(reclaimed)
    }

    async fn prune_history(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.inner.lock().await;

        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job.completed_at.is_some_and(|at| at < older_than)
            })
            .map(|job| job.id)
            .collect();

        for job_id in &stale {
            state.jobs.remove(job_id);
            state.sequence.remove(job_id);
        }
        state.history.retain(|entry| entry.finished_at >= older_than);

        Ok(stale.len() as u64)
    }
}
