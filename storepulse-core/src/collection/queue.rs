use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, Result};

use super::job::{
    EnqueueRequest, JobHandle, JobId, JobKind, JobPriority, JobRecord, JobStatus,
    LeaseId,
};

/// Request object to claim work from a specific queue.
#[derive(Clone, Debug)]
pub struct DequeueRequest {
    pub kind: JobKind,
    pub worker_id: String,
    pub lease_ttl: chrono::Duration,
}

impl DequeueRequest {
    pub fn new(
        kind: JobKind,
        worker_id: impl Into<String>,
        lease_ttl: chrono::Duration,
    ) -> Self {
        Self {
            kind,
            worker_id: worker_id.into(),
            lease_ttl,
        }
    }
}

/// What `fail` did with the job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailOutcome {
    Requeued {
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    Terminal {
        retry_count: u32,
    },
}

/// Abstracts the job queue backend consumed by workers, the scheduler and the
/// automation facade.
///
/// Every implementation must make `dequeue` an atomic claim: a pending job is
/// handed to at most one caller, and only the highest-priority eligible job of
/// the requested kind is handed out.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    /// Enqueue multiple jobs. Default implementation issues jobs one-by-one.
    /// Implementations backed by a transactional store should override this
    /// to insert all jobs atomically.
    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobHandle>> {
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            out.push(self.enqueue(req).await?);
        }
        Ok(out)
    }

    /// Claim the next eligible job. `Ok(None)` when nothing is ready.
    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobRecord>>;

    /// Finish the claim identified by `lease_id`. A claim that expired and
    /// was reclaimed fails with [`CollectorError::LeaseLost`].
    ///
    /// [`CollectorError::LeaseLost`]: crate::error::CollectorError::LeaseLost
    async fn complete(&self, job_id: JobId, lease_id: LeaseId) -> Result<()>;

    /// Record a failed attempt. Retryable failures under the retry budget are
    /// requeued behind a backoff delay; everything else becomes terminal.
    /// Fenced by `lease_id` like [`JobQueue::complete`].
    async fn fail(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome>;

    async fn get_job(&self, job_id: JobId) -> Result<JobRecord>;

    /// Pending job counts per kind.
    async fn queue_stats(&self) -> Result<HashMap<JobKind, usize>>;

    async fn completed_stats(&self, recent: usize) -> Result<CompletedJobsStats>;

    /// Return jobs whose claim expired (worker crashed or was abandoned) to
    /// pending, or to terminal failure once their retry budget is spent.
    /// Returns the number of jobs touched.
    async fn reclaim_expired_leases(&self) -> Result<u64>;

    /// Forget finished jobs older than `older_than`.
    async fn prune_history(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Check that `record` is in progress and, when `lease` is given, still held
/// under it.
pub(crate) fn ensure_claimed(
    record: &JobRecord,
    lease: Option<LeaseId>,
    action: &str,
) -> Result<()> {
    if let Some(lease) = lease
        && record.lease_id != Some(lease)
    {
        return Err(CollectorError::LeaseLost { job_id: record.id });
    }
    if record.status != JobStatus::InProgress {
        return Err(CollectorError::InvalidJob(format!(
            "job {} is {} and cannot be {action}",
            record.id,
            record.status.as_str()
        )));
    }
    Ok(())
}

/// One finished job as remembered for statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedJobEntry {
    pub job_id: JobId,
    pub kind: JobKind,
    pub priority: JobPriority,
    /// Either `Completed` or `Failed`.
    pub status: JobStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl CompletedJobEntry {
    pub fn from_record(record: &JobRecord, finished_at: DateTime<Utc>) -> Self {
        Self {
            job_id: record.id,
            kind: record.kind(),
            priority: record.priority,
            status: record.status,
            retry_count: record.retry_count,
            error: record.last_error.clone(),
            finished_at,
        }
    }
}

/// Aggregate and recent-window statistics over finished jobs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompletedJobsStats {
    pub total_completed: u64,
    /// Jobs that exhausted their retry budget or failed permanently.
    pub total_failed: u64,
    /// Completed within the last 24 hours.
    pub last_24h: u64,
    /// Completed counts per kind.
    pub by_kind: HashMap<JobKind, u64>,
    /// Most recent finished jobs, newest first.
    pub recent: Vec<CompletedJobEntry>,
}

impl CompletedJobsStats {
    /// Fold a newest-first sequence of entries into statistics.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a CompletedJobEntry>,
        now: DateTime<Utc>,
        recent: usize,
    ) -> Self {
        let window_start = now - chrono::Duration::hours(24);
        let mut stats = CompletedJobsStats::default();

        for entry in entries {
            match entry.status {
                JobStatus::Completed => {
                    stats.total_completed += 1;
                    *stats.by_kind.entry(entry.kind).or_default() += 1;
                    if entry.finished_at >= window_start {
                        stats.last_24h += 1;
                    }
                }
                JobStatus::Failed => stats.total_failed += 1,
                _ => continue,
            }
            if stats.recent.len() < recent {
                stats.recent.push(entry.clone());
            }
        }

        stats
    }
}
