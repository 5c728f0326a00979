//! Postgres-backed job queue.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Postgres, Transaction};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::backoff::plan_retry;
use super::config::QueueConfig;
use super::job::{
    EnqueueRequest, JobHandle, JobId, JobKind, JobPayload, JobPriority,
    JobRecord, JobStatus, LeaseId,
};
use super::queue::{
    CompletedJobEntry, CompletedJobsStats, DequeueRequest, FailOutcome,
    JobQueue, ensure_claimed,
};
use crate::error::{CollectorError, Result, queue_error};

const JOB_COLUMNS: &str = "id, kind, payload, priority, status, retry_count, \
     last_error, available_at, lease_id, lease_owner, lease_expires_at, \
     dedupe_key, created_at, updated_at, completed_at";

const CLAIMED_COLUMNS: &str = "j.id, j.kind, j.payload, j.priority, j.status, \
     j.retry_count, j.last_error, j.available_at, j.lease_id, j.lease_owner, \
     j.lease_expires_at, j.dedupe_key, j.created_at, j.updated_at, \
     j.completed_at";

/// Durable queue. Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers,
/// in this process or another, never receive the same job.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl fmt::Debug for PostgresJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: i16,
    payload: serde_json::Value,
    priority: i16,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    available_at: DateTime<Utc>,
    lease_id: Option<Uuid>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    dedupe_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CollectorError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload: JobPayload = serde_json::from_value(row.payload)?;
        let kind = JobKind::from_i16(row.kind)?;
        if payload.kind() != kind {
            return Err(CollectorError::Internal(format!(
                "job {} stored as {kind} but carries a {} payload",
                row.id,
                payload.kind()
            )));
        }

        Ok(JobRecord {
            id: JobId(row.id),
            payload,
            priority: JobPriority::from_i16(row.priority)?,
            status: JobStatus::parse(&row.status)?,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
            available_at: row.available_at,
            lease_id: row.lease_id.map(LeaseId),
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            dedupe_key: row.dedupe_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActiveMatch {
    id: Uuid,
    priority: i16,
}

impl PostgresJobQueue {
    /// Connect the queue to `pool` and verify the schema is migrated.
    pub async fn new(pool: PgPool, config: QueueConfig) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| queue_error("queue health check", e))?;

        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_collection_jobs_ready_dequeue")
        .fetch_optional(&pool)
        .await
        .map_err(|e| queue_error("queue schema validation", e))?
        .is_some();

        if !idx_exists {
            return Err(CollectorError::Internal(
                "Required index idx_collection_jobs_ready_dequeue is missing; run migrations"
                    .into(),
            ));
        }

        info!("Job queue connected to Postgres");
        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or merge a single request inside `tx`.
    async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: EnqueueRequest,
    ) -> Result<JobHandle> {
        request.validate()?;
        let dedupe_key = request.dedupe_key().to_string();
        let priority = request.priority as i16;

        if request.allow_merge
            && let Some(existing) = self.find_active(tx, &dedupe_key).await?
        {
            self.elevate(tx, existing.id, existing.priority, priority).await?;
            trace!(job = %existing.id, key = %dedupe_key, "enqueue merged");
            return Ok(JobHandle::merged(
                JobId(existing.id),
                &request.payload,
                request.priority,
            ));
        }

        let job_id = JobId::new();
        let payload_json = serde_json::to_value(&request.payload)?;

        // The partial unique index cannot be named in ON CONFLICT, so a
        // unique violation from a concurrent producer is treated as a merge.
        // The savepoint keeps the surrounding transaction usable.
        let mut savepoint = (&mut **tx)
            .begin()
            .await
            .map_err(|e| queue_error("enqueue savepoint", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO collection_jobs (
                id, kind, payload, priority, status, retry_count,
                available_at, dedupe_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, NOW(), $5, NOW(), NOW())
            "#,
        )
        .bind(job_id.0)
        .bind(request.payload.kind() as i16)
        .bind(&payload_json)
        .bind(priority)
        .bind(&dedupe_key)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| queue_error("enqueue savepoint release", e))?;
                trace!(job = %job_id, key = %dedupe_key, "enqueue accepted");
                Ok(JobHandle::accepted(job_id, &request.payload, request.priority))
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| queue_error("enqueue savepoint rollback", e))?;

                if !request.allow_merge {
                    return Err(CollectorError::InvalidJob(format!(
                        "an active job already exists for {dedupe_key}"
                    )));
                }

                let existing =
                    self.find_active(tx, &dedupe_key).await?.ok_or_else(|| {
                        CollectorError::Internal(format!(
                            "dedupe conflict for {dedupe_key} without an active job"
                        ))
                    })?;
                self.elevate(tx, existing.id, existing.priority, priority).await?;
                Ok(JobHandle::merged(
                    JobId(existing.id),
                    &request.payload,
                    request.priority,
                ))
            }
            Err(e) => Err(queue_error("enqueue insert", e)),
        }
    }

    async fn find_active(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dedupe_key: &str,
    ) -> Result<Option<ActiveMatch>> {
        sqlx::query_as::<_, ActiveMatch>(
            r#"
            SELECT id, priority
            FROM collection_jobs
            WHERE dedupe_key = $1
              AND status IN ('pending', 'in_progress')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(dedupe_key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| queue_error("enqueue dedupe lookup", e))
    }

    /// Raise a pending job to `incoming` if that is more urgent.
    async fn elevate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        current: i16,
        incoming: i16,
    ) -> Result<()> {
        if incoming >= current {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE collection_jobs
            SET priority = $1,
                updated_at = NOW()
            WHERE id = $2 AND status = 'pending'
            "#,
        )
        .bind(incoming)
        .bind(job_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| queue_error("enqueue priority elevation", e))?;
        Ok(())
    }

    /// Apply a failed attempt to a row already locked by `tx`.
    async fn fail_locked(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &JobRecord,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let plan = plan_retry(
            &self.config.retry,
            record.retry_count,
            retryable,
            record.id,
            now,
        );

        let outcome = match plan.requeue_at {
            Some(available_at) => {
                sqlx::query(
                    r#"
                    UPDATE collection_jobs
                    SET status = 'pending',
                        retry_count = $2,
                        last_error = $3,
                        available_at = $4,
                        lease_id = NULL,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = $5
                    WHERE id = $1
                    "#,
                )
                .bind(record.id.0)
                .bind(plan.retry_count as i32)
                .bind(error)
                .bind(available_at)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(|e| queue_error("fail requeue", e))?;

                FailOutcome::Requeued {
                    retry_count: plan.retry_count,
                    available_at,
                }
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE collection_jobs
                    SET status = 'failed',
                        retry_count = $2,
                        last_error = $3,
                        lease_id = NULL,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        completed_at = $4,
                        updated_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(record.id.0)
                .bind(plan.retry_count as i32)
                .bind(error)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(|e| queue_error("fail terminal", e))?;

                FailOutcome::Terminal {
                    retry_count: plan.retry_count,
                }
            }
        };

        Ok(outcome)
    }

    async fn begin(&self, context: &str) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| queue_error(context, e))
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let mut tx = self.begin("begin enqueue tx").await?;
        let handle = self.enqueue_in_tx(&mut tx, request).await?;
        tx.commit()
            .await
            .map_err(|e| queue_error("enqueue commit", e))?;
        Ok(handle)
    }

    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobHandle>> {
        let mut tx = self.begin("begin bulk enqueue tx").await?;
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            handles.push(self.enqueue_in_tx(&mut tx, request).await?);
        }
        tx.commit()
            .await
            .map_err(|e| queue_error("bulk enqueue commit", e))?;
        debug!(count = handles.len(), "bulk enqueue committed");
        Ok(handles)
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobRecord>> {
        let expires_at = Utc::now() + request.lease_ttl;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM collection_jobs
                WHERE kind = $1
                  AND status = 'pending'
                  AND available_at <= NOW()
                ORDER BY priority ASC, available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE collection_jobs j
            SET status = 'in_progress',
                lease_owner = $2,
                lease_expires_at = $3,
                lease_id = $4,
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {CLAIMED_COLUMNS}
            "#
        ))
        .bind(request.kind as i16)
        .bind(&request.worker_id)
        .bind(expires_at)
        .bind(LeaseId::new().0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| queue_error("dequeue claim", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = JobRecord::try_from(row)?;
        debug!(
            job = %record.id,
            kind = %request.kind,
            worker = %request.worker_id,
            "job claimed"
        );
        Ok(Some(record))
    }

    async fn complete(&self, job_id: JobId, lease_id: LeaseId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE collection_jobs
            SET status = 'completed',
                completed_at = NOW(),
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lease_id = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job_id.0)
        .bind(lease_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| queue_error("complete", e))?;

        if result.rows_affected() == 0 {
            let current = self.get_job(job_id).await?;
            ensure_claimed(&current, Some(lease_id), "completed")?;
            return Err(CollectorError::Internal(format!(
                "job {job_id} completion matched no row"
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let mut tx = self.begin("begin fail tx").await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM collection_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| queue_error("fail lookup", e))?
        .ok_or_else(|| CollectorError::NotFound(format!("job {job_id}")))?;

        let record = JobRecord::try_from(row)?;
        ensure_claimed(&record, Some(lease_id), "failed")?;

        let outcome = self.fail_locked(&mut tx, &record, error, retryable).await?;
        tx.commit()
            .await
            .map_err(|e| queue_error("fail commit", e))?;
        Ok(outcome)
    }

    async fn get_job(&self, job_id: JobId) -> Result<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM collection_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| queue_error("get job", e))?
        .ok_or_else(|| CollectorError::NotFound(format!("job {job_id}")))?;

        JobRecord::try_from(row)
    }

    async fn queue_stats(&self) -> Result<HashMap<JobKind, usize>> {
        let rows = sqlx::query_as::<_, (i16, i64)>(
            r#"
            SELECT kind, COUNT(*)::bigint
            FROM collection_jobs
            WHERE status = 'pending'
            GROUP BY kind
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| queue_error("queue stats", e))?;

        let mut counts: HashMap<JobKind, usize> =
            JobKind::all_kinds().iter().map(|kind| (*kind, 0)).collect();
        for (kind, count) in rows {
            counts.insert(JobKind::from_i16(kind)?, count.max(0) as usize);
        }
        Ok(counts)
    }

    async fn completed_stats(&self, recent: usize) -> Result<CompletedJobsStats> {
        let (total_completed, total_failed, last_24h) =
            sqlx::query_as::<_, (i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'completed')::bigint,
                    COUNT(*) FILTER (WHERE status = 'failed')::bigint,
                    COUNT(*) FILTER (
                        WHERE status = 'completed'
                          AND completed_at >= NOW() - INTERVAL '24 hours'
                    )::bigint
                FROM collection_jobs
                WHERE status IN ('completed', 'failed')
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| queue_error("completed stats totals", e))?;

        let by_kind_rows = sqlx::query_as::<_, (i16, i64)>(
            r#"
            SELECT kind, COUNT(*)::bigint
            FROM collection_jobs
            WHERE status = 'completed'
            GROUP BY kind
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| queue_error("completed stats by kind", e))?;

        let mut by_kind = HashMap::new();
        for (kind, count) in by_kind_rows {
            by_kind.insert(JobKind::from_i16(kind)?, count.max(0) as u64);
        }

        let recent_rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM collection_jobs
            WHERE status IN ('completed', 'failed')
            ORDER BY completed_at DESC NULLS LAST
            LIMIT $1
            "#
        ))
        .bind(recent as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| queue_error("completed stats recent", e))?;

        let mut recent_entries = Vec::with_capacity(recent_rows.len());
        for row in recent_rows {
            let record = JobRecord::try_from(row)?;
            let finished_at = record.completed_at.unwrap_or(record.updated_at);
            recent_entries.push(CompletedJobEntry::from_record(&record, finished_at));
        }

        Ok(CompletedJobsStats {
            total_completed: total_completed.max(0) as u64,
            total_failed: total_failed.max(0) as u64,
            last_24h: last_24h.max(0) as u64,
            by_kind,
            recent: recent_entries,
        })
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let mut tx = self.begin("begin lease reclaim tx").await?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM collection_jobs
            WHERE status = 'in_progress'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < NOW()
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| queue_error("lease expiry scan", e))?;

        let mut reclaimed = 0u64;
        for row in rows {
            let record = match JobRecord::try_from(row) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable expired job");
                    continue;
                }
            };
            let outcome = self
                .fail_locked(&mut tx, &record, "lease expired", true)
                .await?;
            warn!(
                job = %record.id,
                owner = ?record.lease_owner,
                ?outcome,
                "reclaimed expired lease"
            );
            reclaimed += 1;
        }

        tx.commit()
            .await
            .map_err(|e| queue_error("lease reclaim commit", e))?;
        Ok(reclaimed)
    }

    async fn prune_history(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM collection_jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| queue_error("prune history", e))?;

        Ok(result.rows_affected())
    }
}
