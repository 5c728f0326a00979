//! Retry delay computation for requeued jobs.
//!
//! `delay(k) = min(base * 2^(k-1), max) + jitter`, where the jitter is a
//! non-negative slice of the anchor derived from the job id and attempt. The
//! anchor is therefore a hard lower bound on how soon a job can run again.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::config::RetryPolicy;
use super::job::JobId;

/// Unjittered delay after the `attempt`-th failure (1-based). Zero attempts
/// means no delay.
pub fn anchor_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp = attempt.saturating_sub(1).min(62) as i32;
    let scaled = (policy.backoff_base_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(policy.backoff_max_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Delay before a job that has failed `attempt` times becomes eligible again.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32, job_id: JobId) -> Duration {
    let anchor = anchor_delay(policy, attempt);
    if anchor.is_zero() {
        return anchor;
    }

    let ratio = f64::from(policy.jitter_ratio.max(0.0));
    let headroom = policy.backoff_max().saturating_sub(anchor);
    let span = anchor.mul_f64(ratio).min(headroom);
    anchor + span.mul_f64(deterministic_unit(job_id, attempt))
}

/// Where a failed attempt leaves a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPlan {
    /// Attempts counted after this failure, capped at `max_retries`.
    pub retry_count: u32,
    /// `Some` when the job goes back to pending; `None` when it is terminal.
    pub requeue_at: Option<DateTime<Utc>>,
}

/// Decide the fate of a job that failed with `retry_count` prior failures.
pub fn plan_retry(
    policy: &RetryPolicy,
    retry_count: u32,
    retryable: bool,
    job_id: JobId,
    now: DateTime<Utc>,
) -> RetryPlan {
    let retry_count = retry_count.saturating_add(1).min(policy.max_retries);
    if !retryable || retry_count >= policy.max_retries {
        return RetryPlan {
            retry_count,
            requeue_at: None,
        };
    }

    let delay = chrono::Duration::from_std(retry_delay(policy, retry_count, job_id))
        .unwrap_or_else(|_| chrono::Duration::zero());
    RetryPlan {
        retry_count,
        requeue_at: Some(now + delay),
    }
}

/// Stable value in `[0, 1]` so retries of the same job spread out without
/// needing shared RNG state.
fn deterministic_unit(job_id: JobId, attempt: u32) -> f64 {
    let mut hasher = DefaultHasher::default();
    job_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}
