use thiserror::Error;

use crate::collection::job::JobId;

#[derive(Error, Debug)]
pub enum CollectorError {
    /// The job queue backing store could not be reached.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The extension datastore could not be reached or rejected a write.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The caller's claim on the job expired and was reclaimed, or the job
    /// was never claimed under that lease.
    #[error("Lease lost for job {job_id}")]
    LeaseLost { job_id: JobId },

    #[error("No healthy proxy available")]
    NoHealthyProxy,

    #[error("Job {job_id} exhausted its retry budget: {error}")]
    JobTerminalFailure { job_id: JobId, error: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CollectorError {
    /// Whether the error reflects lost connectivity to infrastructure rather
    /// than a problem with the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CollectorError::QueueUnavailable(_))
    }
}

/// Classify a sqlx error raised by the job queue. Connectivity failures map to
/// [`CollectorError::QueueUnavailable`]; everything else is internal.
#[cfg(feature = "database")]
pub(crate) fn queue_error(context: &str, err: sqlx::Error) -> CollectorError {
    if is_connectivity_error(&err) {
        CollectorError::QueueUnavailable(format!("{context}: {err}"))
    } else {
        CollectorError::Internal(format!("{context}: {err}"))
    }
}

#[cfg(feature = "database")]
pub(crate) fn store_error(context: &str, err: sqlx::Error) -> CollectorError {
    CollectorError::Store(format!("{context}: {err}"))
}

#[cfg(feature = "database")]
fn is_connectivity_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(all(test, feature = "database"))]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_reported_as_unavailable() {
        let err = queue_error("dequeue", sqlx::Error::PoolTimedOut);
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("dequeue"));
    }

    #[test]
    fn missing_rows_are_not_connectivity_failures() {
        let err = queue_error("get job", sqlx::Error::RowNotFound);
        assert!(!err.is_unavailable());
    }
}
