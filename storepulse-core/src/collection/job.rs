use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{CollectorError, Result};
use crate::types::ExtensionId;

/// Unique identifier for collection jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(JobId).map_err(|e| {
            CollectorError::InvalidJob(format!("malformed job id {s}: {e}"))
        })
    }
}

/// Token minted for each claim. Reports against a job must present the
/// token of the claim they finish.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority tiers. The discriminant doubles as the storage value; lower sorts
/// first.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobPriority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl JobPriority {
    /// Numeric weight; larger means more urgent.
    pub fn weight(&self) -> u8 {
        match self {
            JobPriority::High => 3,
            JobPriority::Medium => 2,
            JobPriority::Low => 1,
        }
    }

    pub fn elevate(self, target: JobPriority) -> JobPriority {
        if target < self { target } else { self }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(JobPriority::High),
            1 => Ok(JobPriority::Medium),
            2 => Ok(JobPriority::Low),
            other => Err(CollectorError::Internal(format!(
                "unknown priority value {other}"
            ))),
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::High => write!(f, "high"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for JobPriority {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "medium" => Ok(JobPriority::Medium),
            "low" => Ok(JobPriority::Low),
            other => Err(CollectorError::InvalidJob(format!(
                "unknown priority {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    /// Terminal: the retry budget is exhausted or the failure was permanent.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CollectorError::Internal(format!(
                "unknown job status {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }
}

/// The two work queues.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobKind {
    Discovery = 0,
    Update = 1,
}

impl JobKind {
    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(JobKind::Discovery),
            1 => Ok(JobKind::Update),
            other => Err(CollectorError::Internal(format!(
                "unknown job kind value {other}"
            ))),
        }
    }

    pub fn all_kinds() -> &'static [Self] {
        &[JobKind::Discovery, JobKind::Update]
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Discovery => write!(f, "discovery"),
            JobKind::Update => write!(f, "update"),
        }
    }
}

/// How a discovery job looks for unknown extensions.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "discovery_type", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    Category { category: String, page: u32 },
    Search { keyword: String, page: u32 },
    Related { extension_id: ExtensionId },
    Popular { page: u32 },
}

impl DiscoveryStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            DiscoveryStrategy::Category { .. } => "category",
            DiscoveryStrategy::Search { .. } => "search",
            DiscoveryStrategy::Related { .. } => "related",
            DiscoveryStrategy::Popular { .. } => "popular",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryJob {
    pub strategy: DiscoveryStrategy,
}

/// Who asked for an update.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Scheduler,
    Manual,
    Discovery,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateJob {
    pub extension_id: ExtensionId,
    pub source: UpdateSource,
}

/// Structured payload per job kind.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    Discovery(DiscoveryJob),
    Update(UpdateJob),
}

impl JobPayload {
    pub fn update(extension_id: ExtensionId, source: UpdateSource) -> Self {
        JobPayload::Update(UpdateJob {
            extension_id,
            source,
        })
    }

    pub fn discovery(strategy: DiscoveryStrategy) -> Self {
        JobPayload::Discovery(DiscoveryJob { strategy })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Discovery(_) => JobKind::Discovery,
            JobPayload::Update(_) => JobKind::Update,
        }
    }

    /// A structural dedupe key extracted from payload content. Two payloads
    /// with the same key describe the same unit of work.
    pub fn dedupe_key(&self) -> DedupeKey {
        match self {
            JobPayload::Update(job) => DedupeKey::Update {
                extension_id: job.extension_id.clone(),
            },
            JobPayload::Discovery(job) => DedupeKey::Discovery {
                strategy: job.strategy.clone(),
            },
        }
    }
}

/// Domain view over dedupe identity per job kind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DedupeKey {
    Update { extension_id: ExtensionId },
    Discovery { strategy: DiscoveryStrategy },
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupeKey::Update { extension_id } => {
                write!(f, "update:{extension_id}")
            }
            DedupeKey::Discovery { strategy } => match strategy {
                DiscoveryStrategy::Category { category, page } => {
                    write!(f, "discovery:category:{category}:{page}")
                }
                DiscoveryStrategy::Search { keyword, page } => write!(
                    f,
                    "discovery:search:{}:{page}",
                    keyword.trim().to_lowercase()
                ),
                DiscoveryStrategy::Related { extension_id } => {
                    write!(f, "discovery:related:{extension_id}")
                }
                DiscoveryStrategy::Popular { page } => {
                    write!(f, "discovery:popular:{page}")
                }
            },
        }
    }
}

/// Envelope stored in persistence for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest instant the job may be dequeued; pushed out by backoff.
    pub available_at: DateTime<Utc>,
    /// Present while in progress; identifies the current claim.
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dedupe_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(payload: JobPayload, priority: JobPriority) -> Self {
        let now = Utc::now();
        let dedupe_key = payload.dedupe_key().to_string();
        Self {
            id: JobId::new(),
            payload,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            available_at: now,
            lease_id: None,
            lease_owner: None,
            lease_expires_at: None,
            dedupe_key,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// The terminal failure carried by this record, if it has one.
    pub fn terminal_failure(&self) -> Option<CollectorError> {
        (self.status == JobStatus::Failed).then(|| {
            CollectorError::JobTerminalFailure {
                job_id: self.id,
                error: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".into()),
            }
        })
    }
}

/// Lightweight summary returned to callers after enqueue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub kind: JobKind,
    pub dedupe_key: String,
    pub priority: JobPriority,
    pub accepted: bool,
    pub merged_into: Option<JobId>,
}

impl JobHandle {
    pub fn accepted(
        job_id: JobId,
        payload: &JobPayload,
        priority: JobPriority,
    ) -> Self {
        Self {
            job_id,
            kind: payload.kind(),
            dedupe_key: payload.dedupe_key().to_string(),
            priority,
            accepted: true,
            merged_into: None,
        }
    }

    pub fn merged(
        existing: JobId,
        payload: &JobPayload,
        priority: JobPriority,
    ) -> Self {
        Self {
            job_id: existing,
            kind: payload.kind(),
            dedupe_key: payload.dedupe_key().to_string(),
            priority,
            accepted: false,
            merged_into: Some(existing),
        }
    }
}

/// High-level enqueue request used by upstream producers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub priority: JobPriority,
    pub payload: JobPayload,
    /// Merge into an active job with the same dedupe key instead of inserting.
    pub allow_merge: bool,
    pub requested_at: DateTime<Utc>,
}

impl EnqueueRequest {
    pub fn new(priority: JobPriority, payload: JobPayload) -> Self {
        Self {
            priority,
            payload,
            allow_merge: true,
            requested_at: Utc::now(),
        }
    }

    pub fn without_merge(mut self) -> Self {
        self.allow_merge = false;
        self
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        self.payload.dedupe_key()
    }

    pub fn validate(&self) -> Result<()> {
        match &self.payload {
            JobPayload::Discovery(job) => match &job.strategy {
                DiscoveryStrategy::Category { category, .. }
                    if category.trim().is_empty() =>
                {
                    Err(CollectorError::InvalidJob(
                        "category discovery requires a category".into(),
                    ))
                }
                DiscoveryStrategy::Search { keyword, .. }
                    if keyword.trim().is_empty() =>
                {
                    Err(CollectorError::InvalidJob(
                        "search discovery requires a keyword".into(),
                    ))
                }
                _ => Ok(()),
            },
            JobPayload::Update(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::new(id).unwrap()
    }

    #[test]
    fn priority_orders_high_first() {
        let mut tiers =
            vec![JobPriority::Low, JobPriority::High, JobPriority::Medium];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![JobPriority::High, JobPriority::Medium, JobPriority::Low]
        );
        assert!(JobPriority::High.weight() > JobPriority::Low.weight());
        assert_eq!(
            JobPriority::Low.elevate(JobPriority::High),
            JobPriority::High
        );
        assert_eq!(
            JobPriority::High.elevate(JobPriority::Low),
            JobPriority::High
        );
    }

    #[test]
    fn update_dedupe_key_ignores_source() {
        let a = JobPayload::update(ext("abc"), UpdateSource::Manual);
        let b = JobPayload::update(ext("abc"), UpdateSource::Scheduler);
        assert_eq!(a.dedupe_key().to_string(), b.dedupe_key().to_string());
        assert_eq!(a.dedupe_key().to_string(), "update:abc");
    }

    #[test]
    fn search_dedupe_key_is_case_insensitive() {
        let a = JobPayload::discovery(DiscoveryStrategy::Search {
            keyword: "Ad Blocker".into(),
            page: 1,
        });
        let b = JobPayload::discovery(DiscoveryStrategy::Search {
            keyword: "ad blocker ".into(),
            page: 1,
        });
        assert_eq!(a.dedupe_key().to_string(), b.dedupe_key().to_string());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = JobPayload::discovery(DiscoveryStrategy::Popular { page: 2 });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "discovery");
        assert_eq!(json["payload"]["strategy"]["discovery_type"], "popular");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn blank_search_keyword_is_rejected() {
        let req = EnqueueRequest::new(
            JobPriority::Low,
            JobPayload::discovery(DiscoveryStrategy::Search {
                keyword: "  ".into(),
                page: 1,
            }),
        );
        assert!(matches!(req.validate(), Err(CollectorError::InvalidJob(_))));
    }

    #[test]
    fn failed_record_exposes_terminal_failure() {
        let mut record = JobRecord::new(
            JobPayload::update(ext("abc"), UpdateSource::Manual),
            JobPriority::High,
        );
        assert!(record.terminal_failure().is_none());

        record.status = JobStatus::Failed;
        record.last_error = Some("gone".into());
        assert!(matches!(
            record.terminal_failure(),
            Some(CollectorError::JobTerminalFailure { .. })
        ));
    }
}
