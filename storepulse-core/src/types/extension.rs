use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::ExtensionId;
use crate::collection::classification::classify_with_trend;
use crate::collection::config::TrendingPolicy;
use crate::collection::job::JobPriority;

/// Structured listing produced by the page parser and handed to the
/// datastore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub id: ExtensionId,
    pub name: String,
    pub developer: Option<String>,
    pub category: Option<String>,
    pub user_count: u64,
    pub rating: Option<f32>,
    pub review_count: Option<u64>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub version: Option<String>,
    pub last_updated: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl ExtensionRecord {
    /// Minimal record with only the identity and headline numbers filled in.
    pub fn new(id: ExtensionId, name: impl Into<String>, user_count: u64) -> Self {
        Self {
            id,
            name: name.into(),
            developer: None,
            category: None,
            user_count,
            rating: None,
            review_count: None,
            keywords: Vec::new(),
            version: None,
            last_updated: None,
            scraped_at: Utc::now(),
        }
    }
}

/// Scheduling tier of an extension. Drives both the job priority of its
/// refreshes and, through [`UpdateFrequency`], how often they happen.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    High,
    Medium,
    Low,
}

impl PriorityClass {
    pub fn job_priority(&self) -> JobPriority {
        match self {
            PriorityClass::High => JobPriority::High,
            PriorityClass::Medium => JobPriority::Medium,
            PriorityClass::Low => JobPriority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::High => "high",
            PriorityClass::Medium => "medium",
            PriorityClass::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "high" => Some(PriorityClass::High),
            "medium" => Some(PriorityClass::Medium),
            "low" => Some(PriorityClass::Low),
            _ => None,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl UpdateFrequency {
    pub fn interval(&self) -> Duration {
        match self {
            UpdateFrequency::Daily => Duration::days(1),
            UpdateFrequency::Weekly => Duration::days(7),
            UpdateFrequency::Monthly => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateFrequency::Daily => "daily",
            UpdateFrequency::Weekly => "weekly",
            UpdateFrequency::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(UpdateFrequency::Daily),
            "weekly" => Some(UpdateFrequency::Weekly),
            "monthly" => Some(UpdateFrequency::Monthly),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling metadata kept per extension, separate from its analytics data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionUpdateRecord {
    pub extension_id: ExtensionId,
    pub next_update_due: DateTime<Utc>,
    pub frequency: UpdateFrequency,
    pub priority_class: PriorityClass,
    pub consecutive_failures: u32,
    /// Back-to-back "not found" answers. Any other outcome resets it.
    #[serde(default)]
    pub consecutive_not_found: u32,
    pub last_successful_update: Option<DateTime<Utc>>,
    /// User count seen on the previous successful scrape; feeds trending
    /// detection.
    pub last_user_count: Option<u64>,
    /// Set once the listing is confirmed gone; cleared by cleanup.
    #[serde(default)]
    pub invalid: bool,
}

impl ExtensionUpdateRecord {
    /// Record for a freshly discovered extension: due immediately, lowest tier
    /// until its first scrape reveals a user count.
    pub fn discovered(extension_id: ExtensionId, now: DateTime<Utc>) -> Self {
        Self {
            extension_id,
            next_update_due: now,
            frequency: UpdateFrequency::Monthly,
            priority_class: PriorityClass::Low,
            consecutive_failures: 0,
            consecutive_not_found: 0,
            last_successful_update: None,
            last_user_count: None,
            invalid: false,
        }
    }

    /// Apply a successful scrape: reclassify, reset the failure streak, and
    /// push the due date forward. The due date never moves backwards.
    pub fn record_success(
        &mut self,
        user_count: u64,
        trending: &TrendingPolicy,
        now: DateTime<Utc>,
    ) {
        let (priority_class, frequency) =
            classify_with_trend(user_count, self.last_user_count, trending);
        let anchor = self.next_update_due.max(now);

        self.priority_class = priority_class;
        self.frequency = frequency;
        self.next_update_due = anchor + frequency.interval();
        self.consecutive_failures = 0;
        self.consecutive_not_found = 0;
        self.last_successful_update = Some(now);
        self.last_user_count = Some(user_count);
    }

    /// Any failure other than a missing listing.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_not_found = 0;
    }

    /// The web store answered that the listing does not exist.
    pub fn record_not_found(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_not_found = self.consecutive_not_found.saturating_add(1);
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.invalid && self.next_update_due <= now
    }
}
