//! Extension datastore seam consumed by handlers and the scheduler.

#[cfg(feature = "database")]
pub mod postgres;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::{ExtensionId, ExtensionRecord, ExtensionUpdateRecord, PriorityClass};

#[cfg(feature = "database")]
pub use postgres::PostgresExtensionStore;

/// Listings plus the per-extension refresh schedule.
#[async_trait]
pub trait ExtensionStore: Send + Sync {
    async fn save_extension(&self, record: &ExtensionRecord) -> Result<()>;

    async fn get_extension(&self, id: &ExtensionId) -> Result<Option<ExtensionRecord>>;

    async fn get_update_record(
        &self,
        id: &ExtensionId,
    ) -> Result<Option<ExtensionUpdateRecord>>;

    async fn upsert_update_record(&self, record: &ExtensionUpdateRecord) -> Result<()>;

    /// Create a schedule entry for a newly seen extension. Returns `false`
    /// when one already exists, leaving it untouched.
    async fn insert_discovered(&self, id: &ExtensionId, now: DateTime<Utc>) -> Result<bool>;

    /// Valid records due at or before `before`, high tier first, then oldest
    /// due date first.
    async fn query_due(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExtensionUpdateRecord>>;

    async fn mark_invalid(&self, id: &ExtensionId) -> Result<()>;

    /// Remove extensions flagged invalid along with their schedule entries.
    async fn delete_invalid_extensions(&self) -> Result<u64>;
}

fn tier_rank(class: PriorityClass) -> u8 {
    match class {
        PriorityClass::High => 0,
        PriorityClass::Medium => 1,
        PriorityClass::Low => 2,
    }
}

#[derive(Default)]
struct StoreState {
    extensions: HashMap<ExtensionId, ExtensionRecord>,
    schedule: HashMap<ExtensionId, ExtensionUpdateRecord>,
}

/// Map-backed store for tests and development runs.
#[derive(Default)]
pub struct InMemoryExtensionStore {
    state: RwLock<StoreState>,
}

impl fmt::Debug for InMemoryExtensionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryExtensionStore").finish_non_exhaustive()
    }
}

impl InMemoryExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn extension_count(&self) -> usize {
        self.state.read().await.extensions.len()
    }

    pub async fn schedule_len(&self) -> usize {
        self.state.read().await.schedule.len()
    }
}

#[async_trait]
impl ExtensionStore for InMemoryExtensionStore {
    async fn save_extension(&self, record: &ExtensionRecord) -> Result<()> {
        self.state
            .write()
            .await
            .extensions
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_extension(&self, id: &ExtensionId) -> Result<Option<ExtensionRecord>> {
        Ok(self.state.read().await.extensions.get(id).cloned())
    }

    async fn get_update_record(
        &self,
        id: &ExtensionId,
    ) -> Result<Option<ExtensionUpdateRecord>> {
        Ok(self.state.read().await.schedule.get(id).cloned())
    }

    async fn upsert_update_record(&self, record: &ExtensionUpdateRecord) -> Result<()> {
        self.state
            .write()
            .await
            .schedule
            .insert(record.extension_id.clone(), record.clone());
        Ok(())
    }

    async fn insert_discovered(&self, id: &ExtensionId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.schedule.contains_key(id) {
            return Ok(false);
        }
        state
            .schedule
            .insert(id.clone(), ExtensionUpdateRecord::discovered(id.clone(), now));
        Ok(true)
    }

    async fn query_due(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExtensionUpdateRecord>> {
        let state = self.state.read().await;
        let mut due: Vec<ExtensionUpdateRecord> = state
            .schedule
            .values()
            .filter(|record| record.is_due(before))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            tier_rank(a.priority_class)
                .cmp(&tier_rank(b.priority_class))
                .then(a.next_update_due.cmp(&b.next_update_due))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_invalid(&self, id: &ExtensionId) -> Result<()> {
        if let Some(record) = self.state.write().await.schedule.get_mut(id) {
            record.invalid = true;
        }
        Ok(())
    }

    async fn delete_invalid_extensions(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let invalid: Vec<ExtensionId> = state
            .schedule
            .values()
            .filter(|record| record.invalid)
            .map(|record| record.extension_id.clone())
            .collect();
        for id in &invalid {
            state.schedule.remove(id);
            state.extensions.remove(id);
        }
        Ok(invalid.len() as u64)
    }
}
