use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use super::ExtensionStore;
use crate::error::{CollectorError, Result, store_error};
use crate::types::{
    ExtensionId, ExtensionRecord, ExtensionUpdateRecord, PriorityClass,
    UpdateFrequency,
};

const SCHEDULE_COLUMNS: &str = "extension_id, next_update_due, frequency, \
     priority_class, consecutive_failures, consecutive_not_found, \
     last_successful_update, last_user_count, invalid";

/// Extension listings and refresh schedule stored in Postgres.
#[derive(Clone)]
pub struct PostgresExtensionStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresExtensionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresExtensionStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct ExtensionRow {
    id: String,
    name: String,
    developer: Option<String>,
    category: Option<String>,
    user_count: i64,
    rating: Option<f32>,
    review_count: Option<i64>,
    keywords: Vec<String>,
    version: Option<String>,
    last_updated: Option<String>,
    scraped_at: DateTime<Utc>,
}

impl TryFrom<ExtensionRow> for ExtensionRecord {
    type Error = CollectorError;

    fn try_from(row: ExtensionRow) -> Result<Self> {
        Ok(ExtensionRecord {
            id: ExtensionId::new(row.id)?,
            name: row.name,
            developer: row.developer,
            category: row.category,
            user_count: row.user_count.max(0) as u64,
            rating: row.rating,
            review_count: row.review_count.map(|c| c.max(0) as u64),
            keywords: row.keywords,
            version: row.version,
            last_updated: row.last_updated,
            scraped_at: row.scraped_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    extension_id: String,
    next_update_due: DateTime<Utc>,
    frequency: String,
    priority_class: String,
    consecutive_failures: i32,
    consecutive_not_found: i32,
    last_successful_update: Option<DateTime<Utc>>,
    last_user_count: Option<i64>,
    invalid: bool,
}

impl TryFrom<ScheduleRow> for ExtensionUpdateRecord {
    type Error = CollectorError;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        let frequency = UpdateFrequency::parse(&row.frequency).ok_or_else(|| {
            CollectorError::Store(format!("unknown update frequency {}", row.frequency))
        })?;
        let priority_class =
            PriorityClass::parse(&row.priority_class).ok_or_else(|| {
                CollectorError::Store(format!(
                    "unknown priority class {}",
                    row.priority_class
                ))
            })?;

        Ok(ExtensionUpdateRecord {
            extension_id: ExtensionId::new(row.extension_id)?,
            next_update_due: row.next_update_due,
            frequency,
            priority_class,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            consecutive_not_found: row.consecutive_not_found.max(0) as u32,
            last_successful_update: row.last_successful_update,
            last_user_count: row.last_user_count.map(|c| c.max(0) as u64),
            invalid: row.invalid,
        })
    }
}

impl PostgresExtensionStore {
    pub fn new(pool: PgPool) -> Self {
        info!("Extension store connected to Postgres");
        Self { pool }
    }
}

#[async_trait]
impl ExtensionStore for PostgresExtensionStore {
    async fn save_extension(&self, record: &ExtensionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extensions (
                id, name, developer, category, user_count, rating,
                review_count, keywords, version, last_updated, scraped_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                developer = EXCLUDED.developer,
                category = EXCLUDED.category,
                user_count = EXCLUDED.user_count,
                rating = EXCLUDED.rating,
                review_count = EXCLUDED.review_count,
                keywords = EXCLUDED.keywords,
                version = EXCLUDED.version,
                last_updated = EXCLUDED.last_updated,
                scraped_at = EXCLUDED.scraped_at
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.name)
        .bind(&record.developer)
        .bind(&record.category)
        .bind(record.user_count.min(i64::MAX as u64) as i64)
        .bind(record.rating)
        .bind(record.review_count.map(|c| c.min(i64::MAX as u64) as i64))
        .bind(&record.keywords)
        .bind(&record.version)
        .bind(&record.last_updated)
        .bind(record.scraped_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("save extension", e))?;
        Ok(())
    }

    async fn get_extension(&self, id: &ExtensionId) -> Result<Option<ExtensionRecord>> {
        sqlx::query_as::<_, ExtensionRow>(
            r#"
            SELECT id, name, developer, category, user_count, rating,
                   review_count, keywords, version, last_updated, scraped_at
            FROM extensions
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("get extension", e))?
        .map(ExtensionRecord::try_from)
        .transpose()
    }

    async fn get_update_record(
        &self,
        id: &ExtensionId,
    ) -> Result<Option<ExtensionUpdateRecord>> {
        sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM extension_update_records WHERE extension_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("get update record", e))?
        .map(ExtensionUpdateRecord::try_from)
        .transpose()
    }

    async fn upsert_update_record(&self, record: &ExtensionUpdateRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extension_update_records (
                extension_id, next_update_due, frequency, priority_class,
                consecutive_failures, consecutive_not_found,
                last_successful_update, last_user_count, invalid
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (extension_id) DO UPDATE SET
                next_update_due = EXCLUDED.next_update_due,
                frequency = EXCLUDED.frequency,
                priority_class = EXCLUDED.priority_class,
                consecutive_failures = EXCLUDED.consecutive_failures,
                consecutive_not_found = EXCLUDED.consecutive_not_found,
                last_successful_update = EXCLUDED.last_successful_update,
                last_user_count = EXCLUDED.last_user_count,
                invalid = EXCLUDED.invalid
            "#,
        )
        .bind(record.extension_id.as_str())
        .bind(record.next_update_due)
        .bind(record.frequency.as_str())
        .bind(record.priority_class.as_str())
        .bind(record.consecutive_failures.min(i32::MAX as u32) as i32)
        .bind(record.consecutive_not_found.min(i32::MAX as u32) as i32)
        .bind(record.last_successful_update)
        .bind(record.last_user_count.map(|c| c.min(i64::MAX as u64) as i64))
        .bind(record.invalid)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("upsert update record", e))?;
        Ok(())
    }

    async fn insert_discovered(&self, id: &ExtensionId, now: DateTime<Utc>) -> Result<bool> {
        let record = ExtensionUpdateRecord::discovered(id.clone(), now);
        let result = sqlx::query(
            r#"
            INSERT INTO extension_update_records (
                extension_id, next_update_due, frequency, priority_class,
                consecutive_failures, invalid
            )
            VALUES ($1, $2, $3, $4, 0, FALSE)
            ON CONFLICT (extension_id) DO NOTHING
            "#,
        )
        .bind(record.extension_id.as_str())
        .bind(record.next_update_due)
        .bind(record.frequency.as_str())
        .bind(record.priority_class.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("insert discovered extension", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn query_due(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExtensionUpdateRecord>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM extension_update_records
            WHERE invalid = FALSE
              AND next_update_due <= $1
            ORDER BY
                CASE priority_class WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                next_update_due ASC
            LIMIT $2
            "#
        ))
        .bind(before)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("query due extensions", e))?;

        rows.into_iter().map(ExtensionUpdateRecord::try_from).collect()
    }

    async fn mark_invalid(&self, id: &ExtensionId) -> Result<()> {
        sqlx::query(
            "UPDATE extension_update_records SET invalid = TRUE WHERE extension_id = $1",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("mark extension invalid", e))?;
        Ok(())
    }

    async fn delete_invalid_extensions(&self) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("begin invalid cleanup tx", e))?;

        sqlx::query(
            r#"
            DELETE FROM extensions
            WHERE id IN (
                SELECT extension_id FROM extension_update_records WHERE invalid = TRUE
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| store_error("delete invalid extensions", e))?;

        let removed = sqlx::query("DELETE FROM extension_update_records WHERE invalid = TRUE")
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("delete invalid schedule entries", e))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| store_error("commit invalid cleanup", e))?;
        Ok(removed)
    }
}
