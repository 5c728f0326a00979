//! # storepulse-core
//!
//! Collection engine for Chrome Web Store extension data: a prioritized,
//! deduplicating job queue with retry and backoff, a health-tracked proxy
//! rotation pool, a scrape executor, per-kind worker tasks, a scheduler that
//! turns each extension's popularity tier into a refresh cadence, and the
//! [`AutomationContext`](collection::AutomationContext) that runs them.
//!
//! ## Feature Flags
//!
//! - `database` (default): Postgres-backed job queue and extension store
//!   plus the embedded [`MIGRATOR`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Job queue, proxies, executor, workers, scheduler and automation facade
pub mod collection;

/// Error types and error handling utilities
pub mod error;

/// Extension datastore trait and implementations
pub mod store;

/// Extension identifiers, listings and refresh schedule records
pub mod types;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{CollectorError, Result};
