//! Periodic producer: turns the refresh schedule into update jobs, seeds
//! discovery, and runs housekeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::config::{QueueConfig, SchedulerConfig};
use super::job::{
    DiscoveryStrategy, EnqueueRequest, JobKind, JobPayload, JobPriority, UpdateSource,
};
use super::queue::JobQueue;
use crate::error::Result;
use crate::store::ExtensionStore;

/// Outcome of a single scheduling pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Extensions the store reported as due.
    pub due: usize,
    pub enqueued: usize,
    /// Due extensions that already had an active update job.
    pub merged: usize,
    pub failed: usize,
    pub discovery_enqueued: usize,
    pub cleanup: Option<CleanupReport>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub invalid_removed: u64,
    pub leases_reclaimed: u64,
    pub history_pruned: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub queue_stats: HashMap<JobKind, usize>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_discovery: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub cycles: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    last_checked: Option<DateTime<Utc>>,
    last_discovery: Option<DateTime<Utc>>,
    last_cleanup: Option<DateTime<Utc>>,
    cycles: u64,
    discovery_rounds: usize,
}

struct LoopHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    history_retention: chrono::Duration,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ExtensionStore>,
    state: Mutex<SchedulerState>,
    runtime: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .runtime
            .try_lock()
            .map(|rt| rt.is_some())
            .unwrap_or(true);
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("history_retention", &self.history_retention)
            .field("running", &running)
            .finish_non_exhaustive()
    }
}

fn should_run(last: Option<DateTime<Utc>>, every: chrono::Duration, now: DateTime<Utc>) -> bool {
    last.is_none_or(|at| now - at >= every)
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        queue_config: &QueueConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ExtensionStore>,
    ) -> Self {
        Self {
            config,
            history_retention: queue_config.history_retention(),
            queue,
            store,
            state: Mutex::new(SchedulerState::default()),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run cycles every `tick_interval` on a background task. The first
    /// cycle runs immediately. No-op while already running.
    pub async fn start(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("scheduler already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = shutdown.clone();
        let every = self.config.tick_interval();
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = scheduler.run_cycle().await {
                                warn!(error = %err, "scheduling cycle failed");
                            }
                        }
                    }
                }
                info!("scheduler loop stopped");
            }
            .instrument(info_span!("scheduler")),
        );

        *runtime = Some(LoopHandle { shutdown, task });
        info!(every = ?every, "scheduler started");
    }

    /// Cancel the loop and wait for an in-flight cycle to finish.
    pub async fn stop(&self) {
        let Some(LoopHandle { shutdown, task }) = self.runtime.lock().await.take() else {
            debug!("scheduler already stopped");
            return;
        };
        shutdown.cancel();
        if let Err(err) = task.await {
            warn!(error = %err, "scheduler task failed");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// One scheduling pass: enqueue due updates, seed discovery when its
    /// interval has elapsed, and run housekeeping when its interval has
    /// elapsed.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let now = Utc::now();
        let due = self.store.query_due(now, self.config.max_jobs_per_run).await?;

        let mut report = CycleReport {
            due: due.len(),
            ..CycleReport::default()
        };
        let requests = due.into_iter().map(|record| {
            EnqueueRequest::new(
                record.priority_class.job_priority(),
                JobPayload::update(record.extension_id, UpdateSource::Scheduler),
            )
        });
        for request in requests {
            let key = request.dedupe_key();
            match self.queue.enqueue(request).await {
                Ok(handle) if handle.accepted => report.enqueued += 1,
                Ok(_) => report.merged += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(job = %key, error = %err, "skipping update enqueue");
                }
            }
        }

        let (discover, clean) = {
            let state = self.state();
            (
                should_run(state.last_discovery, self.config.discovery_interval(), now),
                should_run(state.last_cleanup, self.config.cleanup_interval(), now),
            )
        };

        if discover {
            report.discovery_enqueued = self.seed_discovery().await;
            self.state().last_discovery = Some(now);
        }

        if clean {
            match self.housekeeping().await {
                Ok(cleanup) => report.cleanup = Some(cleanup),
                Err(err) => warn!(error = %err, "housekeeping failed"),
            }
            self.state().last_cleanup = Some(now);
        }

        {
            let mut state = self.state();
            state.last_checked = Some(now);
            state.cycles += 1;
        }

        if report.due > 0 || report.discovery_enqueued > 0 {
            info!(
                due = report.due,
                enqueued = report.enqueued,
                merged = report.merged,
                failed = report.failed,
                discovery = report.discovery_enqueued,
                "scheduling cycle finished"
            );
        } else {
            debug!("scheduling cycle found nothing due");
        }
        Ok(report)
    }

    /// The discovery jobs for the next round: the next seed category, the
    /// next seed keyword, and the popular list.
    fn next_discovery_round(&self) -> Vec<DiscoveryStrategy> {
        let round = {
            let mut state = self.state();
            let round = state.discovery_rounds;
            state.discovery_rounds = round.wrapping_add(1);
            round
        };

        let mut strategies = Vec::with_capacity(3);
        let categories = &self.config.discovery_categories;
        if !categories.is_empty() {
            strategies.push(DiscoveryStrategy::Category {
                category: categories[round % categories.len()].clone(),
                page: 1,
            });
        }
        let keywords = &self.config.discovery_keywords;
        if !keywords.is_empty() {
            strategies.push(DiscoveryStrategy::Search {
                keyword: keywords[round % keywords.len()].clone(),
                page: 1,
            });
        }
        strategies.push(DiscoveryStrategy::Popular { page: 1 });
        strategies
    }

    async fn seed_discovery(&self) -> usize {
        let mut enqueued = 0;
        for strategy in self.next_discovery_round() {
            let label = strategy.label();
            let request = EnqueueRequest::new(JobPriority::Low, JobPayload::discovery(strategy));
            match self.queue.enqueue(request).await {
                Ok(handle) if handle.accepted => enqueued += 1,
                Ok(_) => debug!(strategy = label, "discovery already queued"),
                Err(err) => warn!(strategy = label, error = %err, "skipping discovery enqueue"),
            }
        }
        enqueued
    }

    /// Purge invalid extensions, reclaim expired leases and prune finished
    /// job history past the retention window.
    pub async fn housekeeping(&self) -> Result<CleanupReport> {
        let invalid_removed = self.store.delete_invalid_extensions().await?;
        let leases_reclaimed = self.queue.reclaim_expired_leases().await?;
        let history_pruned = self
            .queue
            .prune_history(Utc::now() - self.history_retention)
            .await?;

        let report = CleanupReport {
            invalid_removed,
            leases_reclaimed,
            history_pruned,
        };
        info!(
            invalid_removed,
            leases_reclaimed, history_pruned, "housekeeping finished"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let running = self.is_running().await;
        let queue_stats = self.queue.queue_stats().await?;
        let state = self.state();
        Ok(SchedulerStats {
            running,
            queue_stats,
            last_checked: state.last_checked,
            last_discovery: state.last_discovery,
            last_cleanup: state.last_cleanup,
            cycles: state.cycles,
        })
    }
}
