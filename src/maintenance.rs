//! Background maintenance tasks.
//!
//! Two independent loops run next to the request path: a sweep that deletes
//! dead state keys under the engine's namespace, and a periodic log line
//! with the decision counters. Neither touches anything the decision path
//! reads except the shared store, and a failing run is logged and retried
//! on the next tick.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MaintenanceSettings;
use crate::error::Result;
use crate::ratelimit::{AlgorithmState, RateLimiter};

/// Concurrent store calls issued by one sweep.
const SWEEP_CONCURRENCY: usize = 16;

/// Summary of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys found under the namespace
    pub scanned: usize,
    /// Keys deleted because they were expired or unreadable
    pub removed: usize,
}

/// Delete expired and unreadable state keys under the limiter's namespace.
///
/// Every store call is bounded by the limiter's store timeout. Only listing
/// the namespace can fail the sweep; a failure on an individual key is
/// logged and the key is left for the next run. Deletes are conditional on
/// the key still holding what was read, so a check that rewrites the key in
/// the meantime keeps its state.
pub async fn sweep(limiter: &RateLimiter) -> Result<SweepReport> {
    let store = limiter.store();
    let prefix = format!("{}:", limiter.settings().key_prefix);
    let keys = limiter.timed(store.keys(&prefix)).await?;
    let scanned = keys.len();

    let removed = stream::iter(keys)
        .map(|key| async move {
            let expected = match limiter.timed(store.get_versioned(&key)).await {
                Ok(None) => None,
                Ok(Some(stored)) if AlgorithmState::decode(&stored.value).is_none() => {
                    Some(stored.version)
                }
                Ok(Some(_)) => return false,
                Err(e) => {
                    warn!(key = %key, error = %e, "Sweep could not read key");
                    return false;
                }
            };
            match limiter.timed(store.compare_and_delete(&key, expected)).await {
                Ok(removed) => {
                    if removed {
                        debug!(key = %key, "Swept dead rate limit key");
                    }
                    removed
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Sweep could not delete key");
                    false
                }
            }
        })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .filter(|removed| futures::future::ready(*removed))
        .count()
        .await;

    Ok(SweepReport { scanned, removed })
}

/// Log the limiter's current counters.
pub fn emit_stats(limiter: &RateLimiter) {
    let stats = limiter.get_stats();
    let by_algorithm = serde_json::to_string(&stats.by_algorithm).unwrap_or_default();
    info!(
        instance = %limiter.instance_id(),
        total = stats.total_requests,
        allowed = stats.allowed_requests,
        blocked = stats.blocked_requests,
        skipped = stats.skipped_requests,
        store_errors = stats.store_errors,
        cas_conflicts = stats.cas_conflicts,
        block_rate = stats.block_rate,
        average_latency_ms = stats.average_latency_ms,
        by_algorithm = %by_algorithm,
        since = %stats.since,
        "Rate limit stats"
    );
}

/// Handle to the running maintenance tasks.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Start the tasks described by `settings`.
    ///
    /// Disabled settings start nothing.
    pub fn from_settings(limiter: Arc<RateLimiter>, settings: &MaintenanceSettings) -> Self {
        if !settings.enabled {
            info!("Maintenance tasks disabled");
            return Self::spawn(limiter, None, None);
        }
        Self::spawn(
            limiter,
            Some(settings.sweep_interval()),
            Some(settings.stats_interval()),
        )
    }

    /// Start a sweep every `sweep_every` and a stats line every `stats_every`.
    ///
    /// A `None` or zero interval leaves that task out. The first run of each
    /// task happens one interval after start.
    pub fn spawn(
        limiter: Arc<RateLimiter>,
        sweep_every: Option<Duration>,
        stats_every: Option<Duration>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        if let Some(period) = sweep_every.filter(|p| !p.is_zero()) {
            let limiter = limiter.clone();
            tasks.push(every(period, shutdown.subscribe(), move || {
                let limiter = limiter.clone();
                async move {
                    match sweep(&limiter).await {
                        Ok(report) => info!(
                            scanned = report.scanned,
                            removed = report.removed,
                            "Rate limit sweep finished"
                        ),
                        Err(e) => warn!(error = %e, "Rate limit sweep failed"),
                    }
                }
            }));
            info!(interval = ?period, "Started rate limit sweep task");
        }

        if let Some(period) = stats_every.filter(|p| !p.is_zero()) {
            tasks.push(every(period, shutdown.subscribe(), move || {
                emit_stats(&limiter);
                futures::future::ready(())
            }));
            info!(interval = ?period, "Started rate limit stats task");
        }

        Self { shutdown, tasks }
    }

    /// Number of running tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop all tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!("Maintenance tasks stopped");
    }
}

/// Resolve once `shutdown` is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `job` every `period` until `shutdown` flips.
///
/// A run in progress is abandoned when shutdown is signalled.
fn every<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            tokio::select! {
                _ = job() => {}
                _ = stopped(&mut shutdown) => break,
            }
        }
    })
}
