//! Observability counters for rate limit decisions.
//!
//! The aggregator is written to after a decision has been made and is never
//! read on the decision path.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::algorithm::Algorithm;

/// How a single check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Allowed,
    Blocked,
    /// Bypassed by the skip predicate
    Skipped,
    /// Admitted because the store could not be reached
    FailedOpen,
}

/// Per-algorithm breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlgorithmStats {
    pub requests: u64,
    pub blocked: u64,
    pub average_latency_ms: f64,
    pub block_rate: f64,
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub skipped_requests: u64,
    pub store_errors: u64,
    pub cas_conflicts: u64,
    pub average_latency_ms: f64,
    /// Blocked over total, in `[0, 1]`
    pub block_rate: f64,
    pub by_algorithm: BTreeMap<Algorithm, AlgorithmStats>,
    /// When counting started (creation or last reset)
    pub since: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    requests: u64,
    blocked: u64,
    latency: Duration,
}

impl Tally {
    fn add(&mut self, blocked: bool, latency: Duration) {
        self.requests += 1;
        if blocked {
            self.blocked += 1;
        }
        self.latency += latency;
    }

    fn average_latency_ms(&self) -> f64 {
        ratio(self.latency.as_secs_f64() * 1000.0, self.requests)
    }

    fn block_rate(&self) -> f64 {
        ratio(self.blocked as f64, self.requests)
    }
}

fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

#[derive(Debug)]
struct Counters {
    total: Tally,
    skipped: u64,
    store_errors: u64,
    cas_conflicts: u64,
    by_algorithm: BTreeMap<Algorithm, Tally>,
    since: DateTime<Utc>,
}

impl Counters {
    fn new() -> Self {
        Self {
            total: Tally::default(),
            skipped: 0,
            store_errors: 0,
            cas_conflicts: 0,
            by_algorithm: BTreeMap::new(),
            since: Utc::now(),
        }
    }
}

/// Accumulates global and per-algorithm counters.
#[derive(Debug)]
pub struct StatsAggregator {
    counters: Mutex<Counters>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::new()),
        }
    }

    /// Record the conclusion of one check.
    pub fn record(&self, algorithm: Algorithm, outcome: CheckOutcome, latency: Duration) {
        let blocked = outcome == CheckOutcome::Blocked;
        let mut counters = self.counters.lock();
        counters.total.add(blocked, latency);
        counters
            .by_algorithm
            .entry(algorithm)
            .or_default()
            .add(blocked, latency);
        match outcome {
            CheckOutcome::Skipped => counters.skipped += 1,
            CheckOutcome::FailedOpen => counters.store_errors += 1,
            CheckOutcome::Allowed | CheckOutcome::Blocked => {}
        }
    }

    /// Record compare-and-swap attempts lost to concurrent writers.
    pub fn record_cas_conflicts(&self, conflicts: u64) {
        if conflicts > 0 {
            self.counters.lock().cas_conflicts += conflicts;
        }
    }

    /// Take a snapshot of the current counters.
    pub fn snapshot(&self) -> RateLimitStats {
        let counters = self.counters.lock();
        RateLimitStats {
            total_requests: counters.total.requests,
            allowed_requests: counters.total.requests - counters.total.blocked,
            blocked_requests: counters.total.blocked,
            skipped_requests: counters.skipped,
            store_errors: counters.store_errors,
            cas_conflicts: counters.cas_conflicts,
            average_latency_ms: counters.total.average_latency_ms(),
            block_rate: counters.total.block_rate(),
            by_algorithm: counters
                .by_algorithm
                .iter()
                .map(|(algorithm, tally)| {
                    (
                        *algorithm,
                        AlgorithmStats {
                            requests: tally.requests,
                            blocked: tally.blocked,
                            average_latency_ms: tally.average_latency_ms(),
                            block_rate: tally.block_rate(),
                        },
                    )
                })
                .collect(),
            since: counters.since,
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::new();
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
