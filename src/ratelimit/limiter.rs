//! Rate limit dispatcher.
//!
//! [`RateLimiter`] turns a [`RateLimitConfig`] into a decision: it derives the
//! storage key, loads the key's state from the [`SharedState`], runs the
//! configured strategy and writes the new state back with a TTL of two
//! windows.
//!
//! The load/decide/store cycle is made atomic with compare-and-swap on the
//! version token of the stored value. A plain get-then-set would let two
//! instances read the same state, both admit, and both write, so the key
//! would admit more than its limit; a lost swap is retried from a fresh read
//! instead. Only admissions are written: a denial never consumes capacity,
//! so it returns straight from the read and takes no part in the race.
//!
//! A swap lost to another writer is not a store failure. Retries continue
//! for at least `max_cas_attempts` attempts and at least the store timeout;
//! a request that still cannot win is denied with a one-second
//! `retry_after`, never admitted.
//!
//! Store failures (errors and timeouts) never propagate out of
//! [`RateLimiter::check`]: the request is admitted (fail-open) and the
//! failure is logged and counted.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::algorithm::{Algorithm, RateLimitConfig};
use super::state::{after_secs, AlgorithmState, Decision};
use super::stats::{CheckOutcome, RateLimitStats, StatsAggregator};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterSettings;
use crate::error::{Result, StoreError, StoreResult};
use crate::store::SharedState;

/// Outcome of a rate limit check, returned to the caller and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Effective limit of the configuration that decided
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds
    pub reset_time: u64,
    /// Seconds to wait before retrying, set only on denial
    pub retry_after: Option<u64>,
    pub algorithm: Algorithm,
    pub key: String,
    /// Bypassed by the skip predicate
    pub skipped: bool,
    /// Admitted because the store could not be reached
    pub fail_open: bool,
}

impl RateLimitResult {
    /// `reset_time` as a UTC timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.reset_time as i64)
            .single()
            .unwrap_or_default()
    }
}

/// The rate limit dispatcher.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    store: Arc<dyn SharedState>,
    clock: Arc<dyn Clock>,
    stats: StatsAggregator,
    settings: LimiterSettings,
    instance_id: Uuid,
}

impl RateLimiter {
    /// Create a rate limiter over `store` with default settings.
    pub fn new(store: Arc<dyn SharedState>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a rate limiter reading time from `clock`.
    pub fn with_clock(store: Arc<dyn SharedState>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stats: StatsAggregator::new(),
            settings: LimiterSettings::default(),
            instance_id: Uuid::new_v4(),
        }
    }

    /// Replace the limiter settings.
    pub fn with_settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Unique id of this limiter instance, attached to its log records.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The limiter settings.
    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<dyn SharedState> {
        &self.store
    }

    /// Storage key for `key` under `algorithm`: `{prefix}:{algorithm}:{key}`.
    pub fn storage_key(&self, algorithm: Algorithm, key: &str) -> String {
        format!("{}:{}:{}", self.settings.key_prefix, algorithm, key)
    }

    /// Check the rate limit for `key`.
    ///
    /// Only configuration errors are returned; store failures admit the request.
    #[instrument(
        level = "trace",
        skip_all,
        fields(key = %key, algorithm = %config.algorithm, instance = %self.instance_id)
    )]
    pub async fn check<C>(
        &self,
        key: &str,
        config: &RateLimitConfig<C>,
        context: &C,
    ) -> Result<RateLimitResult> {
        config.validate()?;
        let started = Instant::now();

        if config.should_skip(context) {
            trace!("Rate limit check skipped");
            self.stats
                .record(config.algorithm, CheckOutcome::Skipped, started.elapsed());
            return Ok(self.admit_unchecked(key, config, true, false));
        }

        let storage_key = self.storage_key(config.algorithm, key);

        match self.apply(&storage_key, config).await {
            Ok(decision) => {
                let outcome = if decision.allowed {
                    trace!(remaining = decision.remaining, "Rate limit check passed");
                    CheckOutcome::Allowed
                } else {
                    debug!(
                        storage_key = %storage_key,
                        retry_after = ?decision.retry_after,
                        "Rate limit exceeded"
                    );
                    CheckOutcome::Blocked
                };
                self.stats
                    .record(config.algorithm, outcome, started.elapsed());

                Ok(RateLimitResult {
                    allowed: decision.allowed,
                    limit: config.limit,
                    remaining: decision.remaining,
                    reset_time: decision.reset_time,
                    retry_after: decision.retry_after,
                    algorithm: config.algorithm,
                    key: key.to_string(),
                    skipped: false,
                    fail_open: false,
                })
            }
            Err(StoreError::ContentionExhausted { attempts, .. }) => {
                warn!(
                    storage_key = %storage_key,
                    attempts,
                    "Rate limit key too contended, denying"
                );
                self.stats
                    .record(config.algorithm, CheckOutcome::Blocked, started.elapsed());

                let now = self.clock.now_millis();
                Ok(RateLimitResult {
                    allowed: false,
                    limit: config.limit,
                    remaining: 0,
                    reset_time: after_secs(now, config.window),
                    retry_after: Some(1),
                    algorithm: config.algorithm,
                    key: key.to_string(),
                    skipped: false,
                    fail_open: false,
                })
            }
            Err(e) => {
                warn!(
                    storage_key = %storage_key,
                    error = %e,
                    "Shared state unavailable, failing open"
                );
                self.stats
                    .record(config.algorithm, CheckOutcome::FailedOpen, started.elapsed());
                Ok(self.admit_unchecked(key, config, false, true))
            }
        }
    }

    /// Delete the stored state for `key`, unblocking it immediately.
    pub async fn reset<C>(&self, key: &str, config: &RateLimitConfig<C>) -> Result<()> {
        let storage_key = self.storage_key(config.algorithm, key);
        let existed = self.timed(self.store.delete(&storage_key)).await?;
        info!(storage_key = %storage_key, existed, "Rate limit state reset");
        Ok(())
    }

    /// Read the stored state for `key` without modifying it.
    ///
    /// Absent, expired and unreadable state all report `None`.
    pub async fn get_status<C>(
        &self,
        key: &str,
        config: &RateLimitConfig<C>,
    ) -> Result<Option<AlgorithmState>> {
        let storage_key = self.storage_key(config.algorithm, key);
        let stored = self.timed(self.store.get(&storage_key)).await?;
        Ok(stored.and_then(|bytes| AlgorithmState::decode_as(&bytes, config.algorithm)))
    }

    /// Snapshot of the decision counters.
    pub fn get_stats(&self) -> RateLimitStats {
        self.stats.snapshot()
    }

    /// Zero the decision counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
        info!(instance = %self.instance_id, "Rate limit stats reset");
    }

    /// Run one load/decide/compare-and-swap cycle, retrying lost swaps.
    async fn apply<C>(
        &self,
        storage_key: &str,
        config: &RateLimitConfig<C>,
    ) -> StoreResult<Decision<AlgorithmState>> {
        let ttl = config.state_ttl();
        let min_attempts = self.settings.max_cas_attempts.max(1);
        let budget = self.settings.store_timeout();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if attempt >= min_attempts && started.elapsed() >= budget {
                    return Err(StoreError::ContentionExhausted {
                        key: storage_key.to_string(),
                        attempts: attempt,
                    });
                }
                self.backoff(attempt).await;
            }

            let now = self.clock.now_millis();
            let current = self.timed(self.store.get_versioned(storage_key)).await?;

            let (state, version) = match current {
                Some(stored) => {
                    let state = AlgorithmState::decode_as(&stored.value, config.algorithm)
                        .unwrap_or_else(|| {
                            debug!(
                                storage_key = %storage_key,
                                "Discarding unreadable rate limit state"
                            );
                            AlgorithmState::initial(config, now)
                        });
                    (state, Some(stored.version))
                }
                None => (AlgorithmState::initial(config, now), None),
            };

            let decision = state.decide(now, config);
            if !decision.allowed {
                return Ok(decision);
            }
            let encoded = decision.state.encode()?;

            let swapped = self
                .timed(self.store.compare_and_swap(storage_key, version, encoded, ttl))
                .await?;
            if swapped {
                return Ok(decision);
            }

            trace!(storage_key = %storage_key, attempt, "Lost compare-and-swap, retrying");
            self.stats.record_cas_conflicts(1);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Result for checks that never reached the store.
    fn admit_unchecked<C>(
        &self,
        key: &str,
        config: &RateLimitConfig<C>,
        skipped: bool,
        fail_open: bool,
    ) -> RateLimitResult {
        RateLimitResult {
            allowed: true,
            limit: config.limit,
            remaining: config.limit,
            reset_time: after_secs(self.clock.now_millis(), config.window),
            retry_after: None,
            algorithm: config.algorithm,
            key: key.to_string(),
            skipped,
            fail_open,
        }
    }

    /// Bound a store call by the configured timeout.
    pub(crate) async fn timed<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let limit = self.settings.store_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }

    /// Jittered pause before retry `attempt`.
    async fn backoff(&self, attempt: u32) {
        let base = u64::try_from(self.settings.cas_backoff().as_millis()).unwrap_or(u64::MAX);
        let ceiling = base.saturating_mul(u64::from(attempt.min(8)));
        let delay = if ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=ceiling)
        };

        if delay == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("instance_id", &self.instance_id)
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .finish()
    }
}
