//! Persisted per-key algorithm state.
//!
//! State lives in the shared store under `{prefix}:{algorithm}:{key}` as a
//! JSON document tagged with the algorithm name, so a value written by one
//! strategy can never be read back as another's.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::algorithm::{Algorithm, RateLimitConfig};
use super::{fixed_window, leaky_bucket, sliding_window, token_bucket};
use crate::error::{StoreError, StoreResult};

/// Token bucket state. `tokens` stays within `[0, capacity]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    /// Epoch milliseconds of the last refill
    pub last_refill: u64,
    pub capacity: u64,
}

/// Sliding window state: request timestamps (epoch ms) inside the window, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub timestamps: VecDeque<u64>,
    pub limit: u64,
}

/// Fixed window state. `window_start` is aligned to a window boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowState {
    pub count: u64,
    /// Epoch milliseconds
    pub window_start: u64,
}

/// Leaky bucket state. `volume` stays within `[0, capacity]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    pub volume: f64,
    /// Epoch milliseconds of the last drain
    pub last_leak: u64,
    pub capacity: u64,
}

/// State of a single key, tagged by algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmState {
    TokenBucket(TokenBucketState),
    SlidingWindow(SlidingWindowState),
    FixedWindow(FixedWindowState),
    LeakyBucket(LeakyBucketState),
}

/// Outcome of one strategy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision<S> {
    /// State to persist
    pub state: S,
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch milliseconds at which the limiter is fully replenished or the window rolls over
    pub reset_time: u64,
    /// Seconds the caller should wait, set only on denial
    pub retry_after: Option<u64>,
}

impl<S> Decision<S> {
    /// Wrap the state into another type, keeping the verdict.
    pub fn map_state<T>(self, f: impl FnOnce(S) -> T) -> Decision<T> {
        Decision {
            state: f(self.state),
            allowed: self.allowed,
            remaining: self.remaining,
            reset_time: self.reset_time,
            retry_after: self.retry_after,
        }
    }
}

impl AlgorithmState {
    /// The zero state a never-seen key starts from.
    pub fn initial<C>(config: &RateLimitConfig<C>, now: u64) -> Self {
        match config.algorithm {
            Algorithm::TokenBucket => AlgorithmState::TokenBucket(TokenBucketState {
                tokens: config.capacity() as f64,
                last_refill: now,
                capacity: config.capacity(),
            }),
            Algorithm::SlidingWindow => AlgorithmState::SlidingWindow(SlidingWindowState {
                timestamps: VecDeque::new(),
                limit: config.limit,
            }),
            Algorithm::FixedWindow => AlgorithmState::FixedWindow(FixedWindowState {
                count: 0,
                window_start: fixed_window::window_start(now, config.window_millis()),
            }),
            Algorithm::LeakyBucket => AlgorithmState::LeakyBucket(LeakyBucketState {
                volume: 0.0,
                last_leak: now,
                capacity: config.capacity(),
            }),
        }
    }

    /// The algorithm this state belongs to.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            AlgorithmState::TokenBucket(_) => Algorithm::TokenBucket,
            AlgorithmState::SlidingWindow(_) => Algorithm::SlidingWindow,
            AlgorithmState::FixedWindow(_) => Algorithm::FixedWindow,
            AlgorithmState::LeakyBucket(_) => Algorithm::LeakyBucket,
        }
    }

    /// Whether the state satisfies the invariants its strategy relies on.
    pub fn is_well_formed(&self) -> bool {
        match self {
            AlgorithmState::TokenBucket(state) => {
                state.tokens.is_finite()
                    && state.tokens >= 0.0
                    && state.tokens <= state.capacity as f64
            }
            AlgorithmState::SlidingWindow(state) => state
                .timestamps
                .iter()
                .zip(state.timestamps.iter().skip(1))
                .all(|(earlier, later)| earlier <= later),
            AlgorithmState::FixedWindow(_) => true,
            AlgorithmState::LeakyBucket(state) => {
                state.volume.is_finite()
                    && state.volume >= 0.0
                    && state.volume <= state.capacity as f64
            }
        }
    }

    /// Run the configured strategy over this state.
    ///
    /// A state belonging to a different algorithm than `config` is discarded
    /// and the decision starts from the zero state.
    pub fn decide<C>(self, now: u64, config: &RateLimitConfig<C>) -> Decision<AlgorithmState> {
        match (config.algorithm, self) {
            (Algorithm::TokenBucket, AlgorithmState::TokenBucket(state)) => {
                token_bucket::decide(state, now, config).map_state(AlgorithmState::TokenBucket)
            }
            (Algorithm::SlidingWindow, AlgorithmState::SlidingWindow(state)) => {
                sliding_window::decide(state, now, config).map_state(AlgorithmState::SlidingWindow)
            }
            (Algorithm::FixedWindow, AlgorithmState::FixedWindow(state)) => {
                fixed_window::decide(state, now, config).map_state(AlgorithmState::FixedWindow)
            }
            (Algorithm::LeakyBucket, AlgorithmState::LeakyBucket(state)) => {
                leaky_bucket::decide(state, now, config).map_state(AlgorithmState::LeakyBucket)
            }
            (_, _) => AlgorithmState::initial(config, now).decide(now, config),
        }
    }

    /// Serialize for the store.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Deserialize any well-formed state.
    ///
    /// Values that parse but break a state invariant, such as out-of-order
    /// sliding window timestamps or a negative bucket level, count as absent.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(bytes)
            .ok()
            .filter(AlgorithmState::is_well_formed)
    }

    /// Deserialize a state, accepting only the expected algorithm's shape.
    pub fn decode_as(bytes: &[u8], algorithm: Algorithm) -> Option<Self> {
        Self::decode(bytes).filter(|state| state.algorithm() == algorithm)
    }
}

/// Whole seconds needed to cover `secs`, never negative.
pub(crate) fn ceil_secs(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        secs.ceil() as u64
    } else {
        0
    }
}

/// Epoch milliseconds `secs` whole seconds after `now`.
pub(crate) fn after_secs(now: u64, secs: u64) -> u64 {
    now.saturating_add(secs.saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_states() {
        let config: RateLimitConfig =
            RateLimitConfig::new(Algorithm::TokenBucket, 10, 60).with_burst(20);
        assert_eq!(
            AlgorithmState::initial(&config, 5_000),
            AlgorithmState::TokenBucket(TokenBucketState {
                tokens: 20.0,
                last_refill: 5_000,
                capacity: 20,
            })
        );

        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::FixedWindow, 10, 60);
        assert_eq!(
            AlgorithmState::initial(&config, 61_500),
            AlgorithmState::FixedWindow(FixedWindowState {
                count: 0,
                window_start: 60_000,
            })
        );
    }

    #[test]
    fn test_encode_is_tagged() {
        let state = AlgorithmState::FixedWindow(FixedWindowState {
            count: 3,
            window_start: 60_000,
        });
        let json: serde_json::Value = serde_json::from_slice(&state.encode().unwrap()).unwrap();
        assert_eq!(json["algorithm"], "fixed_window");
        assert_eq!(json["count"], 3);
    }

    #[test]
    fn test_decode_rejects_other_algorithm_shape() {
        let state = AlgorithmState::TokenBucket(TokenBucketState {
            tokens: 1.5,
            last_refill: 0,
            capacity: 2,
        });
        let bytes = state.encode().unwrap();

        assert_eq!(AlgorithmState::decode_as(&bytes, Algorithm::TokenBucket), Some(state));
        assert_eq!(AlgorithmState::decode_as(&bytes, Algorithm::LeakyBucket), None);
    }

    #[test]
    fn test_decode_garbage_is_absent() {
        assert_eq!(AlgorithmState::decode(b"not json"), None);
        assert_eq!(AlgorithmState::decode(br#"{"algorithm":"fixed_window"}"#), None);
        assert_eq!(AlgorithmState::decode(br#"{"algorithm":"gcra","tat":1}"#), None);
    }

    #[test]
    fn test_decode_rejects_broken_invariants() {
        let unsorted = br#"{"algorithm":"sliding_window","timestamps":[5000,1000,3000],"limit":5}"#;
        assert_eq!(AlgorithmState::decode_as(unsorted, Algorithm::SlidingWindow), None);

        let sorted = br#"{"algorithm":"sliding_window","timestamps":[1000,1000,3000],"limit":5}"#;
        assert!(AlgorithmState::decode_as(sorted, Algorithm::SlidingWindow).is_some());

        let negative =
            br#"{"algorithm":"token_bucket","tokens":-4.0,"last_refill":0,"capacity":5}"#;
        assert_eq!(AlgorithmState::decode(negative), None);

        let overfull = br#"{"algorithm":"leaky_bucket","volume":9.0,"last_leak":0,"capacity":3}"#;
        assert_eq!(AlgorithmState::decode(overfull), None);
    }

    #[test]
    fn test_mismatched_state_starts_fresh() {
        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::FixedWindow, 2, 60);
        let stale = AlgorithmState::LeakyBucket(LeakyBucketState {
            volume: 2.0,
            last_leak: 0,
            capacity: 2,
        });

        let decision = stale.decide(1_000, &config);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.state.algorithm(), Algorithm::FixedWindow);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(0.0), 0);
        assert_eq!(ceil_secs(-3.0), 0);
        assert_eq!(ceil_secs(0.2), 1);
        assert_eq!(ceil_secs(2.0), 2);
        assert_eq!(ceil_secs(f64::INFINITY), 0);
    }
}
