//! Algorithm selection and per-check rate limit configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// The rate limiting algorithms the engine can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Burst-tolerant bucket refilled at a steady rate
    TokenBucket,
    /// Exact rolling window over per-request timestamps
    SlidingWindow,
    /// Counter reset at aligned window boundaries
    FixedWindow,
    /// Bucket drained at a constant rate, no burst tolerance
    LeakyBucket,
}

impl Algorithm {
    /// All algorithms, in a stable order.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::TokenBucket,
        Algorithm::SlidingWindow,
        Algorithm::FixedWindow,
        Algorithm::LeakyBucket,
    ];

    /// Name used in storage keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" | "tokenbucket" => Ok(Algorithm::TokenBucket),
            "sliding_window" | "slidingwindow" => Ok(Algorithm::SlidingWindow),
            "fixed_window" | "fixedwindow" => Ok(Algorithm::FixedWindow),
            "leaky_bucket" | "leakybucket" => Ok(Algorithm::LeakyBucket),
            _ => Err(RateLimitError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Resolves the rate limit key from caller context.
pub type KeyGenerator<C> = Arc<dyn Fn(&C) -> String + Send + Sync>;

/// Decides whether a request bypasses rate limiting entirely.
pub type SkipPredicate<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// Immutable configuration supplied with every check.
///
/// `C` is the caller's request context; the engine never inspects it except
/// through the optional hooks.
pub struct RateLimitConfig<C = ()> {
    /// Algorithm used for the decision
    pub algorithm: Algorithm,
    /// Maximum permitted units per window
    pub limit: u64,
    /// Window length in seconds
    pub window: u64,
    /// Bucket capacity (token and leaky buckets); defaults to `limit`
    pub burst: Option<u64>,
    /// Token refill rate per second; defaults to `limit / window`
    pub refill_rate: Option<f64>,
    /// Custom key derivation used by named types
    pub key_generator: Option<KeyGenerator<C>>,
    /// Bypass predicate
    pub skip_if: Option<SkipPredicate<C>>,
}

impl<C> RateLimitConfig<C> {
    /// Create a configuration without hooks.
    pub fn new(algorithm: Algorithm, limit: u64, window: u64) -> Self {
        Self {
            algorithm,
            limit,
            window,
            burst: None,
            refill_rate: None,
            key_generator: None,
            skip_if: None,
        }
    }

    /// Set the bucket capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Set the token refill rate per second.
    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = Some(refill_rate);
        self
    }

    /// Derive keys from the context instead of `{type}:{identifier}`.
    pub fn with_key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(f));
        self
    }

    /// Bypass the check whenever `f` returns true.
    pub fn with_skip_if<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Arc::new(f));
        self
    }

    /// Reject values no algorithm can work with.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RateLimitError::Config("limit must be positive".to_string()));
        }
        if self.window == 0 {
            return Err(RateLimitError::Config("window must be positive".to_string()));
        }
        if self.burst == Some(0) {
            return Err(RateLimitError::Config("burst must be positive".to_string()));
        }
        if let Some(rate) = self.refill_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(RateLimitError::Config(format!(
                    "refill_rate must be a positive number, got {}",
                    rate
                )));
            }
        }
        Ok(())
    }

    /// Whether the skip predicate bypasses this context.
    pub fn should_skip(&self, context: &C) -> bool {
        self.skip_if.as_ref().is_some_and(|skip| skip(context))
    }

    /// Bucket capacity for token and leaky buckets.
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    /// Token refill rate per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or_else(|| self.limit as f64 / self.window as f64)
    }

    /// Leaky bucket drain rate per second.
    pub fn leak_rate(&self) -> f64 {
        self.limit as f64 / self.window as f64
    }

    /// Window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window.saturating_mul(1000)
    }

    /// TTL of persisted state: two windows.
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.window.saturating_mul(2))
    }
}

impl<C> Clone for RateLimitConfig<C> {
    fn clone(&self) -> Self {
        Self {
            algorithm: self.algorithm,
            limit: self.limit,
            window: self.window,
            burst: self.burst,
            refill_rate: self.refill_rate,
            key_generator: self.key_generator.clone(),
            skip_if: self.skip_if.clone(),
        }
    }
}

impl<C> fmt::Debug for RateLimitConfig<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("algorithm", &self.algorithm)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("burst", &self.burst)
            .field("refill_rate", &self.refill_rate)
            .field("key_generator", &self.key_generator.is_some())
            .field("skip_if", &self.skip_if.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("token_bucket".parse::<Algorithm>().unwrap(), Algorithm::TokenBucket);
        assert_eq!("Sliding-Window".parse::<Algorithm>().unwrap(), Algorithm::SlidingWindow);
        assert_eq!("fixedwindow".parse::<Algorithm>().unwrap(), Algorithm::FixedWindow);
        assert_eq!("leaky_bucket".parse::<Algorithm>().unwrap(), Algorithm::LeakyBucket);

        let err = "gcra".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, RateLimitError::UnknownAlgorithm(ref name) if name == "gcra"));
    }

    #[test]
    fn test_algorithm_display_roundtrips() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.to_string().parse::<Algorithm>().unwrap(), algorithm);
        }
    }

    #[test]
    fn test_defaults_derived_from_limit_and_window() {
        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::TokenBucket, 120, 60);
        assert_eq!(config.capacity(), 120);
        assert_eq!(config.refill_rate(), 2.0);
        assert_eq!(config.leak_rate(), 2.0);
        assert_eq!(config.state_ttl(), Duration::from_secs(120));

        let config = config.with_burst(10).with_refill_rate(0.5);
        assert_eq!(config.capacity(), 10);
        assert_eq!(config.refill_rate(), 0.5);
    }

    #[test]
    fn test_validate_rejects_non_positive_values() {
        let zero_limit: RateLimitConfig = RateLimitConfig::new(Algorithm::FixedWindow, 0, 60);
        assert!(zero_limit.validate().is_err());

        let zero_window: RateLimitConfig = RateLimitConfig::new(Algorithm::FixedWindow, 5, 0);
        assert!(zero_window.validate().is_err());

        let bad_rate: RateLimitConfig =
            RateLimitConfig::new(Algorithm::TokenBucket, 5, 1).with_refill_rate(f64::NAN);
        assert!(bad_rate.validate().is_err());

        let ok: RateLimitConfig = RateLimitConfig::new(Algorithm::LeakyBucket, 5, 1);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_skip_predicate() {
        let config = RateLimitConfig::<String>::new(Algorithm::FixedWindow, 1, 1)
            .with_skip_if(|ctx: &String| ctx == "internal");
        assert!(config.should_skip(&"internal".to_string()));
        assert!(!config.should_skip(&"public".to_string()));

        let no_hook = RateLimitConfig::<String>::new(Algorithm::FixedWindow, 1, 1);
        assert!(!no_hook.should_skip(&"internal".to_string()));
    }
}
