//! Rate limiting algorithms, dispatch and named types.

mod algorithm;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod rules;
mod sliding_window;
mod state;
mod stats;
mod token_bucket;

pub use algorithm::{Algorithm, KeyGenerator, RateLimitConfig, SkipPredicate};
pub use limiter::{RateLimitResult, RateLimiter};
pub use rules::{ConfigRegistry, RuleSet, TypeRule};
pub use state::{
    AlgorithmState, Decision, FixedWindowState, LeakyBucketState, SlidingWindowState,
    TokenBucketState,
};
pub use stats::{AlgorithmStats, CheckOutcome, RateLimitStats, StatsAggregator};
