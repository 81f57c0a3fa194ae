//! Leaky bucket strategy.
//!
//! Each admitted request adds one unit of volume; the bucket drains at
//! `limit / window` units per second. Output is smoothed to the drain rate
//! with no burst beyond the bucket capacity.

use super::algorithm::RateLimitConfig;
use super::state::{after_secs, ceil_secs, Decision, LeakyBucketState};

/// Evaluate one request against the bucket.
pub fn decide<C>(
    state: LeakyBucketState,
    now: u64,
    config: &RateLimitConfig<C>,
) -> Decision<LeakyBucketState> {
    let capacity = config.capacity();
    let leak_rate = config.leak_rate();

    let elapsed = now.saturating_sub(state.last_leak) as f64 / 1000.0;
    let mut volume = (state.volume - elapsed * leak_rate).clamp(0.0, capacity as f64);

    // Admit only if a whole unit still fits.
    let allowed = volume + 1.0 <= capacity as f64;
    if allowed {
        volume += 1.0;
    }

    let reset_time = after_secs(now, ceil_secs(volume / leak_rate));
    let retry_after =
        (!allowed).then(|| ceil_secs((volume + 1.0 - capacity as f64) / leak_rate).max(1));

    Decision {
        state: LeakyBucketState {
            volume,
            last_leak: now.max(state.last_leak),
            capacity,
        },
        allowed,
        remaining: (capacity as f64 - volume).max(0.0).floor() as u64,
        reset_time,
        retry_after,
    }
}
