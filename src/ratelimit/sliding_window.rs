//! Sliding window strategy.
//!
//! Keeps the timestamp of every admitted request inside the window and
//! admits a new one only while fewer than `limit` remain. Enforcement is
//! exact over any rolling interval of `window` seconds, at the cost of
//! O(limit) stored timestamps per key.

use super::algorithm::RateLimitConfig;
use super::state::{ceil_secs, Decision, SlidingWindowState};

/// Evaluate one request against the window.
pub fn decide<C>(
    mut state: SlidingWindowState,
    now: u64,
    config: &RateLimitConfig<C>,
) -> Decision<SlidingWindowState> {
    let window = config.window_millis();
    let limit = config.limit;

    // Evict everything at or before `now - window`.
    while state
        .timestamps
        .front()
        .is_some_and(|&oldest| oldest.saturating_add(window) <= now)
    {
        state.timestamps.pop_front();
    }

    let allowed = (state.timestamps.len() as u64) < limit;
    if allowed {
        let at = state.timestamps.partition_point(|&ts| ts <= now);
        state.timestamps.insert(at, now);
    }

    let remaining = limit.saturating_sub(state.timestamps.len() as u64);
    let reset_time = match state.timestamps.front() {
        Some(&oldest) => oldest.saturating_add(window),
        None => now.saturating_add(window),
    };
    let retry_after =
        (!allowed).then(|| ceil_secs(reset_time.saturating_sub(now) as f64 / 1000.0).max(1));

    state.limit = limit;

    Decision {
        state,
        allowed,
        remaining,
        reset_time,
        retry_after,
    }
}
