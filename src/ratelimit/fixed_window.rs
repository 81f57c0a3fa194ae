//! Fixed window strategy.
//!
//! One counter per aligned window. Cheapest in state, but up to twice the
//! limit can pass around a window boundary.

use super::algorithm::RateLimitConfig;
use super::state::{ceil_secs, Decision, FixedWindowState};

/// Start of the window containing `now`, aligned to a multiple of `window`.
pub fn window_start(now: u64, window: u64) -> u64 {
    if window == 0 {
        return now;
    }
    now / window * window
}

/// Evaluate one request against the current window.
pub fn decide<C>(
    state: FixedWindowState,
    now: u64,
    config: &RateLimitConfig<C>,
) -> Decision<FixedWindowState> {
    let window = config.window_millis();
    let limit = config.limit;
    let current = window_start(now, window);

    // A new epoch discards whatever the previous one counted.
    let mut count = if state.window_start == current {
        state.count.min(limit)
    } else {
        0
    };

    let allowed = count < limit;
    if allowed {
        count += 1;
    }

    let reset_time = current.saturating_add(window);
    let retry_after =
        (!allowed).then(|| ceil_secs(reset_time.saturating_sub(now) as f64 / 1000.0).max(1));

    Decision {
        state: FixedWindowState {
            count,
            window_start: current,
        },
        allowed,
        remaining: limit - count,
        reset_time,
        retry_after,
    }
}
