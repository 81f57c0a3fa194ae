//! Token bucket strategy.
//!
//! The bucket holds up to `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. Each admitted request takes one token,
//! so short bursts up to `capacity` pass immediately and sustained traffic
//! is throttled to the refill rate.

use super::algorithm::RateLimitConfig;
use super::state::{after_secs, ceil_secs, Decision, TokenBucketState};

/// Evaluate one request against the bucket.
pub fn decide<C>(
    state: TokenBucketState,
    now: u64,
    config: &RateLimitConfig<C>,
) -> Decision<TokenBucketState> {
    let capacity = config.capacity();
    let refill_rate = config.refill_rate();

    let elapsed = now.saturating_sub(state.last_refill) as f64 / 1000.0;
    let mut tokens = (state.tokens + elapsed * refill_rate).clamp(0.0, capacity as f64);

    // A fraction of a token does not admit a request.
    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    let reset_time = after_secs(now, ceil_secs((capacity as f64 - tokens) / refill_rate));
    let retry_after = (!allowed).then(|| ceil_secs((1.0 - tokens) / refill_rate).max(1));

    Decision {
        state: TokenBucketState {
            tokens,
            last_refill: now.max(state.last_refill),
            capacity,
        },
        allowed,
        remaining: tokens.floor() as u64,
        reset_time,
        retry_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::algorithm::Algorithm;

    fn full(config: &RateLimitConfig, now: u64) -> TokenBucketState {
        TokenBucketState {
            tokens: config.capacity() as f64,
            last_refill: now,
            capacity: config.capacity(),
        }
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::TokenBucket, 5, 5);
        let mut state = full(&config, 0);

        for expected_remaining in (0..5).rev() {
            let decision = decide(state, 0, &config);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            state = decision.state;
        }

        let decision = decide(state, 0, &config);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(1));
        // Five tokens at one per second
        assert_eq!(decision.reset_time, 5_000);
    }

    #[test]
    fn test_refill_over_time() {
        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::TokenBucket, 2, 1);
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill: 0,
            capacity: 2,
        };

        // Half a second at two tokens per second refills one token
        let decision = decide(state, 500, &config);
        assert!(decision.allowed);
        assert_eq!(decision.state.tokens, 0.0);
        assert_eq!(decision.state.last_refill, 500);
    }

    #[test]
    fn test_fractional_token_is_denied() {
        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::TokenBucket, 1, 4);
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill: 0,
            capacity: 1,
        };

        // 0.5 tokens after two seconds at 0.25/s
        let decision = decide(state, 2_000, &config);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(2));
        assert_eq!(decision.state.tokens, 0.5);
    }

    #[test]
    fn test_tokens_never_leave_bounds() {
        let config: RateLimitConfig =
            RateLimitConfig::new(Algorithm::TokenBucket, 3, 1).with_burst(4);
        let mut state = full(&config, 0);
        let mut now = 0;

        for step in 0..200u64 {
            // Irregular gaps, including long idle periods
            now += (step * 37) % 1_300;
            state = decide(state, now, &config).state;
            assert!(state.tokens >= 0.0, "tokens dropped below zero at step {}", step);
            assert!(state.tokens <= 4.0, "tokens exceeded capacity at step {}", step);
        }
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let config: RateLimitConfig = RateLimitConfig::new(Algorithm::TokenBucket, 1, 1);
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill: 10_000,
            capacity: 1,
        };

        let decision = decide(state, 9_000, &config);
        assert!(!decision.allowed);
        assert_eq!(decision.state.last_refill, 10_000);
    }
}
