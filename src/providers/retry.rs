//! Retry policy shared by every adapter: bounded attempts, exponential
//! backoff with jitter, retrying only transient conditions. Grounded in
//! the forwarding layer's `should_retry`/`calculate_retry_delay` shape.

use rand::Rng;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 200;
const MAX_DELAY_MS: u64 = 5_000;

/// Network errors and 408/429/5xx are retryable; other 4xx are not.
pub fn should_retry(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Exponential backoff with full jitter, capped at `MAX_DELAY_MS`.
/// `attempt` is 1-indexed (the attempt number that just failed).
pub fn calculate_retry_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(MAX_DELAY_MS);
    let jittered = rand::thread_rng().gen_range(0..=capped).max(1);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(should_retry(408));
        assert!(should_retry(429));
        assert!(should_retry(500));
        assert!(should_retry(503));
        assert!(!should_retry(400));
        assert!(!should_retry(401));
        assert!(!should_retry(404));
    }

    #[test]
    fn delay_is_bounded() {
        for attempt in 1..8 {
            let d = calculate_retry_delay(attempt);
            assert!(d.as_millis() as u64 <= MAX_DELAY_MS);
            assert!(d.as_millis() >= 1);
        }
    }
}
