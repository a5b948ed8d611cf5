//! Retry classification and exponential backoff for broker errors.

use crate::error::BrokerError;
use rand::Rng;
use std::time::Duration;

pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Fraction of the delay added as random jitter, at most.
pub const RETRY_JITTER_RATIO: f64 = 0.25;

/// Whether attempt number `attempt` (1-based) should be followed by another.
pub fn should_retry(error: &BrokerError, attempt: u32, max_attempts: u32) -> bool {
    error.is_retryable() && attempt < max_attempts
}

/// Delay before the attempt after `attempt` (1-based), without jitter.
pub fn base_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ms = RETRY_BASE_DELAY_MS
        .saturating_mul(1u64 << exponent)
        .min(RETRY_MAX_DELAY_MS);
    Duration::from_millis(ms)
}

/// Exponential backoff capped at 30 s, plus up to 25% jitter.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = base_delay(attempt);
    let jitter_ms = (base.as_millis() as f64 * RETRY_JITTER_RATIO) as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_quota_never_retried() {
        let err = BrokerError::QuotaExceeded {
            used: 1000,
            quota: 1000,
            resets_at: Utc::now(),
        };
        assert!(!should_retry(&err, 1, 5));
    }

    #[test]
    fn test_transient_retried_until_max() {
        let err = BrokerError::Timeout { waited_ms: 30_000 };
        assert!(should_retry(&err, 1, 3));
        assert!(should_retry(&err, 2, 3));
        assert!(!should_retry(&err, 3, 3));

        let err = BrokerError::QueueFull { capacity: 5 };
        assert!(should_retry(&err, 1, 2));
        assert!(should_retry(&BrokerError::Connection("refused".into()), 1, 2));
    }

    #[test]
    fn test_base_delay_doubles_then_caps() {
        assert_eq!(base_delay(1), Duration::from_millis(1_000));
        assert_eq!(base_delay(2), Duration::from_millis(2_000));
        assert_eq!(base_delay(5), Duration::from_millis(16_000));
        assert_eq!(base_delay(6), Duration::from_millis(30_000));
        assert_eq!(base_delay(60), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounds() {
        for attempt in 1..8 {
            let base = base_delay(attempt);
            let delay = retry_delay(attempt);
            assert!(delay >= base);
            assert!(delay.as_millis() <= base.as_millis() * 5 / 4);
        }
    }
}
