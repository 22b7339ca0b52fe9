//! Retry backoff with jitter (`next_attempt_at = now +
//! min(base·2^retries, max_backoff) · (1 ± jitter)`), following the
//! exponential-backoff shape `RetryStrategy::execute_simple` uses in the
//! retrieved resilience example.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_ms: 500,
            max_backoff_ms: 60_000,
            jitter_fraction: 0.2,
        }
    }
}

/// Computes the next attempt timestamp for a message about to be
/// requeued after its `retries`'th failure.
pub fn next_attempt_at(now: u64, retries: u32, config: &BackoffConfig) -> u64 {
    let exp = config.base_ms.saturating_mul(1u64.checked_shl(retries).unwrap_or(u64::MAX).max(1));
    let backoff = exp.min(config.max_backoff_ms);
    let jitter = config.jitter_fraction.clamp(0.0, 1.0);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    let jittered = (backoff as f64 * factor).round().max(0.0) as u64;
    now + jittered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonically_bounded_by_max() {
        let config = BackoffConfig {
            base_ms: 100,
            max_backoff_ms: 1_000,
            jitter_fraction: 0.0,
        };
        for retries in 0..10 {
            let at = next_attempt_at(0, retries, &config);
            assert!(at <= 1_000);
        }
    }

    #[test]
    fn zero_retries_is_roughly_base() {
        let config = BackoffConfig {
            base_ms: 200,
            max_backoff_ms: 10_000,
            jitter_fraction: 0.0,
        };
        assert_eq!(next_attempt_at(1_000, 0, &config), 1_200);
    }
}
