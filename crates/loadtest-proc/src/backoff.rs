use rand::RngExt;
use std::time::Duration;

/// Exponential backoff with an optional jittered component, capped so the
/// total delay never exceeds `max_delay` regardless of attempt count.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before the (0-indexed) `attempt`th restart.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let scaled = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = scaled.min(max_ms).max(0.0);
        let mut delay = Duration::from_millis(capped_ms as u64);

        if self.jitter {
            let remaining = self.max_delay.saturating_sub(delay);
            let jitter_limit_ms = (self.initial_delay.as_millis() as u64 / 2)
                .min(remaining.as_millis() as u64)
                .max(1);
            let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
            delay = (delay + Duration::from_millis(jitter_ms)).min(self.max_delay);
        }

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_respects_max_cap() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        };
        assert!(policy.delay_for_attempt(20) <= Duration::from_secs(1));
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_with_jitter_never_exceeds_max() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: true,
        };
        for attempt in 0..10 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(350));
        }
    }

    #[test]
    fn delay_with_jitter_adds_random_component() {
        let policy = BackoffPolicy::default();
        let samples: Vec<_> = (0..20).map(|_| policy.delay_for_attempt(1)).collect();
        assert!(samples.iter().any(|d| *d != samples[0]));
    }
}
