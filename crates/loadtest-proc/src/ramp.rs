use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RampConfig;

/// Emits client ids `0..target_clients` at a jittered rate, stopping early
/// if cancelled. Never retries a start that the caller reports as failed;
/// ramp-up only decides *when* to hand out the next id.
pub struct RampScheduler {
    config: RampConfig,
}

impl RampScheduler {
    pub fn new(config: RampConfig) -> Self {
        Self { config }
    }

    /// Drive `on_tick(client_id)` for every id in order, pacing by
    /// `rate_per_sec` with up to `jitter` of additional random delay between
    /// ticks. Returns the number of ids actually emitted before completion
    /// or cancellation.
    pub async fn run<F>(&self, token: CancellationToken, mut on_tick: F) -> u64
    where
        F: FnMut(u64),
    {
        if self.config.target_clients == 0 {
            return 0;
        }

        let base_interval = if self.config.rate_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / self.config.rate_per_sec)
        } else {
            Duration::ZERO
        };

        for client_id in 0..self.config.target_clients {
            if token.is_cancelled() {
                debug!(client_id, "ramp cancelled before emitting");
                return client_id;
            }
            on_tick(client_id);

            if client_id + 1 == self.config.target_clients {
                break;
            }

            let delay = self.next_delay(base_interval);
            if delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return client_id + 1,
                }
            }
        }

        self.config.target_clients
    }

    fn next_delay(&self, base_interval: Duration) -> Duration {
        if self.config.jitter.is_zero() {
            return base_interval;
        }
        let jitter_ms = rand::rng().random_range(0..=self.config.jitter.as_millis() as u64);
        base_interval + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn emits_every_client_id_in_order() {
        let scheduler = RampScheduler::new(RampConfig {
            target_clients: 5,
            rate_per_sec: 100.0,
            jitter: Duration::from_millis(0),
        });
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let emitted = scheduler
            .run(CancellationToken::new(), move |id| seen_clone.lock().push(id))
            .await;
        assert_eq!(emitted, 5);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn zero_target_emits_nothing() {
        let scheduler = RampScheduler::new(RampConfig {
            target_clients: 0,
            rate_per_sec: 10.0,
            jitter: Duration::from_millis(0),
        });
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        let emitted = scheduler
            .run(CancellationToken::new(), move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            })
            .await;
        assert_eq!(emitted, 0);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_ramp_early() {
        let scheduler = RampScheduler::new(RampConfig {
            target_clients: 1000,
            rate_per_sec: 1.0,
            jitter: Duration::from_millis(0),
        });
        let token = CancellationToken::new();
        token.cancel();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        let emitted = scheduler
            .run(token, move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            })
            .await;
        assert_eq!(emitted, 0);
    }
}
