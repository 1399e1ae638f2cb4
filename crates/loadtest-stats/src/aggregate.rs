use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client_stats::{ClientStats, ClientSummary};
use crate::digest::{LatencyDigest, Percentiles};

/// Immutable point-in-time rollup across every registered client.
///
/// Produced by [`StatsAggregator::aggregate`] and never mutated afterwards;
/// consumers (the Prometheus exporter, the dashboard, the exit summary) all
/// read from the same snapshot instance.
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    pub timestamp: Instant,
    pub total_clients: usize,
    pub active_clients: usize,
    pub stalled_clients: usize,

    pub manifest_requests: u64,
    pub segment_requests: u64,
    pub init_requests: u64,
    pub unknown_requests: u64,
    pub bytes: u64,
    pub http_errors: HashMap<u16, u64>,
    pub reconnections: u64,
    pub timeouts: u64,

    pub overall_bytes_per_sec: f64,
    pub instantaneous_bytes_per_sec: f64,
    pub overall_requests_per_sec: f64,
    pub instantaneous_requests_per_sec: f64,

    pub clients_above_realtime: usize,
    pub clients_below_realtime: usize,
    pub clients_with_unknown_speed: usize,
    pub average_speed: f64,
    pub average_drift: Duration,
    pub max_drift: Duration,
    pub clients_with_high_drift: usize,

    pub total_lines_read: u64,
    pub total_lines_dropped: u64,
    pub clients_degraded: usize,
    pub peak_drop_rate: f64,

    pub uptime_min: Duration,
    pub uptime_max: Duration,
    pub uptime_avg: Duration,
    pub uptime_percentiles: Percentiles,
    pub segment_latency_percentiles: Percentiles,
}

/// Threshold above which a client is considered to have degraded (i.e.
/// partially unreliable) metrics due to dropped pipeline lines.
pub const DEGRADED_DROP_RATE_THRESHOLD: f64 = 0.05;
/// Drift above which a client is flagged as falling far behind the live edge.
pub const HIGH_DRIFT_THRESHOLD: Duration = Duration::from_secs(10);

struct PreviousSnapshot {
    at: Instant,
    bytes: u64,
    requests: u64,
}

/// Periodically sums every registered client's atomics into an
/// [`AggregatedStats`] snapshot without ever holding a global lock across the
/// scan: each `ClientStats` is read field-by-field with relaxed atomic loads,
/// so the result is point-in-time-approximate but never internally torn.
pub struct StatsAggregator {
    start: Instant,
    previous: Mutex<Option<PreviousSnapshot>>,
    total_bytes_ever: AtomicU64,
    degraded_drop_rate_threshold: f64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::with_drop_rate_threshold(DEGRADED_DROP_RATE_THRESHOLD)
    }

    /// Build an aggregator using a caller-supplied degraded-client drop-rate
    /// threshold rather than the default, matching the config's
    /// `dropRateThreshold` knob.
    pub fn with_drop_rate_threshold(degraded_drop_rate_threshold: f64) -> Self {
        Self {
            start: Instant::now(),
            previous: Mutex::new(None),
            total_bytes_ever: AtomicU64::new(0),
            degraded_drop_rate_threshold,
        }
    }

    /// Sum the given clients' summaries into a fresh snapshot. `clients`
    /// pairs each stats handle with whether its supervisor currently has a
    /// live subprocess (typically `ClientManager::snapshot()`'s output);
    /// `activeClients` counts that flag rather than inferring it from the
    /// stats themselves, since a client mid-backoff has nonzero uptime but
    /// no running subprocess. Clients that were just registered or just
    /// torn down may or may not appear in any given call, which is
    /// acceptable.
    pub fn aggregate(&self, clients: &[(bool, Arc<ClientStats>)]) -> AggregatedStats {
        let now = Instant::now();
        let mut manifest_requests = 0u64;
        let mut segment_requests = 0u64;
        let mut init_requests = 0u64;
        let mut unknown_requests = 0u64;
        let mut bytes = 0u64;
        let mut http_errors: HashMap<u16, u64> = HashMap::new();
        let mut reconnections = 0u64;
        let mut timeouts = 0u64;

        let mut stalled_clients = 0usize;
        let mut clients_above_realtime = 0usize;
        let mut clients_below_realtime = 0usize;
        let mut clients_with_unknown_speed = 0usize;
        let mut speed_sum = 0f64;
        let mut speed_samples = 0usize;
        let mut drift_sum = Duration::ZERO;
        let mut max_drift = Duration::ZERO;
        let mut clients_with_high_drift = 0usize;

        let mut total_lines_read = 0u64;
        let mut total_lines_dropped = 0u64;
        let mut clients_degraded = 0usize;
        let mut peak_drop_rate = 0f64;

        let mut uptime_min = Duration::MAX;
        let mut uptime_max = Duration::ZERO;
        let mut uptime_sum = Duration::ZERO;
        let mut uptime_digest = LatencyDigest::new();
        let mut segment_digest = LatencyDigest::new();

        let summaries: Vec<ClientSummary> = clients.iter().map(|(_, c)| c.summary()).collect();
        let active_clients = clients.iter().filter(|(running, _)| *running).count();

        for summary in &summaries {
            manifest_requests += summary.manifest_requests;
            segment_requests += summary.segment_requests;
            init_requests += summary.init_requests;
            unknown_requests += summary.unknown_requests;
            bytes += summary.total_bytes;
            reconnections += summary.reconnections;
            timeouts += summary.timeouts;
            for (code, count) in &summary.http_errors {
                *http_errors.entry(*code).or_insert(0) += count;
            }

            if summary.is_stalled {
                stalled_clients += 1;
            }

            if summary.speed <= 0.0 {
                clients_with_unknown_speed += 1;
            } else {
                speed_sum += summary.speed;
                speed_samples += 1;
                if summary.speed >= 1.0 {
                    clients_above_realtime += 1;
                } else {
                    clients_below_realtime += 1;
                }
            }

            drift_sum += summary.current_drift;
            max_drift = max_drift.max(summary.max_drift);
            if summary.current_drift > HIGH_DRIFT_THRESHOLD {
                clients_with_high_drift += 1;
            }

            let read = summary.progress_lines_read + summary.stderr_lines_read;
            let dropped = summary.progress_lines_dropped + summary.stderr_lines_dropped;
            total_lines_read += read;
            total_lines_dropped += dropped;
            if summary.peak_drop_rate > self.degraded_drop_rate_threshold {
                clients_degraded += 1;
            }
            peak_drop_rate = peak_drop_rate.max(summary.peak_drop_rate);

            uptime_min = uptime_min.min(summary.uptime);
            uptime_max = uptime_max.max(summary.uptime);
            uptime_sum += summary.uptime;
            uptime_digest.record(summary.uptime);
            segment_digest.merge(&summary.segment_latency_digest);
        }

        let total_clients = summaries.len();
        if total_clients == 0 {
            uptime_min = Duration::ZERO;
        }
        let uptime_avg = if total_clients > 0 {
            uptime_sum / total_clients as u32
        } else {
            Duration::ZERO
        };
        let average_speed = if speed_samples > 0 {
            speed_sum / speed_samples as f64
        } else {
            0.0
        };
        let average_drift = if total_clients > 0 {
            drift_sum / total_clients as u32
        } else {
            Duration::ZERO
        };

        let requests_total = manifest_requests + segment_requests + init_requests + unknown_requests;
        self.total_bytes_ever.store(bytes, Ordering::Relaxed);

        let elapsed_since_start = self.start.elapsed().as_secs_f64().max(f64::EPSILON);
        let overall_bytes_per_sec = bytes as f64 / elapsed_since_start;
        let overall_requests_per_sec = requests_total as f64 / elapsed_since_start;

        let mut previous = self.previous.lock();
        let (instantaneous_bytes_per_sec, instantaneous_requests_per_sec) = match previous.as_ref() {
            Some(prev) => {
                let dt = now.saturating_duration_since(prev.at).as_secs_f64().max(f64::EPSILON);
                (
                    (bytes.saturating_sub(prev.bytes)) as f64 / dt,
                    (requests_total.saturating_sub(prev.requests)) as f64 / dt,
                )
            }
            None => (overall_bytes_per_sec, overall_requests_per_sec),
        };
        *previous = Some(PreviousSnapshot {
            at: now,
            bytes,
            requests: requests_total,
        });
        drop(previous);

        AggregatedStats {
            timestamp: now,
            total_clients,
            active_clients,
            stalled_clients,
            manifest_requests,
            segment_requests,
            init_requests,
            unknown_requests,
            bytes,
            http_errors,
            reconnections,
            timeouts,
            overall_bytes_per_sec,
            instantaneous_bytes_per_sec,
            overall_requests_per_sec,
            instantaneous_requests_per_sec,
            clients_above_realtime,
            clients_below_realtime,
            clients_with_unknown_speed,
            average_speed,
            average_drift,
            max_drift,
            clients_with_high_drift,
            total_lines_read,
            total_lines_dropped,
            clients_degraded,
            peak_drop_rate,
            uptime_min,
            uptime_max,
            uptime_avg,
            uptime_percentiles: uptime_digest.percentiles(),
            segment_latency_percentiles: segment_digest.percentiles(),
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_produces_zeroed_snapshot() {
        let aggregator = StatsAggregator::new();
        let snapshot = aggregator.aggregate(&[]);
        assert_eq!(snapshot.total_clients, 0);
        assert_eq!(snapshot.bytes, 0);
        assert_eq!(snapshot.uptime_min, Duration::ZERO);
    }

    #[test]
    fn sums_across_clients() {
        let a = Arc::new(ClientStats::new(1));
        let b = Arc::new(ClientStats::new(2));
        a.on_process_start();
        a.update_current_bytes(1000);
        b.on_process_start();
        b.update_current_bytes(2000);
        a.record_http_error(404);
        b.record_http_error(404);

        let aggregator = StatsAggregator::new();
        let snapshot = aggregator.aggregate(&[(true, a), (true, b)]);
        assert_eq!(snapshot.total_clients, 2);
        assert_eq!(snapshot.active_clients, 2);
        assert_eq!(snapshot.bytes, 3000);
        assert_eq!(snapshot.http_errors.get(&404), Some(&2));
    }

    #[test]
    fn active_clients_reflects_running_flag_not_uptime() {
        let a = Arc::new(ClientStats::new(1));
        let b = Arc::new(ClientStats::new(2));

        let aggregator = StatsAggregator::new();
        let snapshot = aggregator.aggregate(&[(true, a), (false, b)]);
        assert_eq!(snapshot.total_clients, 2);
        assert_eq!(snapshot.active_clients, 1);
    }

    #[test]
    fn speed_buckets_partition_clients() {
        let a = Arc::new(ClientStats::new(1));
        a.update_speed(1.5);
        let b = Arc::new(ClientStats::new(2));
        b.update_speed(0.5);
        let c = Arc::new(ClientStats::new(3));

        let aggregator = StatsAggregator::new();
        let snapshot = aggregator.aggregate(&[(true, a), (true, b), (true, c)]);
        assert_eq!(snapshot.clients_above_realtime, 1);
        assert_eq!(snapshot.clients_below_realtime, 1);
        assert_eq!(snapshot.clients_with_unknown_speed, 1);
        assert_eq!(
            snapshot.clients_above_realtime
                + snapshot.clients_below_realtime
                + snapshot.clients_with_unknown_speed,
            snapshot.total_clients
        );
    }

    #[test]
    fn exact_realtime_speed_counts_as_above_not_dropped() {
        let a = Arc::new(ClientStats::new(1));
        a.update_speed(1.0);

        let aggregator = StatsAggregator::new();
        let snapshot = aggregator.aggregate(&[(true, a)]);
        assert_eq!(snapshot.clients_above_realtime, 1);
        assert_eq!(snapshot.clients_below_realtime, 0);
        assert_eq!(snapshot.clients_with_unknown_speed, 0);
        assert_eq!(
            snapshot.clients_above_realtime
                + snapshot.clients_below_realtime
                + snapshot.clients_with_unknown_speed,
            snapshot.total_clients
        );
    }

    #[test]
    fn instantaneous_rate_uses_delta_from_previous_call() {
        let a = Arc::new(ClientStats::new(1));
        a.on_process_start();
        a.update_current_bytes(1000);

        let aggregator = StatsAggregator::new();
        let _first = aggregator.aggregate(&[(true, a.clone())]);

        std::thread::sleep(Duration::from_millis(20));
        a.update_current_bytes(2000);
        let second = aggregator.aggregate(&[(true, a)]);
        assert!(second.instantaneous_bytes_per_sec > 0.0);
    }
}
