use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::digest::LatencyDigest;

/// Number of slots in the HTTP status-code counter array: one per code in
/// `400..=599` plus a trailing "other" bucket for anything outside that range.
const HTTP_ERROR_SLOTS: usize = 201;
const OTHER_SLOT: usize = 200;
const SEGMENT_RING_LEN: usize = 100;

/// Per-client counters and gauges updated by the progress and event parsers.
///
/// Every field is either a plain atomic or (for the latency digest) a small
/// lock guarding an O(log n) histogram update. No lock is ever held across
/// I/O: a parser calls one of the `record_*`/`update_*` methods per line and
/// returns immediately.
///
/// A `ClientStats` lives for the whole run, including across subprocess
/// restarts for the same client id, so its counters are cumulative.
#[derive(Debug)]
pub struct ClientStats {
    client_id: u64,
    start_time: Instant,

    manifest_requests: AtomicU64,
    segment_requests: AtomicU64,
    init_requests: AtomicU64,
    unknown_requests: AtomicU64,

    bytes_from_previous_runs: AtomicU64,
    current_process_bytes: AtomicU64,

    reconnections: AtomicU64,
    timeouts: AtomicU64,
    sequence_skips: AtomicU64,

    http_errors: Box<[AtomicU64; HTTP_ERROR_SLOTS]>,

    /// Bit pattern of the last-reported playback speed multiplier (`f64`).
    /// Zero means "unknown"; never written as a literal zero bit pattern
    /// because `0.0f64.to_bits() == 0`, which is indistinguishable from
    /// "unknown" by design (both read as "no speed data yet").
    speed_bits: AtomicU64,
    /// Nanoseconds since `start_time` at which speed first dropped below the
    /// stall threshold; zero means "not currently stalled".
    stall_since_nanos: AtomicU64,

    last_playback_nanos: AtomicU64,
    current_drift_nanos: AtomicI64,
    max_drift_nanos: AtomicI64,

    segment_latency: Mutex<LatencyDigest>,
    segment_sizes: SegmentRing,

    progress_lines_read: AtomicU64,
    progress_lines_dropped: AtomicU64,
    stderr_lines_read: AtomicU64,
    stderr_lines_dropped: AtomicU64,
    peak_drop_rate_bits: AtomicU64,
}

/// Stall is declared once speed has stayed below this multiplier.
pub const STALL_SPEED_THRESHOLD: f64 = 0.9;
/// ...for at least this long.
pub const STALL_GRACE: Duration = Duration::from_secs(5);

impl ClientStats {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            start_time: Instant::now(),
            manifest_requests: AtomicU64::new(0),
            segment_requests: AtomicU64::new(0),
            init_requests: AtomicU64::new(0),
            unknown_requests: AtomicU64::new(0),
            bytes_from_previous_runs: AtomicU64::new(0),
            current_process_bytes: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            sequence_skips: AtomicU64::new(0),
            http_errors: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            speed_bits: AtomicU64::new(0),
            stall_since_nanos: AtomicU64::new(0),
            last_playback_nanos: AtomicU64::new(0),
            current_drift_nanos: AtomicI64::new(0),
            max_drift_nanos: AtomicI64::new(0),
            segment_latency: Mutex::new(LatencyDigest::new()),
            segment_sizes: SegmentRing::new(),
            progress_lines_read: AtomicU64::new(0),
            progress_lines_dropped: AtomicU64::new(0),
            stderr_lines_read: AtomicU64::new(0),
            stderr_lines_dropped: AtomicU64::new(0),
            peak_drop_rate_bits: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn increment_manifest_requests(&self) {
        self.manifest_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_segment_requests(&self) {
        self.segment_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_init_requests(&self) {
        self.init_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unknown_requests(&self) {
        self.unknown_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sequence_skips(&self) {
        self.sequence_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an HTTP response status code. Anything outside `400..=599`
    /// lands in the trailing "other" slot rather than being rejected.
    pub fn record_http_error(&self, code: u16) {
        let idx = http_error_slot(code);
        self.http_errors[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Non-zero slots, keyed by status code with the "other" bucket
    /// surfaced under key `0`.
    pub fn http_errors(&self) -> std::collections::HashMap<u16, u64> {
        let mut out = std::collections::HashMap::new();
        for (idx, slot) in self.http_errors.iter().enumerate() {
            let count = slot.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            let code = if idx == OTHER_SLOT {
                0
            } else {
                400 + idx as u16
            };
            out.insert(code, count);
        }
        out
    }

    pub fn total_http_errors(&self) -> u64 {
        self.http_errors
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bytes seen across every subprocess run for this client.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_from_previous_runs.load(Ordering::Relaxed)
            + self.current_process_bytes.load(Ordering::Relaxed)
    }

    /// Called by the supervisor immediately before spawning a new
    /// subprocess instance. Folds whatever the previous instance reported
    /// into the carry-over total and resets the live counter, so
    /// `total_bytes` never regresses across a restart.
    pub fn on_process_start(&self) {
        let previous = self.current_process_bytes.swap(0, Ordering::Relaxed);
        self.bytes_from_previous_runs
            .fetch_add(previous, Ordering::Relaxed);
    }

    /// Apply a `total_size` reading from the current subprocess's progress
    /// stream. If the new value is smaller than what's already recorded for
    /// this process instance, the subprocess has silently restarted without
    /// the supervisor noticing (e.g. ffmpeg's own `-xerror` auto-retry) and
    /// the shortfall is folded into the carry-over so totals stay monotonic.
    pub fn update_current_bytes(&self, total_size: u64) {
        let previous = self.current_process_bytes.load(Ordering::Relaxed);
        if total_size < previous {
            self.bytes_from_previous_runs
                .fetch_add(previous, Ordering::Relaxed);
        }
        self.current_process_bytes.store(total_size, Ordering::Relaxed);
    }

    pub fn update_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
        if speed < STALL_SPEED_THRESHOLD {
            let now_nanos = self.start_time.elapsed().as_nanos() as u64;
            // Only the first dip sets the stall clock; a compare_exchange
            // against the "unset" sentinel keeps this a single atomic op.
            let _ = self.stall_since_nanos.compare_exchange(
                0,
                now_nanos.max(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        } else {
            self.stall_since_nanos.store(0, Ordering::Relaxed);
        }
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    pub fn is_stalled(&self, now: Instant) -> bool {
        let since = self.stall_since_nanos.load(Ordering::Relaxed);
        if since == 0 {
            return false;
        }
        let stalled_at = self.start_time + Duration::from_nanos(since);
        now.saturating_duration_since(stalled_at) > STALL_GRACE
    }

    /// Feed a `out_time_us` reading. Drift is wall-clock elapsed minus
    /// reported playback position; positive drift means the client is
    /// falling behind the live edge.
    pub fn update_drift(&self, playback_micros: u64) {
        self.last_playback_nanos
            .store(playback_micros.saturating_mul(1_000), Ordering::Relaxed);
        let elapsed_nanos = self.start_time.elapsed().as_nanos() as i64;
        let playback_nanos = (playback_micros as i64).saturating_mul(1_000);
        let drift = elapsed_nanos.saturating_sub(playback_nanos);
        self.current_drift_nanos.store(drift, Ordering::Relaxed);
        self.max_drift_nanos
            .fetch_max(drift, Ordering::Relaxed);
    }

    pub fn current_drift(&self) -> Duration {
        nanos_to_duration(self.current_drift_nanos.load(Ordering::Relaxed))
    }

    pub fn max_drift(&self) -> Duration {
        nanos_to_duration(self.max_drift_nanos.load(Ordering::Relaxed))
    }

    pub fn record_segment_wall_time(&self, elapsed: Duration) {
        self.segment_latency.lock().record(elapsed);
        self.segment_sizes.push_duration(elapsed);
    }

    pub fn latency_percentiles(&self) -> crate::digest::Percentiles {
        self.segment_latency.lock().percentiles()
    }

    /// Clone of the live segment-wall-time digest, used by the aggregator to
    /// merge true per-client distributions rather than resampling a single
    /// percentile per client.
    pub fn segment_latency_digest(&self) -> LatencyDigest {
        self.segment_latency.lock().clone()
    }

    pub fn record_pipeline_stats(&self, stream: PipelineStream, read: u64, dropped: u64) {
        let (read_counter, dropped_counter) = match stream {
            PipelineStream::Progress => (&self.progress_lines_read, &self.progress_lines_dropped),
            PipelineStream::Stderr => (&self.stderr_lines_read, &self.stderr_lines_dropped),
        };
        read_counter.fetch_add(read, Ordering::Relaxed);
        dropped_counter.fetch_add(dropped, Ordering::Relaxed);

        let total_read = self.progress_lines_read.load(Ordering::Relaxed)
            + self.stderr_lines_read.load(Ordering::Relaxed);
        let total_dropped = self.progress_lines_dropped.load(Ordering::Relaxed)
            + self.stderr_lines_dropped.load(Ordering::Relaxed);
        let denom = total_read + total_dropped;
        if denom == 0 {
            return;
        }
        let rate = total_dropped as f64 / denom as f64;
        let mut current = self.peak_drop_rate_bits.load(Ordering::Relaxed);
        loop {
            if f64::from_bits(current) >= rate {
                break;
            }
            match self.peak_drop_rate_bits.compare_exchange_weak(
                current,
                rate.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn peak_drop_rate(&self) -> f64 {
        f64::from_bits(self.peak_drop_rate_bits.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every field, used by the aggregator.
    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            client_id: self.client_id,
            uptime: self.uptime(),
            manifest_requests: self.manifest_requests.load(Ordering::Relaxed),
            segment_requests: self.segment_requests.load(Ordering::Relaxed),
            init_requests: self.init_requests.load(Ordering::Relaxed),
            unknown_requests: self.unknown_requests.load(Ordering::Relaxed),
            total_bytes: self.total_bytes(),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sequence_skips: self.sequence_skips.load(Ordering::Relaxed),
            total_http_errors: self.total_http_errors(),
            http_errors: self.http_errors(),
            speed: self.speed(),
            is_stalled: self.is_stalled(Instant::now()),
            current_drift: self.current_drift(),
            max_drift: self.max_drift(),
            latency_percentiles: self.latency_percentiles(),
            segment_latency_digest: self.segment_latency_digest(),
            progress_lines_read: self.progress_lines_read.load(Ordering::Relaxed),
            progress_lines_dropped: self.progress_lines_dropped.load(Ordering::Relaxed),
            stderr_lines_read: self.stderr_lines_read.load(Ordering::Relaxed),
            stderr_lines_dropped: self.stderr_lines_dropped.load(Ordering::Relaxed),
            peak_drop_rate: self.peak_drop_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStream {
    Progress,
    Stderr,
}

fn http_error_slot(code: u16) -> usize {
    if (400..=599).contains(&code) {
        (code - 400) as usize
    } else {
        OTHER_SLOT
    }
}

fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

/// Fixed-size ring of recent segment wall-times, used only for local
/// debugging/introspection; the percentile digest is the source of truth
/// for aggregation.
#[derive(Debug)]
struct SegmentRing {
    slots: [AtomicU64; SEGMENT_RING_LEN],
    write_index: AtomicU64,
}

impl SegmentRing {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            write_index: AtomicU64::new(0),
        }
    }

    fn push_duration(&self, d: Duration) {
        let idx = self.write_index.fetch_add(1, Ordering::Relaxed) as usize % SEGMENT_RING_LEN;
        self.slots[idx].store(d.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Plain-value snapshot of a [`ClientStats`], produced by [`ClientStats::summary`].
#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub client_id: u64,
    pub uptime: Duration,
    pub manifest_requests: u64,
    pub segment_requests: u64,
    pub init_requests: u64,
    pub unknown_requests: u64,
    pub total_bytes: u64,
    pub reconnections: u64,
    pub timeouts: u64,
    pub sequence_skips: u64,
    pub total_http_errors: u64,
    pub http_errors: std::collections::HashMap<u16, u64>,
    pub speed: f64,
    pub is_stalled: bool,
    pub current_drift: Duration,
    pub max_drift: Duration,
    pub latency_percentiles: crate::digest::Percentiles,
    pub segment_latency_digest: crate::digest::LatencyDigest,
    pub progress_lines_read: u64,
    pub progress_lines_dropped: u64,
    pub stderr_lines_read: u64,
    pub stderr_lines_dropped: u64,
    pub peak_drop_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn http_error_slot_boundaries() {
        assert_eq!(http_error_slot(400), 0);
        assert_eq!(http_error_slot(599), 199);
        assert_eq!(http_error_slot(399), OTHER_SLOT);
        assert_eq!(http_error_slot(600), OTHER_SLOT);
        assert_eq!(http_error_slot(0), OTHER_SLOT);
    }

    #[test]
    fn http_error_roundtrip() {
        let stats = ClientStats::new(1);
        stats.record_http_error(404);
        stats.record_http_error(404);
        stats.record_http_error(503);
        stats.record_http_error(12);

        let errors = stats.http_errors();
        assert_eq!(errors.get(&404), Some(&2));
        assert_eq!(errors.get(&503), Some(&1));
        assert_eq!(errors.get(&0), Some(&1));
        assert_eq!(stats.total_http_errors(), 4);
        assert_eq!(errors.values().sum::<u64>(), stats.total_http_errors());
    }

    #[test]
    fn byte_accounting_monotonic_across_restart() {
        let stats = ClientStats::new(1);
        stats.on_process_start();
        stats.update_current_bytes(1000);
        stats.update_current_bytes(2000);
        assert_eq!(stats.total_bytes(), 2000);

        // subprocess restarts: supervisor calls on_process_start again
        stats.on_process_start();
        stats.update_current_bytes(500);
        assert_eq!(stats.total_bytes(), 2500);
    }

    #[test]
    fn update_current_bytes_equivalent_to_single_final_call() {
        let a = ClientStats::new(1);
        a.on_process_start();
        a.update_current_bytes(100);
        a.update_current_bytes(9000);

        let b = ClientStats::new(2);
        b.on_process_start();
        b.update_current_bytes(9000);

        assert_eq!(a.total_bytes(), b.total_bytes());
    }

    #[test]
    fn speed_below_threshold_sets_stall_clock() {
        let stats = ClientStats::new(1);
        assert!(!stats.is_stalled(Instant::now()));
        stats.update_speed(0.5);
        // hasn't been below threshold for the grace period yet
        assert!(!stats.is_stalled(Instant::now()));
        stats.update_speed(1.0);
        assert!(!stats.is_stalled(Instant::now() + STALL_GRACE * 2));
    }

    #[test]
    fn drift_tracks_max() {
        let stats = ClientStats::new(1);
        std::thread::sleep(Duration::from_millis(5));
        stats.update_drift(0);
        let first = stats.max_drift();
        assert!(first > Duration::ZERO);

        stats.update_drift(1_000_000_000);
        // playback caught up to (or past) wall clock; max shouldn't shrink
        assert!(stats.max_drift() >= first);
    }

    #[test]
    fn pipeline_drop_rate_tracks_peak() {
        let stats = ClientStats::new(1);
        stats.record_pipeline_stats(PipelineStream::Progress, 90, 10);
        let first = stats.peak_drop_rate();
        assert!((first - 0.1).abs() < 1e-9);

        stats.record_pipeline_stats(PipelineStream::Stderr, 100, 0);
        // overall rate dropped but peak must not regress
        assert!(stats.peak_drop_rate() >= first - 1e-9);
    }

    proptest! {
        #[test]
        fn prop_total_bytes_never_decreases(
            updates in prop::collection::vec(0u64..1_000_000, 1..40)
        ) {
            let stats = ClientStats::new(7);
            let mut last = 0u64;
            for (i, value) in updates.into_iter().enumerate() {
                if i % 7 == 0 {
                    stats.on_process_start();
                }
                stats.update_current_bytes(value);
                let total = stats.total_bytes();
                prop_assert!(total >= last);
                last = total;
            }
        }

        #[test]
        fn prop_http_error_slots_sum_matches_map(
            codes in prop::collection::vec(0u16..700, 1..200)
        ) {
            let stats = ClientStats::new(1);
            for code in &codes {
                stats.record_http_error(*code);
            }
            let map_sum: u64 = stats.http_errors().values().sum();
            prop_assert_eq!(map_sum, stats.total_http_errors());
            prop_assert_eq!(stats.total_http_errors(), codes.len() as u64);
        }
    }
}
