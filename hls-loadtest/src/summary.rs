use std::time::Duration;

use loadtest_stats::AggregatedStats;

/// Render the plain-text exit report printed once a run finishes.
pub fn render(snapshot: &AggregatedStats, run_duration: Duration) -> String {
    let mut out = String::new();
    out.push_str("===== hls-loadtest summary =====\n");
    out.push_str(&format!("run duration: {:.1}s\n", run_duration.as_secs_f64()));
    out.push_str(&format!(
        "clients: {} total, {} active at exit, {} stalled, {} degraded\n",
        snapshot.total_clients, snapshot.active_clients, snapshot.stalled_clients, snapshot.clients_degraded,
    ));
    out.push('\n');

    out.push_str("requests:\n");
    out.push_str(&format!(
        "  manifest={} segment={} init={} unknown={}\n",
        snapshot.manifest_requests, snapshot.segment_requests, snapshot.init_requests, snapshot.unknown_requests,
    ));
    out.push_str(&format!(
        "  reconnections={} timeouts={}\n",
        snapshot.reconnections, snapshot.timeouts,
    ));

    if !snapshot.http_errors.is_empty() {
        out.push_str("  http errors:\n");
        let mut codes: Vec<_> = snapshot.http_errors.iter().collect();
        codes.sort_by_key(|(code, _)| **code);
        for (code, count) in codes {
            out.push_str(&format!("    {code}: {count}\n"));
        }
    }
    out.push('\n');

    out.push_str("throughput:\n");
    out.push_str(&format!(
        "  total bytes={} overall={:.2} MB/s\n",
        snapshot.bytes,
        snapshot.overall_bytes_per_sec / 1_000_000.0,
    ));
    out.push_str(&format!(
        "  overall requests/s={:.2}\n",
        snapshot.overall_requests_per_sec,
    ));
    out.push('\n');

    out.push_str("health:\n");
    out.push_str(&format!(
        "  average speed={:.2}x (above={} below={} unknown={})\n",
        snapshot.average_speed,
        snapshot.clients_above_realtime,
        snapshot.clients_below_realtime,
        snapshot.clients_with_unknown_speed,
    ));
    out.push_str(&format!(
        "  average drift={:.2}s max drift={:.2}s ({} clients above threshold)\n",
        snapshot.average_drift.as_secs_f64(),
        snapshot.max_drift.as_secs_f64(),
        snapshot.clients_with_high_drift,
    ));
    out.push_str(&format!(
        "  pipeline lines read={} dropped={} peak drop rate={:.4}\n",
        snapshot.total_lines_read, snapshot.total_lines_dropped, snapshot.peak_drop_rate,
    ));
    out.push('\n');

    out.push_str("uptime (s): ");
    out.push_str(&format!(
        "min={:.1} avg={:.1} max={:.1} p50={:.1} p95={:.1} p99={:.1}\n",
        snapshot.uptime_min.as_secs_f64(),
        snapshot.uptime_avg.as_secs_f64(),
        snapshot.uptime_max.as_secs_f64(),
        snapshot.uptime_percentiles.p50.as_secs_f64(),
        snapshot.uptime_percentiles.p95.as_secs_f64(),
        snapshot.uptime_percentiles.p99.as_secs_f64(),
    ));

    out.push_str("segment latency (s): ");
    out.push_str(&format!(
        "p50={:.3} p95={:.3} p99={:.3}\n",
        snapshot.segment_latency_percentiles.p50.as_secs_f64(),
        snapshot.segment_latency_percentiles.p95.as_secs_f64(),
        snapshot.segment_latency_percentiles.p99.as_secs_f64(),
    ));

    out
}
