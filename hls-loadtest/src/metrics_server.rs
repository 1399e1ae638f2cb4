use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use loadtest_proc::ClientManager;
use loadtest_stats::{AggregatedStats, StatsAggregator};
use tower_http::trace::TraceLayer;

const NAMESPACE: &str = "hls_loadtest";

pub struct MetricsState {
    pub manager: Arc<ClientManager>,
    pub aggregator: Arc<StatsAggregator>,
    pub per_client_metrics: bool,
}

pub fn router(state: Arc<MetricsState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    let clients = state.manager.snapshot();
    let aggregated = state.aggregator.aggregate(&clients);
    let mut output = String::new();
    render_aggregate(&mut output, &aggregated);

    if state.per_client_metrics {
        state.manager.for_each(|client_id, stats| {
            render_client(&mut output, client_id, &stats.summary());
        });
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        output,
    )
}

fn write_gauge(output: &mut String, name: &str, help: &str, value: f64) {
    let full_name = format!("{NAMESPACE}_{name}");
    output.push_str(&format!("# HELP {full_name} {help}\n"));
    output.push_str(&format!("# TYPE {full_name} gauge\n"));
    output.push_str(&format!("{full_name} {value}\n"));
}

fn write_counter(output: &mut String, name: &str, help: &str, value: f64) {
    let full_name = format!("{NAMESPACE}_{name}");
    output.push_str(&format!("# HELP {full_name} {help}\n"));
    output.push_str(&format!("# TYPE {full_name} counter\n"));
    output.push_str(&format!("{full_name} {value}\n"));
}

fn write_counter_with_labels(
    output: &mut String,
    name: &str,
    help: &str,
    value: f64,
    labels: &[(&str, &str)],
) {
    let full_name = format!("{NAMESPACE}_{name}");
    output.push_str(&format!("# HELP {full_name} {help}\n"));
    output.push_str(&format!("# TYPE {full_name} counter\n"));
    let labels_str = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    output.push_str(&format!("{full_name}{{{labels_str}}} {value}\n"));
}

fn write_gauge_with_labels(
    output: &mut String,
    name: &str,
    help: &str,
    value: f64,
    labels: &[(&str, &str)],
) {
    let full_name = format!("{NAMESPACE}_{name}");
    output.push_str(&format!("# HELP {full_name} {help}\n"));
    output.push_str(&format!("# TYPE {full_name} gauge\n"));
    let labels_str = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    output.push_str(&format!("{full_name}{{{labels_str}}} {value}\n"));
}

fn render_aggregate(output: &mut String, snapshot: &AggregatedStats) {
    write_gauge(output, "clients_total", "Total registered clients", snapshot.total_clients as f64);
    write_gauge(output, "clients_active", "Clients with a running subprocess", snapshot.active_clients as f64);
    write_gauge(output, "clients_stalled", "Clients currently stalled", snapshot.stalled_clients as f64);
    write_gauge(output, "clients_degraded", "Clients with peak pipeline drop rate above threshold", snapshot.clients_degraded as f64);
    write_gauge(output, "clients_high_drift", "Clients with current drift above threshold", snapshot.clients_with_high_drift as f64);

    write_counter(output, "manifest_requests_total", "Total manifest requests observed", snapshot.manifest_requests as f64);
    write_counter(output, "segment_requests_total", "Total segment requests observed", snapshot.segment_requests as f64);
    write_counter(output, "init_requests_total", "Total init segment requests observed", snapshot.init_requests as f64);
    write_counter(output, "unknown_requests_total", "Total unclassified requests observed", snapshot.unknown_requests as f64);
    write_counter(output, "bytes_total", "Total bytes fetched across all clients", snapshot.bytes as f64);
    write_counter(output, "reconnections_total", "Total reconnect events observed", snapshot.reconnections as f64);
    write_counter(output, "timeouts_total", "Total timeout events observed", snapshot.timeouts as f64);

    for (code, count) in &snapshot.http_errors {
        write_counter_with_labels(
            output,
            "http_errors_total",
            "Total HTTP error responses by status code",
            *count as f64,
            &[("code", &code.to_string())],
        );
    }

    write_gauge(output, "bytes_per_second_overall", "Overall byte rate since run start", snapshot.overall_bytes_per_sec);
    write_gauge(output, "bytes_per_second_instantaneous", "Byte rate since the previous scrape", snapshot.instantaneous_bytes_per_sec);
    write_gauge(output, "requests_per_second_overall", "Overall request rate since run start", snapshot.overall_requests_per_sec);
    write_gauge(output, "requests_per_second_instantaneous", "Request rate since the previous scrape", snapshot.instantaneous_requests_per_sec);

    write_gauge(output, "clients_above_realtime", "Clients fetching faster than playback speed", snapshot.clients_above_realtime as f64);
    write_gauge(output, "clients_below_realtime", "Clients fetching slower than playback speed", snapshot.clients_below_realtime as f64);
    write_gauge(output, "clients_unknown_speed", "Clients with no speed sample yet", snapshot.clients_with_unknown_speed as f64);
    write_gauge(output, "average_speed", "Average reported speed multiplier", snapshot.average_speed);
    write_gauge(output, "average_drift_seconds", "Average wall-clock vs playback drift", snapshot.average_drift.as_secs_f64());
    write_gauge(output, "max_drift_seconds", "Maximum observed drift across all clients", snapshot.max_drift.as_secs_f64());

    write_counter(output, "pipeline_lines_read_total", "Total output lines read from client subprocesses", snapshot.total_lines_read as f64);
    write_counter(output, "pipeline_lines_dropped_total", "Total output lines dropped due to a full channel", snapshot.total_lines_dropped as f64);
    write_gauge(output, "pipeline_peak_drop_rate", "Highest peak drop rate observed across all clients", snapshot.peak_drop_rate);

    write_gauge(output, "uptime_seconds_min", "Minimum client uptime", snapshot.uptime_min.as_secs_f64());
    write_gauge(output, "uptime_seconds_max", "Maximum client uptime", snapshot.uptime_max.as_secs_f64());
    write_gauge(output, "uptime_seconds_avg", "Average client uptime", snapshot.uptime_avg.as_secs_f64());

    write_percentiles(output, "uptime_seconds", "client uptime", &snapshot.uptime_percentiles, |d| d.as_secs_f64());
    write_percentiles(output, "segment_latency_seconds", "per-segment fetch latency", &snapshot.segment_latency_percentiles, |d| d.as_secs_f64());
}

fn write_percentiles(
    output: &mut String,
    name: &str,
    help_subject: &str,
    percentiles: &loadtest_stats::Percentiles,
    to_f64: impl Fn(std::time::Duration) -> f64,
) {
    for (quantile, value) in [
        ("0.25", percentiles.p25),
        ("0.5", percentiles.p50),
        ("0.75", percentiles.p75),
        ("0.95", percentiles.p95),
        ("0.99", percentiles.p99),
    ] {
        write_gauge_with_labels(
            output,
            name,
            &format!("Quantile distribution of {help_subject}"),
            to_f64(value),
            &[("quantile", quantile)],
        );
    }
}

fn render_client(output: &mut String, client_id: u64, summary: &loadtest_stats::ClientSummary) {
    let id = client_id.to_string();
    write_gauge_with_labels(output, "client_uptime_seconds", "Per-client uptime", summary.uptime.as_secs_f64(), &[("client_id", &id)]);
    write_counter_with_labels(output, "client_bytes_total", "Per-client total bytes fetched", summary.total_bytes as f64, &[("client_id", &id)]);
    write_gauge_with_labels(output, "client_speed", "Per-client reported speed multiplier", summary.speed, &[("client_id", &id)]);
    write_gauge_with_labels(output, "client_stalled", "Whether this client is currently stalled", if summary.is_stalled { 1.0 } else { 0.0 }, &[("client_id", &id)]);
    write_gauge_with_labels(output, "client_drift_seconds", "Per-client current drift", summary.current_drift.as_secs_f64(), &[("client_id", &id)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadtest_stats::ClientStats;
    use std::sync::Arc as StdArc;

    #[test]
    fn renders_aggregate_metrics_as_prometheus_text() {
        let aggregator = StatsAggregator::new();
        let stats = StdArc::new(ClientStats::new(0));
        stats.on_process_start();
        stats.update_current_bytes(1024);
        let snapshot = aggregator.aggregate(&[(true, stats)]);
        let mut output = String::new();
        render_aggregate(&mut output, &snapshot);
        assert!(output.contains("hls_loadtest_clients_total 1"));
        assert!(output.contains("# TYPE hls_loadtest_bytes_total counter"));
    }

    #[test]
    fn renders_per_client_metrics_with_label() {
        let stats = ClientStats::new(7);
        stats.on_process_start();
        let mut output = String::new();
        render_client(&mut output, 7, &stats.summary());
        assert!(output.contains("client_id=\"7\""));
    }
}
