use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use loadtest_stats::AggregatedStats;

/// Live terminal dashboard: a spinner-driven summary line plus a handful of
/// single-line gauges, all parented under one [`MultiProgress`] so they
/// redraw together instead of scrolling the terminal.
pub struct Dashboard {
    multi: MultiProgress,
    clients_bar: ProgressBar,
    throughput_bar: ProgressBar,
    health_bar: ProgressBar,
    errors_bar: ProgressBar,
}

impl Dashboard {
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let clients_bar = multi.add(ProgressBar::new_spinner());
        clients_bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        clients_bar.enable_steady_tick(std::time::Duration::from_millis(120));

        let throughput_bar = multi.add(ProgressBar::new_spinner());
        throughput_bar.set_style(ProgressStyle::default_spinner().template("  {msg}").unwrap());

        let health_bar = multi.add(ProgressBar::new_spinner());
        health_bar.set_style(ProgressStyle::default_spinner().template("  {msg}").unwrap());

        let errors_bar = multi.add(ProgressBar::new_spinner());
        errors_bar.set_style(ProgressStyle::default_spinner().template("  {msg}").unwrap());

        Self {
            multi,
            clients_bar,
            throughput_bar,
            health_bar,
            errors_bar,
        }
    }

    pub fn render(&self, snapshot: &AggregatedStats) {
        self.clients_bar.set_message(format!(
            "clients: {} active / {} total, {} stalled, {} degraded",
            snapshot.active_clients,
            snapshot.total_clients,
            snapshot.stalled_clients,
            snapshot.clients_degraded,
        ));
        self.throughput_bar.set_message(format!(
            "throughput: {:.2} MB/s ({:.2} MB/s overall), {:.1} req/s",
            snapshot.instantaneous_bytes_per_sec / 1_000_000.0,
            snapshot.overall_bytes_per_sec / 1_000_000.0,
            snapshot.instantaneous_requests_per_sec,
        ));
        self.health_bar.set_message(format!(
            "speed: avg {:.2}x ({} above, {} below, {} unknown), max drift {:.1}s",
            snapshot.average_speed,
            snapshot.clients_above_realtime,
            snapshot.clients_below_realtime,
            snapshot.clients_with_unknown_speed,
            snapshot.max_drift.as_secs_f64(),
        ));
        let total_errors: u64 = snapshot.http_errors.values().sum();
        self.errors_bar.set_message(format!(
            "errors: {total_errors} http, {} reconnects, {} timeouts, {} dropped lines",
            snapshot.reconnections, snapshot.timeouts, snapshot.total_lines_dropped,
        ));
    }

    pub fn finish(&self, message: impl Into<String>) {
        let message = message.into();
        self.clients_bar.finish_with_message(message);
        self.throughput_bar.finish_and_clear();
        self.health_bar.finish_and_clear();
        self.errors_bar.finish_and_clear();
    }

    /// Suspend the dashboard's redraws for the duration of `f`, so other
    /// output (e.g. the final summary) doesn't interleave with it.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}
