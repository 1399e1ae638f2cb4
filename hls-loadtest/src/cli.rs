use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Drive N concurrent HLS-fetching clients against a stream URL and report
/// aggregate health and throughput.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// HLS stream URL every client fetches.
    #[arg(long, env = "HLS_LOADTEST_URL")]
    pub url: String,

    /// Number of concurrent clients to ramp up to.
    #[arg(long, default_value_t = 10)]
    pub clients: u64,

    /// Clients started per second during ramp-up.
    #[arg(long, default_value_t = 1.0)]
    pub ramp_rate: f64,

    /// Maximum random jitter added between ramp-up ticks, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub ramp_jitter_ms: u64,

    /// Total run duration. Runs until interrupted if omitted.
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Path to the client binary (an ffmpeg-compatible HLS fetcher).
    #[arg(long, default_value = "ffmpeg", env = "HLS_LOADTEST_BINARY")]
    pub binary_path: PathBuf,

    /// Which rendition(s) each client fetches: all, highest, lowest, first.
    #[arg(long, default_value = "all")]
    pub variant: String,

    /// What to do if a highest/lowest variant probe fails: fallback, fail.
    #[arg(long, default_value = "fallback")]
    pub variant_probe_failure_policy: String,

    /// Rewrite the stream host to this IP literal, bypassing DNS.
    /// Requires --acknowledge-dangerous.
    #[arg(long)]
    pub ip_override: Option<IpAddr>,

    /// Required alongside --ip-override; acknowledges that TLS verification
    /// is disabled for the rewritten connection.
    #[arg(long, default_value_t = false)]
    pub acknowledge_dangerous: bool,

    /// Extra request header as "Name: Value". May be repeated.
    #[arg(long = "header", value_parser = parse_header)]
    pub custom_headers: Vec<(String, String)>,

    /// Append a unique cache-busting query parameter to every request.
    #[arg(long, default_value_t = false)]
    pub cache_bust: bool,

    /// Base user-agent string; each client appends "/client-<id>".
    #[arg(long, default_value = "hls-loadtest")]
    pub user_agent_base: String,

    /// Maximum restarts per client for the run's duration. 0 is unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_restarts: u32,

    /// Prefer a Unix-domain-socket progress channel over a stdout pipe.
    #[arg(long, default_value_t = false)]
    pub progress_via_socket: bool,

    /// Address the Prometheus metrics endpoint binds to.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub metrics_bind_address: String,

    /// Export a gauge vector per client id in addition to the aggregate.
    /// Expensive at high client counts; off by default.
    #[arg(long, default_value_t = false)]
    pub per_client_metrics: bool,

    /// Disable the terminal dashboard (useful when piping output).
    #[arg(long, default_value_t = false)]
    pub no_dashboard: bool,

    /// Write every raw subprocess stdout/stderr line to this file for
    /// post-mortem debugging.
    #[arg(long)]
    pub debug_event_log: Option<PathBuf>,

    /// Skip the startup preflight check against the stream URL.
    #[arg(long, default_value_t = false)]
    pub skip_preflight: bool,

    /// tracing-subscriber EnvFilter directive, e.g. "info,hls_loadtest=debug".
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Shorthand for --log-filter debug.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Shorthand for --log-filter error.
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,

    /// Bounded line capacity of each client's stderr/event pipeline.
    /// Feeding a full channel drops the line rather than blocking ffmpeg.
    #[arg(long, default_value_t = 256)]
    pub stderr_buffer_per_client: usize,

    /// Bounded line capacity of each client's progress pipeline.
    #[arg(long, default_value_t = 64)]
    pub progress_buffer_per_client: usize,

    /// Initial restart backoff delay, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub backoff_initial_ms: u64,

    /// Restart backoff delay ceiling, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    /// Multiplier applied to the backoff delay after each failed attempt.
    #[arg(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Disable the random jitter added to each restart backoff delay.
    #[arg(long, default_value_t = false)]
    pub no_backoff_jitter: bool,

    /// Terminate and restart a client's subprocess after it stalls
    /// (playback speed below 0.9x) for more than 5 seconds.
    #[arg(long, default_value_t = false)]
    pub restart_on_stall: bool,

    /// Expected HLS segment duration, in milliseconds; documents the unit
    /// stall detection is measured against.
    #[arg(long, default_value_t = 6_000)]
    pub stall_target_duration_ms: u64,

    /// Fraction of dropped pipeline lines above which a client's metrics
    /// are flagged degraded.
    #[arg(long, default_value_t = 0.05)]
    pub drop_rate_threshold: f64,

    /// Grace window for a socket-mode client to connect its progress
    /// socket before falling back to pipe mode, in milliseconds.
    #[arg(long, default_value_t = 3_000)]
    pub socket_connect_grace_ms: u64,

    /// Grace window between SIGTERM and SIGKILL when stopping a client's
    /// process group, in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    pub graceful_stop_grace_ms: u64,

    /// Ceiling on ffmpeg's own reconnect backoff delay, in seconds
    /// (`-reconnect_delay_max`).
    #[arg(long, default_value_t = 2)]
    pub reconnect_delay_max_secs: u64,

    /// Read/write timeout passed to the subprocess, in milliseconds
    /// (`-rw_timeout`, converted to microseconds on the command line).
    #[arg(long, default_value_t = 5_000)]
    pub read_write_timeout_ms: u64,

    /// Subprocess loglevel (ffmpeg `-loglevel` values, e.g. info, warning,
    /// debug). `debug` is only permitted with `--progress-via-socket`,
    /// since a debug-level stream would otherwise flood the same stderr
    /// pipe the event parser is reading.
    #[arg(long, default_value = "info")]
    pub subprocess_log_level: String,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, suffix) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len()));
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration value: {raw}"))?;
    let seconds = match suffix {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unknown duration suffix: {other}")),
    };
    Ok(Duration::from_secs(seconds))
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header must be \"Name: Value\", got {raw:?}"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn parses_header_pair() {
        assert_eq!(
            parse_header("X-Test: abc").unwrap(),
            ("X-Test".to_string(), "abc".to_string())
        );
    }

    #[test]
    fn rejects_header_without_colon() {
        assert!(parse_header("no-colon-here").is_err());
    }
}
