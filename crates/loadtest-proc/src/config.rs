use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which rendition(s) of an HLS variant playlist a client should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSelection {
    /// Fetch every rendition referenced by the master playlist.
    All,
    /// Probe the master playlist once and fetch only the highest-bandwidth
    /// rendition.
    Highest,
    /// Probe once and fetch only the lowest-bandwidth rendition.
    Lowest,
    /// Fetch whichever rendition the subprocess picks first, with no probe.
    First,
}

/// What to do when a [`VariantSelection::Highest`]/[`VariantSelection::Lowest`]
/// probe fails (the playlist can't be fetched or parsed ahead of the real run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantProbeFailurePolicy {
    /// Fall back to [`VariantSelection::All`] and proceed.
    Fallback,
    /// Treat the client as failed to start.
    Fail,
}

/// Per-client knobs that shape the subprocess invocation. Shared by every
/// client in a run; only the client id and, optionally, the probed program
/// id vary between invocations.
#[derive(Debug, Clone)]
pub struct ClientProcessConfig {
    pub binary_path: PathBuf,
    pub url: String,
    pub variant: VariantSelection,
    pub variant_probe_failure_policy: VariantProbeFailurePolicy,
    pub custom_headers: Vec<(String, String)>,
    pub cache_bust: bool,
    pub user_agent_base: String,
    pub ip_override: Option<IpAddr>,
    pub acknowledge_dangerous: bool,
    pub reconnect_delay_max: Duration,
    pub read_write_timeout: Duration,
    pub log_filter: String,
}

/// Where a client's `-progress` stream is delivered.
#[derive(Debug, Clone)]
pub enum ProgressMode {
    /// `-progress pipe:1`, read from the child's stdout.
    Pipe,
    /// `-progress unix://<path>`, read from a freshly bound Unix socket.
    Socket(PathBuf),
}

/// Knobs controlling one client's supervising state machine.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backoff: crate::backoff::BackoffPolicy,
    /// 0 means unlimited restarts for the run's duration.
    pub max_restarts: u32,
    pub stderr_channel_capacity: usize,
    pub progress_channel_capacity: usize,
    pub prefer_socket_progress: bool,
    pub socket_dir: PathBuf,
    pub socket_connect_grace: Duration,
    pub graceful_stop_grace: Duration,
    /// Whether a sustained stall (see [`loadtest_stats::STALL_GRACE`]) should
    /// cause the supervisor to terminate and restart the subprocess. When
    /// `false` the stall watchdog still runs (stall is always visible in
    /// metrics) but never signals the process group.
    pub restart_on_stall: bool,
    /// Expected HLS segment duration, used only to document the unit stall
    /// detection is measured against; the detector itself is the fixed
    /// 5-second [`loadtest_stats::STALL_GRACE`] threshold (see spec's open
    /// question on stall hysteresis).
    pub stall_target_duration: Duration,
    /// When set, every raw progress/stderr line this client's subprocess
    /// produces is also appended here, tagged by client id and stream.
    pub debug_event_log: Option<std::sync::Arc<crate::debug_log::DebugEventLog>>,
}

/// Knobs controlling client ramp-up.
#[derive(Debug, Clone)]
pub struct RampConfig {
    pub target_clients: u64,
    pub rate_per_sec: f64,
    pub jitter: Duration,
}
