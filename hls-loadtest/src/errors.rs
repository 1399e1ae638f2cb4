#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--url is not a valid URL: {0}")]
    InvalidUrl(#[source] url::ParseError),

    #[error("--ramp-rate must be greater than zero")]
    NonPositiveRampRate,

    #[error("unknown --variant {0:?}, expected one of all, highest, lowest, first")]
    UnknownVariant(String),

    #[error("unknown --variant-probe-failure-policy {0:?}, expected fallback or fail")]
    UnknownProbeFailurePolicy(String),

    #[error("--ip-override requires --acknowledge-dangerous")]
    IpOverrideWithoutAcknowledgement,

    #[error("--metrics-bind-address {0:?} is not a valid socket address")]
    InvalidMetricsAddress(String),

    #[error("--subprocess-log-level debug requires --progress-via-socket (a debug-level stderr stream would flood the event pipeline)")]
    DebugLogLevelRequiresSocketMode,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("preflight check against {url} failed: {source}")]
    Preflight {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics server failed to bind {addr}: {source}")]
    MetricsBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open --debug-event-log file {path}: {source}")]
    DebugEventLogOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Proc(#[from] loadtest_proc::ProcError),
}
