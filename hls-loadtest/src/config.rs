use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use loadtest_proc::{VariantProbeFailurePolicy, VariantSelection};

use crate::cli::Cli;
use crate::errors::ConfigError;

/// Immutable, fully validated run configuration. Built once from [`Cli`] via
/// [`Config::from_cli`] and shared read-only for the rest of the run.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub clients: u64,
    pub ramp_rate: f64,
    pub ramp_jitter: Duration,
    pub duration: Option<Duration>,
    pub binary_path: PathBuf,
    pub variant: VariantSelection,
    pub variant_probe_failure_policy: VariantProbeFailurePolicy,
    pub ip_override: Option<std::net::IpAddr>,
    pub acknowledge_dangerous: bool,
    pub custom_headers: Vec<(String, String)>,
    pub cache_bust: bool,
    pub user_agent_base: String,
    pub max_restarts: u32,
    pub progress_via_socket: bool,
    pub metrics_bind_address: SocketAddr,
    pub per_client_metrics: bool,
    pub dashboard_enabled: bool,
    pub debug_event_log: Option<PathBuf>,
    pub skip_preflight: bool,
    pub log_filter: Option<String>,
    pub verbose: bool,
    pub quiet: bool,

    pub stderr_buffer_per_client: usize,
    pub progress_buffer_per_client: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    pub backoff_jitter: bool,
    pub restart_on_stall: bool,
    pub stall_target_duration: Duration,
    pub drop_rate_threshold: f64,
    pub socket_connect_grace: Duration,
    pub graceful_stop_grace: Duration,
    pub reconnect_delay_max: Duration,
    pub read_write_timeout: Duration,
    pub subprocess_log_level: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        url::Url::parse(&cli.url).map_err(ConfigError::InvalidUrl)?;

        if cli.ramp_rate <= 0.0 {
            return Err(ConfigError::NonPositiveRampRate);
        }

        let variant = match cli.variant.as_str() {
            "all" => VariantSelection::All,
            "highest" => VariantSelection::Highest,
            "lowest" => VariantSelection::Lowest,
            "first" => VariantSelection::First,
            other => return Err(ConfigError::UnknownVariant(other.to_string())),
        };

        let variant_probe_failure_policy = match cli.variant_probe_failure_policy.as_str() {
            "fallback" => VariantProbeFailurePolicy::Fallback,
            "fail" => VariantProbeFailurePolicy::Fail,
            other => return Err(ConfigError::UnknownProbeFailurePolicy(other.to_string())),
        };

        if cli.ip_override.is_some() && !cli.acknowledge_dangerous {
            return Err(ConfigError::IpOverrideWithoutAcknowledgement);
        }
        if cli.subprocess_log_level == "debug" && !cli.progress_via_socket {
            return Err(ConfigError::DebugLogLevelRequiresSocketMode);
        }

        let metrics_bind_address = cli
            .metrics_bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidMetricsAddress(cli.metrics_bind_address.clone()))?;

        Ok(Self {
            url: cli.url,
            clients: cli.clients,
            ramp_rate: cli.ramp_rate,
            ramp_jitter: Duration::from_millis(cli.ramp_jitter_ms),
            duration: cli.duration,
            binary_path: cli.binary_path,
            variant,
            variant_probe_failure_policy,
            ip_override: cli.ip_override,
            acknowledge_dangerous: cli.acknowledge_dangerous,
            custom_headers: cli.custom_headers,
            cache_bust: cli.cache_bust,
            user_agent_base: cli.user_agent_base,
            max_restarts: cli.max_restarts,
            progress_via_socket: cli.progress_via_socket,
            metrics_bind_address,
            per_client_metrics: cli.per_client_metrics,
            dashboard_enabled: !cli.no_dashboard,
            debug_event_log: cli.debug_event_log,
            skip_preflight: cli.skip_preflight,
            log_filter: cli.log_filter,
            verbose: cli.verbose,
            quiet: cli.quiet,

            stderr_buffer_per_client: cli.stderr_buffer_per_client,
            progress_buffer_per_client: cli.progress_buffer_per_client,
            backoff_initial: Duration::from_millis(cli.backoff_initial_ms),
            backoff_max: Duration::from_millis(cli.backoff_max_ms),
            backoff_multiplier: cli.backoff_multiplier,
            backoff_jitter: !cli.no_backoff_jitter,
            restart_on_stall: cli.restart_on_stall,
            stall_target_duration: Duration::from_millis(cli.stall_target_duration_ms),
            drop_rate_threshold: cli.drop_rate_threshold,
            socket_connect_grace: Duration::from_millis(cli.socket_connect_grace_ms),
            graceful_stop_grace: Duration::from_millis(cli.graceful_stop_grace_ms),
            reconnect_delay_max: Duration::from_secs(cli.reconnect_delay_max_secs),
            read_write_timeout: Duration::from_millis(cli.read_write_timeout_ms),
            subprocess_log_level: cli.subprocess_log_level,
        })
    }

    pub fn ramp_config(&self) -> loadtest_proc::RampConfig {
        loadtest_proc::RampConfig {
            target_clients: self.clients,
            rate_per_sec: self.ramp_rate,
            jitter: self.ramp_jitter,
        }
    }

    pub fn supervisor_config(
        &self,
        debug_event_log: Option<std::sync::Arc<loadtest_proc::DebugEventLog>>,
    ) -> loadtest_proc::SupervisorConfig {
        loadtest_proc::SupervisorConfig {
            backoff: loadtest_proc::BackoffPolicy {
                initial_delay: self.backoff_initial,
                max_delay: self.backoff_max,
                multiplier: self.backoff_multiplier,
                jitter: self.backoff_jitter,
            },
            max_restarts: self.max_restarts,
            stderr_channel_capacity: self.stderr_buffer_per_client,
            progress_channel_capacity: self.progress_buffer_per_client,
            prefer_socket_progress: self.progress_via_socket,
            socket_dir: std::env::temp_dir(),
            socket_connect_grace: self.socket_connect_grace,
            graceful_stop_grace: self.graceful_stop_grace,
            restart_on_stall: self.restart_on_stall,
            stall_target_duration: self.stall_target_duration,
            debug_event_log,
        }
    }

    pub fn process_config(&self) -> loadtest_proc::ClientProcessConfig {
        loadtest_proc::ClientProcessConfig {
            binary_path: self.binary_path.clone(),
            url: self.url.clone(),
            variant: self.variant,
            variant_probe_failure_policy: self.variant_probe_failure_policy,
            custom_headers: self.custom_headers.clone(),
            cache_bust: self.cache_bust,
            user_agent_base: self.user_agent_base.clone(),
            ip_override: self.ip_override,
            acknowledge_dangerous: self.acknowledge_dangerous,
            reconnect_delay_max: self.reconnect_delay_max,
            read_write_timeout: self.read_write_timeout,
            log_filter: self.subprocess_log_level.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            url: "https://cdn.example.com/live/master.m3u8".to_string(),
            clients: 10,
            ramp_rate: 1.0,
            ramp_jitter_ms: 0,
            duration: None,
            binary_path: PathBuf::from("ffmpeg"),
            variant: "all".to_string(),
            variant_probe_failure_policy: "fallback".to_string(),
            ip_override: None,
            acknowledge_dangerous: false,
            custom_headers: Vec::new(),
            cache_bust: false,
            user_agent_base: "hls-loadtest".to_string(),
            max_restarts: 0,
            progress_via_socket: false,
            metrics_bind_address: "127.0.0.1:9090".to_string(),
            per_client_metrics: false,
            no_dashboard: false,
            debug_event_log: None,
            skip_preflight: false,
            log_filter: None,
            verbose: false,
            quiet: false,
            stderr_buffer_per_client: 256,
            progress_buffer_per_client: 64,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            no_backoff_jitter: false,
            restart_on_stall: false,
            stall_target_duration_ms: 6_000,
            drop_rate_threshold: 0.05,
            socket_connect_grace_ms: 3_000,
            graceful_stop_grace_ms: 2_000,
            reconnect_delay_max_secs: 2,
            read_write_timeout_ms: 5_000,
            subprocess_log_level: "info".to_string(),
        }
    }

    #[test]
    fn valid_cli_builds_config() {
        let config = Config::from_cli(base_cli()).unwrap();
        assert_eq!(config.clients, 10);
        assert!(config.dashboard_enabled);
    }

    #[test]
    fn zero_clients_is_accepted_for_an_empty_run() {
        let mut cli = base_cli();
        cli.clients = 0;
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.clients, 0);
    }

    #[test]
    fn ip_override_without_acknowledgement_is_rejected() {
        let mut cli = base_cli();
        cli.ip_override = Some("203.0.113.10".parse().unwrap());
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::IpOverrideWithoutAcknowledgement)
        ));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let mut cli = base_cli();
        cli.variant = "weird".to_string();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::UnknownVariant(_))));
    }

    #[test]
    fn debug_log_level_without_socket_mode_is_rejected() {
        let mut cli = base_cli();
        cli.subprocess_log_level = "debug".to_string();
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::DebugLogLevelRequiresSocketMode)
        ));
    }

    #[test]
    fn debug_log_level_with_socket_mode_is_accepted() {
        let mut cli = base_cli();
        cli.subprocess_log_level = "debug".to_string();
        cli.progress_via_socket = true;
        assert!(Config::from_cli(cli).is_ok());
    }

    #[test]
    fn invalid_url_is_rejected() {
        let mut cli = base_cli();
        cli.url = "not a url".to_string();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::InvalidUrl(_))));
    }
}
