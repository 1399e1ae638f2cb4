//! Startup checks that gate the run before any subprocess is spawned.
//! Skipped entirely when `--skip-preflight` is set.

use std::io;

use crate::config::Config;
use crate::errors::RuntimeError;

/// Approximate file descriptors consumed per client: subprocess stdin/
/// stdout/stderr pipes, internal logging, an optional progress socket.
const FDS_PER_CLIENT: u64 = 20;
const FD_HEADROOM: u64 = 100;
const PROCESS_HEADROOM: u64 = 50;

/// Run every preflight check, short-circuiting on the first failure. Each
/// failure is reported as [`RuntimeError::Preflight`] against `config.url`
/// since that's the only resource preflight is guarding access to.
pub fn run(config: &Config) -> Result<(), RuntimeError> {
    check_binary_present(config)?;
    check_fd_limit(config)?;
    check_process_limit(config)?;
    Ok(())
}

fn fail(config: &Config, message: impl Into<String>) -> RuntimeError {
    RuntimeError::Preflight {
        url: config.url.clone(),
        source: io::Error::new(io::ErrorKind::Other, message.into()),
    }
}

/// Resolve `config.binary_path` against `PATH` the same way a shell would,
/// unless it's already an absolute or relative path that exists directly.
fn check_binary_present(config: &Config) -> Result<(), RuntimeError> {
    let path = &config.binary_path;
    if path.components().count() > 1 {
        if path.is_file() {
            return Ok(());
        }
        return Err(fail(
            config,
            format!("subprocess binary not found at {}", path.display()),
        ));
    }

    let Some(path_var) = std::env::var_os("PATH") else {
        return Err(fail(config, "PATH is not set, cannot locate subprocess binary"));
    };

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(path);
        if candidate.is_file() {
            return Ok(());
        }
    }

    Err(fail(
        config,
        format!("subprocess binary {:?} not found on PATH", path.display()),
    ))
}

#[cfg(unix)]
fn check_fd_limit(config: &Config) -> Result<(), RuntimeError> {
    use nix::sys::resource::{getrlimit, Resource};

    let required = FDS_PER_CLIENT * config.clients + FD_HEADROOM;
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE)
        .map_err(|err| fail(config, format!("failed to read file descriptor limit: {err}")))?;
    if soft < required {
        return Err(fail(
            config,
            format!("file descriptor limit {soft} is below the required {required} for {} clients", config.clients),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_fd_limit(_config: &Config) -> Result<(), RuntimeError> {
    Ok(())
}

#[cfg(unix)]
fn check_process_limit(config: &Config) -> Result<(), RuntimeError> {
    use nix::sys::resource::{getrlimit, Resource};

    let required = config.clients + PROCESS_HEADROOM;
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NPROC)
        .map_err(|err| fail(config, format!("failed to read process limit: {err}")))?;
    if soft < required {
        return Err(fail(
            config,
            format!("process limit {soft} is below the required {required} for {} clients", config.clients),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_process_limit(_config: &Config) -> Result<(), RuntimeError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            url: "https://cdn.example.com/live/master.m3u8".to_string(),
            clients: 1,
            ramp_rate: 1.0,
            ramp_jitter: std::time::Duration::ZERO,
            duration: None,
            binary_path: PathBuf::from("true"),
            variant: loadtest_proc::VariantSelection::All,
            variant_probe_failure_policy: loadtest_proc::VariantProbeFailurePolicy::Fallback,
            ip_override: None,
            acknowledge_dangerous: false,
            custom_headers: Vec::new(),
            cache_bust: false,
            user_agent_base: "hls-loadtest".to_string(),
            max_restarts: 0,
            progress_via_socket: false,
            metrics_bind_address: "127.0.0.1:9090".parse().unwrap(),
            per_client_metrics: false,
            dashboard_enabled: true,
            debug_event_log: None,
            skip_preflight: false,
            log_filter: None,
            verbose: false,
            quiet: false,
            stderr_buffer_per_client: 256,
            progress_buffer_per_client: 64,
            backoff_initial: std::time::Duration::from_millis(500),
            backoff_max: std::time::Duration::from_secs(30),
            backoff_multiplier: 2.0,
            backoff_jitter: true,
            restart_on_stall: false,
            stall_target_duration: std::time::Duration::from_secs(6),
            drop_rate_threshold: 0.05,
            socket_connect_grace: std::time::Duration::from_secs(3),
            graceful_stop_grace: std::time::Duration::from_secs(2),
            reconnect_delay_max: std::time::Duration::from_secs(2),
            read_write_timeout: std::time::Duration::from_secs(5),
            subprocess_log_level: "info".to_string(),
        }
    }

    #[test]
    fn finds_binary_on_path() {
        let config = base_config();
        assert!(check_binary_present(&config).is_ok());
    }

    #[test]
    fn missing_binary_is_rejected() {
        let mut config = base_config();
        config.binary_path = PathBuf::from("definitely-not-a-real-binary-xyz");
        assert!(check_binary_present(&config).is_err());
    }

    #[test]
    fn absolute_path_checked_directly() {
        let mut config = base_config();
        config.binary_path = PathBuf::from("/nonexistent/path/to/binary");
        assert!(check_binary_present(&config).is_err());
    }
}
