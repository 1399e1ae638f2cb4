use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use loadtest_stats::ClientStats;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ClientProcessConfig, SupervisorConfig};
use crate::supervisor::{Supervisor, SupervisorState};

struct ManagedClient {
    supervisor: Arc<Supervisor>,
    handle: JoinHandle<()>,
}

/// Lock-free registry of every active client's supervisor, keyed by client
/// id. Owns the shared cancellation token that a shutdown propagates to
/// every running client at once.
pub struct ClientManager {
    clients: DashMap<u64, ManagedClient>,
    token: CancellationToken,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            token: CancellationToken::new(),
        }
    }

    /// Build a client's stats record, start its supervisor on a background
    /// task, and register it. Returns the shared stats handle so the caller
    /// can feed it directly into aggregation without a registry lookup.
    pub fn start(
        &self,
        client_id: u64,
        process_config: ClientProcessConfig,
        supervisor_config: SupervisorConfig,
    ) -> Arc<ClientStats> {
        let stats = Arc::new(ClientStats::new(client_id));
        let supervisor = Arc::new(Supervisor::new(
            client_id,
            Arc::clone(&stats),
            process_config,
            supervisor_config,
        ));

        let run_supervisor = Arc::clone(&supervisor);
        let run_token = self.token.clone();
        let handle = tokio::spawn(async move {
            run_supervisor.run(run_token).await;
        });

        self.clients.insert(
            client_id,
            ManagedClient {
                supervisor,
                handle,
            },
        );
        info!(client_id, "client registered");
        stats
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn active_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().supervisor.state() == SupervisorState::Running)
            .count()
    }

    /// A point-in-time snapshot of every registered client's stats handle
    /// paired with whether its subprocess is currently running, ready to be
    /// passed to an aggregator. "Running" reflects the supervisor's own
    /// state machine, not an inference from the stats (a client mid-backoff
    /// has nonzero uptime but no live subprocess).
    pub fn snapshot(&self) -> Vec<(bool, Arc<ClientStats>)> {
        self.clients
            .iter()
            .map(|entry| {
                let managed = entry.value();
                (
                    managed.supervisor.state() == SupervisorState::Running,
                    Arc::clone(managed.supervisor.stats()),
                )
            })
            .collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(u64, &Arc<ClientStats>)) {
        for entry in self.clients.iter() {
            f(*entry.key(), entry.value().supervisor.stats());
        }
    }

    /// Cancel every client's supervisor, wait up to `timeout` for their
    /// background tasks to finish, and force-terminate whatever is still
    /// running afterward: the task is aborted and, if it left a subprocess
    /// behind, that process group is sent a final `SIGKILL` sweep so no
    /// subprocess survives the call regardless of whether its supervisor
    /// task was actually responding to cancellation.
    pub async fn shutdown(&self, timeout: Duration) {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut handles: Vec<(u64, Arc<Supervisor>, JoinHandle<()>)> = Vec::new();
        for mut entry in self.clients.iter_mut() {
            let client_id = *entry.key();
            let managed = entry.value_mut();
            let placeholder = tokio::spawn(async {});
            let handle = std::mem::replace(&mut managed.handle, placeholder);
            handles.push((client_id, Arc::clone(&managed.supervisor), handle));
        }

        for (client_id, supervisor, handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            // Grab an abort handle before the timeout consumes `handle` by
            // value: the JoinHandle future being dropped on timeout only
            // detaches the task, it does not cancel it.
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(client_id, error = %err, "client task panicked"),
                Err(_) => {
                    warn!(
                        client_id,
                        "client did not stop within shutdown grace, aborting task and force-killing its process group"
                    );
                    abort_handle.abort();
                    if let Some(pid) = supervisor.current_pid() {
                        crate::supervisor::force_kill_process_group(pid);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::{ProgressMode, VariantProbeFailurePolicy, VariantSelection};
    use std::path::PathBuf;

    fn process_config() -> ClientProcessConfig {
        ClientProcessConfig {
            binary_path: PathBuf::from("/bin/true"),
            url: "https://cdn.example.com/live/master.m3u8".to_string(),
            variant: VariantSelection::All,
            variant_probe_failure_policy: VariantProbeFailurePolicy::Fallback,
            custom_headers: Vec::new(),
            cache_bust: false,
            user_agent_base: "hls-loadtest".to_string(),
            ip_override: None,
            acknowledge_dangerous: false,
            reconnect_delay_max: std::time::Duration::from_secs(2),
            read_write_timeout: std::time::Duration::from_secs(5),
            log_filter: "warning".to_string(),
        }
    }

    fn supervisor_config() -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffPolicy::default(),
            max_restarts: 1,
            stderr_channel_capacity: 64,
            progress_channel_capacity: 64,
            prefer_socket_progress: false,
            socket_dir: std::env::temp_dir(),
            socket_connect_grace: std::time::Duration::from_secs(3),
            graceful_stop_grace: std::time::Duration::from_millis(200),
            restart_on_stall: false,
            stall_target_duration: std::time::Duration::from_secs(6),
            debug_event_log: None,
        }
    }

    #[tokio::test]
    async fn start_registers_client_and_returns_stats() {
        let manager = ClientManager::new();
        let stats = manager.start(0, process_config(), supervisor_config());
        assert_eq!(stats.client_id(), 0);
        assert_eq!(manager.client_count(), 1);
        manager.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn snapshot_includes_every_registered_client() {
        let manager = ClientManager::new();
        manager.start(0, process_config(), supervisor_config());
        manager.start(1, process_config(), supervisor_config());
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 2);
        manager.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn active_count_matches_running_entries_in_snapshot() {
        let manager = ClientManager::new();
        manager.start(0, process_config(), supervisor_config());
        let running_in_snapshot = manager
            .snapshot()
            .iter()
            .filter(|(running, _)| *running)
            .count();
        assert_eq!(running_in_snapshot, manager.active_count());
        manager.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn shutdown_aborts_tasks_that_ignore_cancellation() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let manager = ClientManager::new();
        let stats = Arc::new(ClientStats::new(42));
        let supervisor = Arc::new(Supervisor::new(
            42,
            Arc::clone(&stats),
            process_config(),
            supervisor_config(),
        ));

        // A task that never observes the manager's cancellation token, to
        // stand in for a wedged supervisor.
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = Arc::clone(&counter);
        let handle = tokio::spawn(async move {
            loop {
                counter_clone.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        manager
            .clients
            .insert(42, ManagedClient { supervisor, handle });

        manager.shutdown(Duration::from_millis(50)).await;

        let at_shutdown = counter.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_grace = counter.load(Ordering::Relaxed);
        assert_eq!(
            at_shutdown, after_grace,
            "task should have been aborted on timeout, not merely detached"
        );
    }

    #[allow(dead_code)]
    fn assert_progress_mode_variants_exhaustive(mode: ProgressMode) {
        match mode {
            ProgressMode::Pipe => {}
            ProgressMode::Socket(_) => {}
        }
    }
}
