use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use loadtest_parse::{EventParser, ProgressParser};
use loadtest_pipeline::Pipeline;
use loadtest_stats::{ClientStats, PipelineStream};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProgressMode, SupervisorConfig, VariantProbeFailurePolicy, VariantSelection};
use crate::error::{ProcError, ProcResult};
use crate::process_builder::ProcessBuilder;

/// Coarse lifecycle state of one client's subprocess, exposed for
/// introspection and tests; the restart loop itself drives transitions
/// through plain control flow rather than an explicit transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Idle = 0,
    Preparing = 1,
    Running = 2,
    Backoff = 3,
    Terminal = 4,
}

impl SupervisorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Preparing,
            2 => Self::Running,
            3 => Self::Backoff,
            _ => Self::Terminal,
        }
    }
}

/// How one subprocess attempt ended.
#[derive(Debug)]
enum ExitOutcome {
    Clean,
    NonZero(i32),
    Signaled(i32),
    WatchdogKilled,
    Cancelled,
}

fn categorize_exit(status: ExitStatus) -> ExitOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitOutcome::Signaled(signal);
        }
    }
    match status.code() {
        Some(0) => ExitOutcome::Clean,
        Some(code) => ExitOutcome::NonZero(code),
        None => ExitOutcome::NonZero(-1),
    }
}

/// Drives one client's subprocess through its full lifetime: spawn, attach
/// output pipelines, watch for stalls, restart on unexpected exit with
/// backoff, and stop cleanly on cancellation.
pub struct Supervisor {
    client_id: u64,
    stats: Arc<ClientStats>,
    builder: ProcessBuilder,
    config: SupervisorConfig,
    socket_mode_failed: AtomicBool,
    state: AtomicU8,
    /// PID of the currently running subprocess, or 0 if none is live right
    /// now (between attempts, or before the first spawn). Lets a caller
    /// outside the restart loop (the client manager's shutdown sweep) find
    /// and signal the process group of a supervisor whose own task is
    /// wedged and not responding to cancellation.
    current_pid: AtomicU64,
    /// Cache of the one-time `highest`/`lowest` variant probe, shared across
    /// restarts so a flaky origin isn't re-probed on every attempt.
    resolved_program: tokio::sync::OnceCell<Option<u32>>,
}

impl Supervisor {
    pub fn new(
        client_id: u64,
        stats: Arc<ClientStats>,
        process_config: crate::config::ClientProcessConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            client_id,
            stats,
            builder: ProcessBuilder::new(process_config),
            config,
            socket_mode_failed: AtomicBool::new(false),
            state: AtomicU8::new(SupervisorState::Idle as u8),
            current_pid: AtomicU64::new(0),
            resolved_program: tokio::sync::OnceCell::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// PID of the subprocess currently attached to this supervisor, if any
    /// is live right now. Used by [`crate::ClientManager::shutdown`] to
    /// force-kill the process group of a supervisor that didn't stop within
    /// the shutdown grace period.
    pub fn current_pid(&self) -> Option<u32> {
        match self.current_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Restart loop: runs subprocess attempts until `token` is cancelled or
    /// the restart ceiling is reached.
    pub async fn run(&self, token: CancellationToken) {
        if let Err(err) = self.ensure_probed().await {
            warn!(client_id = self.client_id, error = %err, "variant probe failed, client will not start");
            self.set_state(SupervisorState::Terminal);
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            self.set_state(SupervisorState::Preparing);
            let outcome = match self.run_once(&token).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(client_id = self.client_id, error = %err, "client attempt failed to start");
                    ExitOutcome::NonZero(-1)
                }
            };

            if matches!(outcome, ExitOutcome::Cancelled) {
                self.set_state(SupervisorState::Terminal);
                return;
            }

            if matches!(outcome, ExitOutcome::Clean) {
                debug!(client_id = self.client_id, "client exited cleanly, restarting");
            } else {
                warn!(client_id = self.client_id, ?outcome, "client exited, restarting");
            }

            if self.config.max_restarts != 0 && attempt >= self.config.max_restarts {
                warn!(client_id = self.client_id, attempt, "restart ceiling reached");
                self.set_state(SupervisorState::Terminal);
                return;
            }

            self.set_state(SupervisorState::Backoff);
            let delay = self.config.backoff.delay_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    self.set_state(SupervisorState::Terminal);
                    return;
                }
            }
            attempt += 1;
        }
    }

    /// Resolve the `highest`/`lowest` variant's program id exactly once for
    /// this supervisor's lifetime. A no-op for `all`/`first` selection. On
    /// probe failure, honors [`VariantProbeFailurePolicy`]: `Fallback`
    /// caches `None` (every subsequent build maps all streams); `Fail`
    /// returns the error so the caller aborts the client to `Terminal`.
    async fn ensure_probed(&self) -> ProcResult<()> {
        if !matches!(
            self.builder.variant(),
            VariantSelection::Highest | VariantSelection::Lowest
        ) {
            return Ok(());
        }
        if self.resolved_program.initialized() {
            return Ok(());
        }

        let pick_highest = matches!(self.builder.variant(), VariantSelection::Highest);
        match crate::probe::probe_program_id(self.builder.url(), pick_highest).await {
            Ok(program_id) => {
                let _ = self.resolved_program.set(Some(program_id));
                Ok(())
            }
            Err(err) => match self.builder.variant_probe_failure_policy() {
                VariantProbeFailurePolicy::Fallback => {
                    warn!(client_id = self.client_id, error = %err, "variant probe failed, falling back to mapping all streams");
                    let _ = self.resolved_program.set(None);
                    Ok(())
                }
                VariantProbeFailurePolicy::Fail => Err(err),
            },
        }
    }

    fn progress_mode(&self) -> ProgressMode {
        if self.config.prefer_socket_progress && !self.socket_mode_failed.load(Ordering::Relaxed) {
            let path = self.config.socket_dir.join(format!(
                "hls_{}_{}.sock",
                std::process::id(),
                self.client_id
            ));
            ProgressMode::Socket(path)
        } else {
            ProgressMode::Pipe
        }
    }

    /// Run a single subprocess attempt to completion.
    async fn run_once(&self, token: &CancellationToken) -> ProcResult<ExitOutcome> {
        let requested_mode = self.progress_mode();

        // Build the progress pipeline first so a socket-creation failure
        // (path too long, bind error) can downgrade to pipe mode before
        // anything else — including the argument vector — commits to it.
        let mut progress_mode = requested_mode.clone();
        let progress_pipeline = match &requested_mode {
            ProgressMode::Pipe => Pipeline::new_pipe(self.config.progress_channel_capacity),
            ProgressMode::Socket(path) => {
                match Pipeline::new_socket(self.config.progress_channel_capacity, path.clone()) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(client_id = self.client_id, error = %err, "falling back to pipe progress");
                        self.socket_mode_failed.store(true, Ordering::Relaxed);
                        progress_mode = ProgressMode::Pipe;
                        Pipeline::new_pipe(self.config.progress_channel_capacity)
                    }
                }
            }
        };
        let stderr_pipeline = Pipeline::new_pipe(self.config.stderr_channel_capacity);

        // Socket mode: the listener must be bound and accepting *before* the
        // subprocess is spawned, or the subprocess's first connect attempt
        // can race the bind. `run_socket` signals `Pipeline::ready()` the
        // instant the listener is up, which is what we wait on below.
        let socket_task = if let ProgressMode::Socket(_) = &progress_mode {
            let grace = self.config.socket_connect_grace;
            let p = Arc::clone(&progress_pipeline);
            let t = token.clone();
            let task = tokio::spawn(async move { p.run_socket(t, grace).await });
            progress_pipeline.ready().await;
            Some(task)
        } else {
            None
        };

        let resolved_program = self.resolved_program.get().copied().flatten();
        let args = self.builder.build_args(self.client_id, &progress_mode, resolved_program);

        let mut cmd = process_utils::tokio_command(self.builder.binary_path());
        cmd.args(&args);
        cmd.stderr(std::process::Stdio::piped());
        match &progress_mode {
            ProgressMode::Pipe => {
                cmd.stdout(std::process::Stdio::piped());
            }
            ProgressMode::Socket(_) => {
                cmd.stdout(std::process::Stdio::null());
            }
        }
        cmd.stdin(std::process::Stdio::null());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(ProcError::Spawn)?;
        let pid = child.id();
        self.current_pid
            .store(pid.unwrap_or(0) as u64, Ordering::Relaxed);
        self.stats.on_process_start();
        self.set_state(SupervisorState::Running);
        info!(client_id = self.client_id, pid, ?progress_mode, "client started");

        let event_parser = Arc::new(Mutex::new(EventParser::new()));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Arc::clone(&progress_pipeline).run_pipe(stdout, token.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Arc::clone(&stderr_pipeline).run_pipe(stderr, token.clone()));
        }

        let progress_task = self.spawn_progress_consumer(
            Arc::clone(&progress_pipeline),
            Arc::clone(&event_parser),
        );
        let stderr_task = self.spawn_stderr_consumer(Arc::clone(&stderr_pipeline), event_parser);
        let watchdog_cancel = CancellationToken::new();
        let watchdog_task = self.config.restart_on_stall.then(|| self.spawn_stall_watchdog(pid, watchdog_cancel.clone()));

        let outcome = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => categorize_exit(status),
                    Err(err) => {
                        warn!(client_id = self.client_id, error = %err, "wait() failed");
                        ExitOutcome::NonZero(-1)
                    }
                }
            }
            _ = token.cancelled() => {
                self.graceful_stop(pid, &mut child).await;
                ExitOutcome::Cancelled
            }
        };
        self.current_pid.store(0, Ordering::Relaxed);

        watchdog_cancel.cancel();
        progress_pipeline.close_channel().await;
        stderr_pipeline.close_channel().await;
        let _ = progress_task.await;
        let _ = stderr_task.await;
        if let Some(watchdog_task) = watchdog_task {
            let _ = watchdog_task.await;
        }
        if let Some(socket_task) = socket_task {
            match socket_task.await {
                Ok(Err(loadtest_pipeline::PipelineError::SocketNeverConnected)) => {
                    warn!(client_id = self.client_id, "progress socket never connected, falling back to pipe mode next run");
                    self.socket_mode_failed.store(true, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    warn!(client_id = self.client_id, error = %err, "progress socket reader ended with an error");
                }
                Ok(Ok(())) | Err(_) => {}
            }
        }

        Ok(outcome)
    }

    fn spawn_progress_consumer(
        &self,
        pipeline: Arc<Pipeline>,
        event_parser: Arc<Mutex<EventParser>>,
    ) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let client_id = self.client_id;
        let debug_log = self.config.debug_event_log.clone();
        tokio::spawn(async move {
            let mut receiver = pipeline.take_receiver().await;
            let mut parser = ProgressParser::new();
            while let Some(line) = receiver.recv().await {
                if let Some(log) = &debug_log {
                    log.write_line(client_id, "progress", &line).await;
                }
                if line.starts_with("progress=") {
                    event_parser.lock().complete_oldest_segment(&stats);
                }
                parser.feed_line(&line, &stats);
            }
            let stats_pipeline = pipeline.stats();
            stats.record_pipeline_stats(
                PipelineStream::Progress,
                stats_pipeline.lines_read,
                stats_pipeline.lines_dropped,
            );
        })
    }

    fn spawn_stderr_consumer(
        &self,
        pipeline: Arc<Pipeline>,
        event_parser: Arc<Mutex<EventParser>>,
    ) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let client_id = self.client_id;
        let debug_log = self.config.debug_event_log.clone();
        tokio::spawn(async move {
            let mut receiver = pipeline.take_receiver().await;
            let mut sweep = tokio::time::interval(Duration::from_secs(30));
            sweep.tick().await;
            loop {
                tokio::select! {
                    line = receiver.recv() => {
                        match line {
                            Some(line) => {
                                if let Some(log) = &debug_log {
                                    log.write_line(client_id, "stderr", &line).await;
                                }
                                event_parser.lock().feed_line(&line, &stats);
                            }
                            None => break,
                        }
                    }
                    _ = sweep.tick() => {
                        event_parser.lock().sweep_stale(&stats, Instant::now());
                    }
                }
            }
            event_parser.lock().sweep_stale(&stats, Instant::now());
            let stats_pipeline = pipeline.stats();
            stats.record_pipeline_stats(
                PipelineStream::Stderr,
                stats_pipeline.lines_read,
                stats_pipeline.lines_dropped,
            );
        })
    }

    fn spawn_stall_watchdog(
        &self,
        pid: Option<u32>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let grace_stop = self.config.graceful_stop_grace;
        let client_id = self.client_id;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if stats.is_stalled(Instant::now()) {
                            warn!(client_id, "client stalled, terminating process group");
                            if let Some(pid) = pid {
                                signal_process_group(pid, grace_stop).await;
                            }
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    async fn graceful_stop(&self, pid: Option<u32>, child: &mut tokio::process::Child) {
        if let Some(pid) = pid {
            signal_process_group(pid, self.config.graceful_stop_grace).await;
        }
        let _ = tokio::time::timeout(self.config.graceful_stop_grace, child.wait()).await;
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
async fn signal_process_group(pid: u32, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    if let Err(err) = killpg(target, Signal::SIGTERM) {
        debug!(pid, error = %err, "SIGTERM to process group failed");
    }
    tokio::time::sleep(grace).await;
    let _ = killpg(target, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn signal_process_group(_pid: u32, _grace: Duration) {}

/// Immediately SIGKILL a process group, with no SIGTERM grace period. Used
/// by [`crate::ClientManager::shutdown`] as a last resort against a
/// supervisor whose task didn't stop within the shutdown timeout.
#[cfg(unix)]
pub(crate) fn force_kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub(crate) fn force_kill_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            SupervisorState::Idle,
            SupervisorState::Preparing,
            SupervisorState::Running,
            SupervisorState::Backoff,
            SupervisorState::Terminal,
        ] {
            assert_eq!(SupervisorState::from_u8(state as u8), state);
        }
    }
}
