//! Top-level run composition: preflight, metrics server, ramp-up, the
//! periodic aggregation/dashboard loop, and final shutdown + summary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use loadtest_proc::{ClientManager, DebugEventLog, RampScheduler};
use loadtest_stats::StatsAggregator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dashboard::Dashboard;
use crate::errors::RuntimeError;
use crate::metrics_server::{self, MetricsState};
use crate::{preflight, summary};

/// Grace period given to [`ClientManager::shutdown`] once the run decides
/// to stop, independent of any individual client's own graceful-stop grace.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<(), RuntimeError> {
        let config = &self.config;

        if config.skip_preflight {
            info!("skipping preflight checks");
        } else {
            preflight::run(config)?;
        }

        let debug_event_log = match &config.debug_event_log {
            Some(path) => Some(Arc::new(DebugEventLog::open(path).await.map_err(|source| {
                RuntimeError::DebugEventLogOpen {
                    path: path.display().to_string(),
                    source,
                }
            })?)),
            None => None,
        };

        let manager = Arc::new(ClientManager::new());
        let aggregator = Arc::new(StatsAggregator::with_drop_rate_threshold(
            config.drop_rate_threshold,
        ));

        let shutdown = CancellationToken::new();
        let metrics_task = self.spawn_metrics_server(&manager, &aggregator, &shutdown).await?;
        let ramp_task = self.spawn_ramp(&manager, shutdown.clone(), debug_event_log);

        let dashboard = config.dashboard_enabled.then(Dashboard::new);
        let run_start = Instant::now();
        self.run_update_loop(&manager, &aggregator, dashboard.as_ref())
            .await;

        shutdown.cancel();
        manager.shutdown(SHUTDOWN_TIMEOUT).await;
        ramp_task.abort();

        let final_snapshot = aggregator.aggregate(&manager.snapshot());
        let report = summary::render(&final_snapshot, run_start.elapsed());
        if let Some(dashboard) = &dashboard {
            dashboard.finish("run complete");
        }
        println!("{report}");

        if let Err(err) = metrics_task.await {
            warn!(error = %err, "metrics server task panicked");
        }

        Ok(())
    }

    async fn spawn_metrics_server(
        &self,
        manager: &Arc<ClientManager>,
        aggregator: &Arc<StatsAggregator>,
        shutdown: &CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>, RuntimeError> {
        let config = &self.config;
        let state = Arc::new(MetricsState {
            manager: Arc::clone(manager),
            aggregator: Arc::clone(aggregator),
            per_client_metrics: config.per_client_metrics,
        });

        let listener = tokio::net::TcpListener::bind(config.metrics_bind_address)
            .await
            .map_err(|source| RuntimeError::MetricsBind {
                addr: config.metrics_bind_address.to_string(),
                source,
            })?;
        info!(addr = %config.metrics_bind_address, "metrics server listening");

        let router = metrics_server::router(state);
        let metrics_shutdown = shutdown.clone();
        Ok(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
                .await
            {
                warn!(error = %err, "metrics server exited with an error");
            }
        }))
    }

    fn spawn_ramp(
        &self,
        manager: &Arc<ClientManager>,
        token: CancellationToken,
        debug_event_log: Option<Arc<DebugEventLog>>,
    ) -> tokio::task::JoinHandle<()> {
        let ramp_config = self.config.ramp_config();
        let process_config = self.config.process_config();
        let supervisor_config = self.config.supervisor_config(debug_event_log);
        let manager = Arc::clone(manager);

        tokio::spawn(async move {
            let scheduler = RampScheduler::new(ramp_config);
            let emitted = scheduler
                .run(token, move |client_id| {
                    manager.start(client_id, process_config.clone(), supervisor_config.clone());
                })
                .await;
            info!(emitted, "ramp-up complete");
        })
    }

    /// Run the 1-second aggregate/dashboard cadence until the configured
    /// duration elapses, a termination signal arrives, or preflight never
    /// started any clients at all (`targetClients=0` still runs this loop
    /// so the exit path is identical).
    async fn run_update_loop(
        &self,
        manager: &Arc<ClientManager>,
        aggregator: &Arc<StatsAggregator>,
        dashboard: Option<&Dashboard>,
    ) -> loadtest_stats::AggregatedStats {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let deadline = self.config.duration.map(|d| tokio::time::Instant::now() + d);
        let mut snapshot = aggregator.aggregate(&manager.snapshot());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    snapshot = aggregator.aggregate(&manager.snapshot());
                    if let Some(dashboard) = dashboard {
                        dashboard.render(&snapshot);
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    info!("configured duration elapsed");
                    return snapshot;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt signal");
                    return snapshot;
                }
                _ = wait_for_sigterm() => {
                    info!("received termination signal");
                    return snapshot;
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
