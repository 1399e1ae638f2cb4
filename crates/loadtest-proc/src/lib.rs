//! Process lifecycle management for HLS-fetching load test clients: building
//! subprocess invocations, supervising them through restarts and stalls,
//! pacing ramp-up, and tracking the set of currently active clients.

mod backoff;
mod config;
mod debug_log;
mod error;
mod manager;
mod probe;
mod process_builder;
mod ramp;
mod supervisor;

pub use backoff::BackoffPolicy;
pub use config::{
    ClientProcessConfig, ProgressMode, RampConfig, SupervisorConfig, VariantProbeFailurePolicy,
    VariantSelection,
};
pub use debug_log::DebugEventLog;
pub use error::{ProcError, ProcResult};
pub use manager::ClientManager;
pub use probe::probe_program_id;
pub use process_builder::ProcessBuilder;
pub use ramp::RampScheduler;
pub use supervisor::{Supervisor, SupervisorState};
