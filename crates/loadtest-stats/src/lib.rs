//! Lock-free per-client statistics and cross-client aggregation.
//!
//! [`ClientStats`] is the write side: every field is a plain atomic (or, for
//! the latency digest, a small lock around an O(log n) histogram update), so
//! progress/event parsers never block on a shared lock while a subprocess's
//! output is flowing. [`StatsAggregator`] is the read side: it sums a
//! snapshot of every registered client into an immutable [`AggregatedStats`]
//! record on a fixed cadence.

mod aggregate;
mod client_stats;
mod digest;

pub use aggregate::{AggregatedStats, StatsAggregator, DEGRADED_DROP_RATE_THRESHOLD, HIGH_DRIFT_THRESHOLD};
pub use client_stats::{ClientStats, ClientSummary, PipelineStream, STALL_GRACE, STALL_SPEED_THRESHOLD};
pub use digest::{LatencyDigest, Percentiles};
