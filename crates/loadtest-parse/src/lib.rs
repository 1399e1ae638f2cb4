//! Parsers for the two streams an HLS client subprocess produces: the
//! structured `-progress` key=value stream (stdout or a progress socket)
//! and the unstructured stderr/debug log.
//!
//! Neither parser ever returns an error: malformed or unrecognized input is
//! silently dropped, counted only through the pipeline's own drop metrics.

mod events;
mod progress;

pub use events::{EventParser, OpenKind};
pub use progress::ProgressParser;
