use thiserror::Error;

/// Errors raised by a [`crate::Pipeline`]'s reader loop.
///
/// None of these ever reach a parser: the supervisor treats any of them as
/// "this subprocess instance is done" and drives its own restart policy.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("socket path too long ({len} bytes, max 104): {path}")]
    SocketPathTooLong { path: String, len: usize },

    #[error("progress socket was never connected to within the grace window")]
    SocketNeverConnected,
}
