use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("failed to spawn client process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait on client process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("progress pipeline setup failed: {0}")]
    Pipeline(#[from] loadtest_pipeline::PipelineError),

    #[error("variant probe failed for {url}: {source}")]
    ProbeFailed {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket directory {0:?} is not usable")]
    SocketDirUnusable(PathBuf),
}

pub type ProcResult<T> = Result<T, ProcError>;
