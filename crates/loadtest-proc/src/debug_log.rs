use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Appends every raw subprocess stdout/stderr line to a single file for
/// post-mortem debugging, tagged with client id and stream name. Shared
/// across every client's supervisor via one `Arc`, guarded by a mutex since
/// writes interleave from many concurrent reader tasks.
pub struct DebugEventLog {
    file: Mutex<tokio::fs::File>,
}

impl DebugEventLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Best-effort: a write failure is logged and otherwise ignored, since
    /// this log exists purely for human debugging and must never affect the
    /// run it's observing.
    pub async fn write_line(&self, client_id: u64, stream: &str, line: &str) {
        let mut file = self.file.lock().await;
        if let Err(err) = file
            .write_all(format!("[client {client_id}] [{stream}] {line}\n").as_bytes())
            .await
        {
            warn!(client_id, error = %err, "failed to write debug event log line");
        }
    }
}
