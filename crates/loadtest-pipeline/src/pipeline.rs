use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Unix-domain socket paths are capped at 104 bytes on most platforms
/// (macOS; Linux allows 108). 104 is used as the conservative bound named
/// in the wire contract.
const MAX_SOCKET_PATH_BYTES: usize = 104;

/// A bounded, lossy line channel from a subprocess's stdout/stderr (or a
/// progress socket) to a parser task.
///
/// Feeding a full channel drops the line and counts it rather than
/// blocking the subprocess; this is a deliberate backpressure policy, not
/// an oversight. The channel is closed at most once, from whichever exit
/// path reaches it first.
pub struct Pipeline {
    sender: AsyncMutex<Option<mpsc::Sender<String>>>,
    receiver: AsyncMutex<Option<mpsc::Receiver<String>>>,
    closed: AtomicBool,
    lines_read: AtomicU64,
    lines_dropped: AtomicU64,
    bytes_read: AtomicU64,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    socket_path: Option<PathBuf>,
}

/// Read-only counters for a pipeline, used for per-client pipeline-health
/// reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub lines_read: u64,
    pub lines_dropped: u64,
    pub bytes_read: u64,
}

impl Pipeline {
    /// Build a pipe-mode pipeline. Readiness is immediate: there is no
    /// handshake to wait for before the subprocess can be spawned.
    pub fn new_pipe(capacity: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = watch::channel(true);
        Arc::new(Self {
            sender: AsyncMutex::new(Some(sender)),
            receiver: AsyncMutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
            lines_read: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            ready_tx,
            ready_rx,
            socket_path: None,
        })
    }

    /// Build a socket-mode pipeline at the given path. Readiness fires once
    /// the listener is bound and accepting, which happens inside
    /// [`Pipeline::run_socket`]; callers must await [`Pipeline::ready`]
    /// before spawning the subprocess that will connect to it.
    pub fn new_socket(capacity: usize, socket_path: PathBuf) -> Result<Arc<Self>, PipelineError> {
        let path_str = socket_path.to_string_lossy().into_owned();
        if path_str.len() > MAX_SOCKET_PATH_BYTES {
            return Err(PipelineError::SocketPathTooLong {
                path: path_str,
                len: path_str.len(),
            });
        }
        let (sender, receiver) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            sender: AsyncMutex::new(Some(sender)),
            receiver: AsyncMutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
            lines_read: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            ready_tx,
            ready_rx,
            socket_path: Some(socket_path),
        }))
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Non-blocking: enqueue a line for the parser. Returns `false` (and
    /// counts a drop) if the channel is full or already closed.
    pub async fn feed_line(&self, line: String) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        let guard = self.sender.lock().await;
        let Some(sender) = guard.as_ref() else {
            return false;
        };
        let bytes = line.len() as u64;
        match sender.try_send(line) {
            Ok(()) => {
                self.lines_read.fetch_add(1, Ordering::Relaxed);
                self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.lines_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Idempotent: the first caller to reach this drops the sender half,
    /// which closes the channel for the parser task; every later call is a
    /// no-op.
    pub async fn close_channel(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.sender.lock().await.take();
        if let Some(path) = &self.socket_path {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Takes the receiver half exactly once; intended for the parser task
    /// to call at startup. Panics on a second call, which would indicate a
    /// programming error (two parsers racing on one pipeline).
    pub async fn take_receiver(&self) -> mpsc::Receiver<String> {
        self.receiver
            .lock()
            .await
            .take()
            .expect("Pipeline::take_receiver called more than once")
    }

    /// Resolves once the pipeline is ready to accept a subprocess
    /// connection (socket mode) or immediately (pipe mode).
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Drive a pipe-mode reader until EOF, a read error, or cancellation.
    /// Guarantees the channel is closed on every exit path.
    pub async fn run_pipe<R>(self: Arc<Self>, reader: R, token: CancellationToken)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("pipeline reader cancelled");
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            self.feed_line(line).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "pipeline reader error");
                            break;
                        }
                    }
                }
            }
        }
        self.close_channel().await;
    }

    /// Drive a socket-mode reader: bind the listener, signal readiness,
    /// accept exactly one connection, then forward lines until EOF, error,
    /// or cancellation. If no connection arrives before `grace`, returns
    /// [`PipelineError::SocketNeverConnected`] without having signaled
    /// success; the caller (the supervisor) interprets this as a
    /// socket-mode failure and falls back to pipe mode on the next run.
    #[cfg(unix)]
    pub async fn run_socket(
        self: Arc<Self>,
        token: CancellationToken,
        grace: std::time::Duration,
    ) -> Result<(), PipelineError> {
        use tokio::net::UnixListener;

        let path = self
            .socket_path
            .clone()
            .expect("run_socket called on a pipe-mode pipeline");
        let _ = tokio::fs::remove_file(&path).await;
        let listener = UnixListener::bind(&path)?;
        self.ready_tx.send_replace(true);

        let accept = tokio::time::timeout(grace, listener.accept());
        let stream = tokio::select! {
            _ = token.cancelled() => {
                self.close_channel().await;
                return Err(PipelineError::Cancelled);
            }
            result = accept => {
                match result {
                    Ok(Ok((stream, _addr))) => stream,
                    Ok(Err(e)) => {
                        self.close_channel().await;
                        return Err(PipelineError::Io(e));
                    }
                    Err(_elapsed) => {
                        self.close_channel().await;
                        return Err(PipelineError::SocketNeverConnected);
                    }
                }
            }
        };

        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => { self.feed_line(line).await; }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "socket pipeline reader error");
                            break;
                        }
                    }
                }
            }
        }
        self.close_channel().await;
        Ok(())
    }
}
