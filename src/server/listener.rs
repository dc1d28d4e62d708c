//! Direct submission over a Unix-domain socket.
//!
//! A client connects, writes the raw payload, and shuts down its write
//! half. The listener enqueues the bytes, answers with a two-byte
//! acknowledgement, and closes:
//!
//! ```text
//! client ──payload──► EOF ──► listener ── enqueue ──► "OK" | "KO"
//! ```
//!
//! A submission goes through the same [`Spool::enqueue`] as any other
//! producer, so it carries no extra semantics. The only difference is that
//! the dispatcher is woken at once rather than on its next poll.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::spool::{Payload, Spool};

/// Acknowledgement for an accepted submission.
pub const ACK_OK: &[u8; 2] = b"OK";

/// Acknowledgement for a rejected submission.
pub const ACK_KO: &[u8; 2] = b"KO";

/// Largest payload accepted over the socket (64 MiB).
pub const MAX_SUBMISSION_BYTES: u64 = 64 * 1024 * 1024;

/// Errors that can occur while running the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The socket could not be bound.
    #[error("cannot listen on {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed.
    #[error("accept failed: {0}")]
    Accept(#[from] io::Error),
}

/// Result type for listener operations.
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Accepts submissions on a Unix socket and enqueues them.
#[derive(Debug)]
pub struct Listener {
    socket: UnixListener,
    path: PathBuf,
    spool: Arc<Spool>,
    wake: Arc<Notify>,
}

impl Listener {
    /// Binds the socket at `path`.
    ///
    /// A socket file left behind by a dead listener is replaced. Anything
    /// else at `path`, including the socket of a listener that still
    /// accepts connections, makes binding fail.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>, spool: Arc<Spool>, wake: Arc<Notify>) -> Result<Self> {
        let path = path.into();
        let bind_err = |source| ListenerError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::symlink_metadata(&path) {
            Ok(meta) if !meta.file_type().is_socket() => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )));
            }
            Ok(_) if std::os::unix::net::UnixStream::connect(&path).is_ok() => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "another listener is accepting on this socket",
                )));
            }
            Ok(_) => {
                std::fs::remove_file(&path).map_err(bind_err)?;
                debug!(path = %path.display(), "Removed stale socket");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }
        let socket = UnixListener::bind(&path).map_err(bind_err)?;

        Ok(Listener {
            socket,
            path,
            spool,
            wake,
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// The socket file is removed on return.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Listening for submissions");

        let result = loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.socket.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => break Err(ListenerError::Accept(e)),
                },
            };

            let spool = Arc::clone(&self.spool);
            let wake = Arc::clone(&self.wake);
            tokio::spawn(async move {
                if let Err(e) = handle_submission(stream, spool, wake).await {
                    debug!(error = %e, "Submission connection failed");
                }
            });
        };

        let _ = std::fs::remove_file(&self.path);
        info!("Listener stopped");
        result
    }
}

/// Reads one payload, enqueues it, and answers.
async fn handle_submission(mut stream: UnixStream, spool: Arc<Spool>, wake: Arc<Notify>) -> io::Result<()> {
    let mut payload = Vec::new();
    (&mut stream)
        .take(MAX_SUBMISSION_BYTES + 1)
        .read_to_end(&mut payload)
        .await?;

    let ack = if payload.len() as u64 > MAX_SUBMISSION_BYTES {
        warn!(limit = MAX_SUBMISSION_BYTES, "Submission too large, rejecting");
        ACK_KO
    } else {
        let size = payload.len();
        let enqueued =
            tokio::task::spawn_blocking(move || spool.enqueue(Payload::Bytes(&payload), "")).await;
        match enqueued {
            Ok(Ok(num)) => {
                debug!(num = %num, size, "Accepted submission");
                wake.notify_one();
                ACK_OK
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to enqueue submission");
                ACK_KO
            }
            Err(e) => {
                warn!(error = %e, "Enqueue task failed");
                ACK_KO
            }
        }
    };

    stream.write_all(ack).await?;
    stream.shutdown().await
}
