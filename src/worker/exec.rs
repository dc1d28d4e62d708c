//! Worker process execution.
//!
//! Each claimed entry is handed to a fresh child process. The child runs in
//! its own process group so a timeout kills everything it started, and
//! `kill_on_drop` ensures an aborted dispatcher task does not leave it
//! running.
//!
//! # Exit Codes
//!
//! The recorded failure code is the worker's exit status, except:
//!
//! - [`EXIT_SPAWN_FAILED`] (127) when the worker could not be started or
//!   its payload could not be read
//! - [`EXIT_TIMED_OUT`] (124) when the worker exceeded its timeout
//! - `128 + signo` when the worker was killed by a signal

use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use super::config::{Delivery, DispatcherConfig};
use crate::spool::SpoolEntry;
use crate::spool::store::read_payload;

/// Failure code when the worker cannot be started.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Failure code when the worker exceeds its timeout.
pub const EXIT_TIMED_OUT: i32 = crate::spool::ORPHAN_ERROR_CODE;

/// Added to the signal number when the worker dies by signal.
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Environment variable carrying the entry id.
pub const ENV_ENTRY: &str = "DIRSPOOL_ENTRY";

/// Environment variable carrying the entry's options string.
pub const ENV_OPTIONS: &str = "DIRSPOOL_OPTIONS";

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Failed with the given code.
    Failed(i32),
}

impl Outcome {
    /// Returns the numeric code (0 on success).
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failed(code) => code,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match exit_code(status) {
            0 => Outcome::Success,
            code => Outcome::Failed(code),
        }
    }
}

/// Maps an exit status to a single integer code.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_SIGNAL_BASE + signal;
        }
    }
    1
}

/// Runs the configured worker for `entry` and waits for it.
pub async fn run_worker(config: &DispatcherConfig, entry: &SpoolEntry) -> Outcome {
    let Some((program, args)) = config.command.split_first() else {
        warn!(num = %entry.num, "No worker command configured");
        return Outcome::Failed(EXIT_SPAWN_FAILED);
    };

    let payload = match config.delivery {
        Delivery::Stdin => match read_payload(entry) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(num = %entry.num, error = %e, "Cannot read payload for worker");
                return Outcome::Failed(EXIT_SPAWN_FAILED);
            }
        },
        Delivery::Path => None,
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env(ENV_ENTRY, entry.num.to_string())
        .env(ENV_OPTIONS, &entry.options)
        .stdin(if payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if config.delivery == Delivery::Path {
        cmd.arg(&entry.df_path);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(num = %entry.num, program = %program, error = %e, "Failed to spawn worker");
            return Outcome::Failed(EXIT_SPAWN_FAILED);
        }
    };
    debug!(num = %entry.num, pid = child.id(), "Worker started");

    if let (Some(bytes), Some(mut stdin)) = (payload, child.stdin.take()) {
        let num = entry.num;
        // Written concurrently so a worker that never reads stdin cannot
        // stall us on a full pipe
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&bytes).await {
                trace!(num = %num, error = %e, "Worker closed stdin early");
            }
        });
    }

    let waited = match config.worker_timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                warn!(num = %entry.num, timeout_secs = limit.as_secs(), "Worker timed out, killing");
                kill_group(&mut child).await;
                return Outcome::Failed(EXIT_TIMED_OUT);
            }
        },
        None => child.wait().await,
    };

    match waited {
        Ok(status) => {
            let outcome = Outcome::from_status(status);
            debug!(num = %entry.num, code = outcome.code(), "Worker finished");
            outcome
        }
        Err(e) => {
            warn!(num = %entry.num, error = %e, "Failed to wait for worker");
            kill_group(&mut child).await;
            Outcome::Failed(EXIT_SPAWN_FAILED)
        }
    }
}

/// Kills the worker's whole process group, then the worker itself.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: killpg only sends a signal; the group was created by us
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}
