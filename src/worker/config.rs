//! Dispatcher configuration.
//!
//! # Environment
//!
//! [`DispatcherConfig::from_env`] reads:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `DIRSPOOL_COMMAND` | worker command line, split on whitespace | (none) |
//! | `DIRSPOOL_DELIVERY` | `stdin` or `path` | `stdin` |
//! | `DIRSPOOL_WORKERS` | concurrent worker processes | 1 |
//! | `DIRSPOOL_WORKER_TIMEOUT_SECS` | worker execution ceiling, below `DIRSPOOL_MAX_ELAB_SECS`; `0` disables | 600 |
//! | `DIRSPOOL_TRAP` | failure notification command line | (none) |
//! | `DIRSPOOL_LISTEN` | Unix socket path for direct submissions | (none) |
//! | `DIRSPOOL_AUTO_REINSERT_SECS` | age after which ERROR entries are retried; `0` disables | 0 |
//! | `DIRSPOOL_POLL_MS` | idle rescan interval | 1000 |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 1;

/// Default worker execution timeout (10 minutes).
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 600;

/// Default interval between rescans of an idle spool.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Sleep after a spool-wide failure before the next attempt.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How the payload reaches the worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Payload bytes are written to the worker's standard input.
    #[default]
    Stdin,
    /// The data file path is appended as the last argument.
    Path,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Delivery::Stdin => "stdin",
            Delivery::Path => "path",
        })
    }
}

impl FromStr for Delivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdin" => Ok(Delivery::Stdin),
            "path" => Ok(Delivery::Path),
            other => Err(format!("unknown delivery mode {other:?} (expected stdin or path)")),
        }
    }
}

/// Configuration for the dispatch daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Worker program followed by its arguments.
    pub command: Vec<String>,

    /// How the payload is handed over.
    pub delivery: Delivery,

    /// Maximum number of worker processes running at once.
    pub workers: usize,

    /// Workers still running after this long are killed and the entry fails.
    pub worker_timeout: Option<Duration>,

    /// Command run on every failure with the entry id and failure code
    /// appended as arguments.
    pub trap: Option<Vec<String>>,

    /// Unix socket accepting direct submissions.
    pub listen: Option<PathBuf>,

    /// ERROR entries older than this are periodically returned to WAIT.
    pub auto_reinsert_after: Option<Duration>,

    /// Rescan interval while the spool is idle.
    pub poll_interval: Duration,

    /// Sleep after a spool-wide failure.
    pub error_backoff: Duration,
}

impl DispatcherConfig {
    /// Creates a configuration running `command` with default settings.
    pub fn new(command: Vec<String>) -> Self {
        DispatcherConfig {
            command,
            delivery: Delivery::default(),
            workers: DEFAULT_WORKERS,
            worker_timeout: Some(Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS)),
            trap: None,
            listen: None,
            auto_reinsert_after: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Creates a configuration from `DIRSPOOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Creates a configuration from an arbitrary variable lookup.
    ///
    /// Unset or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let command_line = |name: &str| {
            lookup(name)
                .map(|v| split_command(&v))
                .filter(|argv| !argv.is_empty())
        };
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        let defaults = Self::new(command_line("DIRSPOOL_COMMAND").unwrap_or_default());
        DispatcherConfig {
            delivery: lookup("DIRSPOOL_DELIVERY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.delivery),
            workers: number("DIRSPOOL_WORKERS")
                .filter(|n| *n > 0)
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
                .unwrap_or(defaults.workers),
            worker_timeout: match number("DIRSPOOL_WORKER_TIMEOUT_SECS") {
                Some(0) => None,
                Some(s) => Some(Duration::from_secs(s)),
                None => defaults.worker_timeout,
            },
            trap: command_line("DIRSPOOL_TRAP"),
            listen: lookup("DIRSPOOL_LISTEN")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            auto_reinsert_after: number("DIRSPOOL_AUTO_REINSERT_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            poll_interval: number("DIRSPOOL_POLL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            ..defaults
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Sets the worker concurrency. Zero is clamped to one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_trap(mut self, trap: Option<Vec<String>>) -> Self {
        self.trap = trap.filter(|argv| !argv.is_empty());
        self
    }

    pub fn with_listen(mut self, listen: Option<PathBuf>) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_auto_reinsert_after(mut self, after: Option<Duration>) -> Self {
        self.auto_reinsert_after = after;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Splits a command line on whitespace. No quoting is interpreted.
pub fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}
