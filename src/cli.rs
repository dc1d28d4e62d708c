//! Command-line surface.
//!
//! ```text
//! dirspool [--spool DIR] [-v|-q] <command>
//!
//!   daemon [options] -- CMD [ARGS...]   run the dispatcher
//!   enqueue [--file PATH] [--options S] queue a payload (stdin by default)
//!   list [--state S] [--limit N] [--json]
//!   show ID [--payload]
//!   delete ID
//!   reinsert ID
//!   reclaim                             run one orphan reclaim pass
//!   stats [--json]
//! ```
//!
//! Daemon flags override the `DIRSPOOL_*` environment; anything left unset
//! keeps the environment or built-in default. Failures print the error's own
//! description and exit nonzero.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::server::{Listener, ListenerError};
use crate::spool::time::format_time;
use crate::spool::{ListFilter, Payload, Spool, SpoolConfig, SpoolEntry, SpoolError};
use crate::types::{EntryId, EntryState};
use crate::worker::config::split_command;
use crate::worker::{Delivery, DispatchError, Dispatcher, DispatcherConfig};

/// Errors surfaced to the command line.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Spool(#[from] SpoolError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Arguments that parse but cannot be used together.
    #[error("{0}")]
    Usage(String),
}

/// Result type for command execution.
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Parser)]
#[command(name = "dirspool", version, about = "Disk-backed work queue with a worker dispatcher")]
pub struct Cli {
    /// Spool root directory
    #[arg(long, short = 's', env = "DIRSPOOL_DIR", global = true, default_value = "spool")]
    pub spool: PathBuf,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Errors only
    #[arg(long, short, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the dispatch daemon until SIGINT or SIGTERM
    Daemon(DaemonArgs),

    /// Queue a payload read from a file or standard input
    Enqueue {
        /// Read the payload from this file instead of stdin
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
        /// Single-line string passed through to the worker
        #[arg(long, default_value = "")]
        options: String,
    },

    /// List entries
    List {
        /// Only entries in this state (wait, elab, error)
        #[arg(long)]
        state: Option<EntryState>,
        /// Maximum entries to show
        #[arg(long)]
        limit: Option<usize>,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Show one entry as JSON
    Show {
        id: EntryId,
        /// Write the raw payload to stdout instead
        #[arg(long)]
        payload: bool,
    },

    /// Delete an entry and its payload
    Delete { id: EntryId },

    /// Return an entry to WAIT
    Reinsert { id: EntryId },

    /// Correct entries stuck in ELAB past their elaboration time
    Reclaim,

    /// Count entries per state
    Stats {
        #[arg(long)]
        json: bool,
    },
}

/// Daemon settings; each overrides its `DIRSPOOL_*` variable when given.
#[derive(Debug, Clone, Default, Args)]
pub struct DaemonArgs {
    /// How the payload reaches the worker: stdin or path
    #[arg(long)]
    pub delivery: Option<Delivery>,

    /// Concurrent worker processes
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,

    /// Worker timeout in seconds; 0 disables (needs DIRSPOOL_MAX_ELAB_SECS=0)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Command run on failure with the entry id and code appended
    #[arg(long, value_name = "COMMAND")]
    pub trap: Option<String>,

    /// Unix socket accepting direct submissions
    #[arg(long, value_name = "PATH")]
    pub listen: Option<PathBuf>,

    /// Retry ERROR entries older than this many seconds; 0 disables
    #[arg(long, value_name = "SECS")]
    pub auto_reinsert: Option<u64>,

    /// Idle rescan interval in milliseconds
    #[arg(long, value_name = "MS")]
    pub poll_ms: Option<u64>,

    /// Worker command and arguments
    #[arg(last = true, value_name = "CMD")]
    pub command: Vec<String>,
}

impl DaemonArgs {
    /// Applies the flags that were given on top of `base`.
    pub fn apply(self, mut base: DispatcherConfig) -> DispatcherConfig {
        if !self.command.is_empty() {
            base.command = self.command;
        }
        if let Some(delivery) = self.delivery {
            base = base.with_delivery(delivery);
        }
        if let Some(workers) = self.workers {
            base = base.with_workers(workers);
        }
        if let Some(secs) = self.timeout {
            base = base.with_worker_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(trap) = self.trap {
            base = base.with_trap(Some(split_command(&trap)));
        }
        if let Some(listen) = self.listen {
            base = base.with_listen(Some(listen));
        }
        if let Some(secs) = self.auto_reinsert {
            base = base.with_auto_reinsert_after((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(ms) = self.poll_ms.filter(|ms| *ms > 0) {
            base = base.with_poll_interval(Duration::from_millis(ms));
        }
        base
    }
}

impl Cli {
    /// Runs the parsed command against the spool named on the command line.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Daemon(args) => run_daemon(self.spool, args).await,
            command => {
                let spool = Spool::open(self.spool, SpoolConfig::from_env())?;
                let stdout = io::stdout();
                execute(&spool, command, &mut io::stdin().lock(), &mut stdout.lock())
            }
        }
    }
}

/// Runs one administrative command.
///
/// `input` supplies the payload for `enqueue` without `--file`.
pub fn execute(spool: &Spool, command: Command, input: &mut impl Read, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Daemon(_) => {
            return Err(CliError::Usage("the daemon runs through Cli::run".to_string()));
        }
        Command::Enqueue { file, options } => {
            let id = match file {
                Some(path) => spool.enqueue(Payload::File(&path), &options)?,
                None => {
                    let mut payload = Vec::new();
                    input.read_to_end(&mut payload)?;
                    spool.enqueue(Payload::Bytes(&payload), &options)?
                }
            };
            writeln!(out, "{id}")?;
        }
        Command::List { state, limit, json } => {
            let mut filter = state.map_or_else(ListFilter::all, ListFilter::state);
            if let Some(limit) = limit {
                filter = filter.with_limit(limit);
            }
            for entry in spool.list(filter)? {
                if json {
                    writeln!(out, "{}", serde_json::to_string(&entry)?)?;
                } else {
                    writeln!(out, "{}", summary_line(&entry))?;
                }
            }
        }
        Command::Show { id, payload } => {
            let entry = spool.get(id)?;
            if payload {
                out.write_all(&spool.read_payload(&entry)?)?;
            } else {
                writeln!(out, "{}", serde_json::to_string_pretty(&entry)?)?;
            }
        }
        Command::Delete { id } => spool.delete(id)?,
        Command::Reinsert { id } => {
            let entry = spool.reinsert(id)?;
            writeln!(out, "{}", summary_line(&entry))?;
        }
        Command::Reclaim => {
            let report = spool.reclaim_orphans()?;
            writeln!(
                out,
                "inspected {} reinserted {} failed {} clamped {}",
                report.inspected, report.reinserted, report.failed, report.clamped
            )?;
        }
        Command::Stats { json } => {
            let stats = spool.stats()?;
            if json {
                writeln!(out, "{}", serde_json::to_string(&stats)?)?;
            } else {
                writeln!(out, "wait     {}", stats.wait)?;
                writeln!(out, "elab     {}", stats.elab)?;
                writeln!(out, "error    {}", stats.error)?;
                writeln!(out, "invalid  {}", stats.invalid)?;
                writeln!(out, "shards   {}", stats.shards)?;
                writeln!(out, "counter  {}", stats.counter)?;
            }
        }
    }
    Ok(())
}

fn summary_line(entry: &SpoolEntry) -> String {
    format!(
        "{:>10}  {:<5}  {:>4}  {:>10}  {}  {}",
        entry.num,
        entry.state,
        entry.error,
        entry.size,
        format_time(entry.mtime),
        entry.options
    )
}

/// Runs the dispatcher, and the listener when configured, until a
/// termination signal arrives.
pub async fn run_daemon(root: PathBuf, args: DaemonArgs) -> Result<()> {
    let config = args.apply(DispatcherConfig::from_env());
    if config.command.is_empty() {
        return Err(CliError::Usage(
            "no worker command: pass it after `--` or set DIRSPOOL_COMMAND".to_string(),
        ));
    }

    let spool = Arc::new(Spool::open(root, SpoolConfig::from_env())?);
    let report = spool.reclaim_orphans()?;
    if report.reinserted + report.failed > 0 {
        info!(
            reinserted = report.reinserted,
            failed = report.failed,
            "Reclaimed orphans at startup"
        );
    }

    let listen = config.listen.clone();
    let dispatcher = Dispatcher::new(Arc::clone(&spool), config)?;
    let shutdown = CancellationToken::new();

    let listener = match listen {
        Some(path) => {
            let listener = Listener::bind(path, Arc::clone(&spool), dispatcher.wake_handle())?;
            Some(tokio::spawn(listener.run(shutdown.clone())))
        }
        None => None,
    };

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        signal_token.cancel();
    });

    let result = dispatcher.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(task) = listener {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Listener failed"),
            Err(e) => error!(error = %e, "Listener task panicked"),
        }
    }
    result.map_err(CliError::from)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot watch SIGTERM, relying on SIGINT"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot watch SIGINT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dirspool").chain(args.iter().copied())).unwrap()
    }

    fn run(spool: &Spool, args: &[&str], input: &[u8]) -> Result<String> {
        let mut out = Vec::new();
        execute(spool, parse(args).command, &mut &input[..], &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    // ─── Parsing ───

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn daemon_takes_trailing_command() {
        let cli = parse(&["--spool", "/tmp/q", "daemon", "-j", "3", "--", "/bin/worker", "--flag"]);
        assert_eq!(cli.spool, PathBuf::from("/tmp/q"));
        let Command::Daemon(args) = cli.command else {
            panic!("expected daemon");
        };
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.command, vec!["/bin/worker", "--flag"]);
    }

    #[test]
    fn bad_state_is_rejected() {
        assert!(Cli::try_parse_from(["dirspool", "list", "--state", "done"]).is_err());
    }

    #[test]
    fn daemon_flags_override_base() {
        let base = DispatcherConfig::new(vec!["env-cmd".to_string()])
            .with_auto_reinsert_after(Some(Duration::from_secs(9)));
        let args = DaemonArgs {
            delivery: Some(Delivery::Path),
            timeout: Some(0),
            trap: Some("notify --loud".to_string()),
            auto_reinsert: Some(0),
            ..DaemonArgs::default()
        };

        let config = args.apply(base);
        assert_eq!(config.command, vec!["env-cmd"]);
        assert_eq!(config.delivery, Delivery::Path);
        assert_eq!(config.worker_timeout, None);
        assert_eq!(config.trap, Some(vec!["notify".to_string(), "--loud".to_string()]));
        assert_eq!(config.auto_reinsert_after, None);
    }

    // ─── Administrative commands ───

    #[test]
    fn enqueue_show_delete() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path(), SpoolConfig::new()).unwrap();

        let id = run(&spool, &["enqueue", "--options", "k=v"], b"payload").unwrap();
        let id = id.trim();

        let shown = run(&spool, &["show", id], b"").unwrap();
        let json: serde_json::Value = serde_json::from_str(&shown).unwrap();
        assert_eq!(json["status"], "wait");
        assert_eq!(json["options"], "k=v");
        assert_eq!(run(&spool, &["show", id, "--payload"], b"").unwrap(), "payload");

        run(&spool, &["delete", id], b"").unwrap();
        assert!(matches!(
            run(&spool, &["show", id], b""),
            Err(CliError::Spool(SpoolError::NotFound(_)))
        ));
    }

    #[test]
    fn enqueue_from_file() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path().join("spool"), SpoolConfig::new()).unwrap();
        let source = dir.path().join("input");
        std::fs::write(&source, b"from disk").unwrap();

        let id = run(&spool, &["enqueue", "--file", source.to_str().unwrap()], b"").unwrap();
        let entry = spool.get(id.trim().parse().unwrap()).unwrap();
        assert_eq!(spool.read_payload(&entry).unwrap(), b"from disk");
    }

    #[test]
    fn list_filters_by_state() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path(), SpoolConfig::new()).unwrap();
        let a = spool.enqueue(Payload::Bytes(b"a"), "").unwrap();
        spool.enqueue(Payload::Bytes(b"b"), "").unwrap();
        spool.set_state(a, EntryState::Error, 7).unwrap();

        let errors = run(&spool, &["list", "--state", "error", "--json"], b"").unwrap();
        let lines: Vec<_> = errors.lines().collect();
        assert_eq!(lines.len(), 1);
        let json: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(json["error"], 7);

        assert_eq!(run(&spool, &["list"], b"").unwrap().lines().count(), 2);
    }

    #[test]
    fn reinsert_and_stats() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path(), SpoolConfig::new()).unwrap();
        let id = spool.enqueue(Payload::Bytes(b"x"), "").unwrap();
        spool.set_state(id, EntryState::Error, 1).unwrap();

        let line = run(&spool, &["reinsert", &id.to_string()], b"").unwrap();
        assert!(line.contains("wait"));

        let stats = run(&spool, &["stats", "--json"], b"").unwrap();
        let json: serde_json::Value = serde_json::from_str(&stats).unwrap();
        assert_eq!(json["wait"], 1);
        assert_eq!(json["error"], 0);
    }

    #[test]
    fn missing_entry_reports_not_found() {
        let dir = tempdir().unwrap();
        let spool = Spool::open(dir.path(), SpoolConfig::new()).unwrap();

        let err = run(&spool, &["reinsert", "42"], b"").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
