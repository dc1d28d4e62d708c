//! The dispatch loop.
//!
//! ```text
//!          ┌──────────────────────────────────────────────┐
//!          ▼                                              │
//!   ┌────────────┐  entry   ┌────────────┐  exit 0   ┌─────────┐
//!   │  DEQUEUE   │ ───────► │  DISPATCH  │ ────────► │ delete  │
//!   └────────────┘          └────────────┘           └─────────┘
//!      │ nothing                  │ exit != 0 / timeout
//!      ▼                          ▼
//!   ┌────────────┐          ┌────────────────────────┐
//!   │    IDLE    │          │ ERROR + error/ + trap  │
//!   └────────────┘          └────────────────────────┘
//!      wakes on poll interval, listener submission,
//!      auto-reinsert, or a finished worker
//! ```
//!
//! Spool operations are blocking filesystem work and run on the blocking
//! pool. Workers run as tasks in a [`JoinSet`] capped at
//! [`DispatcherConfig::workers`]; finished ones are reaped without blocking
//! before every dequeue. Errors confined to one entry are handled by the
//! spool itself; a spool-wide failure is logged and retried after
//! [`DispatcherConfig::error_backoff`].
//!
//! An entry whose worker task is lost (dispatcher crash, panic) stays in
//! ELAB until the spool's orphan reclaim picks it up.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::DispatcherConfig;
use super::exec::{Outcome, run_worker};
use super::reinsert::run_auto_reinsert;
use super::trap;
use crate::spool::{Spool, SpoolEntry, SpoolError};
use crate::types::EntryState;

/// Errors that can occur in the dispatch loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Spool-wide failure.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A blocking spool call panicked or was cancelled.
    #[error("spool task failed: {0}")]
    Join(#[from] JoinError),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// What one finished worker task produced.
type Finished = std::result::Result<(SpoolEntry, Outcome), JoinError>;

/// Dispatches spool entries to worker processes.
pub struct Dispatcher {
    spool: Arc<Spool>,
    config: Arc<DispatcherConfig>,
    wake: Arc<Notify>,
    workers: JoinSet<(SpoolEntry, Outcome)>,
}

impl Dispatcher {
    /// Creates a dispatcher for `spool`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] if no worker command is configured,
    /// or if a worker could outlive the spool's maximum elaboration time.
    /// Such a worker's entry would be reclaimed as an orphan and run a
    /// second time while the first run is still going.
    pub fn new(spool: Arc<Spool>, config: DispatcherConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(DispatchError::Config("no worker command".to_string()));
        }
        if let Some(max_elab) = spool.config().max_elab_time {
            match config.worker_timeout {
                Some(timeout) if timeout < max_elab => {}
                Some(timeout) => {
                    return Err(DispatchError::Config(format!(
                        "worker timeout of {}s must be shorter than the spool's maximum elaboration time of {}s",
                        timeout.as_secs(),
                        max_elab.as_secs()
                    )));
                }
                None => {
                    return Err(DispatchError::Config(format!(
                        "workers need a timeout shorter than the spool's maximum elaboration time of {}s",
                        max_elab.as_secs()
                    )));
                }
            }
        }
        Ok(Dispatcher {
            spool,
            config: Arc::new(config),
            wake: Arc::new(Notify::new()),
            workers: JoinSet::new(),
        })
    }

    /// Returns the handle that wakes an idle loop, for submission paths.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Returns the number of workers currently running.
    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Runs until `shutdown` is cancelled, then waits for running workers.
    #[instrument(skip_all, fields(root = %self.spool.root().display()))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            workers = self.config.workers,
            delivery = %self.config.delivery,
            "Dispatcher started"
        );

        let mut side_tasks = JoinSet::new();
        if let Some(after) = self.config.auto_reinsert_after {
            side_tasks.spawn(run_auto_reinsert(
                Arc::clone(&self.spool),
                after,
                Arc::clone(&self.wake),
                shutdown.clone(),
            ));
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.reap().await;

            if self.workers.len() >= self.config.workers {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(finished) = self.workers.join_next() => self.complete(finished).await,
                }
                continue;
            }

            match self.dispatch_next().await {
                Ok(true) => {}
                Ok(false) => {
                    trace!("Spool idle");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.wake.notified() => debug!("Woken"),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        Some(finished) = self.workers.join_next(), if !self.workers.is_empty() => {
                            self.complete(finished).await;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, backoff_secs = self.config.error_backoff.as_secs(), "Dispatch failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(in_flight = self.workers.len(), "Dispatcher stopping");
        self.drain().await;
        while side_tasks.join_next().await.is_some() {}
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Claims one entry and starts a worker for it.
    ///
    /// Returns `Ok(false)` when the spool has nothing to claim. A spool-wide
    /// failure, such as a vanished spool root, is an error.
    pub async fn dispatch_next(&mut self) -> Result<bool> {
        let spool = Arc::clone(&self.spool);
        let Some(entry) = tokio::task::spawn_blocking(move || spool.try_dequeue()).await?? else {
            return Ok(false);
        };

        debug!(num = %entry.num, size = entry.size, "Dispatching entry");
        let config = Arc::clone(&self.config);
        self.workers.spawn(async move {
            let outcome = run_worker(&config, &entry).await;
            (entry, outcome)
        });
        Ok(true)
    }

    /// Handles every worker that has already finished, without waiting.
    pub async fn reap(&mut self) {
        while let Some(finished) = self.workers.try_join_next() {
            self.complete(finished).await;
        }
    }

    /// Waits for every running worker and handles its outcome.
    pub async fn drain(&mut self) {
        while let Some(finished) = self.workers.join_next().await {
            self.complete(finished).await;
        }
    }

    /// Applies a worker's outcome to its entry.
    async fn complete(&self, finished: Finished) {
        let (entry, outcome) = match finished {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Worker task panicked; entry left for orphan reclaim");
                return;
            }
        };
        let num = entry.num;

        let result = match outcome {
            Outcome::Success => self.blocking(move |spool| spool.delete(num)).await,
            Outcome::Failed(code) => {
                let result = self
                    .blocking(move |spool| spool.set_state(num, EntryState::Error, code).map(|_| ()))
                    .await;
                if let Some(trap) = &self.config.trap {
                    trap::fire(trap, num, code);
                }
                result
            }
        };

        match result {
            Ok(()) if outcome == Outcome::Success => info!(num = %num, "Entry done"),
            Ok(()) => warn!(num = %num, code = outcome.code(), "Entry failed"),
            Err(e) => error!(num = %num, code = outcome.code(), error = %e, "Failed to record worker outcome"),
        }
    }

    async fn blocking(
        &self,
        op: impl FnOnce(&Spool) -> crate::spool::Result<()> + Send + 'static,
    ) -> Result<()> {
        let spool = Arc::clone(&self.spool);
        tokio::task::spawn_blocking(move || op(&spool)).await??;
        Ok(())
    }
}
