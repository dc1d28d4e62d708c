//! Periodic retry of failed entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::spool::Spool;

/// Shortest interval between error-directory scans.
pub const MIN_REINSERT_TICK: Duration = Duration::from_secs(1);

/// Returns how often to scan for entries that become due after `after`.
pub fn tick_interval(after: Duration) -> Duration {
    (after / 10).max(MIN_REINSERT_TICK)
}

/// Scans the error directory every [`tick_interval`] and returns entries
/// that have been in ERROR for at least `after` to WAIT.
///
/// `wake` is notified whenever something was reinserted.
#[instrument(skip_all, fields(after_secs = after.as_secs()))]
pub async fn run_auto_reinsert(
    spool: Arc<Spool>,
    after: Duration,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick_interval(after));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(tick_secs = tick_interval(after).as_secs(), "Auto-reinsert started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let spool = Arc::clone(&spool);
        match tokio::task::spawn_blocking(move || spool.reinsert_aged_errors(after)).await {
            Ok(Ok(0)) => debug!("No aged errors"),
            Ok(Ok(_)) => wake.notify_one(),
            Ok(Err(e)) => warn!(error = %e, "Auto-reinsert scan failed"),
            Err(e) => error!(error = %e, "Auto-reinsert task panicked"),
        }
    }

    debug!("Auto-reinsert stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::{Payload, SpoolConfig, store};
    use crate::types::EntryState;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    #[test]
    fn tick_is_a_tenth_with_floor() {
        assert_eq!(tick_interval(Duration::from_secs(600)), Duration::from_secs(60));
        assert_eq!(tick_interval(Duration::from_secs(5)), MIN_REINSERT_TICK);
        assert_eq!(tick_interval(Duration::ZERO), MIN_REINSERT_TICK);
    }

    #[tokio::test]
    async fn aged_error_is_reinserted_and_wakes() {
        let dir = tempdir().unwrap();
        let spool = Arc::new(Spool::open(dir.path(), SpoolConfig::new()).unwrap());
        let id = spool.enqueue(Payload::Bytes(b"x"), "").unwrap();
        let mut failed = spool.set_state(id, EntryState::Error, 1).unwrap();
        failed.mtime = Utc.timestamp_opt(1_000_000_000, 0).unwrap();
        store::write_control(&failed).unwrap();

        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_auto_reinsert(
            Arc::clone(&spool),
            Duration::from_secs(60),
            Arc::clone(&wake),
            shutdown.clone(),
        ));

        // The first tick fires immediately
        tokio::time::timeout(Duration::from_secs(5), wake.notified())
            .await
            .unwrap();
        assert_eq!(spool.get(id).unwrap().state, EntryState::Wait);

        shutdown.cancel();
        task.await.unwrap();
    }
}
