//! Per-spool sequence number allocator.
//!
//! The counter file (`<spool>/cnt`) holds a single integer: the last id
//! handed out. Allocation is a read-modify-write under the spool-level lock
//! (`<spool>/lock`), and the new value is written with temp-then-rename so a
//! crash leaves either the old or the new value, never a torn one.
//!
//! Zero is reserved as "unset" and never returned.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::time::Duration;

use tracing::{trace, warn};

use super::error::Result;
use super::fsync::replace_file;
use super::lock::LockManager;
use crate::types::EntryId;

/// Name of the counter file inside a spool root.
pub const COUNTER_FILE: &str = "cnt";

/// Name of the spool-level lock inside a spool root.
pub const SPOOL_LOCK_FILE: &str = "lock";

/// Allocates entry ids for one spool.
#[derive(Debug, Clone)]
pub struct Counter {
    path: PathBuf,
    lock_path: PathBuf,
    /// Sleep inside the locked section, for exercising contention.
    #[cfg(test)]
    pub(crate) hold: Option<Duration>,
}

impl Counter {
    /// Creates a counter for the spool rooted at `spool_dir`.
    pub fn new(spool_dir: &Path) -> Self {
        Counter {
            path: spool_dir.join(COUNTER_FILE),
            lock_path: spool_dir.join(SPOOL_LOCK_FILE),
            #[cfg(test)]
            hold: None,
        }
    }

    /// Returns the path to the counter file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates the next id.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::TimedOut`](super::SpoolError::TimedOut) if the
    /// spool lock cannot be acquired, or a system error if the counter cannot
    /// be written.
    pub fn next(&self, locks: &LockManager) -> Result<EntryId> {
        let guard = locks.lock(&self.lock_path)?;

        let current = self.read();

        #[cfg(test)]
        if let Some(hold) = self.hold {
            std::thread::sleep(hold);
        }

        let next = match current.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        let tmp = self
            .path
            .with_file_name(format!("{COUNTER_FILE}.{}.tmp", std::process::id()));
        replace_file(&self.path, &tmp, format!("{next}\n").as_bytes())?;

        guard.release()?;
        trace!(num = next, "Allocated entry id");
        Ok(EntryId(next))
    }

    /// Returns the last allocated id without incrementing.
    pub fn peek(&self) -> EntryId {
        EntryId(self.read())
    }

    /// Reads the stored value; absent or unparseable counts as zero.
    fn read(&self) -> u64 {
        match read_first_line(&self.path) {
            Ok(Some(line)) => match line.trim().parse() {
                Ok(n) => n,
                Err(_) => {
                    warn!(path = %self.path.display(), value = %line, "Unparseable counter, restarting at 0");
                    0
                }
            },
            Ok(None) => 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable counter, restarting at 0");
                0
            }
        }
    }
}

fn read_first_line(path: &Path) -> io::Result<Option<String>> {
    let file = File::open(path)?;
    BufReader::new(file).lines().next().transpose()
}
