//! Mapping of entry ids to bounded-size shard directories.
//!
//! Entry `num` lives in `sd_<base>` where `base = num - num % N`, so a shard
//! never holds more than `N` pairs and directory scans stay cheap however
//! deep the backlog gets.
//!
//! # File Layout
//!
//! ```text
//! <spool>/
//!   cnt                 # counter (counter.rs)
//!   lock                # spool-level lock
//!   error/              # failed entries, flat
//!   sd_0.lock           # shard lock, guards creation and removal of sd_0
//!   sd_0/
//!     cf_*, df_*, lk_*  # entry pairs and entry locks (store.rs)
//!     date              # date marker: "content may have changed" hint
//!     date-lock         # guards date marker rewrites
//! ```
//!
//! With sharding disabled every entry lives directly in the spool root and
//! the root carries the date marker.
//!
//! # Removal
//!
//! An empty shard is removed only once `base + N` is at or below the live
//! counter value: every id it could ever hold has been handed out, so no
//! producer will write there again. A leftover empty shard is harmless; the
//! check guards against deleting a shard that is still being filled.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use super::config::SpoolConfig;
use super::error::{Result, SpoolError};
use super::fsync::replace_file;
use super::lock::LockManager;
use super::store::{FileRole, classify};
use crate::types::EntryId;

/// Prefix of shard directory names.
pub const SHARD_PREFIX: &str = "sd_";

/// Name of the date marker inside a shard.
pub const DATE_MARKER: &str = "date";

/// Name of the lock guarding the date marker.
pub const DATE_LOCK: &str = "date-lock";

/// Name of the error directory inside a spool root.
pub const ERROR_DIR: &str = "error";

/// Non-entry names that belong in a shard (or in the root when unsharded).
pub const SHARD_METADATA: &[&str] = &[DATE_MARKER, DATE_LOCK];

/// Non-entry names that belong in a spool root.
pub const ROOT_METADATA: &[&str] = &[
    DATE_MARKER,
    DATE_LOCK,
    super::counter::COUNTER_FILE,
    super::counter::SPOOL_LOCK_FILE,
    ERROR_DIR,
];

/// Returns the shard name for `num` with `per_shard` entries per shard.
pub fn resolve(num: EntryId, per_shard: u64) -> String {
    let per_shard = per_shard.max(1);
    format!("{SHARD_PREFIX}{}", num.get() - num.get() % per_shard)
}

/// One shard directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Lowest id the shard can hold.
    pub base: u64,
    /// Directory holding the shard's entries.
    pub path: PathBuf,
}

impl Shard {
    /// Returns the directory name, or an empty string for the unsharded root.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.starts_with(SHARD_PREFIX))
            .unwrap_or("")
    }
}

/// "Content may have changed" hint written into every shard.
///
/// Compared for equality only; the value is the writer's wall-clock time
/// with nanoseconds so two touches in the same second still differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateMarker {
    pub secs: u64,
    pub nanos: u32,
}

impl DateMarker {
    /// Returns a marker for the current time.
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        DateMarker {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    /// Parses `secs` or `secs.nanos`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (secs, nanos) = match s.split_once('.') {
            Some((secs, nanos)) => (secs, nanos.parse().ok()?),
            None => (s, 0),
        };
        Some(DateMarker {
            secs: secs.parse().ok()?,
            nanos,
        })
    }
}

impl fmt::Display for DateMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Shard layout of one spool.
#[derive(Debug, Clone)]
pub struct ShardIndex {
    root: PathBuf,
    per_shard: u64,
    sharding: bool,
}

impl ShardIndex {
    /// Creates the index for the spool rooted at `root`.
    pub fn new(root: &Path, config: &SpoolConfig) -> Self {
        ShardIndex {
            root: root.to_path_buf(),
            per_shard: config.entries_per_shard.max(1),
            sharding: config.sharding,
        }
    }

    /// Returns the spool root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the error directory.
    pub fn error_dir(&self) -> PathBuf {
        self.root.join(ERROR_DIR)
    }

    /// Returns true when entries are spread across `sd_<base>` directories.
    pub fn is_sharded(&self) -> bool {
        self.sharding
    }

    /// Returns the shard `num` belongs to.
    pub fn shard_for(&self, num: EntryId) -> Shard {
        if !self.sharding {
            return self.root_shard();
        }
        let base = num.get() - num.get() % self.per_shard;
        Shard {
            base,
            path: self.root.join(resolve(num, self.per_shard)),
        }
    }

    fn root_shard(&self) -> Shard {
        Shard {
            base: 0,
            path: self.root.clone(),
        }
    }

    /// Names that are expected in a shard directory besides entry files.
    pub fn metadata_names(&self) -> &'static [&'static str] {
        if self.sharding {
            SHARD_METADATA
        } else {
            ROOT_METADATA
        }
    }

    fn shard_lock_path(&self, shard: &Shard) -> PathBuf {
        self.root.join(format!("{}.lock", shard.name()))
    }

    /// Creates the shard for `num` if it does not exist yet.
    ///
    /// Creation happens under the shard lock, so concurrent creators and a
    /// concurrent [`maybe_remove`](Self::maybe_remove) cannot interleave.
    pub fn ensure(&self, locks: &LockManager, num: EntryId) -> Result<Shard> {
        let shard = self.shard_for(num);
        if !self.sharding || shard.path.is_dir() {
            return Ok(shard);
        }

        let guard = locks.lock(&self.shard_lock_path(&shard))?;
        match std::fs::create_dir(&shard.path) {
            Ok(()) => {
                super::fsync::fsync_dir(&self.root)?;
                debug!(shard = %shard.name(), "Created shard");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(SpoolError::from_io_at(e, &shard.path)),
        }
        guard.release()?;
        Ok(shard)
    }

    /// Lists shards in ascending base order.
    ///
    /// With sharding disabled the spool root is the only shard.
    pub fn list_shards(&self) -> Result<Vec<Shard>> {
        if !self.sharding {
            return Ok(vec![self.root_shard()]);
        }

        let mut shards = Vec::new();
        for dirent in std::fs::read_dir(&self.root).map_err(|e| SpoolError::from_io_at(e, &self.root))? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(base) = name
                .to_str()
                .and_then(|n| n.strip_prefix(SHARD_PREFIX))
                .and_then(|b| b.parse::<u64>().ok())
            else {
                continue;
            };
            if dirent.file_type().is_ok_and(|t| t.is_dir()) {
                shards.push(Shard {
                    base,
                    path: dirent.path(),
                });
            }
        }
        shards.sort_by_key(|s| s.base);
        Ok(shards)
    }

    /// Removes `shard` if it is empty and can no longer receive entries.
    ///
    /// Returns `Ok(true)` if the directory was removed. Every reason to keep
    /// the shard (ids still unallocated, entries present, lock contended,
    /// concurrent write) yields `Ok(false)`.
    pub fn maybe_remove(&self, locks: &LockManager, shard: &Shard, counter: EntryId) -> Result<bool> {
        if !self.sharding || shard.path == self.root {
            return Ok(false);
        }
        if shard.base.saturating_add(self.per_shard) > counter.get() {
            trace!(shard = %shard.name(), counter = %counter, "Shard may still receive entries");
            return Ok(false);
        }

        let guard = match locks.try_acquire(&self.shard_lock_path(shard)) {
            Ok(guard) => guard,
            Err(SpoolError::TimedOut(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut strays = Vec::new();
        let dirents = match std::fs::read_dir(&shard.path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        for dirent in dirents {
            let dirent = dirent?;
            let name = dirent.file_name();
            if matches!(name.to_str().map(classify), Some(r) if r != FileRole::Other) {
                return Ok(false);
            }
            strays.push(dirent.path());
        }

        for stray in &strays {
            let name = stray.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !SHARD_METADATA.contains(&name) {
                warn!(path = %stray.display(), "Purging foreign file from shard");
            }
            if let Err(e) = std::fs::remove_file(stray)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %stray.display(), error = %e, "Cannot purge stray file; keeping shard");
                return Ok(false);
            }
        }

        match std::fs::remove_dir(&shard.path) {
            Ok(()) => {
                super::fsync::fsync_dir(&self.root)?;
                guard.release()?;
                debug!(shard = %shard.name(), "Removed empty shard");
                Ok(true)
            }
            // Someone wrote into it after our listing
            Err(_) => Ok(false),
        }
    }

    /// Records that the content of `dir` changed.
    ///
    /// The marker is a hint; failing to write it is logged and otherwise
    /// ignored.
    pub fn touch_date(&self, locks: &LockManager, dir: &Path) {
        let marker = DateMarker::now();
        let result = locks.lock(&dir.join(DATE_LOCK)).and_then(|guard| {
            let tmp = dir.join(format!("{DATE_MARKER}.{:x}.tmp", std::process::id()));
            replace_file(&dir.join(DATE_MARKER), &tmp, marker.to_string().as_bytes())?;
            guard.release()
        });
        match result {
            Ok(()) => trace!(dir = %dir.display(), %marker, "Touched date marker"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to update date marker"),
        }
    }

    /// Reads the date marker of `dir`, if any.
    pub fn read_date(dir: &Path) -> Option<DateMarker> {
        std::fs::read_to_string(dir.join(DATE_MARKER))
            .ok()
            .and_then(|s| DateMarker::parse(&s))
    }
}
