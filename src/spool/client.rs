//! The spool handle.
//!
//! A [`Spool`] is the context object every operation goes through: it owns
//! the configuration snapshot, the lock manager, the shard layout, and the
//! process-local list cache. Nothing is global, so a process can hold
//! handles to several spools (or several handles to the same spool, which
//! then coordinate through the filesystem exactly like separate processes).
//!
//! # Entry Lifecycle
//!
//! ```text
//! enqueue ──► WAIT ──dequeue──► ELAB ──delete──► (gone)
//!              ▲                  │
//!              │                  └─set_state(Error)──► ERROR (error/)
//!              └──────────reinsert / set_state(Wait)──────┘
//! ```
//!
//! Every transition happens under the entry's lock file. Reads for listing
//! and lookup are lockless; a control file is always replaced atomically so
//! a lockless reader sees either the old or the new version.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::SpoolCache;
use super::config::SpoolConfig;
use super::counter::Counter;
use super::entry::SpoolEntry;
use super::error::{Result, SpoolError};
use super::lock::{LockGuard, LockManager};
use super::shard::{ERROR_DIR, Shard, ShardIndex};
use super::store::{self, CONTROL_PREFIX, ControlName, Payload, entry_lock_path};
use super::time::{Instant, age, current_time};
use crate::types::{EntryId, EntryState};

/// Failure code recorded when an orphaned entry is forced to ERROR.
pub const ORPHAN_ERROR_CODE: i32 = 124;

/// Lookups retried when an entry moves between directories under us.
const MAX_RELOCATE_ATTEMPTS: u32 = 3;

/// Selects entries returned by [`Spool::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only entries in this state.
    pub state: Option<EntryState>,
    /// At most this many entries, lowest ids first.
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Matches every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches entries in `state`.
    pub fn state(state: EntryState) -> Self {
        ListFilter {
            state: Some(state),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &SpoolEntry) -> bool {
        self.state.is_none_or(|s| s == entry.state)
    }
}

/// Outcome of an orphan reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// ELAB entries inspected.
    pub inspected: usize,
    /// Orphans returned to WAIT.
    pub reinserted: usize,
    /// Orphans forced to ERROR.
    pub failed: usize,
    /// Future-dated modify times clamped to now.
    pub clamped: usize,
}

/// Entry counts for one spool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpoolStats {
    pub wait: usize,
    pub elab: usize,
    pub error: usize,
    /// Control files that could not be read.
    pub invalid: usize,
    pub shards: usize,
    /// Last allocated id.
    pub counter: u64,
}

/// What the orphan check did to an ELAB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orphan {
    /// Within its elaboration time; left alone.
    Alive,
    /// Modify time was in the future and has been reset to now.
    Clamped,
    Reinserted,
    /// Forced to ERROR and moved to the error directory.
    Failed,
}

/// Everything derived from one configuration snapshot.
#[derive(Debug)]
struct Context {
    config: Arc<SpoolConfig>,
    locks: LockManager,
    shards: ShardIndex,
    counter: Counter,
}

impl Context {
    fn new(root: &Path, config: SpoolConfig) -> Self {
        Context {
            locks: LockManager::new(config.lock.clone()),
            shards: ShardIndex::new(root, &config),
            counter: Counter::new(root),
            config: Arc::new(config),
        }
    }
}

/// Handle to one spool directory.
///
/// `Spool` is `Send + Sync`; concurrent callers in one process share the
/// list cache.
#[derive(Debug)]
pub struct Spool {
    root: PathBuf,
    context: RwLock<Arc<Context>>,
    cache: Mutex<SpoolCache>,
}

impl Spool {
    /// Opens the spool rooted at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Param`] if `root` exists but is not a directory.
    pub fn open(root: impl Into<PathBuf>, config: SpoolConfig) -> Result<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(SpoolError::Param(format!(
                "spool root {} is not a directory",
                root.display()
            )));
        }
        std::fs::create_dir_all(root.join(ERROR_DIR))?;

        debug!(
            root = %root.display(),
            entries_per_shard = config.entries_per_shard,
            sharding = config.sharding,
            "Opened spool"
        );
        Ok(Spool {
            context: RwLock::new(Arc::new(Context::new(&root, config))),
            root,
            cache: Mutex::new(SpoolCache::new()),
        })
    }

    /// Returns the spool root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the current configuration snapshot.
    pub fn config(&self) -> Arc<SpoolConfig> {
        Arc::clone(&self.context().config)
    }

    /// Replaces the configuration snapshot and drops the list cache.
    pub fn refresh_config(&self, config: SpoolConfig) {
        let context = Arc::new(Context::new(&self.root, config));
        match self.context.write() {
            Ok(mut guard) => *guard = context,
            Err(poisoned) => *poisoned.into_inner() = context,
        }
        self.invalidate_cache();
        debug!(root = %self.root.display(), "Configuration refreshed");
    }

    /// Drops the process-local list cache and shard date index.
    pub fn invalidate_cache(&self) {
        self.cache().invalidate();
    }

    fn context(&self) -> Arc<Context> {
        match self.context.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, SpoolCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stretches the counter's critical section, for contention tests.
    #[cfg(test)]
    pub(crate) fn hold_counter(&mut self, hold: Duration) {
        let context = self
            .context
            .get_mut()
            .ok()
            .and_then(Arc::get_mut);
        if let Some(ctx) = context {
            ctx.counter.hold = Some(hold);
        }
    }

    // ─── Producer ────────────────────────────────────────────────────────────

    /// Adds an entry in WAIT and returns its id.
    ///
    /// The data file is complete and synced before the control file names
    /// it, and the shard's date marker is touched last so caching consumers
    /// notice the new entry.
    ///
    /// # Errors
    ///
    /// - [`SpoolError::Param`] if `options` spans more than one line or a
    ///   payload file does not exist.
    /// - [`SpoolError::TimedOut`] if the spool or shard lock is contended.
    pub fn enqueue(&self, payload: Payload<'_>, options: &str) -> Result<EntryId> {
        if options.contains(['\n', '\r']) {
            return Err(SpoolError::Param("options must be a single line".to_string()));
        }
        if let Payload::File(path) = payload
            && !path.is_file()
        {
            return Err(SpoolError::Param(format!(
                "payload file {} not found",
                path.display()
            )));
        }

        let ctx = self.context();
        let num = ctx.counter.next(&ctx.locks)?;
        let (shard, cf_path, df_path) = create_in_shard(&ctx, num)?;

        let now = current_time();
        let mut entry = SpoolEntry {
            num,
            pid: std::process::id(),
            state: EntryState::Wait,
            error: 0,
            ctime: now,
            mtime: now,
            size: 0,
            options: options.to_string(),
            cf_path,
            df_path,
        };
        if let Err(e) = store::write(&mut entry, payload) {
            let _ = std::fs::remove_file(&entry.cf_path);
            let _ = std::fs::remove_file(&entry.df_path);
            return Err(e);
        }
        ctx.shards.touch_date(&ctx.locks, &shard.path);

        debug!(num = %num, size = entry.size, shard = %shard.name(), "Enqueued entry");
        Ok(num)
    }

    // ─── Consumer ────────────────────────────────────────────────────────────

    /// Claims the next WAIT entry, flipping it to ELAB.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::NotFound`] when there is nothing to claim, as
    /// well as for the failures of [`try_dequeue`](Self::try_dequeue).
    pub fn dequeue(&self) -> Result<SpoolEntry> {
        self.try_dequeue()?
            .ok_or_else(|| SpoolError::NotFound("no pending entries".to_string()))
    }

    /// Claims the next WAIT entry, or returns `Ok(None)` if there is none.
    ///
    /// Walks the cached candidate list, rebuilding it at most once per call.
    /// ELAB entries met along the way are checked for abandonment. Errors
    /// confined to one candidate skip that candidate.
    ///
    /// # Errors
    ///
    /// Fails only for spool-wide problems, such as a spool root that is
    /// missing or cannot be listed.
    pub fn try_dequeue(&self) -> Result<Option<SpoolEntry>> {
        if !self.root.is_dir() {
            return Err(SpoolError::NotFound(format!(
                "spool root {}",
                self.root.display()
            )));
        }

        let ctx = self.context();
        let mut cache = self.cache();

        let mut rescanned = false;
        if cache.is_stale(ctx.config.cache_ttl) {
            cache.rescan(&ctx.shards)?;
            rescanned = true;
        }

        loop {
            let Some(candidate) = cache.next_candidate() else {
                if rescanned {
                    return Ok(None);
                }
                cache.rescan(&ctx.shards)?;
                rescanned = true;
                continue;
            };

            match self.try_claim(&ctx, &candidate) {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(e) if e.is_benign() => {
                    debug!(num = %candidate.num, error = %e, "Skipping candidate");
                }
                Err(e) => {
                    warn!(num = %candidate.num, error = %e, "Skipping candidate after failure");
                }
            }
        }
    }

    /// Locks one candidate and claims it if it is still WAIT.
    fn try_claim(&self, ctx: &Context, candidate: &ControlName) -> Result<Option<SpoolEntry>> {
        let dir = candidate.path.parent().unwrap_or(&self.root);
        let guard = ctx
            .locks
            .acquire(&entry_lock_path(dir, candidate.num), ctx.config.lock.scan_timeout)?;
        let mut entry = store::read(&candidate.path)?;

        match entry.state {
            EntryState::Wait => {
                entry.state = EntryState::Elab;
                entry.mtime = current_time();
                entry.pid = std::process::id();
                store::write_control(&entry)?;
                guard.release()?;
                debug!(num = %entry.num, "Claimed entry");
                Ok(Some(entry))
            }
            EntryState::Elab => {
                let orphan = self.check_orphan(ctx, &mut entry)?;
                guard.release()?;
                if orphan == Orphan::Failed {
                    self.cleanup_shard(ctx, entry.num);
                }
                Ok(None)
            }
            EntryState::Error => {
                // An interrupted move left a failed entry in its shard
                store::move_pair(&entry, &ctx.shards.error_dir())?;
                guard.release()?;
                warn!(num = %entry.num, "Completed interrupted move to error directory");
                self.cleanup_shard(ctx, entry.num);
                Ok(None)
            }
        }
    }

    /// Reclaims an ELAB entry whose worker has evidently gone away.
    ///
    /// Must be called with the entry lock held.
    fn check_orphan(&self, ctx: &Context, entry: &mut SpoolEntry) -> Result<Orphan> {
        let Some(max_elab) = ctx.config.max_elab_time else {
            return Ok(Orphan::Alive);
        };
        let now = current_time();

        let Some(elapsed) = age(now, entry.mtime) else {
            warn!(
                num = %entry.num,
                mtime = %entry.mtime,
                "Modify time lies in the future, clamping to now"
            );
            entry.mtime = now;
            store::write_control(entry)?;
            return Ok(Orphan::Clamped);
        };
        if elapsed <= max_elab {
            return Ok(Orphan::Alive);
        }

        entry.mtime = now;
        entry.pid = std::process::id();
        if ctx.config.reinsert_on_timeout {
            entry.state = EntryState::Wait;
            entry.error = 0;
            store::write_control(entry)?;
            ctx.shards.touch_date(&ctx.locks, entry.dir());
            info!(num = %entry.num, elapsed_secs = elapsed.as_secs(), "Reclaimed orphan to WAIT");
            Ok(Orphan::Reinserted)
        } else {
            entry.state = EntryState::Error;
            entry.error = ORPHAN_ERROR_CODE;
            store::write_control(entry)?;
            *entry = store::move_pair(entry, &ctx.shards.error_dir())?;
            info!(num = %entry.num, elapsed_secs = elapsed.as_secs(), "Reclaimed orphan to ERROR");
            Ok(Orphan::Failed)
        }
    }

    /// Runs the orphan check over every ELAB entry in every shard.
    pub fn reclaim_orphans(&self) -> Result<ReclaimReport> {
        let ctx = self.context();
        let mut report = ReclaimReport::default();

        for shard in ctx.shards.list_shards()? {
            let controls = match store::list_controls(&shard.path, ctx.shards.metadata_names()) {
                Ok((controls, _)) => controls,
                Err(e) if e.is_benign() => continue,
                Err(e) => return Err(e),
            };
            for candidate in controls {
                match self.reclaim_one(&ctx, &shard, &candidate) {
                    Ok(None) => {}
                    Ok(Some(orphan)) => {
                        report.inspected += 1;
                        match orphan {
                            Orphan::Alive => {}
                            Orphan::Clamped => report.clamped += 1,
                            Orphan::Reinserted => report.reinserted += 1,
                            Orphan::Failed => report.failed += 1,
                        }
                    }
                    Err(e) if e.is_benign() => {
                        debug!(num = %candidate.num, error = %e, "Skipping reclaim candidate");
                    }
                    Err(e) => warn!(num = %candidate.num, error = %e, "Reclaim failed"),
                }
            }
        }

        if report.reinserted + report.failed > 0 {
            info!(
                reinserted = report.reinserted,
                failed = report.failed,
                "Reclaimed orphaned entries"
            );
        }
        Ok(report)
    }

    fn reclaim_one(&self, ctx: &Context, shard: &Shard, candidate: &ControlName) -> Result<Option<Orphan>> {
        let guard = ctx.locks.acquire(
            &entry_lock_path(&shard.path, candidate.num),
            ctx.config.lock.scan_timeout,
        )?;
        let mut entry = store::read(&candidate.path)?;
        if entry.state != EntryState::Elab {
            return Ok(None);
        }
        let orphan = self.check_orphan(ctx, &mut entry)?;
        guard.release()?;
        if orphan == Orphan::Failed {
            self.cleanup_shard(ctx, entry.num);
        }
        Ok(Some(orphan))
    }

    // ─── Transitions ─────────────────────────────────────────────────────────

    /// Moves entry `id` to `state`.
    ///
    /// ERROR records `error` and relocates the pair into the error
    /// directory. WAIT and ELAB clear the error code and relocate the pair
    /// back into its shard if it was in the error directory.
    pub fn set_state(&self, id: EntryId, state: EntryState, error: i32) -> Result<SpoolEntry> {
        let ctx = self.context();
        let (mut entry, guard) = self.lock_entry(&ctx, id)?;
        let from = entry.state;
        let source_dir = entry.dir().to_path_buf();

        let dest_dir = match state {
            EntryState::Error => ctx.shards.error_dir(),
            EntryState::Wait | EntryState::Elab => ctx.shards.ensure(&ctx.locks, id)?.path,
        };

        entry.state = state;
        entry.error = if state == EntryState::Error { error } else { 0 };
        entry.mtime = current_time();
        entry.pid = std::process::id();
        store::write_control(&entry)?;

        let moved = source_dir != dest_dir;
        if moved {
            entry = store::move_pair(&entry, &dest_dir)?;
        }
        guard.release()?;

        // Locking may have recreated the shard of an entry that lives in error/
        if state == EntryState::Error {
            self.cleanup_shard(&ctx, id);
        }
        if state == EntryState::Wait {
            ctx.shards.touch_date(&ctx.locks, &dest_dir);
        }

        debug!(num = %id, %from, to = %state, error = entry.error, "Changed entry state");
        Ok(entry)
    }

    /// Returns entry `id` to WAIT.
    pub fn reinsert(&self, id: EntryId) -> Result<SpoolEntry> {
        self.set_state(id, EntryState::Wait, 0)
    }

    /// Unlinks entry `id`.
    pub fn delete(&self, id: EntryId) -> Result<()> {
        let ctx = self.context();
        let (entry, guard) = self.lock_entry(&ctx, id)?;
        store::remove(&entry)?;
        guard.release()?;

        self.cleanup_shard(&ctx, id);
        debug!(num = %id, "Deleted entry");
        Ok(())
    }

    /// Reinserts entries that have sat in ERROR for at least `min_age`.
    ///
    /// WAIT entries found in the error directory (left by an interrupted
    /// reinsert) are moved back regardless of age. Returns the number of
    /// entries reinserted.
    pub fn reinsert_aged_errors(&self, min_age: Duration) -> Result<usize> {
        let ctx = self.context();
        let error_dir = ctx.shards.error_dir();
        let (controls, _) = store::list_controls(&error_dir, &[])?;
        let now = current_time();
        let mut reinserted = 0;

        for candidate in controls {
            let entry = match store::read(&candidate.path) {
                Ok(entry) => entry,
                Err(e) if e.is_benign() => continue,
                Err(e) => return Err(e),
            };
            let due = match entry.state {
                EntryState::Error => is_older_than(now, entry.mtime, min_age),
                EntryState::Wait => true,
                EntryState::Elab => false,
            };
            if !due {
                continue;
            }
            match self.reinsert(entry.num) {
                Ok(_) => reinserted += 1,
                Err(e) if e.is_benign() => {
                    debug!(num = %entry.num, error = %e, "Skipping aged error");
                }
                Err(e) => warn!(num = %entry.num, error = %e, "Failed to reinsert aged error"),
            }
        }

        if reinserted > 0 {
            info!(reinserted, min_age_secs = min_age.as_secs(), "Reinserted aged errors");
        }
        Ok(reinserted)
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Reads entry `id` without locking it.
    pub fn get(&self, id: EntryId) -> Result<SpoolEntry> {
        let ctx = self.context();
        self.locate(&ctx, id)
    }

    /// Reads an entry's payload.
    pub fn read_payload(&self, entry: &SpoolEntry) -> Result<Vec<u8>> {
        store::read_payload(entry)
    }

    /// Lists entries in every shard and the error directory, by id.
    ///
    /// Unreadable entries are skipped.
    pub fn list(&self, filter: ListFilter) -> Result<Vec<SpoolEntry>> {
        let ctx = self.context();
        let mut entries: Vec<SpoolEntry> = self
            .read_all(&ctx)?
            .into_iter()
            .filter_map(|r| r.ok())
            .filter(|e| filter.matches(e))
            .collect();
        entries.sort_by_key(|e| e.num);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Counts entries per state.
    pub fn stats(&self) -> Result<SpoolStats> {
        let ctx = self.context();
        let mut stats = SpoolStats {
            shards: if ctx.shards.is_sharded() {
                ctx.shards.list_shards()?.len()
            } else {
                0
            },
            counter: ctx.counter.peek().get(),
            ..SpoolStats::default()
        };
        for entry in self.read_all(&ctx)? {
            match entry {
                Ok(e) => match e.state {
                    EntryState::Wait => stats.wait += 1,
                    EntryState::Elab => stats.elab += 1,
                    EntryState::Error => stats.error += 1,
                },
                Err(SpoolError::InvalidEntry { .. }) => stats.invalid += 1,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    /// Reads every control file in shards and the error directory.
    fn read_all(&self, ctx: &Context) -> Result<Vec<Result<SpoolEntry>>> {
        let mut dirs: Vec<(PathBuf, &[&str])> = ctx
            .shards
            .list_shards()?
            .into_iter()
            .map(|s| (s.path, ctx.shards.metadata_names()))
            .collect();
        let no_metadata: &[&str] = &[];
        dirs.push((ctx.shards.error_dir(), no_metadata));

        let mut results = Vec::new();
        for (dir, known) in dirs {
            let controls = match store::list_controls(&dir, known) {
                Ok((controls, _)) => controls,
                Err(e) if e.is_benign() => continue,
                Err(e) => return Err(e),
            };
            for control in controls {
                let result = store::read(&control.path);
                if let Err(e) = &result {
                    debug!(path = %control.path.display(), error = %e, "Unreadable entry");
                }
                results.push(result);
            }
        }
        Ok(results)
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    /// Finds entry `id` in its shard or the error directory.
    fn locate(&self, ctx: &Context, id: EntryId) -> Result<SpoolEntry> {
        if id.is_unset() {
            return Err(SpoolError::Param("entry id 0 is reserved".to_string()));
        }
        for dir in [ctx.shards.shard_for(id).path, ctx.shards.error_dir()] {
            if let Some(cf_path) = find_control(&dir, id)? {
                return store::read(&cf_path);
            }
        }
        Err(SpoolError::entry_not_found(id))
    }

    /// Locates entry `id` and takes its lock.
    ///
    /// The lock always lives in the entry's own shard, wherever the pair
    /// currently sits, so moves between the shard and the error directory
    /// are serialized by one lock file. The shard is recreated if needed;
    /// the entry is looked up again under the lock since it may have moved
    /// or vanished in between.
    fn lock_entry(&self, ctx: &Context, id: EntryId) -> Result<(SpoolEntry, LockGuard)> {
        for _ in 0..MAX_RELOCATE_ATTEMPTS {
            self.locate(ctx, id)?;
            let shard = ctx.shards.ensure(&ctx.locks, id)?;
            let guard = match ctx.locks.lock(&entry_lock_path(&shard.path, id)) {
                Ok(guard) => guard,
                Err(SpoolError::NotFound(_)) => {
                    debug!(num = %id, shard = %shard.name(), "Shard removed while locking, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.locate(ctx, id) {
                Ok(entry) => return Ok((entry, guard)),
                Err(SpoolError::NotFound(_)) => {
                    drop(guard);
                    debug!(num = %id, "Entry vanished while locking, retrying lookup");
                }
                Err(e) => return Err(e),
            }
        }
        Err(SpoolError::entry_not_found(id))
    }

    /// Removes the shard of `id` if it has become empty and exhausted.
    fn cleanup_shard(&self, ctx: &Context, id: EntryId) {
        let shard = ctx.shards.shard_for(id);
        if let Err(e) = ctx.shards.maybe_remove(&ctx.locks, &shard, ctx.counter.peek()) {
            warn!(shard = %shard.name(), error = %e, "Shard cleanup failed");
        }
    }
}

/// Ensures the shard for `num` and creates the entry's files in it.
///
/// The shard can be removed between `ensure` and `create` by a cleanup that
/// saw it empty; creation is retried against a freshly ensured shard.
fn create_in_shard(ctx: &Context, num: EntryId) -> Result<(Shard, PathBuf, PathBuf)> {
    let mut attempt = 0;
    loop {
        let shard = ctx.shards.ensure(&ctx.locks, num)?;
        match store::create(&shard.path, num) {
            Ok((cf, df)) => return Ok((shard, cf, df)),
            Err(SpoolError::NotFound(_)) if attempt + 1 < MAX_RELOCATE_ATTEMPTS => {
                attempt += 1;
                debug!(num = %num, shard = %shard.name(), "Shard vanished, recreating");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Returns the control file of entry `id` in `dir`, if any.
fn find_control(dir: &Path, id: EntryId) -> Result<Option<PathBuf>> {
    let prefix = format!("{CONTROL_PREFIX}{:010}_", id.get());
    let dirents = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut found: Option<PathBuf> = None;
    for dirent in dirents {
        let dirent = dirent?;
        let name = dirent.file_name();
        if name.to_str().is_some_and(|n| n.starts_with(&prefix)) {
            let path = dirent.path();
            // Lowest name wins if a crash left duplicates
            if found.as_ref().is_none_or(|f| path < *f) {
                found = Some(path);
            }
        }
    }
    Ok(found)
}

fn is_older_than(now: Instant, t: Instant, min_age: Duration) -> bool {
    age(now, t).is_some_and(|a| a >= min_age)
}
