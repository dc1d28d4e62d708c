//! Process-local list of dequeue candidates.
//!
//! Scanning every shard on every dequeue would make an idle spool cost a
//! full directory walk per poll. The cache keeps the last listing together
//! with a cursor and only rebuilds it when:
//!
//! - nothing has been loaded yet,
//! - the configured TTL has expired, or
//! - the cursor has walked off the end of the list.
//!
//! A rebuild consults the [`ShardDateIndex`]: a shard whose date marker is
//! unchanged since the last listing reuses the names seen then, and only
//! shards with a changed or unknown marker are listed again. Neither the
//! cache nor the index is authoritative. Every candidate is re-read under
//! its entry lock before it is claimed, so a stale listing costs at most a
//! wasted open or a delayed pickup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::config::{CacheTtl, DATE_INDEX_REFRESH};
use super::error::Result;
use super::shard::{DateMarker, Shard, ShardIndex};
use super::store::{ControlName, list_controls};

/// Names last seen in one shard, keyed by the marker they were listed under.
#[derive(Debug, Clone)]
struct ShardListing {
    marker: DateMarker,
    names: Vec<ControlName>,
}

/// Shard path to last observed date marker.
///
/// Dropped wholesale every [`DATE_INDEX_REFRESH`] so a marker update that
/// was missed (for instance because its writer could not take the date
/// lock) is picked up eventually.
#[derive(Debug)]
pub struct ShardDateIndex {
    shards: BTreeMap<PathBuf, ShardListing>,
    built_at: Instant,
}

impl Default for ShardDateIndex {
    fn default() -> Self {
        ShardDateIndex {
            shards: BTreeMap::new(),
            built_at: Instant::now(),
        }
    }
}

impl ShardDateIndex {
    /// Returns the names cached for `shard` if its marker still reads `marker`.
    fn unchanged(&self, shard: &Shard, marker: Option<DateMarker>) -> Option<&[ControlName]> {
        let listing = self.shards.get(&shard.path)?;
        (Some(listing.marker) == marker).then_some(listing.names.as_slice())
    }

    fn record(&mut self, shard: &Shard, marker: Option<DateMarker>, names: &[ControlName]) {
        match marker {
            Some(marker) => {
                self.shards.insert(
                    shard.path.clone(),
                    ShardListing {
                        marker,
                        names: names.to_vec(),
                    },
                );
            }
            // Without a marker there is nothing to compare against next time
            None => {
                self.shards.remove(&shard.path);
            }
        }
    }

    fn clear(&mut self) {
        self.shards.clear();
        self.built_at = Instant::now();
    }

    /// Number of shards with a remembered marker.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Cached candidate list with a scan cursor.
#[derive(Debug, Default)]
pub struct SpoolCache {
    candidates: Vec<ControlName>,
    cursor: usize,
    loaded_at: Option<Instant>,
    dates: ShardDateIndex,
}

impl SpoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the list must be rebuilt before use.
    pub fn is_stale(&self, ttl: CacheTtl) -> bool {
        match self.loaded_at {
            None => true,
            Some(at) => ttl.expired(at.elapsed()) || self.cursor >= self.candidates.len(),
        }
    }

    /// Returns the next candidate and advances the cursor.
    pub fn next_candidate(&mut self) -> Option<ControlName> {
        let candidate = self.candidates.get(self.cursor).cloned();
        if candidate.is_some() {
            self.cursor += 1;
        }
        candidate
    }

    /// Number of candidates in the current listing.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Forgets the listing and every remembered shard marker.
    pub fn invalidate(&mut self) {
        self.candidates.clear();
        self.cursor = 0;
        self.loaded_at = None;
        self.dates.clear();
    }

    /// Rebuilds the listing, shard-ascending then file-name-ascending.
    ///
    /// Returns the number of shards that had to be listed again.
    pub fn rescan(&mut self, index: &ShardIndex) -> Result<usize> {
        if self.dates.built_at.elapsed() >= DATE_INDEX_REFRESH {
            debug!("Refreshing shard date index");
            self.dates.clear();
        }

        let shards = index.list_shards()?;
        let mut candidates = Vec::new();
        let mut relisted = 0;

        for shard in &shards {
            let marker = ShardIndex::read_date(&shard.path);
            if let Some(names) = self.dates.unchanged(shard, marker) {
                trace!(shard = %shard.path.display(), "Shard unchanged, reusing listing");
                candidates.extend_from_slice(names);
                continue;
            }

            let (names, foreign) = match list_controls(&shard.path, index.metadata_names()) {
                Ok(listing) => listing,
                // Removed between list_shards and here
                Err(e) if e.is_benign() => continue,
                Err(e) => return Err(e),
            };
            if !foreign.is_empty() {
                warn!(shard = %shard.path.display(), files = ?foreign, "Ignoring foreign files in shard");
            }
            relisted += 1;
            self.dates.record(shard, marker, &names);
            candidates.extend(names);
        }

        // Forget shards that no longer exist
        self.dates
            .shards
            .retain(|path, _| shards.iter().any(|s| &s.path == path));

        debug!(
            candidates = candidates.len(),
            shards = shards.len(),
            relisted,
            "Rescanned spool"
        );
        self.candidates = candidates;
        self.cursor = 0;
        self.loaded_at = Some(Instant::now());
        Ok(relisted)
    }

    /// Returns the shard date index.
    pub fn dates(&self) -> &ShardDateIndex {
        &self.dates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::config::{LockConfig, SpoolConfig};
    use crate::spool::lock::LockManager;
    use crate::spool::store::{Payload, create, write};
    use crate::spool::time::current_time;
    use crate::spool::SpoolEntry;
    use crate::types::{EntryId, EntryState};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn index(root: &Path) -> ShardIndex {
        ShardIndex::new(root, &SpoolConfig::new().with_entries_per_shard(10))
    }

    fn put(index: &ShardIndex, locks: &LockManager, num: u64, touch: bool) {
        let shard = index.ensure(locks, EntryId(num)).unwrap();
        let (cf, df) = create(&shard.path, EntryId(num)).unwrap();
        let now = current_time();
        let mut entry = SpoolEntry {
            num: EntryId(num),
            pid: 1,
            state: EntryState::Wait,
            error: 0,
            ctime: now,
            mtime: now,
            size: 0,
            options: String::new(),
            cf_path: cf,
            df_path: df,
        };
        write(&mut entry, Payload::Bytes(b"x")).unwrap();
        if touch {
            index.touch_date(locks, &shard.path);
        }
    }

    fn drain(cache: &mut SpoolCache) -> Vec<u64> {
        std::iter::from_fn(|| cache.next_candidate())
            .map(|c| c.num.get())
            .collect()
    }

    #[test]
    fn empty_cache_is_stale() {
        let cache = SpoolCache::new();
        assert!(cache.is_stale(CacheTtl::Forever));
    }

    #[test]
    fn rescan_orders_by_shard_then_name() {
        let dir = tempdir().unwrap();
        let index = index(dir.path());
        let locks = LockManager::new(LockConfig::default());
        for num in [25, 3, 11, 1, 12] {
            put(&index, &locks, num, true);
        }

        let mut cache = SpoolCache::new();
        cache.rescan(&index).unwrap();
        assert_eq!(drain(&mut cache), [1, 3, 11, 12, 25]);
        assert!(cache.is_stale(CacheTtl::Forever));
    }

    #[test]
    fn unchanged_marker_skips_relisting() {
        let dir = tempdir().unwrap();
        let index = index(dir.path());
        let locks = LockManager::new(LockConfig::default());
        put(&index, &locks, 1, true);
        put(&index, &locks, 11, true);

        let mut cache = SpoolCache::new();
        assert_eq!(cache.rescan(&index).unwrap(), 2);
        assert_eq!(cache.dates().len(), 2);

        // Entry added without touching the marker stays invisible
        put(&index, &locks, 2, false);
        assert_eq!(cache.rescan(&index).unwrap(), 0);
        assert_eq!(drain(&mut cache), [1, 11]);

        // Touching the marker makes the shard listed again
        index.touch_date(&locks, &dir.path().join("sd_0"));
        assert_eq!(cache.rescan(&index).unwrap(), 1);
        assert_eq!(drain(&mut cache), [1, 2, 11]);
    }

    #[test]
    fn shard_without_marker_is_always_listed() {
        let dir = tempdir().unwrap();
        let index = index(dir.path());
        let locks = LockManager::new(LockConfig::default());
        put(&index, &locks, 1, false);

        let mut cache = SpoolCache::new();
        assert_eq!(cache.rescan(&index).unwrap(), 1);
        assert_eq!(cache.rescan(&index).unwrap(), 1);
        assert!(cache.dates().is_empty());
    }

    #[test]
    fn ttl_expiry_makes_cache_stale() {
        let dir = tempdir().unwrap();
        let index = index(dir.path());
        let locks = LockManager::new(LockConfig::default());
        put(&index, &locks, 1, true);
        put(&index, &locks, 2, true);

        let mut cache = SpoolCache::new();
        cache.rescan(&index).unwrap();
        assert!(!cache.is_stale(CacheTtl::Forever));
        assert!(cache.is_stale(CacheTtl::Disabled));

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.is_stale(CacheTtl::For(Duration::from_millis(10))));
        assert!(!cache.is_stale(CacheTtl::For(Duration::from_secs(60))));
    }

    #[test]
    fn invalidate_forgets_everything() {
        let dir = tempdir().unwrap();
        let index = index(dir.path());
        let locks = LockManager::new(LockConfig::default());
        put(&index, &locks, 1, true);

        let mut cache = SpoolCache::new();
        cache.rescan(&index).unwrap();
        cache.invalidate();

        assert!(cache.is_stale(CacheTtl::Forever));
        assert!(cache.is_empty());
        assert!(cache.dates().is_empty());
    }

    #[test]
    fn removed_shard_is_forgotten() {
        let dir = tempdir().unwrap();
        let index = index(dir.path());
        let locks = LockManager::new(LockConfig::default());
        put(&index, &locks, 1, true);
        put(&index, &locks, 11, true);

        let mut cache = SpoolCache::new();
        cache.rescan(&index).unwrap();
        std::fs::remove_dir_all(dir.path().join("sd_10")).unwrap();
        cache.rescan(&index).unwrap();

        assert_eq!(cache.dates().len(), 1);
        assert_eq!(drain(&mut cache), [1]);
    }
}
