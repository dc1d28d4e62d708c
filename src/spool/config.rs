//! Spool configuration.
//!
//! A [`SpoolConfig`] is a snapshot: a [`Spool`](super::Spool) reads it once at
//! construction and only sees new values through an explicit
//! [`Spool::refresh_config`](super::Spool::refresh_config).
//!
//! # Environment
//!
//! [`SpoolConfig::from_env`] reads:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `DIRSPOOL_ENTRIES_PER_SHARD` | entries per `sd_<base>` directory | 1000 |
//! | `DIRSPOOL_SHARDING` | `0` stores every entry in the spool root | 1 |
//! | `DIRSPOOL_CACHE_TTL_SECS` | list cache TTL; `0` never, `<0` forever | 10 |
//! | `DIRSPOOL_MAX_ELAB_SECS` | orphan reclaim ceiling; `0` disables | 3600 |
//! | `DIRSPOOL_REINSERT_ON_TIMEOUT` | reclaimed orphans go back to WAIT | 0 |
//! | `DIRSPOOL_NFS_SKEW_WORKAROUND` | correct lock ages for server clock skew | 0 |
//! | `DIRSPOOL_LOCK_TIMEOUT_MS` | default lock acquisition timeout | 10000 |
//! | `DIRSPOOL_LOCK_MAX_WAIT_MS` | hard ceiling on any lock wait | 60000 |

use std::time::Duration;

/// Default number of entries per shard directory.
pub const DEFAULT_ENTRIES_PER_SHARD: u64 = 1000;

/// Default list cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 10;

/// Default ceiling on time spent in ELAB before an entry is reclaimed (1 hour).
pub const DEFAULT_MAX_ELAB_SECS: u64 = 3600;

/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Default ceiling on any single lock wait.
pub const DEFAULT_LOCK_MAX_WAIT_MS: u64 = 60_000;

/// Lock files older than this are presumed abandoned.
pub const DEFAULT_LOCK_STALE_MS: u64 = 2_000;

/// Sleep between lock attempts.
pub const LOCK_RETRY_QUANTUM: Duration = Duration::from_millis(40);

/// How often the clock-skew probe is repeated.
pub const SKEW_PROBE_INTERVAL: Duration = Duration::from_secs(600);

/// How long a dequeue waits on one candidate's lock before moving on.
pub const DEFAULT_SCAN_LOCK_TIMEOUT_MS: u64 = 200;

/// The shard date index is dropped and rebuilt at least this often.
pub const DATE_INDEX_REFRESH: Duration = Duration::from_secs(2 * 60 * 60);

/// Time-to-live of the process-local list cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Rescan on every request.
    Disabled,
    /// Keep the list until the cursor reaches its end.
    Forever,
    /// Rescan once the list is older than this.
    For(Duration),
}

impl CacheTtl {
    /// Decodes the integer convention: `0` disables, negative caches forever.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => CacheTtl::Disabled,
            s if s < 0 => CacheTtl::Forever,
            s => CacheTtl::For(Duration::from_secs(s.unsigned_abs())),
        }
    }

    /// Returns true if a list loaded `age` ago must be rebuilt.
    pub fn expired(self, age: Duration) -> bool {
        match self {
            CacheTtl::Disabled => true,
            CacheTtl::Forever => false,
            CacheTtl::For(ttl) => age >= ttl,
        }
    }
}

/// Lock manager tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Default timeout for [`LockManager::acquire`](super::LockManager::acquire).
    pub timeout: Duration,

    /// Ceiling applied to every wait, whatever timeout the caller asks for.
    pub max_wait: Duration,

    /// Age past which a lock file is presumed abandoned and removed.
    pub stale_after: Duration,

    /// Timeout used for per-entry locks while scanning for work.
    pub scan_timeout: Duration,

    /// Correct lock ages by the measured client/server clock skew.
    ///
    /// Enable on network filesystems whose server clock may disagree with
    /// the local one.
    pub skew_workaround: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            max_wait: Duration::from_millis(DEFAULT_LOCK_MAX_WAIT_MS),
            stale_after: Duration::from_millis(DEFAULT_LOCK_STALE_MS),
            scan_timeout: Duration::from_millis(DEFAULT_SCAN_LOCK_TIMEOUT_MS),
            skew_workaround: false,
        }
    }
}

/// Configuration for one spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolConfig {
    /// Maximum entries per shard directory (`N`).
    pub entries_per_shard: u64,

    /// When false, every entry lives directly in the spool root.
    pub sharding: bool,

    /// List cache time-to-live.
    pub cache_ttl: CacheTtl,

    /// ELAB entries whose mtime is older than this are reclaimed.
    ///
    /// `None` disables reclaim.
    pub max_elab_time: Option<Duration>,

    /// Reclaimed orphans return to WAIT instead of being forced to ERROR.
    pub reinsert_on_timeout: bool,

    /// Lock manager tuning.
    pub lock: LockConfig,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SpoolConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        SpoolConfig {
            entries_per_shard: DEFAULT_ENTRIES_PER_SHARD,
            sharding: true,
            cache_ttl: CacheTtl::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_elab_time: Some(Duration::from_secs(DEFAULT_MAX_ELAB_SECS)),
            reinsert_on_timeout: false,
            lock: LockConfig::default(),
        }
    }

    /// Creates a configuration from `DIRSPOOL_*` environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Creates a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::new();
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<i64>().ok());
        let flag = |name: &str| lookup(name).map(|v| parse_flag(&v));

        let entries_per_shard = number("DIRSPOOL_ENTRIES_PER_SHARD")
            .filter(|n| *n > 0)
            .map(|n| n.unsigned_abs())
            .unwrap_or(defaults.entries_per_shard);

        let max_elab_time = match number("DIRSPOOL_MAX_ELAB_SECS") {
            Some(s) if s <= 0 => None,
            Some(s) => Some(Duration::from_secs(s.unsigned_abs())),
            None => defaults.max_elab_time,
        };

        let millis = |name: &str, default: Duration| {
            number(name)
                .filter(|n| *n > 0)
                .map(|n| Duration::from_millis(n.unsigned_abs()))
                .unwrap_or(default)
        };

        SpoolConfig {
            entries_per_shard,
            sharding: flag("DIRSPOOL_SHARDING").unwrap_or(defaults.sharding),
            cache_ttl: number("DIRSPOOL_CACHE_TTL_SECS")
                .map(CacheTtl::from_secs)
                .unwrap_or(defaults.cache_ttl),
            max_elab_time,
            reinsert_on_timeout: flag("DIRSPOOL_REINSERT_ON_TIMEOUT")
                .unwrap_or(defaults.reinsert_on_timeout),
            lock: LockConfig {
                timeout: millis("DIRSPOOL_LOCK_TIMEOUT_MS", defaults.lock.timeout),
                max_wait: millis("DIRSPOOL_LOCK_MAX_WAIT_MS", defaults.lock.max_wait),
                skew_workaround: flag("DIRSPOOL_NFS_SKEW_WORKAROUND")
                    .unwrap_or(defaults.lock.skew_workaround),
                ..defaults.lock
            },
        }
    }

    /// Sets the number of entries per shard. Zero is clamped to one.
    pub fn with_entries_per_shard(mut self, n: u64) -> Self {
        self.entries_per_shard = n.max(1);
        self
    }

    /// Enables or disables directory sharding.
    pub fn with_sharding(mut self, sharding: bool) -> Self {
        self.sharding = sharding;
        self
    }

    /// Sets the list cache TTL.
    pub fn with_cache_ttl(mut self, ttl: CacheTtl) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the orphan reclaim ceiling.
    pub fn with_max_elab_time(mut self, max: Option<Duration>) -> Self {
        self.max_elab_time = max;
        self
    }

    /// Chooses between WAIT and ERROR for reclaimed orphans.
    pub fn with_reinsert_on_timeout(mut self, reinsert: bool) -> Self {
        self.reinsert_on_timeout = reinsert;
        self
    }

    /// Replaces the lock tuning.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }
}

/// Parses a boolean environment value (`1/0`, `true/false`, `yes/no`, `on/off`).
pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = SpoolConfig::new();

        assert_eq!(config.entries_per_shard, 1000);
        assert!(config.sharding);
        assert_eq!(config.cache_ttl, CacheTtl::For(Duration::from_secs(10)));
        assert_eq!(config.max_elab_time, Some(Duration::from_secs(3600)));
        assert!(!config.reinsert_on_timeout);
        assert_eq!(config.lock.stale_after, Duration::from_secs(2));
    }

    #[test]
    fn cache_ttl_integer_convention() {
        assert_eq!(CacheTtl::from_secs(0), CacheTtl::Disabled);
        assert_eq!(CacheTtl::from_secs(-1), CacheTtl::Forever);
        assert_eq!(
            CacheTtl::from_secs(5),
            CacheTtl::For(Duration::from_secs(5))
        );
    }

    #[test]
    fn cache_ttl_expiry() {
        assert!(CacheTtl::Disabled.expired(Duration::ZERO));
        assert!(!CacheTtl::Forever.expired(Duration::from_secs(1_000_000)));
        let ttl = CacheTtl::For(Duration::from_secs(5));
        assert!(!ttl.expired(Duration::from_secs(4)));
        assert!(ttl.expired(Duration::from_secs(5)));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = SpoolConfig::from_lookup(lookup(&[
            ("DIRSPOOL_ENTRIES_PER_SHARD", "2"),
            ("DIRSPOOL_SHARDING", "no"),
            ("DIRSPOOL_CACHE_TTL_SECS", "-1"),
            ("DIRSPOOL_MAX_ELAB_SECS", "0"),
            ("DIRSPOOL_REINSERT_ON_TIMEOUT", "true"),
            ("DIRSPOOL_NFS_SKEW_WORKAROUND", "1"),
            ("DIRSPOOL_LOCK_TIMEOUT_MS", "250"),
        ]));

        assert_eq!(config.entries_per_shard, 2);
        assert!(!config.sharding);
        assert_eq!(config.cache_ttl, CacheTtl::Forever);
        assert_eq!(config.max_elab_time, None);
        assert!(config.reinsert_on_timeout);
        assert!(config.lock.skew_workaround);
        assert_eq!(config.lock.timeout, Duration::from_millis(250));
        assert_eq!(config.lock.max_wait, Duration::from_secs(60));
    }

    #[test]
    fn unparseable_values_keep_defaults() {
        let config = SpoolConfig::from_lookup(lookup(&[
            ("DIRSPOOL_ENTRIES_PER_SHARD", "lots"),
            ("DIRSPOOL_LOCK_TIMEOUT_MS", "-5"),
        ]));

        assert_eq!(config, SpoolConfig::new());
    }

    #[test]
    fn zero_entries_per_shard_is_clamped() {
        let config = SpoolConfig::new().with_entries_per_shard(0);
        assert_eq!(config.entries_per_shard, 1);
    }
}
