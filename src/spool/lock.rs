//! Advisory cross-process locks built on exclusive file creation.
//!
//! A lock is a file; holding the lock means having created it with
//! `O_CREAT | O_EXCL`. Native byte-range locks are avoided because spools are
//! often on network filesystems where their semantics are unreliable, while
//! exclusive create is honoured by every filesystem we care about.
//!
//! # Staleness
//!
//! A holder that dies leaves its lock file behind. Any lock file older than
//! [`LockConfig::stale_after`] is presumed abandoned, removed, and the
//! acquisition retried. A holder that is merely slow can therefore be
//! preempted; locks are only ever held across short filesystem operations,
//! never across worker execution.
//!
//! Two contenders can judge the same lock stale. Removal therefore renames
//! the lock to a name private to the remover and re-checks the renamed
//! file's age; if it is fresh, a contender replaced it in between and it is
//! linked back into place. A lock re-created and then renamed away in the
//! instant between that rename and the link-back still yields two holders.
//! That window is accepted.
//!
//! # Clock Skew
//!
//! Lock age compares the lock file's mtime (stamped by the file server) with
//! the local clock. With [`LockConfig::skew_workaround`] enabled the manager
//! periodically writes a probe file, measures the difference between the
//! server-reported mtime and local time, and applies that offset to every age
//! computation.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace, warn};

use super::config::{LOCK_RETRY_QUANTUM, LockConfig, SKEW_PROBE_INTERVAL};
use super::error::{Result, SpoolError};

/// Retries without sleeping after a stale removal or a vanished holder,
/// before falling back to the timed wait.
const MAX_IMMEDIATE_RETRIES: u32 = 3;

/// Distinguishes stale-lock renames made by one process.
static STALE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A held lock. Dropping the guard releases it.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    held: bool,
}

impl LockGuard {
    fn new(path: &Path) -> Self {
        LockGuard {
            path: path.to_path_buf(),
            held: true,
        }
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock, reporting unlink failures.
    pub fn release(mut self) -> Result<()> {
        self.held = false;
        release(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = release(&self.path)
        {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

/// Releases the lock at `path`.
///
/// Releasing a lock that is not held is a no-op.
pub fn release(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            trace!(path = %path.display(), "Released lock");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Last measured server/local clock offset.
#[derive(Debug, Default)]
struct SkewProbe {
    /// Server time minus local time, in milliseconds.
    offset_ms: i64,
    probed_at: Option<std::time::Instant>,
}

/// Acquires and releases lock files.
#[derive(Debug)]
pub struct LockManager {
    config: LockConfig,
    skew: Mutex<SkewProbe>,
}

impl LockManager {
    /// Creates a lock manager.
    pub fn new(config: LockConfig) -> Self {
        LockManager {
            config,
            skew: Mutex::new(SkewProbe::default()),
        }
    }

    /// Returns the lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquires the lock at `path` using the configured default timeout.
    pub fn lock(&self, path: &Path) -> Result<LockGuard> {
        self.acquire(path, self.config.timeout)
    }

    /// Acquires the lock at `path`, waiting at most `timeout`.
    ///
    /// The wait is additionally capped by [`LockConfig::max_wait`]. A zero
    /// timeout makes exactly one attempt (after any stale-lock removal).
    ///
    /// # Errors
    ///
    /// - [`SpoolError::TimedOut`] if the lock stays held past the deadline.
    /// - [`SpoolError::NotFound`] if the lock's directory does not exist.
    /// - [`SpoolError::System`] for other I/O failures.
    pub fn acquire(&self, path: &Path, timeout: Duration) -> Result<LockGuard> {
        let budget = timeout.min(self.config.max_wait);
        let start = std::time::Instant::now();
        let mut immediate_retries = 0;

        loop {
            let mut retry_now = false;

            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Informational only; an empty lock file is still a lock
                    let _ = writeln!(file, "{}", std::process::id());
                    trace!(path = %path.display(), "Acquired lock");
                    return Ok(LockGuard::new(path));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match self.lock_age(path) {
                    // Holder released between our attempt and the stat
                    None => retry_now = true,
                    Some(age) if age > self.config.stale_after => {
                        warn!(
                            path = %path.display(),
                            age_ms = age.as_millis() as u64,
                            "Removing stale lock"
                        );
                        self.break_stale(path)?;
                        retry_now = true;
                    }
                    Some(_) => {}
                },
                Err(e) => return Err(SpoolError::from_io_at(e, path)),
            }

            if retry_now && immediate_retries < MAX_IMMEDIATE_RETRIES {
                immediate_retries += 1;
                continue;
            }

            let elapsed = start.elapsed();
            if elapsed >= budget {
                debug!(path = %path.display(), waited_ms = elapsed.as_millis() as u64, "Lock wait timed out");
                return Err(SpoolError::TimedOut(path.to_path_buf()));
            }
            std::thread::sleep(LOCK_RETRY_QUANTUM.min(budget - elapsed));
        }
    }

    /// Makes a single acquisition attempt.
    pub fn try_acquire(&self, path: &Path) -> Result<LockGuard> {
        self.acquire(path, Duration::ZERO)
    }

    /// Removes a lock judged stale, unless it was replaced in the meantime.
    ///
    /// Returns `true` if a stale lock was removed.
    fn break_stale(&self, path: &Path) -> Result<bool> {
        let tomb = stale_name(path);
        match std::fs::rename(path, &tomb) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let fresh = self
            .lock_age(&tomb)
            .is_some_and(|age| age <= self.config.stale_after);
        if fresh {
            debug!(path = %path.display(), "Lock was replaced before removal, restoring");
            match std::fs::hard_link(&tomb, path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "Lock re-created while restoring a live lock");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to restore live lock"),
            }
        }
        if let Err(e) = std::fs::remove_file(&tomb)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %tomb.display(), error = %e, "Failed to remove renamed lock");
        }
        Ok(!fresh)
    }

    /// Returns how old the lock file at `path` is, or `None` if it vanished.
    fn lock_age(&self, path: &Path) -> Option<Duration> {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        let offset_ms = match path.parent() {
            Some(dir) if self.config.skew_workaround => self.skew_offset_ms(dir),
            _ => 0,
        };

        let now = SystemTime::now();
        let server_now = if offset_ms >= 0 {
            now + Duration::from_millis(offset_ms.unsigned_abs())
        } else {
            now - Duration::from_millis(offset_ms.unsigned_abs())
        };

        // A lock stamped in the future is as fresh as it gets
        Some(server_now.duration_since(modified).unwrap_or(Duration::ZERO))
    }

    /// Returns the cached clock offset, re-probing when it is too old.
    fn skew_offset_ms(&self, dir: &Path) -> i64 {
        let mut probe = match self.skew.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let due = probe
            .probed_at
            .is_none_or(|at| at.elapsed() >= SKEW_PROBE_INTERVAL);
        if due {
            match measure_skew(dir) {
                Ok(offset_ms) => {
                    if offset_ms.abs() > 1000 {
                        warn!(dir = %dir.display(), offset_ms, "Filesystem clock differs from local clock");
                    }
                    probe.offset_ms = offset_ms;
                }
                Err(e) => debug!(dir = %dir.display(), error = %e, "Clock skew probe failed"),
            }
            probe.probed_at = Some(std::time::Instant::now());
        }
        probe.offset_ms
    }

    /// Returns the measured skew, probing `dir` if none has been taken yet.
    pub fn clock_skew_ms(&self, dir: &Path) -> i64 {
        self.skew_offset_ms(dir)
    }
}

/// Returns a hidden sibling name for `path`, unique to this call.
fn stale_name(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = STALE_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.stale.{}.{seq}", std::process::id()))
}

/// Writes a throwaway file in `dir` and compares its server-stamped mtime
/// with the local clock. Returns server minus local, in milliseconds.
fn measure_skew(dir: &Path) -> io::Result<i64> {
    let probe_path = dir.join(format!(".skew_{}", std::process::id()));
    let before = SystemTime::now();
    let modified = {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&probe_path)?;
        file.write_all(b"skew")?;
        file.sync_all()?;
        file.metadata()?.modified()
    };
    let _ = std::fs::remove_file(&probe_path);
    let modified = modified?;

    let offset = match modified.duration_since(before) {
        Ok(ahead) => ahead.as_millis() as i64,
        Err(behind) => -(behind.duration().as_millis() as i64),
    };
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> LockManager {
        LockManager::new(LockConfig::default())
    }

    fn age_file(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");

        let guard = manager().try_acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(guard.path(), path);

        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let locks = manager();

        let _held = locks.try_acquire(&path).unwrap();
        let start = std::time::Instant::now();
        let err = locks.acquire(&path, Duration::from_millis(120)).unwrap_err();

        assert!(matches!(err, SpoolError::TimedOut(p) if p == path));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn max_wait_caps_the_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let locks = LockManager::new(LockConfig {
            max_wait: Duration::from_millis(50),
            ..LockConfig::default()
        });

        let _held = locks.try_acquire(&path).unwrap();
        let start = std::time::Instant::now();
        let err = locks.acquire(&path, Duration::from_secs(30)).unwrap_err();

        assert!(matches!(err, SpoolError::TimedOut(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");

        let guard = manager().try_acquire(&path).unwrap();
        guard.release().unwrap();
        release(&path).unwrap();
        release(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn reacquire_after_release_is_immediate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let locks = manager();

        locks.try_acquire(&path).unwrap().release().unwrap();

        let start = std::time::Instant::now();
        let _again = locks.try_acquire(&path).unwrap();
        assert!(start.elapsed() < LOCK_RETRY_QUANTUM);
    }

    #[test]
    fn dropping_guard_releases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");

        {
            let _guard = manager().try_acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"99999\n").unwrap();
        age_file(&path, Duration::from_secs(30));

        let guard = manager().try_acquire(&path).unwrap();
        let pid = std::fs::read_to_string(guard.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"99999\n").unwrap();

        let err = manager().try_acquire(&path).unwrap_err();
        assert!(matches!(err, SpoolError::TimedOut(_)));
        assert!(path.exists());
    }

    #[test]
    fn stale_removal_spares_a_replaced_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let locks = manager();

        // Another contender already broke the stale lock and holds a fresh one
        let winner = locks.try_acquire(&path).unwrap();
        assert!(!locks.break_stale(&path).unwrap());

        assert!(path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(matches!(locks.try_acquire(&path), Err(SpoolError::TimedOut(_))));
        winner.release().unwrap();
    }

    #[test]
    fn stale_removal_leaves_no_renamed_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"99999\n").unwrap();
        age_file(&path, Duration::from_secs(30));

        assert!(manager().break_stale(&path).unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!manager().break_stale(&path).unwrap());
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("no-such-shard").join("lock");

        let err = manager().try_acquire(&path).unwrap_err();
        assert!(matches!(err, SpoolError::NotFound(_)));
    }

    #[test]
    fn skew_probe_on_local_disk_is_small() {
        let dir = tempdir().unwrap();
        let locks = LockManager::new(LockConfig {
            skew_workaround: true,
            ..LockConfig::default()
        });

        let skew = locks.clock_skew_ms(dir.path());
        assert!(skew.abs() < 5_000, "unexpected local skew {skew}ms");
        // Probe file is cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn skew_workaround_still_detects_stale_locks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"1\n").unwrap();
        age_file(&path, Duration::from_secs(60));

        let locks = LockManager::new(LockConfig {
            skew_workaround: true,
            ..LockConfig::default()
        });
        assert!(locks.try_acquire(&path).is_ok());
    }
}
