//! Durable file primitives used by every on-disk spool structure.
//!
//! Counter, control files and date markers are all replaced with the
//! write-to-temp-then-rename pattern so a reader in another process sees
//! either the old content or the new content, never a torn write.
//!
//! # Why Directory fsync?
//!
//! Creating, renaming or unlinking a file updates the directory entry.
//! Without an fsync on the directory the entry may not survive a power loss
//! even if the file contents were synced.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so entries created, renamed or removed in it are durable.
///
/// # Errors
///
/// Returns an error if the path doesn't exist or if the fsync fails.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Replaces `path` with `contents` atomically.
///
/// 1. Write to `tmp_path` (truncating any leftover from a crashed writer)
/// 2. fsync the temp file
/// 3. Rename over `path`
/// 4. fsync the parent directory
///
/// `tmp_path` must live in the same directory as `path` and must be unique
/// to the writer; callers hold the lock guarding `path` while calling this.
pub fn replace_file(path: &Path, tmp_path: &Path, contents: &[u8]) -> io::Result<()> {
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        file.write_all(contents)?;
        fsync_file(&file)?;
    }

    if let Err(e) = std::fs::rename(tmp_path, path) {
        let _ = std::fs::remove_file(tmp_path);
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fsync_file_works() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("df_0000000001_a");

        let mut file = File::create(&path).unwrap();
        file.write_all(b"payload").unwrap();

        fsync_file(&file).unwrap();
    }

    #[test]
    fn fsync_dir_works() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("cnt")).unwrap();

        fsync_dir(dir.path()).unwrap();
    }

    #[test]
    fn fsync_dir_fails_on_nonexistent() {
        let result = fsync_dir(Path::new("/nonexistent/spool/that/does/not/exist"));
        assert!(result.is_err());
    }

    #[test]
    fn replace_file_writes_and_removes_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cnt");
        let tmp = dir.path().join("cnt.tmp");

        replace_file(&path, &tmp, b"41\n").unwrap();
        replace_file(&path, &tmp, b"42\n").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"42\n");
        assert!(!tmp.exists());
    }

    #[test]
    fn replace_file_truncates_stale_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("date");
        let tmp = dir.path().join("date.tmp");

        // Leftover from a writer that crashed mid-write
        std::fs::write(&tmp, b"garbage that is longer than the new value").unwrap();

        replace_file(&path, &tmp, b"7").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"7");
    }
}
