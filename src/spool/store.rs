//! Control/data file pairs on disk.
//!
//! Every entry is two files in the same directory:
//!
//! ```text
//! df_<num:010>_<tag>   - data file (payload bytes)
//! cf_<num:010>_<tag>   - control file (metadata, see entry.rs)
//! lk_<num:010>         - entry lock, present only while a process holds it
//! tf_<num:010>_<pid>   - provisional control file during a rewrite
//! ```
//!
//! # Crash Safety
//!
//! - The data file is always complete before the control file names it
//! - Control files are replaced with temp + rename + fsync + dir fsync
//! - A control file's existence is authoritative: deletion unlinks it first
//! - Moves hard-link both files before unlinking either, so any reader sees
//!   the pair in the source, in the destination, or (after a crash in the
//!   middle) in both, but never half of it
//!
//! The zero-padded id keeps lexical file order equal to numeric order and
//! lets a scanner recover the id from the name without opening the file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use super::entry::SpoolEntry;
use super::error::{Result, SpoolError};
use super::fsync::{fsync_dir, fsync_file, replace_file};
use crate::types::EntryId;

/// Prefix of control files.
pub const CONTROL_PREFIX: &str = "cf_";

/// Prefix of data files.
pub const DATA_PREFIX: &str = "df_";

/// Prefix of per-entry lock files.
pub const ENTRY_LOCK_PREFIX: &str = "lk_";

/// Prefix of provisional control files written during a rewrite.
pub const PROVISIONAL_PREFIX: &str = "tf_";

/// Candidate names tried before `create` gives up.
const MAX_CREATE_ATTEMPTS: u32 = 16;

/// Source of an entry's payload.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Payload bytes held in memory.
    Bytes(&'a [u8]),
    /// Payload copied from an existing file.
    File(&'a Path),
}

/// What a file inside a spool directory is, judged by name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Control(EntryId),
    Data(EntryId),
    EntryLock(EntryId),
    Provisional(EntryId),
    /// Anything else: markers, spool metadata, or foreign files.
    Other,
}

/// Classifies a directory entry by name.
pub fn classify(name: &str) -> FileRole {
    let role: fn(EntryId) -> FileRole = if name.starts_with(CONTROL_PREFIX) {
        FileRole::Control
    } else if name.starts_with(DATA_PREFIX) {
        FileRole::Data
    } else if name.starts_with(ENTRY_LOCK_PREFIX) {
        FileRole::EntryLock
    } else if name.starts_with(PROVISIONAL_PREFIX) {
        FileRole::Provisional
    } else {
        return FileRole::Other;
    };
    match EntryId::from_file_name(name) {
        Some(id) if !id.is_unset() => role(id),
        _ => FileRole::Other,
    }
}

/// Returns the lock path for entry `num` in `dir`.
pub fn entry_lock_path(dir: &Path, num: EntryId) -> PathBuf {
    dir.join(format!("{ENTRY_LOCK_PREFIX}{:010}", num.get()))
}

/// A control file found by listing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlName {
    pub num: EntryId,
    pub path: PathBuf,
}

/// Lists the control files in `dir`, sorted by file name.
///
/// Names that match no entry role and are not in `known` are returned
/// separately so the caller can report them.
pub fn list_controls(dir: &Path, known: &[&str]) -> Result<(Vec<ControlName>, Vec<String>)> {
    let mut controls = Vec::new();
    let mut foreign = Vec::new();

    for dirent in std::fs::read_dir(dir).map_err(|e| SpoolError::from_io_at(e, dir))? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else {
            foreign.push(name.to_string_lossy().into_owned());
            continue;
        };
        match classify(name) {
            FileRole::Control(num) => controls.push(ControlName {
                num,
                path: dirent.path(),
            }),
            FileRole::Data(_) | FileRole::EntryLock(_) | FileRole::Provisional(_) => {}
            FileRole::Other => {
                if !known.iter().any(|k| name == *k || name.starts_with(&format!("{k}.")))
                    && !name.starts_with('.')
                {
                    foreign.push(name.to_string());
                }
            }
        }
    }

    controls.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    foreign.sort();
    Ok((controls, foreign))
}

/// Exclusively creates an empty data/control pair for `num` in `dir`.
///
/// Candidate names embed `num` plus a tag derived from this process id and
/// the attempt number; a collision with an existing file retries with the
/// next tag.
///
/// # Errors
///
/// - [`SpoolError::NotFound`] if `dir` does not exist.
/// - [`SpoolError::Busy`] if every candidate name was taken.
pub fn create(dir: &Path, num: EntryId) -> Result<(PathBuf, PathBuf)> {
    let pid = std::process::id();

    for attempt in 0..MAX_CREATE_ATTEMPTS {
        let tag = if attempt == 0 {
            format!("{pid:x}")
        } else {
            format!("{pid:x}{attempt:x}")
        };
        let df = dir.join(format!("{DATA_PREFIX}{:010}_{tag}", num.get()));
        let cf = dir.join(format!("{CONTROL_PREFIX}{:010}_{tag}", num.get()));

        match create_exclusive(&df) {
            Ok(()) => {}
            Err(SpoolError::AlreadyExists(_)) => continue,
            Err(e) => return Err(e),
        }
        match create_exclusive(&cf) {
            Ok(()) => {
                trace!(num = %num, cf = %cf.display(), "Created entry pair");
                return Ok((cf, df));
            }
            Err(SpoolError::AlreadyExists(_)) => {
                let _ = std::fs::remove_file(&df);
                continue;
            }
            Err(e) => {
                let _ = std::fs::remove_file(&df);
                return Err(e);
            }
        }
    }

    Err(SpoolError::Busy(format!(
        "no free file name for entry {num} in {}",
        dir.display()
    )))
}

fn create_exclusive(path: &Path) -> Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(SpoolError::AlreadyExists(path.to_path_buf()))
        }
        Err(e) => Err(SpoolError::from_io_at(e, path)),
    }
}

/// Writes the payload to the entry's data file, then its control file.
///
/// `entry.size` is updated from the written data file before the control
/// file is rendered.
pub fn write(entry: &mut SpoolEntry, payload: Payload<'_>) -> Result<()> {
    {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&entry.df_path)?;
        match payload {
            Payload::Bytes(bytes) => file.write_all(bytes)?,
            Payload::File(source) => {
                let mut src = File::open(source).map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => {
                        SpoolError::Param(format!("payload file {} not found", source.display()))
                    }
                    _ => SpoolError::System(e),
                })?;
                io::copy(&mut src, &mut file)?;
            }
        }
        fsync_file(&file)?;
    }
    entry.size = data_size(&entry.df_path);
    write_control(entry)
}

/// Atomically replaces the entry's control file with its current fields.
pub fn write_control(entry: &SpoolEntry) -> Result<()> {
    let tmp = entry.dir().join(format!(
        "{PROVISIONAL_PREFIX}{:010}_{:x}",
        entry.num.get(),
        std::process::id()
    ));
    replace_file(&entry.cf_path, &tmp, entry.render().as_bytes())?;
    Ok(())
}

/// Returns the size of a data file, or the negated OS error code.
pub fn data_size(df_path: &Path) -> i64 {
    match std::fs::metadata(df_path) {
        Ok(meta) => i64::try_from(meta.len()).unwrap_or(i64::MAX),
        Err(e) => -i64::from(e.raw_os_error().unwrap_or(1)),
    }
}

/// Reads the entry whose control file is `cf_path`.
///
/// # Errors
///
/// - [`SpoolError::NotFound`] if the control file vanished.
/// - [`SpoolError::InvalidEntry`] if the control file is malformed or its
///   data file is missing or unreadable.
pub fn read(cf_path: &Path) -> Result<SpoolEntry> {
    let text = std::fs::read_to_string(cf_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SpoolError::NotFound(cf_path.display().to_string()),
        io::ErrorKind::InvalidData => SpoolError::invalid_entry(cf_path, "control file is not UTF-8"),
        _ => SpoolError::System(e),
    })?;

    let entry = SpoolEntry::parse(&text, cf_path)?;
    if let Err(e) = std::fs::metadata(&entry.df_path) {
        let reason = match e.kind() {
            io::ErrorKind::NotFound => "data file missing".to_string(),
            _ => format!("data file unreadable: {e}"),
        };
        return Err(SpoolError::invalid_entry(cf_path, reason));
    }
    Ok(entry)
}

/// Reads the payload bytes of an entry.
pub fn read_payload(entry: &SpoolEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(entry.size.max(0) as usize);
    File::open(&entry.df_path)
        .map_err(|e| SpoolError::from_io_at(e, &entry.df_path))?
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Moves an entry's pair into `dest_dir`, returning the relocated entry.
///
/// Both files are hard-linked into the destination before either original
/// is unlinked. If linking the control file fails, the already-linked data
/// file is removed again. A destination file that is already the same inode
/// as its source (left behind by an interrupted move) is accepted.
pub fn move_pair(entry: &SpoolEntry, dest_dir: &Path) -> Result<SpoolEntry> {
    let dest_cf = dest_path(&entry.cf_path, dest_dir)?;
    let dest_df = dest_path(&entry.df_path, dest_dir)?;

    let df_linked = link_into(&entry.df_path, &dest_df)?;
    if let Err(e) = link_into(&entry.cf_path, &dest_cf) {
        if df_linked {
            let _ = std::fs::remove_file(&dest_df);
        }
        return Err(e);
    }
    fsync_dir(dest_dir)?;

    // The control file goes first: without it the source pair is invisible
    remove_if_present(&entry.cf_path)?;
    remove_if_present(&entry.df_path)?;
    fsync_dir(entry.dir())?;

    debug!(
        num = %entry.num,
        from = %entry.dir().display(),
        to = %dest_dir.display(),
        "Moved entry"
    );

    Ok(SpoolEntry {
        cf_path: dest_cf,
        df_path: dest_df,
        ..entry.clone()
    })
}

fn dest_path(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    src.file_name()
        .map(|name| dest_dir.join(name))
        .ok_or_else(|| SpoolError::Param(format!("{} has no file name", src.display())))
}

/// Hard-links `src` to `dest`. Returns whether a new link was made.
fn link_into(src: &Path, dest: &Path) -> Result<bool> {
    match std::fs::hard_link(src, dest) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if same_file(src, dest) {
                Ok(false)
            } else {
                Err(SpoolError::AlreadyExists(dest.to_path_buf()))
            }
        }
        Err(e) => Err(SpoolError::from_io_at(e, src)),
    }
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}

/// Unlinks both files of an entry, control file first.
///
/// # Errors
///
/// Returns [`SpoolError::NotFound`] if the control file was already gone.
pub fn remove(entry: &SpoolEntry) -> Result<()> {
    std::fs::remove_file(&entry.cf_path)
        .map_err(|e| SpoolError::from_io_at(e, &entry.cf_path))?;
    if let Err(e) = remove_if_present(&entry.df_path) {
        warn!(num = %entry.num, error = %e, "Control file removed but data file remains");
    }
    fsync_dir(entry.dir())?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
