//! Spool entries and the control-file codec.
//!
//! A control file is line-oriented `key: value` text:
//!
//! ```text
//! num: 42
//! pid: 31337
//! status: wait
//! error: 0
//! ctime: 2026-10-16T09:00:00Z
//! mtime: 2026-10-16T09:00:00Z
//! df: df_0000000042_7a69
//! size: 5
//! options: priority=high
//! ```
//!
//! The key set is fixed. Unknown keys are ignored so a newer writer does not
//! break an older reader. `df` holds the data file's name, resolved against
//! the control file's own directory, so a pair stays valid when it is moved
//! into or out of the error directory.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::error::{Result, SpoolError};
use super::time::{Instant, format_time, parse_time};
use crate::types::{EntryId, EntryState};

/// One queued unit of work.
///
/// Owned by whichever process holds its entry lock; otherwise addressable by
/// any process through `cf_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpoolEntry {
    /// Sequence number, unique within the spool.
    pub num: EntryId,

    /// Process that last wrote the entry. Informational only.
    pub pid: u32,

    /// Lifecycle state.
    #[serde(rename = "status")]
    pub state: EntryState,

    /// Failure code. Meaningful only in [`EntryState::Error`].
    pub error: i32,

    /// Creation time.
    pub ctime: Instant,

    /// Last state change.
    pub mtime: Instant,

    /// Payload size in bytes, or a negated OS error code when the size could
    /// not be determined.
    pub size: i64,

    /// Opaque pass-through string handed to the worker.
    pub options: String,

    /// Path of the control file.
    pub cf_path: PathBuf,

    /// Path of the data file.
    pub df_path: PathBuf,
}

impl SpoolEntry {
    /// Returns the directory holding this entry's pair.
    pub fn dir(&self) -> &Path {
        self.cf_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Returns true if the payload size is known.
    pub fn size_known(&self) -> bool {
        self.size >= 0
    }

    /// Renders the control-file text.
    pub fn render(&self) -> String {
        let df = self
            .df_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut out = String::with_capacity(256);
        // Writing to a String cannot fail
        let _ = writeln!(out, "num: {}", self.num);
        let _ = writeln!(out, "pid: {}", self.pid);
        let _ = writeln!(out, "status: {}", self.state);
        let _ = writeln!(out, "error: {}", self.error);
        let _ = writeln!(out, "ctime: {}", format_time(self.ctime));
        let _ = writeln!(out, "mtime: {}", format_time(self.mtime));
        let _ = writeln!(out, "df: {df}");
        let _ = writeln!(out, "size: {}", self.size);
        let _ = writeln!(out, "options: {}", self.options);
        out
    }

    /// Parses control-file text read from `cf_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::InvalidEntry`] if `num`, `status`, `ctime` or
    /// `df` is missing or malformed.
    pub fn parse(text: &str, cf_path: &Path) -> Result<Self> {
        let invalid = |reason: String| SpoolError::invalid_entry(cf_path, reason);

        let mut num = None;
        let mut pid = 0;
        let mut state = None;
        let mut error = 0;
        let mut ctime = None;
        let mut mtime = None;
        let mut df = None;
        let mut size = -1;
        let mut options = String::new();

        for line in text.lines() {
            let Some((key, raw)) = line.split_once(':') else {
                continue;
            };
            let value = raw.trim();
            match key.trim() {
                "num" => {
                    let n = value
                        .parse::<EntryId>()
                        .map_err(|_| invalid(format!("bad num {value:?}")))?;
                    num = Some(n);
                }
                "pid" => pid = value.parse().unwrap_or(0),
                "status" => {
                    let s = value
                        .parse::<EntryState>()
                        .map_err(|e| invalid(e.to_string()))?;
                    state = Some(s);
                }
                "error" => error = value.parse().unwrap_or(0),
                "ctime" => ctime = parse_time(value),
                "mtime" => mtime = parse_time(value),
                "df" if !value.is_empty() => df = Some(value.to_string()),
                "size" => size = value.parse().unwrap_or(-1),
                // Options are opaque: keep interior and trailing whitespace
                "options" => options = raw.strip_prefix(' ').unwrap_or(raw).to_string(),
                _ => {}
            }
        }

        let num = num.ok_or_else(|| invalid("missing num".into()))?;
        if num.is_unset() {
            return Err(invalid("num is zero".into()));
        }
        let state = state.ok_or_else(|| invalid("missing status".into()))?;
        let ctime = ctime.ok_or_else(|| invalid("missing or bad ctime".into()))?;
        let df = df.ok_or_else(|| invalid("missing df".into()))?;
        let df_name = Path::new(&df)
            .file_name()
            .ok_or_else(|| invalid(format!("bad df {df:?}")))?;
        let dir = cf_path.parent().unwrap_or_else(|| Path::new("."));

        Ok(SpoolEntry {
            num,
            pid,
            state,
            error,
            ctime,
            mtime: mtime.unwrap_or(ctime),
            size,
            options,
            cf_path: cf_path.to_path_buf(),
            df_path: dir.join(df_name),
        })
    }
}
