//! Error taxonomy for spool operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::EntryId;

/// Errors that can occur during spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Bad arguments (malformed options, invalid spool root, ...).
    #[error("invalid parameter: {0}")]
    Param(String),

    /// Entry or spool missing. Frequently benign: another process may have
    /// consumed or deleted the entry between listing and reading it.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lock could not be acquired before its deadline.
    #[error("timed out acquiring lock {}", .0.display())]
    TimedOut(PathBuf),

    /// Exclusive-create collision. Retried internally by the entry store.
    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Underlying OS call failed.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// Control file is corrupt, incomplete, or references a missing data file.
    #[error("invalid entry {}: {reason}", path.display())]
    InvalidEntry { path: PathBuf, reason: String },

    /// A dependent resource is in use.
    #[error("busy: {0}")]
    Busy(String),
}

/// Result type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

impl SpoolError {
    pub(crate) fn invalid_entry(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SpoolError::InvalidEntry {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn entry_not_found(id: EntryId) -> Self {
        SpoolError::NotFound(format!("entry {id}"))
    }

    /// Returns true for errors a scanner skips over without aborting.
    ///
    /// A vanished control file, a contended lock, or a half-written entry
    /// affect only the one candidate being looked at.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SpoolError::NotFound(_) | SpoolError::TimedOut(_) | SpoolError::InvalidEntry { .. }
        )
    }

    /// Maps `io::ErrorKind::NotFound` to [`SpoolError::NotFound`] naming `path`.
    pub(crate) fn from_io_at(err: io::Error, path: &std::path::Path) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            SpoolError::NotFound(path.display().to_string())
        } else {
            SpoolError::System(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_errors_are_classified() {
        assert!(SpoolError::NotFound("x".into()).is_benign());
        assert!(SpoolError::TimedOut(PathBuf::from("/l")).is_benign());
        assert!(SpoolError::invalid_entry("/cf", "missing num").is_benign());
        assert!(!SpoolError::Param("bad".into()).is_benign());
        assert!(!SpoolError::Busy("shard".into()).is_benign());
        assert!(!SpoolError::System(io::Error::other("boom")).is_benign());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        let mapped = SpoolError::from_io_at(err, std::path::Path::new("/spool/cf_1"));
        assert!(matches!(mapped, SpoolError::NotFound(p) if p == "/spool/cf_1"));
    }

    #[test]
    fn other_io_errors_map_to_system() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let mapped = SpoolError::from_io_at(err, std::path::Path::new("/x"));
        assert!(matches!(mapped, SpoolError::System(_)));
    }

    #[test]
    fn invalid_entry_message_names_path_and_reason() {
        let err = SpoolError::invalid_entry("/spool/sd_0/cf_1", "missing status");
        assert_eq!(
            err.to_string(),
            "invalid entry /spool/sd_0/cf_1: missing status"
        );
    }
}
