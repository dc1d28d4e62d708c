//! Newtype wrappers for spool identifiers.
//!
//! An [`EntryId`] is the sequence number a spool's counter hands out on
//! enqueue. Wrapping it keeps entry numbers from being confused with shard
//! bases, process ids or error codes, all of which are also plain integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The sequence number of one spool entry.
///
/// Unique and monotonically increasing within a spool. Zero is reserved as
/// "unset" and is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Returns the raw sequence number.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the reserved "unset" value.
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// Recovers an id from a file name by collecting its decimal digits.
    ///
    /// Entry file names embed the id (`cf_0000000042_1a2b`), so the id is
    /// available without opening the file. Only the first run of digits is
    /// used; names without digits yield `None`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let start = name.find(|c: char| c.is_ascii_digit())?;
        let digits: &str = &name[start..];
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        digits[..end].parse().ok().map(EntryId)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntryId {
    fn from(n: u64) -> Self {
        EntryId(n)
    }
}

impl FromStr for EntryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EntryId)
    }
}
