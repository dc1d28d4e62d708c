//! Lifecycle state of a spool entry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where an entry is in its lifecycle.
///
/// ```text
/// enqueue ──► WAIT ──dequeue──► ELAB ──exit 0──► (deleted)
///              ▲                  │
///              │                  └──failure──► ERROR (moved to error/)
///              └──────reinsert / reclaim───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Pending; eligible for dequeue.
    Wait,
    /// Claimed by a dispatcher and handed to a worker.
    Elab,
    /// Processing failed; the entry lives in the error directory.
    Error,
}

impl EntryState {
    /// Returns the control-file spelling of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Wait => "wait",
            EntryState::Elab => "elab",
            EntryState::Error => "error",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognized state name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entry state: {0:?} (expected wait, elab or error)")]
pub struct UnknownState(pub String);

impl FromStr for EntryState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(EntryState::Wait),
            "elab" => Ok(EntryState::Elab),
            "error" => Ok(EntryState::Error),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_spelling() {
        for state in [EntryState::Wait, EntryState::Elab, EntryState::Error] {
            assert_eq!(state.as_str().parse::<EntryState>().unwrap(), state);
        }
    }

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!("WAIT".parse::<EntryState>().unwrap(), EntryState::Wait);
        assert_eq!(" Elab ".parse::<EntryState>().unwrap(), EntryState::Elab);
    }

    #[test]
    fn rejects_unknown_state() {
        let err = "done".parse::<EntryState>().unwrap_err();
        assert_eq!(err, UnknownState("done".to_string()));
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&EntryState::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }
}
