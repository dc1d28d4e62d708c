//! Shared test utilities and arbitrary generators for property-based testing.

use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use crate::spool::SpoolEntry;
use crate::spool::time::Instant;
use crate::types::{EntryId, EntryState};

pub fn arb_entry_id() -> impl Strategy<Value = EntryId> {
    (1u64..10_000_000_000).prop_map(EntryId)
}

pub fn arb_state() -> impl Strategy<Value = EntryState> {
    prop_oneof![
        Just(EntryState::Wait),
        Just(EntryState::Elab),
        Just(EntryState::Error),
    ]
}

/// Whole-second instants between 1970 and 2096.
pub fn arb_instant() -> impl Strategy<Value = Instant> {
    (0i64..4_000_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

/// Single-line option strings, including colons and surrounding spaces.
pub fn arb_options() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 =:,;/._-]{0,64}"
}

pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

pub fn arb_entry() -> impl Strategy<Value = crate::spool::SpoolEntry> {
    (
        arb_entry_id(),
        any::<u32>(),
        arb_state(),
        any::<i32>(),
        arb_instant(),
        arb_instant(),
        any::<i64>(),
        arb_options(),
        "[0-9a-f]{4}",
    )
        .prop_map(
            |(num, pid, state, error, ctime, mtime, size, options, tag)| SpoolEntry {
                num,
                pid,
                state,
                error,
                ctime,
                mtime,
                size,
                options,
                cf_path: PathBuf::from(format!("/spool/sd_0/cf_{:010}_{tag}", num.0)),
                df_path: PathBuf::from(format!("/spool/sd_0/df_{:010}_{tag}", num.0)),
            },
        )
}
