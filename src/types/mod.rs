//! Core domain types for the spool.
//!
//! Identifiers and lifecycle states shared by the spool core, the
//! dispatcher and the command-line surface.

pub mod ids;
pub mod state;

pub use ids::EntryId;
pub use state::{EntryState, UnknownState};
