//! The dispatch daemon.
//!
//! Pulls WAIT entries out of a spool and runs an external command for each,
//! one child process per entry. Process isolation is the point: a worker
//! that crashes, hangs, or corrupts its own memory affects only its entry,
//! which ends up in ERROR with the failure code.
//!
//! # Module Structure
//!
//! - [`config`]: daemon settings and their environment variables
//! - [`dispatch`]: the main loop
//! - [`exec`]: running one worker process
//! - [`trap`]: failure notification command
//! - [`reinsert`]: periodic retry of aged failures

pub mod config;
pub mod dispatch;
pub mod exec;
pub mod reinsert;
pub mod trap;


pub use config::{Delivery, DispatcherConfig};
pub use dispatch::{DispatchError, Dispatcher};
pub use exec::Outcome;
