//! Disk-backed work queue coordinated through the filesystem.
//!
//! A spool is a directory that any number of producer and consumer
//! processes share. They have no memory in common; every piece of
//! coordination is a file:
//!
//! ```text
//! <spool>/cnt                      - last allocated entry id
//! <spool>/lock                     - spool lock, guards the counter
//! <spool>/sd_<base>/cf_*, df_*     - entry pairs, at most N per shard
//! <spool>/sd_<base>/lk_*           - entry locks
//! <spool>/sd_<base>/date           - "shard content changed" hint
//! <spool>/error/                   - failed entries
//! ```
//!
//! # Crash Safety
//!
//! - The data file is written and synced before the control file exists
//!   with content, so a readable control file implies a complete payload
//! - Control files are only ever replaced by rename
//! - Moves link both files before unlinking either
//! - A lock left by a dead process is taken over once it is older than
//!   [`LockConfig::stale_after`]
//!
//! # Usage
//!
//! ```no_run
//! use dirspool::spool::{Payload, Spool, SpoolConfig};
//!
//! let spool = Spool::open("/var/spool/jobs", SpoolConfig::from_env())?;
//! let id = spool.enqueue(Payload::Bytes(b"hello"), "priority=high")?;
//! let entry = spool.dequeue()?;
//! assert_eq!(entry.num, id);
//! spool.delete(entry.num)?;
//! # Ok::<(), dirspool::spool::SpoolError>(())
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod counter;
pub mod entry;
pub mod error;
pub mod fsync;
pub mod lock;
pub mod shard;
pub mod store;
pub mod time;


pub use client::{ListFilter, ORPHAN_ERROR_CODE, ReclaimReport, Spool, SpoolStats};
pub use config::{CacheTtl, LockConfig, SpoolConfig};
pub use entry::SpoolEntry;
pub use error::{Result, SpoolError};
pub use lock::{LockGuard, LockManager};
pub use store::Payload;
