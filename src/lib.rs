//! dirspool - a disk-backed work queue with a worker dispatch daemon.
//!
//! Entries live as control/data file pairs in sharded directories under a
//! spool root. Any number of processes may enqueue and dequeue concurrently;
//! all coordination goes through lock files, so no process needs to know
//! about any other. The dispatch daemon hands each entry to an external
//! worker command and records the outcome.

pub mod cli;
pub mod server;
pub mod spool;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod test_utils;
