//! Submission endpoint for the dispatch daemon.
//!
//! Producers normally enqueue by writing into the spool directory. When the
//! daemon is started with a listen path it also accepts payloads over a
//! Unix-domain socket, enqueues them, and wakes the dispatcher so the entry
//! is picked up without waiting for the next poll.
//!
//! # Protocol
//!
//! One payload per connection. The client writes the bytes and shuts down
//! its write half; the listener answers `OK` once the entry is durable, or
//! `KO` if it could not be enqueued.

pub mod listener;

pub use listener::{ACK_KO, ACK_OK, Listener, ListenerError, MAX_SUBMISSION_BYTES};
