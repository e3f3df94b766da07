//! Crash recovery.
//!
//! Recovery is redo-only. The log is scanned once; operations of transactions that
//! reached a `DONE` record after the last checkpoint are replayed in LSN order through
//! the storage layer's idempotent redo entry points. Everything else is discarded.

pub mod manager;

pub use manager::{RecoveryManager, RecoveryStats};
