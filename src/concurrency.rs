//! Concurrency control.
//!
//! Statement-level isolation is provided by two-phase locking over named resources:
//! a transaction acquires shared or exclusive locks as it goes and releases all of them
//! at commit or abort. Waits are bounded by a timeout; there is no deadlock graph, so a
//! timeout is the only way out of a cycle.

pub mod lock;
pub mod resource;

pub use lock::{LockError, LockManager, LockMode};
pub use resource::ResourceId;
