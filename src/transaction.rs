//! Transaction management.
//!
//! Transactions here are the unit of lock ownership and of WAL grouping: each one gets a
//! monotonically increasing id, runs while holding its locks, and releases all of them
//! when it commits or aborts.

pub mod id;
pub mod manager;
pub mod state;

pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{Transaction, TransactionError, TransactionManager};
pub use state::{TransactionInfo, TransactionState};
