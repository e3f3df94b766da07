//! Transaction state.

use std::time::{Duration, Instant};

use super::id::TransactionId;
use crate::storage::wal::Lsn;

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if the transaction is finished (committed or aborted).
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Information about a transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    /// Next WAL position when the transaction began.
    pub start_lsn: Lsn,
    pub start_time: Instant,
}

impl TransactionInfo {
    pub fn new(id: TransactionId, start_lsn: Lsn) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            start_lsn,
            start_time: Instant::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}
