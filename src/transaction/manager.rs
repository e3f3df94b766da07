//! Transaction manager for coordinating transaction lifecycle.

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use thiserror::Error;

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::{TransactionInfo, TransactionState};
use crate::concurrency::LockManager;
use crate::storage::wal::WalManager;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),
    #[error("Transaction {0} is in invalid state: {1}")]
    InvalidState(TransactionId, TransactionState),
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Tracks active transactions and releases their locks when they finish.
///
/// Finished transactions are removed from the table, so asking about one afterwards
/// reports `NotFound`.
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    active: DashMap<TransactionId, TransactionInfo>,
    lock_manager: Arc<LockManager>,
    wal: Arc<WalManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, wal: Arc<WalManager>) -> Self {
        Self::with_generator(lock_manager, wal, TransactionIdGenerator::new())
    }

    pub fn with_generator(
        lock_manager: Arc<LockManager>,
        wal: Arc<WalManager>,
        id_generator: TransactionIdGenerator,
    ) -> Self {
        Self {
            id_generator,
            active: DashMap::new(),
            lock_manager,
            wal,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self) -> TransactionId {
        let id = self.id_generator.next();
        let info = TransactionInfo::new(id, self.wal.next_lsn());
        debug!("{} began at {}", id, info.start_lsn);
        self.active.insert(id, info);
        id
    }

    pub fn commit(&self, id: TransactionId) -> Result<TransactionInfo> {
        self.finish(id, TransactionState::Committed)
    }

    pub fn abort(&self, id: TransactionId) -> Result<TransactionInfo> {
        self.finish(id, TransactionState::Aborted)
    }

    pub fn get_state(&self, id: TransactionId) -> Result<TransactionState> {
        self.active
            .get(&id)
            .map(|info| info.state)
            .ok_or(TransactionError::NotFound(id))
    }

    pub fn get_info(&self, id: TransactionId) -> Result<TransactionInfo> {
        self.active
            .get(&id)
            .map(|info| info.clone())
            .ok_or(TransactionError::NotFound(id))
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        self.get_state(id)
            .map(|state| state.is_active())
            .unwrap_or(false)
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self
            .active
            .iter()
            .filter(|entry| entry.state.is_active())
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// The most recently issued transaction id.
    pub fn last_issued(&self) -> TransactionId {
        self.id_generator.current()
    }

    fn finish(&self, id: TransactionId, terminal: TransactionState) -> Result<TransactionInfo> {
        // Mark first so a concurrent second commit/abort sees a terminal state.
        let info = {
            let mut info = self
                .active
                .get_mut(&id)
                .ok_or(TransactionError::NotFound(id))?;
            if !info.state.is_active() {
                return Err(TransactionError::InvalidState(id, info.state));
            }
            info.state = terminal;
            info.clone()
        };

        let released = self.lock_manager.release_all(id);
        self.active.remove(&id);
        debug!(
            "{} {} after {:?}, released {} locks",
            id,
            terminal,
            info.duration(),
            released
        );
        Ok(info)
    }
}

/// A handle to a transaction that aborts on drop unless it was committed or aborted.
pub struct Transaction {
    id: TransactionId,
    manager: Arc<TransactionManager>,
    finished: bool,
}

impl Transaction {
    pub fn begin(manager: Arc<TransactionManager>) -> Self {
        let id = manager.begin();
        Self {
            id,
            manager,
            finished: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> Result<TransactionInfo> {
        self.finished = true;
        self.manager.commit(self.id)
    }

    pub fn abort(mut self) -> Result<TransactionInfo> {
        self.finished = true;
        self.manager.abort(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!("{} dropped while active, aborting", self.id);
            // Best effort: the only failure is that it already finished.
            let _ = self.manager.abort(self.id);
        }
    }
}
