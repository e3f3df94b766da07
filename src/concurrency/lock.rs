//! Lock manager implementation.
//!
//! Locks are owned by transactions, not threads. A lock entry is created lazily the first
//! time a resource is requested and dropped again once nobody holds or waits for it.
//! Every wait is bounded; on timeout the request is withdrawn and the caller is expected
//! to abort its transaction.

use super::resource::ResourceId;
use crate::transaction::TransactionId;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lock modes for concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock (for reading).
    Shared,
    /// Exclusive lock (for writing).
    Exclusive,
}

impl LockMode {
    /// Checks if two lock modes are compatible when held by different transactions.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding `self` already satisfies a request for `requested`.
    pub fn covers(&self, requested: LockMode) -> bool {
        *self == LockMode::Exclusive || requested == LockMode::Shared
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{txn} timed out after {timeout:?} waiting for {mode} lock on {resource}")]
    Timeout {
        txn: TransactionId,
        resource: ResourceId,
        mode: LockMode,
        timeout: Duration,
    },
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: Option<TransactionId>,
    shared: HashSet<TransactionId>,
}

impl LockState {
    /// Modes held by transactions other than `txn`.
    fn held_by_others(&self, txn: TransactionId) -> impl Iterator<Item = LockMode> + '_ {
        let exclusive = self
            .exclusive
            .filter(|&holder| holder != txn)
            .map(|_| LockMode::Exclusive);
        let shared = self
            .shared
            .iter()
            .any(|&holder| holder != txn)
            .then_some(LockMode::Shared);
        exclusive.into_iter().chain(shared)
    }

    fn can_grant(&self, txn: TransactionId, mode: LockMode) -> bool {
        self.held_by_others(txn)
            .all(|held| mode.is_compatible_with(&held))
    }

    fn grant(&mut self, txn: TransactionId, mode: LockMode) {
        match mode {
            // An exclusive holder already covers shared access.
            LockMode::Shared if self.exclusive == Some(txn) => {}
            LockMode::Shared => {
                self.shared.insert(txn);
            }
            LockMode::Exclusive => {
                self.shared.remove(&txn);
                self.exclusive = Some(txn);
            }
        }
    }

    fn release(&mut self, txn: TransactionId) {
        if self.exclusive == Some(txn) {
            self.exclusive = None;
        }
        self.shared.remove(&txn);
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockEntry {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Shared/exclusive lock table keyed by [`ResourceId`].
#[derive(Debug, Default)]
pub struct LockManager {
    table: DashMap<ResourceId, Arc<LockEntry>>,
    held: DashMap<TransactionId, HashMap<ResourceId, LockMode>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_shared(
        &self,
        txn: TransactionId,
        resource: &ResourceId,
        timeout: Duration,
    ) -> Result<(), LockError> {
        self.acquire(txn, resource, LockMode::Shared, timeout)
    }

    pub fn acquire_exclusive(
        &self,
        txn: TransactionId,
        resource: &ResourceId,
        timeout: Duration,
    ) -> Result<(), LockError> {
        self.acquire(txn, resource, LockMode::Exclusive, timeout)
    }

    /// Acquires `mode` on `resource` for `txn`, waiting at most `timeout`.
    ///
    /// Re-acquiring a held mode is a no-op, an exclusive holder may take shared, and the
    /// only shared holder may upgrade to exclusive.
    pub fn acquire(
        &self,
        txn: TransactionId,
        resource: &ResourceId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<(), LockError> {
        if self.holds(txn, resource, mode) {
            return Ok(());
        }

        let entry = Arc::clone(&self.table.entry(resource.clone()).or_default());
        let deadline = Instant::now() + timeout;
        {
            let mut state = entry.state.lock();
            while !state.can_grant(txn, mode) {
                if entry.released.wait_until(&mut state, deadline).timed_out()
                    && !state.can_grant(txn, mode)
                {
                    drop(state);
                    drop(entry);
                    self.prune(resource);
                    warn!("{} timed out waiting for {} lock on {}", txn, mode, resource);
                    return Err(LockError::Timeout {
                        txn,
                        resource: resource.clone(),
                        mode,
                        timeout,
                    });
                }
            }
            state.grant(txn, mode);
        }

        let mut held = self.held.entry(txn).or_default();
        let current = held.entry(resource.clone()).or_insert(mode);
        if mode == LockMode::Exclusive {
            *current = LockMode::Exclusive;
        }
        debug!("{} acquired {} lock on {}", txn, mode, resource);
        Ok(())
    }

    /// Releases every lock `txn` holds and wakes their waiters.
    pub fn release_all(&self, txn: TransactionId) -> usize {
        let Some((_, resources)) = self.held.remove(&txn) else {
            return 0;
        };

        for resource in resources.keys() {
            let entry = self.table.get(resource).map(|e| Arc::clone(&e));
            if let Some(entry) = entry {
                entry.state.lock().release(txn);
                entry.released.notify_all();
            }
            self.prune(resource);
        }
        debug!("{} released {} locks", txn, resources.len());
        resources.len()
    }

    /// Whether `txn` holds `mode` (or a stronger mode) on `resource`.
    pub fn holds(&self, txn: TransactionId, resource: &ResourceId, mode: LockMode) -> bool {
        self.held
            .get(&txn)
            .and_then(|held| held.get(resource).map(|m| m.covers(mode)))
            .unwrap_or(false)
    }

    pub fn held_locks(&self, txn: TransactionId) -> Vec<(ResourceId, LockMode)> {
        let mut locks: Vec<_> = self
            .held
            .get(&txn)
            .map(|held| held.iter().map(|(r, m)| (r.clone(), *m)).collect())
            .unwrap_or_default();
        locks.sort_by(|a, b| a.0.cmp(&b.0));
        locks
    }

    /// Number of resources with a live lock entry.
    pub fn entry_count(&self) -> usize {
        self.table.len()
    }

    // Drops an entry nobody holds or waits on. Waiters keep their own `Arc`, and clones
    // are only taken under the shard lock, so the count check is race-free.
    fn prune(&self, resource: &ResourceId) {
        self.table.remove_if(resource, |_, entry| {
            Arc::strong_count(entry) == 1 && entry.state.lock().is_free()
        });
    }
}
