//! Database configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::page::DEFAULT_MAX_SLOTS;

/// Settings for [`Database::open`](crate::database::Database::open).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub data_dir: PathBuf,
    pub db_file_name: String,
    pub wal_file_name: String,
    /// Frames in the buffer pool.
    pub buffer_pool_size: usize,
    /// Keys per index node before it splits. Higher orders leave less room per key.
    pub btree_order: usize,
    /// Upper bound on any single lock wait.
    pub lock_timeout: Duration,
    /// Records each WAL listener may have queued; a listener that falls further behind is
    /// disconnected.
    pub listener_channel_capacity: usize,
    pub max_slots_per_page: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./minidb_data"),
            db_file_name: "minidb.db".to_string(),
            wal_file_name: "wal-000000000000.log".to_string(),
            buffer_pool_size: 64,
            btree_order: 32,
            lock_timeout: Duration::from_secs(10),
            listener_channel_capacity: 1024,
            max_slots_per_page: DEFAULT_MAX_SLOTS,
        }
    }
}

impl DbConfig {
    /// Default settings rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::default().with_data_dir(data_dir)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_db_file_name(mut self, name: impl Into<String>) -> Self {
        self.db_file_name = name.into();
        self
    }

    pub fn with_wal_file_name(mut self, name: impl Into<String>) -> Self {
        self.wal_file_name = name.into();
        self
    }

    pub fn with_buffer_pool_size(mut self, frames: usize) -> Self {
        self.buffer_pool_size = frames;
        self
    }

    pub fn with_btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_listener_channel_capacity(mut self, capacity: usize) -> Self {
        self.listener_channel_capacity = capacity;
        self
    }

    pub fn with_max_slots_per_page(mut self, max_slots: usize) -> Self {
        self.max_slots_per_page = max_slots;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file_name)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file_name)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.buffer_pool_size, 64);
        assert_eq!(config.btree_order, 32);
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.listener_channel_capacity, 1024);
        assert_eq!(config.max_slots_per_page, 128);
    }

    #[test]
    fn test_builder_and_paths() {
        let config = DbConfig::new("/tmp/db")
            .with_buffer_pool_size(8)
            .with_btree_order(4)
            .with_lock_timeout(Duration::from_millis(50))
            .with_db_file_name("data.db");

        assert_eq!(config.buffer_pool_size, 8);
        assert_eq!(config.btree_order, 4);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/db/data.db"));
        assert_eq!(
            config.wal_path(),
            PathBuf::from("/tmp/db/wal-000000000000.log")
        );
    }
}
