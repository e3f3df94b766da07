use crate::access::{RecordId, RecordStorage, Row, Schema, Value};
use crate::concurrency::{LockManager, ResourceId};
use crate::config::DbConfig;
use crate::recovery::{RecoveryManager, RecoveryStats};
use crate::storage::buffer::{BufferPoolManager, LruReplacer};
use crate::storage::disk::{FileMetadata, PageManager};
use crate::storage::wal::{LogRecord, Lsn, WalConfig, WalListener, WalManager};
use crate::transaction::{Transaction, TransactionIdGenerator, TransactionManager};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use log::info;
use std::ops::Bound;
use std::sync::Arc;

/// Snapshot of on-disk and in-memory state, for diagnostics.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub metadata: FileMetadata,
    pub num_pages: u32,
    pub cached_pages: usize,
    pub next_lsn: Lsn,
    pub flushed_lsn: Lsn,
    pub rows: usize,
    pub btree_height: usize,
}

/// High-level database interface that integrates all layers.
///
/// Every operation runs as its own auto-committed transaction: begin, lock, touch
/// storage, commit. Any error aborts the transaction and releases its locks. Dropping a
/// `Database` without calling [`Database::close`] behaves like a crash: nothing is
/// flushed and the next open recovers from the log.
pub struct Database {
    config: DbConfig,
    buffer_pool: BufferPoolManager,
    wal: Arc<WalManager>,
    storage: Arc<RecordStorage>,
    txn_manager: Arc<TransactionManager>,
    recovery_stats: RecoveryStats,
}

impl Database {
    /// Opens the database under `config.data_dir`, creating it if needed, then recovers
    /// committed work from the log and checkpoints.
    pub fn open(config: DbConfig, schema: Schema) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!(
                "Failed to create data directory {}",
                config.data_dir.display()
            )
        })?;

        let db_path = config.db_path();
        let page_manager = PageManager::open(&db_path)
            .with_context(|| format!("Failed to open database file {}", db_path.display()))?;
        let fresh = page_manager.num_pages() == 1;
        let replacer = Box::new(LruReplacer::new(config.buffer_pool_size));
        let buffer_pool = BufferPoolManager::new(page_manager, replacer, config.buffer_pool_size);

        let wal = Arc::new(
            WalManager::open(WalConfig {
                path: config.wal_path(),
                listener_capacity: config.listener_channel_capacity,
                sync_on_flush: true,
            })
            .context("Failed to open write-ahead log")?,
        );
        buffer_pool.set_log_flusher(wal.clone());

        let storage = if fresh {
            info!("creating database at {}", db_path.display());
            RecordStorage::create(
                buffer_pool.clone(),
                wal.clone(),
                schema,
                config.btree_order,
                config.max_slots_per_page,
            )?
        } else {
            info!("opening database at {}", db_path.display());
            RecordStorage::open(
                buffer_pool.clone(),
                wal.clone(),
                schema,
                config.btree_order,
                config.max_slots_per_page,
            )?
        };
        let storage = Arc::new(storage);

        let recovery_stats = RecoveryManager::new(wal.clone(), storage.clone())
            .recover()
            .context("Recovery failed")?;
        storage.checkpoint()?;

        let txn_manager = Arc::new(TransactionManager::with_generator(
            Arc::new(LockManager::new()),
            wal.clone(),
            TransactionIdGenerator::starting_at(recovery_stats.max_tx_id + 1),
        ));

        info!(
            "database ready: {} rows, next {}",
            storage.len()?,
            wal.next_lsn()
        );
        Ok(Self {
            config,
            buffer_pool,
            wal,
            storage,
            txn_manager,
            recovery_stats,
        })
    }

    /// Inserts `row`, replacing any row with the same primary key.
    pub fn insert(&self, row: &[Value]) -> Result<RecordId> {
        let key = row.first().ok_or_else(|| anyhow!("Cannot insert an empty row"))?;
        let txn = self.begin();
        self.txn_manager.lock_manager().acquire_exclusive(
            txn.id(),
            &self.key_resource(key),
            self.config.lock_timeout,
        )?;
        let rid = self.storage.insert_record(row, txn.id().value())?;
        txn.commit()?;
        Ok(rid)
    }

    /// Deletes the row with primary key `key`. Returns false if there was none.
    pub fn delete(&self, key: &Value) -> Result<bool> {
        let txn = self.begin();
        self.txn_manager.lock_manager().acquire_exclusive(
            txn.id(),
            &self.key_resource(key),
            self.config.lock_timeout,
        )?;
        let deleted = self.storage.delete_record(key, txn.id().value())?;
        txn.commit()?;
        Ok(deleted)
    }

    pub fn get(&self, key: &Value) -> Result<Option<Row>> {
        let txn = self.begin();
        self.txn_manager.lock_manager().acquire_shared(
            txn.id(),
            &self.key_resource(key),
            self.config.lock_timeout,
        )?;
        let row = self.storage.fetch_record(key)?;
        txn.commit()?;
        Ok(row)
    }

    /// Rows with `low <= key <= high`, in key order.
    pub fn scan(&self, low: &Value, high: &Value) -> Result<Vec<Row>> {
        self.scan_range(Bound::Included(low), Bound::Included(high))
    }

    pub fn scan_all(&self) -> Result<Vec<Row>> {
        self.scan_range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Rows within the given key bounds, under a shared table lock.
    pub fn scan_range(&self, low: Bound<&Value>, high: Bound<&Value>) -> Result<Vec<Row>> {
        let txn = self.begin();
        self.txn_manager.lock_manager().acquire_shared(
            txn.id(),
            &self.table_resource(),
            self.config.lock_timeout,
        )?;
        let rows = self.storage.fetch_range((low.cloned(), high.cloned()))?;
        txn.commit()?;
        Ok(rows)
    }

    /// Flushes every page and logs a checkpoint.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.storage.checkpoint()
    }

    /// Raw queue of every record that goes through `append_and_flush`.
    pub fn subscribe(&self) -> Receiver<LogRecord> {
        self.wal.subscribe()
    }

    pub fn register_listener(&self, listener: Arc<dyn WalListener>) -> Result<()> {
        Ok(self.wal.register_listener(listener)?)
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    pub fn schema(&self) -> &Schema {
        self.storage.schema()
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<RecordStorage> {
        &self.storage
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    pub fn info(&self) -> Result<DatabaseInfo> {
        Ok(DatabaseInfo {
            metadata: self.buffer_pool.file_metadata()?,
            num_pages: self.buffer_pool.num_pages(),
            cached_pages: self.buffer_pool.len(),
            next_lsn: self.wal.next_lsn(),
            flushed_lsn: self.wal.flushed_lsn(),
            rows: self.storage.len()?,
            btree_height: self.storage.index().height()?,
        })
    }

    /// Checkpoints (flushing every page and the metadata page), then closes the log.
    pub fn close(self) -> Result<()> {
        self.storage.checkpoint()?;
        self.wal.close()?;
        info!("database closed at {}", self.wal.next_lsn());
        Ok(())
    }

    fn begin(&self) -> Transaction {
        Transaction::begin(self.txn_manager.clone())
    }

    fn table_resource(&self) -> ResourceId {
        ResourceId::table(self.storage.schema().table_name())
    }

    fn key_resource(&self, key: &Value) -> ResourceId {
        ResourceId::key(self.storage.schema().table_name(), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Column, DataType};
    use crate::concurrency::LockError;
    use std::time::Duration;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(
            "users",
            vec![
                Column::new("id", DataType::Int),
                Column::new("name", DataType::Varchar),
            ],
        )
        .unwrap()
    }

    fn config(dir: &std::path::Path) -> DbConfig {
        DbConfig::new(dir)
            .with_buffer_pool_size(16)
            .with_btree_order(4)
            .with_lock_timeout(Duration::from_millis(100))
    }

    fn user(id: i32, name: &str) -> Row {
        vec![Value::Int(id), Value::from(name)]
    }

    #[test]
    fn test_create_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()), schema())?;
        assert!(dir.path().join("minidb.db").exists());
        assert!(dir.path().join("wal-000000000000.log").exists());

        db.insert(&user(1, "alice"))?;
        db.insert(&user(2, "bob"))?;
        db.close()?;

        let db = Database::open(config(dir.path()), schema())?;
        assert_eq!(db.recovery_stats().redone(), 0);
        assert_eq!(db.recovery_stats().skipped, 2);
        assert_eq!(db.get(&Value::Int(2))?, Some(user(2, "bob")));
        assert_eq!(db.scan_all()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_auto_commit_operations() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()), schema())?;

        for i in 1..=10 {
            db.insert(&user(i, &format!("user_{}", i)))?;
        }
        assert_eq!(db.get(&Value::Int(7))?, Some(user(7, "user_7")));
        assert!(db.delete(&Value::Int(7))?);
        assert!(!db.delete(&Value::Int(7))?);
        assert_eq!(db.get(&Value::Int(7))?, None);

        let rows = db.scan(&Value::Int(3), &Value::Int(8))?;
        let ids: Vec<_> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(
            ids,
            vec![3, 4, 5, 6, 8].into_iter().map(Value::Int).collect::<Vec<_>>()
        );

        // Every auto-commit transaction finished and gave its locks back.
        assert!(db.transaction_manager().active_transactions().is_empty());
        Ok(())
    }

    #[test]
    fn test_lock_conflict_aborts_operation() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()), schema())?;
        db.insert(&user(1, "alice"))?;

        // An outside transaction holds the key exclusively.
        let blocker = db.transaction_manager().begin();
        db.transaction_manager().lock_manager().acquire_exclusive(
            blocker,
            &ResourceId::key("users", Value::Int(1)),
            Duration::from_millis(100),
        )?;

        let err = db.insert(&user(1, "mallory")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LockError>(),
            Some(LockError::Timeout { .. })
        ));
        assert!(db.get(&Value::Int(1)).is_err());
        // Unrelated keys are unaffected.
        db.insert(&user(2, "bob"))?;

        db.transaction_manager().commit(blocker)?;
        assert_eq!(db.get(&Value::Int(1))?, Some(user(1, "alice")));
        assert_eq!(db.transaction_manager().active_transactions(), vec![]);
        Ok(())
    }

    #[test]
    fn test_transaction_ids_continue_after_reopen() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()), schema())?;
        db.insert(&user(1, "a"))?;
        db.insert(&user(2, "b"))?;
        let last = db.transaction_manager().last_issued();
        drop(db);

        let db = Database::open(config(dir.path()), schema())?;
        assert_eq!(db.recovery_stats().max_tx_id, last.value());
        assert!(db.transaction_manager().begin() > last);
        Ok(())
    }

    #[test]
    fn test_info() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()), schema())?;
        db.insert(&user(1, "a"))?;

        let info = db.info()?;
        assert_eq!(info.rows, 1);
        assert_eq!(info.metadata.page_size, 4096);
        assert!(info.num_pages >= 3);
        assert_eq!(info.flushed_lsn.next(), info.next_lsn);
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_row() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(config(dir.path()), schema())?;
        assert!(db.insert(&[]).is_err());
        assert!(db.insert(&[Value::from("not an int"), Value::from("x")]).is_err());
        assert!(db.transaction_manager().active_transactions().is_empty());
        Ok(())
    }
}
