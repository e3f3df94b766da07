//! Redo recovery over the write-ahead log.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::access::{RecordStorage, Value};
use crate::storage::wal::{LogRecord, LogRecordType, Lsn, WalManager};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Valid records read from the log.
    pub records_scanned: usize,
    pub puts_redone: usize,
    pub deletes_redone: usize,
    /// Committed operations that needed no work: already covered by the checkpoint or
    /// already reflected in storage.
    pub skipped: usize,
    /// Operations whose transaction never reached `DONE`.
    pub uncommitted_discarded: usize,
    /// LSN of the last checkpoint, `Lsn::INVALID` if there is none.
    pub checkpoint_lsn: Lsn,
    /// Highest transaction id seen in the log.
    pub max_tx_id: u64,
    /// Whether the log showed an unclean shutdown, forcing an index rebuild.
    pub index_rebuilt: bool,
    /// Rows the rebuilt index picked up from record pages before redo.
    pub rows_reindexed: usize,
    /// Unfinished deletes whose row image was put back.
    pub deletes_rolled_back: usize,
}

impl RecoveryStats {
    pub fn redone(&self) -> usize {
        self.puts_redone + self.deletes_redone
    }
}

impl fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records scanned, {} puts and {} deletes redone, {} skipped, {} uncommitted discarded",
            self.records_scanned,
            self.puts_redone,
            self.deletes_redone,
            self.skipped,
            self.uncommitted_discarded
        )?;
        if self.index_rebuilt {
            write!(
                f,
                ", index rebuilt from {} rows, {} deletes rolled back",
                self.rows_reindexed, self.deletes_rolled_back
            )?;
        }
        Ok(())
    }
}

/// What analysis learned from the log.
struct Analysis {
    /// Committed operations after the last checkpoint, in LSN order.
    committed: Vec<LogRecord>,
    /// Operations whose transaction never logged `DONE`, in LSN order.
    unfinished: Vec<LogRecord>,
    /// Nothing was logged after the last checkpoint, so the pages on disk are exactly
    /// what that checkpoint flushed.
    clean: bool,
}

/// Replays committed work from the log into record storage.
pub struct RecoveryManager {
    wal: Arc<WalManager>,
    storage: Arc<RecordStorage>,
}

impl RecoveryManager {
    pub fn new(wal: Arc<WalManager>, storage: Arc<RecordStorage>) -> Self {
        Self { wal, storage }
    }

    /// Runs analysis, rebuilds the index after an unclean shutdown, then redoes committed
    /// work. Running it again against the same log changes nothing.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let records = self
            .wal
            .read_records()
            .context("Failed to read the write-ahead log")?;

        let mut stats = RecoveryStats {
            records_scanned: records.len(),
            ..Default::default()
        };
        let analysis = Self::analyze(records, &mut stats);
        if !analysis.clean {
            self.rebuild(&analysis, &mut stats)?;
        }
        self.redo(analysis.committed, &mut stats)?;

        info!("recovery finished: {}", stats);
        Ok(stats)
    }

    /// Picks out the committed operations that still need redo and the unfinished ones.
    fn analyze(records: Vec<LogRecord>, stats: &mut RecoveryStats) -> Analysis {
        stats.checkpoint_lsn = records
            .iter()
            .filter(|r| r.record_type == LogRecordType::Checkpoint)
            .map(|r| r.lsn)
            .max()
            .unwrap_or(Lsn::INVALID);
        stats.max_tx_id = records.iter().map(|r| r.tx_id).max().unwrap_or(0);
        let clean = records.iter().all(|r| r.lsn <= stats.checkpoint_lsn);

        let mut pending: HashMap<u64, Vec<LogRecord>> = HashMap::new();
        let mut committed = Vec::new();
        for record in records {
            match record.record_type {
                LogRecordType::Put | LogRecordType::Delete => {
                    pending.entry(record.tx_id).or_default().push(record);
                }
                LogRecordType::Done => {
                    let ops = pending.remove(&record.tx_id).unwrap_or_default();
                    // A checkpoint flushed every page touched before it.
                    if record.lsn > stats.checkpoint_lsn {
                        committed.extend(ops);
                    } else {
                        stats.skipped += ops.len();
                    }
                }
                LogRecordType::Checkpoint => {}
            }
        }

        stats.uncommitted_discarded = pending.values().map(Vec::len).sum();
        for (tx_id, ops) in &pending {
            debug!("discarding {} operations of unfinished tx {}", ops.len(), tx_id);
        }

        let mut unfinished: Vec<LogRecord> = pending.into_values().flatten().collect();
        unfinished.sort_by_key(|r| r.lsn);
        committed.sort_by_key(|r| r.lsn);
        Analysis {
            committed,
            unfinished,
            clean,
        }
    }

    /// Rebuilds the index from record pages, keeping only rows that no logged operation
    /// after the checkpoint could have produced.
    ///
    /// Rows of keys with committed work are dropped and come back through redo. Rows
    /// matching an unfinished PUT are dropped outright. An unfinished DELETE whose row is
    /// already gone from disk gets its logged image back.
    fn rebuild(&self, analysis: &Analysis, stats: &mut RecoveryStats) -> Result<()> {
        let redone_keys: BTreeSet<Value> = analysis
            .committed
            .iter()
            .filter_map(|record| self.key_of(record))
            .collect();
        let unfinished_puts: HashSet<&[u8]> = analysis
            .unfinished
            .iter()
            .filter(|r| r.record_type == LogRecordType::Put)
            .filter_map(|r| r.value.as_deref())
            .collect();

        let rebuilt = self.storage.rebuild_index(|key, bytes| {
            !redone_keys.contains(key) && !unfinished_puts.contains(bytes)
        })?;
        stats.index_rebuilt = true;
        stats.rows_reindexed = rebuilt.rows_indexed;

        for record in &analysis.unfinished {
            if record.record_type != LogRecordType::Delete {
                continue;
            }
            let Some(key) = self.key_of(record) else {
                warn!("unfinished {} carries no row image, cannot roll it back", record);
                continue;
            };
            if redone_keys.contains(&key) || self.storage.fetch_record(&key)?.is_some() {
                continue;
            }
            let image = record.value.as_deref().unwrap_or_default();
            self.storage
                .redo_put(image)
                .with_context(|| format!("Failed to roll back {}", record))?;
            stats.deletes_rolled_back += 1;
            debug!("rolled back {}", record);
        }
        Ok(())
    }

    /// Primary key touched by a PUT or DELETE, read from its row image.
    fn key_of(&self, record: &LogRecord) -> Option<Value> {
        let image = record.value.as_deref().filter(|image| !image.is_empty())?;
        self.storage.schema().key_of_encoded(image).ok()
    }

    fn redo(&self, committed: Vec<LogRecord>, stats: &mut RecoveryStats) -> Result<()> {
        for record in committed {
            let value = record.value.as_deref().unwrap_or_default();
            let applied = match record.record_type {
                LogRecordType::Put => {
                    if value.is_empty() {
                        bail!("PUT record {} carries no row image", record.lsn);
                    }
                    let applied = self
                        .storage
                        .redo_put(value)
                        .with_context(|| format!("Failed to redo {}", record))?;
                    stats.puts_redone += usize::from(applied);
                    applied
                }
                LogRecordType::Delete => {
                    let key = record.key.as_deref().unwrap_or_default();
                    let applied = self
                        .storage
                        .redo_delete(key, value)
                        .with_context(|| format!("Failed to redo {}", record))?;
                    stats.deletes_redone += usize::from(applied);
                    applied
                }
                LogRecordType::Done | LogRecordType::Checkpoint => continue,
            };
            if !applied {
                stats.skipped += 1;
            }
            debug!("redo {}: applied={}", record, applied);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Column, DataType, NodeCodec, Row, Schema, Value};
    use crate::storage::buffer::{BufferPoolManager, LruReplacer};
    use crate::storage::page::DEFAULT_MAX_SLOTS;
    use crate::storage::wal::WalConfig;
    use crate::storage::PageManager;
    use std::path::Path;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(
            "kv",
            vec![
                Column::new("id", DataType::Varchar),
                Column::new("value", DataType::Varchar),
            ],
        )
        .unwrap()
    }

    fn row(id: &str, value: &str) -> Row {
        vec![Value::from(id), Value::from(value)]
    }

    struct Fixture {
        storage: Arc<RecordStorage>,
        wal: Arc<WalManager>,
        pool: BufferPoolManager,
    }

    fn open(dir: &Path) -> Result<Fixture> {
        open_with_pool(dir, 16)
    }

    fn open_with_pool(dir: &Path, frames: usize) -> Result<Fixture> {
        let page_manager = PageManager::open(&dir.join("minidb.db"))?;
        let fresh = page_manager.num_pages() == 1;
        let pool = BufferPoolManager::new(page_manager, Box::new(LruReplacer::new(frames)), frames);
        let wal = Arc::new(WalManager::open(WalConfig::new(dir.join("wal.log")))?);
        pool.set_log_flusher(wal.clone());
        let storage = if fresh {
            RecordStorage::create(pool.clone(), wal.clone(), schema(), 4, DEFAULT_MAX_SLOTS)?
        } else {
            RecordStorage::open(pool.clone(), wal.clone(), schema(), 4, DEFAULT_MAX_SLOTS)?
        };
        Ok(Fixture {
            storage: Arc::new(storage),
            wal,
            pool,
        })
    }

    fn recover(fixture: &Fixture) -> Result<RecoveryStats> {
        RecoveryManager::new(fixture.wal.clone(), fixture.storage.clone()).recover()
    }

    #[test]
    fn test_committed_put_survives_crash() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            db.storage.insert_record(&row("k1", "v1"), 1)?;
            // Dropped without flushing any page.
        }

        let db = open(dir.path())?;
        assert_eq!(db.storage.fetch_record(&Value::from("k1"))?, None);

        let stats = recover(&db)?;
        assert_eq!(stats.records_scanned, 2);
        assert_eq!(stats.puts_redone, 1);
        assert_eq!(stats.max_tx_id, 1);
        assert_eq!(
            db.storage.fetch_record(&Value::from("k1"))?,
            Some(row("k1", "v1"))
        );
        Ok(())
    }

    #[test]
    fn test_uncommitted_operations_are_discarded() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            db.storage.insert_record(&row("a", "1"), 1)?;
            let bytes = schema().encode_row(&row("b", "2"))?;
            db.wal
                .append_and_flush(LogRecord::put(2, Value::from("b").encode(), bytes))?;
        }

        let db = open(dir.path())?;
        let stats = recover(&db)?;
        assert_eq!(stats.puts_redone, 1);
        assert_eq!(stats.uncommitted_discarded, 1);
        assert!(db.storage.fetch_record(&Value::from("a"))?.is_some());
        assert_eq!(db.storage.fetch_record(&Value::from("b"))?, None);
        Ok(())
    }

    #[test]
    fn test_delete_is_redone() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            db.storage.insert_record(&row("a", "1"), 1)?;
            db.storage.insert_record(&row("b", "2"), 2)?;
            db.storage.delete_record(&Value::from("a"), 3)?;
        }

        let db = open(dir.path())?;
        let stats = recover(&db)?;
        assert_eq!(stats.puts_redone, 2);
        assert_eq!(stats.deletes_redone, 1);
        assert_eq!(db.storage.fetch_record(&Value::from("a"))?, None);
        assert_eq!(db.storage.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_recovery_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            for i in 0..20 {
                db.storage
                    .insert_record(&row(&format!("k{:02}", i), &format!("v{}", i)), i + 1)?;
            }
            db.storage.insert_record(&row("k03", "updated"), 21)?;
            db.storage.delete_record(&Value::from("k07"), 22)?;
        }

        let db = open(dir.path())?;
        let first = recover(&db)?;
        let after_first = db.storage.range_fetch(&Value::from(""), &Value::from("z"))?;
        assert_eq!(after_first.len(), 19);
        assert!(first.redone() > 0);

        // Replaying again rewrites intermediate versions but ends in the same state.
        recover(&db)?;
        assert_eq!(
            db.storage.range_fetch(&Value::from(""), &Value::from("z"))?,
            after_first
        );
        assert_eq!(
            db.storage.fetch_record(&Value::from("k03"))?,
            Some(row("k03", "updated"))
        );
        Ok(())
    }

    #[test]
    fn test_checkpoint_limits_redo() -> Result<()> {
        let dir = tempdir()?;
        let checkpoint_lsn = {
            let db = open(dir.path())?;
            db.storage.insert_record(&row("a", "1"), 1)?;
            let lsn = db.storage.checkpoint()?;
            db.storage.insert_record(&row("b", "2"), 2)?;
            lsn
        };

        let db = open(dir.path())?;
        let stats = recover(&db)?;
        assert_eq!(stats.checkpoint_lsn, checkpoint_lsn);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.puts_redone, 1);
        assert!(db.storage.fetch_record(&Value::from("a"))?.is_some());
        assert!(db.storage.fetch_record(&Value::from("b"))?.is_some());
        Ok(())
    }

    #[test]
    fn test_clean_log_skips_rebuild() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            db.storage.insert_record(&row("a", "1"), 1)?;
            db.storage.checkpoint()?;
        }

        let db = open(dir.path())?;
        let stats = recover(&db)?;
        assert!(!stats.index_rebuilt);
        assert_eq!(stats.redone(), 0);
        assert!(db.storage.fetch_record(&Value::from("a"))?.is_some());
        Ok(())
    }

    #[test]
    fn test_index_pages_flushed_mid_workload_are_rebuilt() -> Result<()> {
        let dir = tempdir()?;
        {
            // Six frames force index pages out long before the crash.
            let db = open_with_pool(dir.path(), 6)?;
            db.storage.checkpoint()?;
            let mut tx = 0;
            for i in 0..60 {
                tx += 1;
                db.storage
                    .insert_record(&row(&format!("k{:03}", i), "x"), tx)?;
            }
            for i in (0..60).filter(|i| i % 3 != 0) {
                tx += 1;
                db.storage.delete_record(&Value::from(format!("k{:03}", i)), tx)?;
            }
            for i in 60..90 {
                tx += 1;
                db.storage
                    .insert_record(&row(&format!("k{:03}", i), "y"), tx)?;
            }
        }

        let db = open_with_pool(dir.path(), 6)?;
        let stats = recover(&db)?;
        assert!(stats.index_rebuilt);
        db.storage.index().validate()?;
        let rows = db.storage.fetch_range(..)?;
        assert_eq!(rows.len(), 50);
        assert!(rows.windows(2).all(|w| w[0][0] < w[1][0]));
        Ok(())
    }

    #[test]
    fn test_unfinished_delete_is_rolled_back() -> Result<()> {
        let dir = tempdir()?;
        let wal_path = dir.path().join("wal.log");
        {
            let db = open(dir.path())?;
            db.storage.insert_record(&row("a", "1"), 1)?;
            db.storage.insert_record(&row("b", "2"), 2)?;
            db.storage.checkpoint()?;
            db.storage.delete_record(&Value::from("a"), 3)?;
            // The deleted slot reaches disk.
            db.pool.flush_all()?;
            db.wal.close()?;
        }
        // Cut the final DONE, as if the crash hit before it was written.
        let done_len = LogRecord::done(3).encode().len() as u64;
        let file = std::fs::OpenOptions::new().write(true).open(&wal_path)?;
        file.set_len(file.metadata()?.len() - done_len)?;
        drop(file);

        let db = open(dir.path())?;
        let stats = recover(&db)?;
        assert_eq!(stats.uncommitted_discarded, 1);
        assert_eq!(stats.deletes_rolled_back, 1);
        assert_eq!(
            db.storage.fetch_record(&Value::from("a"))?,
            Some(row("a", "1"))
        );
        assert_eq!(db.storage.len()?, 2);
        Ok(())
    }

    #[test]
    fn test_empty_log() -> Result<()> {
        let dir = tempdir()?;
        let db = open(dir.path())?;
        let stats = recover(&db)?;
        assert_eq!(stats, RecoveryStats::default());
        Ok(())
    }
}
