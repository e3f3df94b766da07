//! WAL manager implementation.
//!
//! A single mutex covers LSN assignment and the append itself, so the order of records in
//! the file is the LSN order. Durability is explicit: `append` only buffers, `flush`
//! forces everything appended so far to disk.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::record::{LogRecord, Lsn};
use crate::storage::buffer::LogFlusher;
use crate::storage::error::{StorageError, StorageResult};

/// WAL manager configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Path of the log file.
    pub path: PathBuf,
    /// Capacity of each listener queue.
    pub listener_capacity: usize,
    /// Whether `flush` calls fsync. Disabling it only makes sense in tests.
    pub sync_on_flush: bool,
}

impl WalConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WalConfig {
            path: path.into(),
            listener_capacity: 1024,
            sync_on_flush: true,
        }
    }
}

/// Receives every record that went through `append_and_flush`, in LSN order.
pub trait WalListener: Send + Sync {
    fn on_new_record(&self, record: &LogRecord);
}

struct WalWriter {
    file: Option<BufWriter<File>>,
    next_lsn: Lsn,
    last_appended: Lsn,
}

/// Append-only log of operations.
pub struct WalManager {
    config: WalConfig,
    writer: Mutex<WalWriter>,
    flushed_lsn: AtomicU64,
    listeners: Mutex<Vec<Sender<LogRecord>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl WalManager {
    /// Opens or creates the log, dropping any torn tail left by a crash.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;
        let last_lsn = Self::recover_next_lsn(&mut file, &config.path)?;
        file.seek(SeekFrom::End(0))?;

        info!(
            "opened WAL {:?}, next {}",
            config.path,
            last_lsn.next()
        );

        Ok(WalManager {
            writer: Mutex::new(WalWriter {
                file: Some(BufWriter::new(file)),
                next_lsn: last_lsn.next(),
                last_appended: last_lsn,
            }),
            flushed_lsn: AtomicU64::new(last_lsn.0),
            listeners: Mutex::new(Vec::new()),
            dispatchers: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Scans the whole log and truncates it at the first invalid or incomplete record.
    /// Returns the highest valid LSN, or `Lsn::INVALID` for an empty log.
    fn recover_next_lsn(file: &mut File, path: &Path) -> StorageResult<Lsn> {
        let data = std::fs::read(path)?;
        let (records, valid_len) = scan(&data);
        let max_lsn = records
            .iter()
            .map(|record| record.lsn)
            .max()
            .unwrap_or(Lsn::INVALID);

        if valid_len < data.len() {
            warn!(
                "truncating WAL {:?} at byte {} ({} trailing bytes after {} valid records)",
                path,
                valid_len,
                data.len() - valid_len,
                records.len()
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        Ok(max_lsn)
    }

    /// Reads every valid record of the log at `path` without opening it for writing.
    pub fn read_log(path: &Path) -> StorageResult<Vec<LogRecord>> {
        let data = std::fs::read(path)?;
        Ok(scan(&data).0)
    }

    /// Assigns the next LSN to `record` and buffers it. Does not force durability.
    pub fn append(&self, record: LogRecord) -> StorageResult<Lsn> {
        let mut writer = self.writer.lock();
        let record = Self::append_locked(&mut writer, record)?;
        Ok(record.lsn)
    }

    /// Appends, flushes, then hands the finalized record to every listener.
    ///
    /// Delivery never waits: a listener whose queue is full is disconnected, so a stalled
    /// consumer cannot hold up the log.
    pub fn append_and_flush(&self, record: LogRecord) -> StorageResult<Lsn> {
        let mut writer = self.writer.lock();
        let record = Self::append_locked(&mut writer, record)?;
        self.flush_locked(&mut writer)?;

        // Still under the log mutex, so listeners observe LSN order.
        let mut listeners = self.listeners.lock();
        listeners.retain(|sender| match sender.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "disconnecting WAL listener: its queue of {} records is full at {}",
                    self.config.listener_capacity, record.lsn
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        Ok(record.lsn)
    }

    /// Number of connected listeners and subscribers.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Forces every appended record to stable storage.
    pub fn flush(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        self.flush_locked(&mut writer)
    }

    /// Flushes only if `lsn` is not durable yet.
    pub fn flush_to(&self, lsn: Lsn) -> StorageResult<()> {
        if self.flushed_lsn() >= lsn {
            return Ok(());
        }
        self.flush()
    }

    /// Every record with an LSN at or below this one is on disk.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::SeqCst))
    }

    pub fn next_lsn(&self) -> Lsn {
        self.writer.lock().next_lsn
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Reads back every valid record, including ones appended but not yet flushed.
    pub fn read_records(&self) -> StorageResult<Vec<LogRecord>> {
        let mut writer = self.writer.lock();
        if let Some(file) = writer.file.as_mut() {
            file.flush()?;
        }
        Self::read_log(&self.config.path)
    }

    /// Returns a bounded queue fed with every record passed to `append_and_flush`. The
    /// queue is closed once it overflows.
    pub fn subscribe(&self) -> Receiver<LogRecord> {
        let (sender, receiver) = crossbeam_channel::bounded(self.config.listener_capacity);
        self.listeners.lock().push(sender);
        receiver
    }

    /// Runs `listener` on a dedicated thread fed by its own queue.
    pub fn register_listener(&self, listener: Arc<dyn WalListener>) -> StorageResult<()> {
        let receiver = self.subscribe();
        let handle = thread::Builder::new()
            .name("wal-listener".to_string())
            .spawn(move || {
                for record in receiver.iter() {
                    listener.on_new_record(&record);
                }
            })?;
        self.dispatchers.lock().push(handle);
        Ok(())
    }

    /// Flushes, closes the file and waits for listener threads to drain their queues.
    pub fn close(&self) -> StorageResult<()> {
        {
            let mut writer = self.writer.lock();
            if writer.file.is_some() {
                self.flush_locked(&mut writer)?;
                writer.file = None;
            }
        }

        self.listeners.lock().clear();
        let handles: Vec<_> = self.dispatchers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("WAL listener thread panicked");
            }
        }
        info!("closed WAL {:?}", self.config.path);
        Ok(())
    }

    fn append_locked(writer: &mut WalWriter, mut record: LogRecord) -> StorageResult<LogRecord> {
        let lsn = writer.next_lsn;
        let file = writer.file.as_mut().ok_or(StorageError::WalClosed)?;

        record.lsn = lsn;
        file.write_all(&record.encode())?;
        writer.next_lsn = lsn.next();
        writer.last_appended = lsn;
        debug!("appended {}", record);
        Ok(record)
    }

    fn flush_locked(&self, writer: &mut WalWriter) -> StorageResult<()> {
        let last = writer.last_appended;
        if self.flushed_lsn() >= last {
            return Ok(());
        }

        let file = writer.file.as_mut().ok_or(StorageError::WalClosed)?;
        file.flush()?;
        if self.config.sync_on_flush {
            file.get_ref().sync_data()?;
        }
        self.flushed_lsn.store(last.0, Ordering::SeqCst);
        Ok(())
    }
}

impl LogFlusher for WalManager {
    fn flush_log_to(&self, lsn: Lsn) -> anyhow::Result<()> {
        Ok(self.flush_to(lsn)?)
    }

    fn flush_log(&self) -> anyhow::Result<()> {
        Ok(self.flush()?)
    }
}

/// Decodes records from the start of `data` up to the first invalid one.
fn scan(data: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        match LogRecord::decode(&data[offset..]) {
            Ok((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            Err(e) => {
                debug!("stopping WAL scan at byte {}: {}", offset, e);
                break;
            }
        }
    }
    (records, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::LogRecordType;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_wal() -> (WalManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = WalConfig::new(temp_dir.path().join("wal.log"));
        config.sync_on_flush = false;
        (WalManager::open(config).unwrap(), temp_dir)
    }

    fn reopen(dir: &TempDir) -> WalManager {
        WalManager::open(WalConfig::new(dir.path().join("wal.log"))).unwrap()
    }

    #[test]
    fn test_lsns_start_at_one_and_increase() {
        let (wal, _dir) = create_test_wal();
        assert_eq!(wal.next_lsn(), Lsn(1));

        let a = wal.append(LogRecord::put(1, &b"k"[..], &b"v"[..])).unwrap();
        let b = wal.append(LogRecord::done(1)).unwrap();
        assert_eq!((a, b), (Lsn(1), Lsn(2)));
        assert_eq!(wal.next_lsn(), Lsn(3));
    }

    #[test]
    fn test_flush_advances_flushed_lsn() {
        let (wal, _dir) = create_test_wal();
        wal.append(LogRecord::put(1, &b"k"[..], &b"v"[..])).unwrap();
        assert_eq!(wal.flushed_lsn(), Lsn::INVALID);

        wal.flush().unwrap();
        assert_eq!(wal.flushed_lsn(), Lsn(1));

        let lsn = wal.append_and_flush(LogRecord::done(1)).unwrap();
        assert_eq!(wal.flushed_lsn(), lsn);
    }

    #[test]
    fn test_records_survive_reopen() {
        let (wal, dir) = create_test_wal();
        wal.append(LogRecord::put(7, &b"key"[..], &b"value"[..]))
            .unwrap();
        wal.append_and_flush(LogRecord::done(7)).unwrap();
        wal.close().unwrap();

        let wal = reopen(&dir);
        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, LogRecordType::Put);
        assert_eq!(records[0].tx_id, 7);
        assert_eq!(records[1].record_type, LogRecordType::Done);
        assert_eq!(wal.next_lsn(), Lsn(3));
        assert_eq!(wal.flushed_lsn(), Lsn(2));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let (wal, dir) = create_test_wal();
        wal.append(LogRecord::put(1, &b"a"[..], &b"1"[..])).unwrap();
        wal.append_and_flush(LogRecord::done(1)).unwrap();
        wal.close().unwrap();

        let path = dir.path().join("wal.log");
        let valid_len = std::fs::metadata(&path).unwrap().len();
        let partial = LogRecord::put(2, &b"b"[..], &b"2"[..]).encode();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let wal = reopen(&dir);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
        assert_eq!(wal.read_records().unwrap().len(), 2);
        assert_eq!(wal.next_lsn(), Lsn(3));

        // Appends continue cleanly after the cut.
        wal.append_and_flush(LogRecord::done(2)).unwrap();
        assert_eq!(wal.read_records().unwrap().len(), 3);
    }

    #[test]
    fn test_corrupted_record_cuts_the_log() {
        let (wal, dir) = create_test_wal();
        let first = LogRecord::put(1, &b"a"[..], &b"1"[..]);
        let first_len = {
            let mut sized = first.clone();
            sized.lsn = Lsn(1);
            sized.encode().len()
        };
        wal.append(first).unwrap();
        wal.append(LogRecord::put(1, &b"b"[..], &b"2"[..])).unwrap();
        wal.append_and_flush(LogRecord::done(1)).unwrap();
        wal.close().unwrap();

        let path = dir.path().join("wal.log");
        let mut data = std::fs::read(&path).unwrap();
        data[first_len + 10] ^= 0x55;
        std::fs::write(&path, &data).unwrap();

        let wal = reopen(&dir);
        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lsn, Lsn(1));
        assert_eq!(wal.next_lsn(), Lsn(2));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), first_len as u64);
    }

    #[test]
    fn test_subscriber_sees_flushed_records_in_order() {
        let (wal, _dir) = create_test_wal();
        let receiver = wal.subscribe();

        wal.append(LogRecord::put(3, &b"k"[..], &b"v"[..])).unwrap();
        wal.append_and_flush(LogRecord::done(3)).unwrap();
        wal.append_and_flush(LogRecord::checkpoint()).unwrap();

        let first = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.lsn, Lsn(2));
        assert_eq!(first.record_type, LogRecordType::Done);
        assert_eq!(second.lsn, Lsn(3));
        assert!(receiver.try_recv().is_err());
    }

    struct Collector(parking_lot::Mutex<Vec<Lsn>>);

    impl WalListener for Collector {
        fn on_new_record(&self, record: &LogRecord) {
            self.0.lock().push(record.lsn);
        }
    }

    #[test]
    fn test_registered_listener_runs_until_close() {
        let (wal, _dir) = create_test_wal();
        let collector = Arc::new(Collector(parking_lot::Mutex::new(Vec::new())));
        wal.register_listener(collector.clone()).unwrap();

        for tx in 1..=5 {
            wal.append(LogRecord::put(tx, &b"k"[..], &b"v"[..])).unwrap();
            wal.append_and_flush(LogRecord::done(tx)).unwrap();
        }
        wal.close().unwrap();

        let seen = collector.0.lock().clone();
        assert_eq!(seen, vec![Lsn(2), Lsn(4), Lsn(6), Lsn(8), Lsn(10)]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let (wal, _dir) = create_test_wal();
        let receiver = wal.subscribe();
        drop(receiver);

        wal.append_and_flush(LogRecord::done(1)).unwrap();
        assert!(wal.listeners.lock().is_empty());
    }

    #[test]
    fn test_stalled_subscriber_does_not_block_appends() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = WalConfig::new(temp_dir.path().join("wal.log"));
        config.sync_on_flush = false;
        config.listener_capacity = 2;
        let wal = Arc::new(WalManager::open(config).unwrap());
        let stalled = wal.subscribe();

        for tx in 1..=3 {
            wal.append_and_flush(LogRecord::done(tx)).unwrap();
        }
        assert_eq!(wal.listener_count(), 0);

        let writer = {
            let wal = Arc::clone(&wal);
            thread::spawn(move || wal.append(LogRecord::done(4)).unwrap())
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || done_tx.send(writer.join().unwrap()).unwrap());
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), Lsn(4));

        // The queue keeps what fit, then reports the disconnect.
        let delivered: Vec<_> = stalled.try_iter().map(|r| r.lsn).collect();
        assert_eq!(delivered, vec![Lsn(1), Lsn(2)]);
        assert!(stalled.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_append_after_close_fails() {
        let (wal, _dir) = create_test_wal();
        wal.close().unwrap();
        assert!(matches!(
            wal.append(LogRecord::done(1)),
            Err(StorageError::WalClosed)
        ));
    }
}
