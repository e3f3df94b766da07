pub mod lru;
pub mod replacer;

pub use lru::LruReplacer;
pub use replacer::Replacer;

use crate::storage::disk::FileMetadata;
use crate::storage::error::StorageError;
use crate::storage::page::{PageId, METADATA_PAGE_ID};
use crate::storage::wal::Lsn;
use crate::storage::{PageManager, PAGE_SIZE};
use anyhow::{bail, Result};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

type PageData = Box<[u8; PAGE_SIZE]>;

/// Forces the write-ahead log to disk before the pool writes a page that depends on it.
pub trait LogFlusher: Send + Sync {
    /// Make every record up to and including `lsn` durable.
    fn flush_log_to(&self, lsn: Lsn) -> Result<()>;

    /// Make every appended record durable.
    fn flush_log(&self) -> Result<()>;
}

struct Frame {
    page_id: PageId,
    data: Arc<RwLock<PageData>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    /// Highest WAL LSN describing a change to this page; 0 if none was stamped.
    page_lsn: AtomicU64,
}

impl Frame {
    fn new(page_id: PageId, data: PageData, is_dirty: bool) -> Self {
        Self {
            page_id,
            data: Arc::new(RwLock::new(data)),
            pin_count: AtomicU32::new(1),
            is_dirty: AtomicBool::new(is_dirty),
            page_lsn: AtomicU64::new(0),
        }
    }
}

/// Fixed-capacity page cache with pin counting and LRU eviction.
///
/// Pages are handed out as guards: holding a guard keeps the page pinned, dropping it
/// unpins exactly once. A frame is only reused once its pin count is zero, and a dirty
/// frame is written back (after the log is forced up to its LSN) before it leaves the
/// cache.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, Arc<Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Mutex<PageManager>,
    log_flusher: RwLock<Option<Arc<dyn LogFlusher>>>,
    /// Serializes cache misses, page creation and eviction.
    load_lock: Mutex<()>,
    capacity: usize,
}

impl BufferPoolManager {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::with_capacity(capacity),
                replacer: Mutex::new(replacer),
                page_manager: Mutex::new(page_manager),
                log_flusher: RwLock::new(None),
                load_lock: Mutex::new(()),
                capacity,
            }),
        }
    }

    /// Installs the log that must be forced before dirty pages are written.
    pub fn set_log_flusher(&self, flusher: Arc<dyn LogFlusher>) {
        *self.inner.log_flusher.write() = Some(flusher);
    }

    pub fn fetch_page(&self, page_id: PageId) -> Result<PageReadGuard> {
        let frame = self.pin(page_id)?;
        let data = frame.data.read_arc();
        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame,
            data,
        })
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard> {
        let frame = self.pin(page_id)?;
        let data = frame.data.write_arc();
        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame,
            data,
        })
    }

    /// Allocates a page on disk and returns it zeroed, pinned and dirty.
    pub fn new_page(&self) -> Result<(PageId, PageWriteGuard)> {
        let _load = self.inner.load_lock.lock();
        self.make_room()?;

        let page_id = self.inner.page_manager.lock().allocate_page()?;
        let frame = Arc::new(Frame::new(page_id, Box::new([0u8; PAGE_SIZE]), true));
        self.inner.page_table.insert(page_id, frame.clone());
        self.track_pinned(page_id);
        debug!("new page {}", page_id);

        let data = frame.data.write_arc();
        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame,
                data,
            },
        ))
    }

    /// Drops a page from the cache without writing it and returns its id to the free list.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let _load = self.inner.load_lock.lock();
        if self.inner.page_table.contains_key(&page_id) {
            let removed = self
                .inner
                .page_table
                .remove_if(&page_id, |_, frame| {
                    frame.pin_count.load(Ordering::SeqCst) == 0
                })
                .is_some();
            if !removed {
                bail!(StorageError::PagePinned(page_id));
            }
            self.inner.replacer.lock().remove(page_id);
        }
        self.inner.page_manager.lock().free_page(page_id)?;
        debug!("deleted page {}", page_id);
        Ok(())
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let frame = self.inner.page_table.get(&page_id).map(|e| e.value().clone());
        if let Some(frame) = frame {
            self.inner.flush_frame(&frame)?;
        }
        Ok(())
    }

    /// Writes every dirty frame, then syncs the data file and its metadata page.
    pub fn flush_all(&self) -> Result<()> {
        let frames: Vec<Arc<Frame>> = self
            .inner
            .page_table
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for frame in &frames {
            self.inner.flush_frame(frame)?;
        }
        self.inner.page_manager.lock().sync_metadata()?;
        debug!("flushed {} cached pages", frames.len());
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush_all()
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.inner
            .page_table
            .get(&page_id)
            .map(|e| e.pin_count.load(Ordering::SeqCst))
    }

    pub fn is_cached(&self, page_id: PageId) -> bool {
        self.inner.page_table.contains_key(&page_id)
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.page_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.page_table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of pages in the database file, including the metadata page.
    pub fn num_pages(&self) -> u32 {
        self.inner.page_manager.lock().num_pages()
    }

    /// Whether `page_id` sits on the free list, waiting to be reused.
    pub fn is_page_free(&self, page_id: PageId) -> bool {
        self.inner.page_manager.lock().is_free(page_id)
    }

    /// Reads the metadata page as it currently is on disk.
    pub fn file_metadata(&self) -> Result<FileMetadata> {
        self.inner.page_manager.lock().read_metadata()
    }

    fn pin(&self, page_id: PageId) -> Result<Arc<Frame>> {
        if page_id == METADATA_PAGE_ID {
            bail!("Page 0 holds file metadata and cannot be cached");
        }
        if let Some(frame) = self.pin_cached(page_id) {
            return Ok(frame);
        }

        let _load = self.inner.load_lock.lock();
        // Another thread may have loaded it while we waited.
        if let Some(frame) = self.pin_cached(page_id) {
            return Ok(frame);
        }

        self.make_room()?;
        let mut data: PageData = Box::new([0u8; PAGE_SIZE]);
        self.inner
            .page_manager
            .lock()
            .read_page(page_id, data.as_mut_slice())?;
        let frame = Arc::new(Frame::new(page_id, data, false));
        self.inner.page_table.insert(page_id, frame.clone());
        self.track_pinned(page_id);
        debug!("loaded page {} from disk", page_id);
        Ok(frame)
    }

    fn pin_cached(&self, page_id: PageId) -> Option<Arc<Frame>> {
        // Pin while the shard is locked so eviction's remove_if cannot interleave.
        let frame = {
            let entry = self.inner.page_table.get(&page_id)?;
            entry.pin_count.fetch_add(1, Ordering::SeqCst);
            entry.value().clone()
        };
        self.track_pinned(page_id);
        Some(frame)
    }

    fn track_pinned(&self, page_id: PageId) {
        let mut replacer = self.inner.replacer.lock();
        replacer.record_access(page_id);
        replacer.set_evictable(page_id, false);
    }

    /// Evicts until a frame is free. Caller holds `load_lock`.
    fn make_room(&self) -> Result<()> {
        while self.inner.page_table.len() >= self.inner.capacity {
            let victim = self.inner.replacer.lock().evict();
            let Some(victim) = victim else {
                bail!(StorageError::BufferPoolFull {
                    capacity: self.inner.capacity
                });
            };

            let frame = self.inner.page_table.get(&victim).map(|e| e.value().clone());
            let Some(frame) = frame else {
                continue;
            };
            if frame.pin_count.load(Ordering::SeqCst) > 0 {
                continue;
            }

            if let Err(e) = self.inner.flush_frame(&frame) {
                warn!("failed to write back page {} before eviction: {}", victim, e);
                self.inner.replacer.lock().set_evictable(victim, true);
                return Err(e);
            }

            let evicted = self
                .inner
                .page_table
                .remove_if(&victim, |_, f| {
                    f.pin_count.load(Ordering::SeqCst) == 0 && !f.is_dirty.load(Ordering::SeqCst)
                })
                .is_some();
            if evicted {
                debug!("evicted page {}", victim);
            }
        }
        Ok(())
    }
}

impl BufferPoolInner {
    /// Writes the frame if dirty, forcing the log up to its LSN first.
    fn flush_frame(&self, frame: &Frame) -> Result<()> {
        if !frame.is_dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = (|| {
            let data = frame.data.read();
            let lsn = Lsn(frame.page_lsn.load(Ordering::SeqCst));
            if let Some(flusher) = self.log_flusher.read().as_ref() {
                if lsn.is_valid() {
                    flusher.flush_log_to(lsn)?;
                } else {
                    flusher.flush_log()?;
                }
            }
            self.page_manager
                .lock()
                .write_page(frame.page_id, data.as_slice())
        })();

        if result.is_err() {
            frame.is_dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    fn unpin(&self, frame: &Frame) {
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut replacer = self.replacer.lock();
            // Re-check under the replacer lock: a concurrent fetch may have re-pinned it.
            if frame.pin_count.load(Ordering::SeqCst) == 0 {
                replacer.set_evictable(frame.page_id, true);
            }
        }
    }
}

pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame: Arc<Frame>,
    data: ArcRwLockReadGuard<RawRwLock, PageData>,
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.frame.page_id
    }
}

impl std::fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("page_id", &self.frame.page_id)
            .finish_non_exhaustive()
    }
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.inner.unpin(&self.frame);
    }
}

pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame: Arc<Frame>,
    data: ArcRwLockWriteGuard<RawRwLock, PageData>,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.frame.page_id
    }

    /// Records that the change made through this guard is described by WAL record `lsn`.
    pub fn stamp_lsn(&mut self, lsn: Lsn) {
        self.frame.page_lsn.fetch_max(lsn.0, Ordering::SeqCst);
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.frame.is_dirty.store(true, Ordering::SeqCst);
        self.inner.unpin(&self.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::PageManager;
    use crate::storage::page::SlottedPage;
    use std::path::Path;
    use tempfile::tempdir;

    fn create_test_buffer_pool(path: &Path, capacity: usize) -> Result<BufferPoolManager> {
        let page_manager = PageManager::open(&path.join("test.db"))?;
        let replacer = Box::new(lru::LruReplacer::new(capacity));
        Ok(BufferPoolManager::new(page_manager, replacer, capacity))
    }

    #[test]
    fn test_new_page() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 10)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        assert_eq!(page_id, PageId(1));
        assert!(guard.iter().all(|&b| b == 0));

        guard[0] = 42;
        guard[1] = 43;
        drop(guard);

        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 42);
        assert_eq!(guard[1], 43);

        Ok(())
    }

    #[test]
    fn test_fetch_write() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 10)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        guard[0] = 10;
        drop(guard);

        let mut guard = buffer_pool.fetch_page_write(page_id)?;
        guard[0] = 20;
        drop(guard);

        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 20);

        Ok(())
    }

    #[test]
    fn test_metadata_page_is_not_cached() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 2)?;
        assert!(buffer_pool.fetch_page(PageId(0)).is_err());
        assert!(buffer_pool.fetch_page(PageId(7)).is_err());
        Ok(())
    }

    #[test]
    fn test_pin_counts_follow_guards() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 4)?;

        let (page_id, guard) = buffer_pool.new_page()?;
        assert_eq!(buffer_pool.pin_count(page_id), Some(1));
        drop(guard);
        assert_eq!(buffer_pool.pin_count(page_id), Some(0));

        let a = buffer_pool.fetch_page(page_id)?;
        let b = buffer_pool.fetch_page(page_id)?;
        assert_eq!(buffer_pool.pin_count(page_id), Some(2));
        drop(a);
        drop(b);
        assert_eq!(buffer_pool.pin_count(page_id), Some(0));

        Ok(())
    }

    #[test]
    fn test_eviction_writes_dirty_pages() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 2)?;

        let mut ids = Vec::new();
        for i in 1..=3u8 {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            guard[0] = i;
            ids.push(page_id);
        }
        assert_eq!(buffer_pool.len(), 2);
        assert!(!buffer_pool.is_cached(ids[0]));

        // The first page was dirty when evicted, so it must come back from disk intact.
        let guard = buffer_pool.fetch_page(ids[0])?;
        assert_eq!(guard[0], 1);
        drop(guard);

        let guard = buffer_pool.fetch_page(ids[1])?;
        assert_eq!(guard[0], 2);

        Ok(())
    }

    #[test]
    fn test_pinned_pages_are_never_evicted() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 2)?;

        let (page1, mut guard1) = buffer_pool.new_page()?;
        guard1[0] = 1;
        drop(guard1);

        let (page2, guard2) = buffer_pool.new_page()?;

        // Page 1 is the only candidate while page 2 stays pinned.
        let (_page3, guard3) = buffer_pool.new_page()?;
        assert!(buffer_pool.is_cached(page2));
        assert!(!buffer_pool.is_cached(page1));

        // Both remaining frames are pinned now.
        let err = buffer_pool.fetch_page(page1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::BufferPoolFull { capacity: 2 })
        ));

        drop(guard2);
        drop(guard3);
        let guard1 = buffer_pool.fetch_page(page1)?;
        assert_eq!(guard1[0], 1);

        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 4)?;

        let (page_id, guard) = buffer_pool.new_page()?;
        let err = buffer_pool.delete_page(page_id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::PagePinned(_))
        ));
        drop(guard);

        buffer_pool.delete_page(page_id)?;
        assert!(!buffer_pool.is_cached(page_id));

        // The freed id is handed out again.
        let (reused, _guard) = buffer_pool.new_page()?;
        assert_eq!(reused, page_id);

        Ok(())
    }

    #[test]
    fn test_flush_all_persists_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let page_id = {
            let buffer_pool = create_test_buffer_pool(dir.path(), 4)?;
            let (page_id, mut guard) = buffer_pool.new_page()?;
            guard[100] = 99;
            drop(guard);
            buffer_pool.flush_all()?;
            page_id
        };

        let buffer_pool = create_test_buffer_pool(dir.path(), 4)?;
        assert_eq!(buffer_pool.num_pages(), 2);
        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard[100], 99);

        Ok(())
    }

    #[derive(Default)]
    struct RecordingFlusher {
        calls: parking_lot::Mutex<Vec<Option<Lsn>>>,
    }

    impl LogFlusher for RecordingFlusher {
        fn flush_log_to(&self, lsn: Lsn) -> Result<()> {
            self.calls.lock().push(Some(lsn));
            Ok(())
        }

        fn flush_log(&self) -> Result<()> {
            self.calls.lock().push(None);
            Ok(())
        }
    }

    #[test]
    fn test_log_forced_before_dirty_write() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 4)?;
        let flusher = Arc::new(RecordingFlusher::default());
        buffer_pool.set_log_flusher(flusher.clone());

        let (stamped, mut guard) = buffer_pool.new_page()?;
        guard.stamp_lsn(Lsn(7));
        guard.stamp_lsn(Lsn(5));
        drop(guard);
        let (_unstamped, guard) = buffer_pool.new_page()?;
        drop(guard);

        buffer_pool.flush_page(stamped)?;
        assert_eq!(flusher.calls.lock().clone(), vec![Some(Lsn(7))]);

        // Clean pages are not written again.
        buffer_pool.flush_page(stamped)?;
        buffer_pool.flush_all()?;
        assert_eq!(flusher.calls.lock().clone(), vec![Some(Lsn(7)), None]);

        Ok(())
    }

    #[test]
    fn test_slotted_page_integration() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 10)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        let slot = {
            let mut page = SlottedPage::init(&mut guard[..], page_id, 16);
            page.insert_record(b"hello").unwrap()
        };
        drop(guard);

        let guard = buffer_pool.fetch_page(page_id)?;
        let page = SlottedPage::open(&guard[..], 16);
        assert_eq!(page.page_id(), page_id);
        assert_eq!(page.get_record(slot), Some(&b"hello"[..]));

        Ok(())
    }

    #[test]
    fn test_concurrent_readers_and_writers() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool = create_test_buffer_pool(dir.path(), 5)?;
        let mut ids = Vec::new();
        for _ in 0..8 {
            let (page_id, _guard) = buffer_pool.new_page()?;
            ids.push(page_id);
        }

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let pool = buffer_pool.clone();
                let ids = ids.clone();
                s.spawn(move || {
                    for round in 0..50 {
                        let page_id = ids[(round + t as usize) % ids.len()];
                        if t % 2 == 0 {
                            let mut guard = pool.fetch_page_write(page_id).unwrap();
                            guard[t as usize] = guard[t as usize].wrapping_add(1);
                        } else {
                            let _guard = pool.fetch_page(page_id).unwrap();
                        }
                    }
                });
            }
        });

        let total: u32 = ids
            .iter()
            .map(|&id| {
                let guard = buffer_pool.fetch_page(id).unwrap();
                guard[0] as u32 + guard[2] as u32
            })
            .sum();
        assert_eq!(total, 100);
        for id in ids {
            assert_eq!(buffer_pool.pin_count(id).unwrap_or(0), 0);
        }

        Ok(())
    }
}
