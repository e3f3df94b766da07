//! Row storage: slotted record pages chained from page 2, indexed by primary key.
//!
//! Every mutation is logged before it touches a page. Record pages are stamped with the
//! LSN of the record describing the change, so the buffer pool forces the log first.

use crate::access::btree::{BPlusTree, NodeCodec};
use crate::access::record_id::RecordId;
use crate::access::value::{Row, Schema, Value};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::error::StorageError;
use crate::storage::page::{
    PageId, SlotId, SlottedPage, FIRST_RECORD_PAGE_ID, PAGE_HEADER_SIZE, SLOT_SIZE,
};
use crate::storage::wal::{LogRecord, Lsn, WalManager};
use crate::storage::PAGE_SIZE;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

/// Largest encoded row a single record page can hold.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE;

/// Outcome of [`RecordStorage::rebuild_index`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildStats {
    pub record_pages: usize,
    pub rows_indexed: usize,
    pub rows_dropped: usize,
    pub pages_freed: usize,
}

pub struct RecordStorage {
    buffer_pool: BufferPoolManager,
    index: BPlusTree<Value, RecordId>,
    wal: Arc<WalManager>,
    schema: Schema,
    max_slots: usize,
    /// Held while probing and extending the page chain.
    placement: Mutex<()>,
    /// Mutations share it; a checkpoint takes it exclusively so no operation straddles
    /// the flush.
    checkpoint_gate: RwLock<()>,
}

impl RecordStorage {
    /// Lays out a fresh database: index root at page 1, first record page at page 2.
    pub fn create(
        buffer_pool: BufferPoolManager,
        wal: Arc<WalManager>,
        schema: Schema,
        btree_order: usize,
        max_slots: usize,
    ) -> Result<Self> {
        let index = BPlusTree::create(buffer_pool.clone(), btree_order)?;
        let (page_id, mut guard) = buffer_pool.new_page()?;
        if page_id != FIRST_RECORD_PAGE_ID {
            bail!(
                "First record page must be page {}, but page {} was allocated",
                FIRST_RECORD_PAGE_ID,
                page_id
            );
        }
        SlottedPage::init(&mut guard[..], page_id, max_slots);
        drop(guard);
        buffer_pool.flush_all()?;

        debug!("created record storage for table {}", schema.table_name());
        Ok(Self::assemble(buffer_pool, index, wal, schema, max_slots))
    }

    pub fn open(
        buffer_pool: BufferPoolManager,
        wal: Arc<WalManager>,
        schema: Schema,
        btree_order: usize,
        max_slots: usize,
    ) -> Result<Self> {
        let index = BPlusTree::open(buffer_pool.clone(), btree_order)?;
        buffer_pool
            .fetch_page(FIRST_RECORD_PAGE_ID)
            .context("Missing first record page")?;
        Ok(Self::assemble(buffer_pool, index, wal, schema, max_slots))
    }

    fn assemble(
        buffer_pool: BufferPoolManager,
        index: BPlusTree<Value, RecordId>,
        wal: Arc<WalManager>,
        schema: Schema,
        max_slots: usize,
    ) -> Self {
        Self {
            buffer_pool,
            index,
            wal,
            schema,
            max_slots,
            placement: Mutex::new(()),
            checkpoint_gate: RwLock::new(()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn index(&self) -> &BPlusTree<Value, RecordId> {
        &self.index
    }

    /// Number of indexed rows.
    pub fn len(&self) -> Result<usize> {
        self.index.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.index.is_empty()
    }

    /// Logs and stores `row`, replacing any row with the same primary key.
    pub fn insert_record(&self, row: &[Value], tx_id: u64) -> Result<RecordId> {
        let _gate = self.checkpoint_gate.read();
        let bytes = self.schema.encode_row(row)?;
        if bytes.len() > MAX_RECORD_SIZE {
            bail!(StorageError::RecordTooLarge {
                size: bytes.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        let key = row[0].clone();
        // Checked before logging so an oversized key leaves no trace.
        self.index
            .check_entry(&key, &RecordId::new(FIRST_RECORD_PAGE_ID, 0))?;

        let lsn = self
            .wal
            .append(LogRecord::put(tx_id, key.encode(), bytes.clone()))?;
        let rid = self.place(&bytes, lsn)?;
        let previous = match self.index.insert(key.clone(), rid) {
            Ok(previous) => previous,
            Err(e) => {
                self.remove_slot_of(rid, &key, lsn)?;
                return Err(e);
            }
        };
        if let Some(old) = previous {
            self.remove_slot_of(old, &key, lsn)?;
        }
        self.wal.append_and_flush(LogRecord::done(tx_id))?;

        debug!("tx {} stored key {} at {}", tx_id, key, rid);
        Ok(rid)
    }

    /// Logs and removes the row with primary key `key`. Returns false if there was none.
    pub fn delete_record(&self, key: &Value, tx_id: u64) -> Result<bool> {
        let _gate = self.checkpoint_gate.read();
        let Some(rid) = self.index.search(key)? else {
            return Ok(false);
        };
        let Some(row_bytes) = self.read_row_bytes(rid, key)? else {
            warn!("index entry for key {} points at missing row {}, dropping it", key, rid);
            self.index.delete(key)?;
            return Ok(false);
        };

        let lsn = self.wal.append(LogRecord::delete(
            tx_id,
            rid.to_bytes().to_vec(),
            row_bytes,
        ))?;
        self.index.delete(key)?;
        self.remove_slot_of(rid, key, lsn)?;
        self.wal.append_and_flush(LogRecord::done(tx_id))?;

        debug!("tx {} deleted key {} from {}", tx_id, key, rid);
        Ok(true)
    }

    /// Looks up a row by primary key. An index entry without a matching row counts as
    /// not found.
    pub fn fetch_record(&self, key: &Value) -> Result<Option<Row>> {
        let Some(rid) = self.index.search(key)? else {
            return Ok(None);
        };
        match self.read_row_bytes(rid, key)? {
            Some(bytes) => Ok(Some(self.schema.decode_row(&bytes)?)),
            None => {
                debug!("key {} is indexed at {} but the row is gone", key, rid);
                Ok(None)
            }
        }
    }

    /// Rows whose primary keys fall within `bounds`, in key order.
    pub fn fetch_range<R: RangeBounds<Value>>(&self, bounds: R) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for (key, rid) in self.index.range(bounds)? {
            if let Some(bytes) = self.read_row_bytes(rid, &key)? {
                rows.push(self.schema.decode_row(&bytes)?);
            }
        }
        Ok(rows)
    }

    /// Rows with `low <= key <= high`.
    pub fn range_fetch(&self, low: &Value, high: &Value) -> Result<Vec<Row>> {
        self.fetch_range((Bound::Included(low.clone()), Bound::Included(high.clone())))
    }

    /// Flushes every page, then logs a checkpoint. Operations committed before the
    /// checkpoint record need no redo.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let _gate = self.checkpoint_gate.write();
        self.buffer_pool.flush_all()?;
        let lsn = self.wal.append_and_flush(LogRecord::checkpoint())?;
        debug!("checkpoint at {}", lsn);
        Ok(lsn)
    }

    /// Reapplies a committed PUT without logging. Returns false when the index already
    /// points at an identical row.
    pub fn redo_put(&self, row_bytes: &[u8]) -> Result<bool> {
        let key = self.schema.key_of_encoded(row_bytes)?;
        if let Some(rid) = self.index.search(&key)? {
            if self.read_row_bytes(rid, &key)?.as_deref() == Some(row_bytes) {
                return Ok(false);
            }
        }

        let rid = self.place(row_bytes, Lsn::INVALID)?;
        if let Some(old) = self.index.insert(key.clone(), rid)? {
            self.remove_slot_of(old, &key, Lsn::INVALID)?;
        }
        Ok(true)
    }

    /// Reapplies a committed DELETE without logging. The key comes from the logged row
    /// image, or from the slot at `rid_bytes` when the image is empty. Returns false if
    /// the key is already gone.
    pub fn redo_delete(&self, rid_bytes: &[u8], row_bytes: &[u8]) -> Result<bool> {
        let key = if row_bytes.is_empty() {
            let rid = RecordId::from_bytes(rid_bytes)?;
            let bytes = self.read_slot(rid)?;
            match bytes {
                Some(bytes) => self.schema.key_of_encoded(&bytes)?,
                None => return Ok(false),
            }
        } else {
            self.schema.key_of_encoded(row_bytes)?
        };

        let Some(rid) = self.index.delete(&key)? else {
            return Ok(false);
        };
        self.remove_slot_of(rid, &key, Lsn::INVALID)?;
        Ok(true)
    }

    /// Throws the index away and rebuilds it from the record-page chain.
    ///
    /// Index pages can reach disk in any order, so after a crash the tree may hold half of
    /// a split or merge. Record pages never depend on each other, which makes the chain
    /// the trustworthy copy. `keep` sees every row found there and decides whether it
    /// survives; rejected rows are deleted from their pages. When two surviving rows share
    /// a key, the one found first along the chain wins.
    ///
    /// Every page that is neither on the chain nor already free is released.
    pub fn rebuild_index<F>(&self, mut keep: F) -> Result<RebuildStats>
    where
        F: FnMut(&Value, &[u8]) -> bool,
    {
        let _gate = self.checkpoint_gate.write();
        let _placement = self.placement.lock();
        let mut stats = RebuildStats::default();

        let chain = self.walk_chain()?;
        let mut live: BTreeMap<Value, RecordId> = BTreeMap::new();
        for &page_id in &chain {
            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            let mut page = SlottedPage::open(&mut guard[..], self.max_slots);
            let rows: Vec<(SlotId, Vec<u8>)> = page
                .valid_records()
                .map(|(slot, bytes)| (slot, bytes.to_vec()))
                .collect();

            for (slot, bytes) in rows {
                let survives = match self.schema.key_of_encoded(&bytes) {
                    Ok(key) if live.contains_key(&key) => {
                        warn!("dropping duplicate row for key {} at page {}", key, page_id);
                        false
                    }
                    Ok(key) => {
                        let kept = keep(&key, &bytes);
                        if kept {
                            live.insert(key, RecordId::new(page_id, slot));
                        }
                        kept
                    }
                    Err(e) => {
                        warn!("dropping undecodable row at page {} slot {}: {}", page_id, slot, e);
                        false
                    }
                };
                if !survives {
                    page.delete_record(slot);
                    stats.rows_dropped += 1;
                }
            }
        }
        stats.record_pages = chain.len();

        self.index.clear()?;
        let on_chain: HashSet<PageId> = chain.into_iter().collect();
        for raw in FIRST_RECORD_PAGE_ID.0..self.buffer_pool.num_pages() {
            let page_id = PageId(raw);
            if on_chain.contains(&page_id) || self.buffer_pool.is_page_free(page_id) {
                continue;
            }
            self.buffer_pool.delete_page(page_id)?;
            stats.pages_freed += 1;
        }

        for (key, rid) in live {
            self.index.insert(key, rid)?;
            stats.rows_indexed += 1;
        }
        info!(
            "rebuilt index: {} rows over {} record pages, {} rows dropped, {} pages freed",
            stats.rows_indexed, stats.record_pages, stats.rows_dropped, stats.pages_freed
        );
        Ok(stats)
    }

    /// Follows the record chain from page 2, formatting pages that never reached disk and
    /// cutting links that point outside the file, at reserved pages, or back into the chain.
    fn walk_chain(&self) -> Result<Vec<PageId>> {
        let num_pages = self.buffer_pool.num_pages();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut page_id = FIRST_RECORD_PAGE_ID;
        loop {
            chain.push(page_id);
            seen.insert(page_id);

            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            if SlottedPage::open(&guard[..], self.max_slots).page_id() != page_id {
                warn!("record page {} was never written, formatting it", page_id);
                SlottedPage::init(&mut guard[..], page_id, self.max_slots);
            }
            let mut page = SlottedPage::open(&mut guard[..], self.max_slots);
            match page.next_page_id() {
                Some(next)
                    if next.0 < num_pages && next >= FIRST_RECORD_PAGE_ID && !seen.contains(&next) =>
                {
                    page_id = next;
                }
                Some(next) => {
                    warn!("record page {} links to invalid page {}, cutting the chain", page_id, next);
                    page.set_next_page_id(None);
                    return Ok(chain);
                }
                None => return Ok(chain),
            }
        }
    }

    /// Finds room for `bytes` along the page chain, extending it when every page is full.
    fn place(&self, bytes: &[u8], lsn: Lsn) -> Result<RecordId> {
        let _placement = self.placement.lock();
        let mut page_id = FIRST_RECORD_PAGE_ID;
        loop {
            let (fits, next, formatted) = {
                let guard = self.buffer_pool.fetch_page(page_id)?;
                let page = SlottedPage::open(&guard[..], self.max_slots);
                (
                    page.can_fit(bytes.len()),
                    page.next_page_id(),
                    page.page_id() == page_id,
                )
            };

            // A chain link can reach disk before the page it points to.
            if !formatted {
                warn!("record page {} was never written, formatting it", page_id);
                let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
                SlottedPage::init(&mut guard[..], page_id, self.max_slots);
                guard.stamp_lsn(lsn);
                continue;
            }

            if fits {
                let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
                let slot = SlottedPage::open(&mut guard[..], self.max_slots).insert_record(bytes);
                let Some(slot) = slot else {
                    bail!("Page {} refused a record it had room for", page_id);
                };
                guard.stamp_lsn(lsn);
                return Ok(RecordId::new(page_id, slot));
            }

            match next {
                Some(next) => page_id = next,
                None => return self.extend_chain(page_id, bytes, lsn),
            }
        }
    }

    fn extend_chain(&self, tail_id: PageId, bytes: &[u8], lsn: Lsn) -> Result<RecordId> {
        let (page_id, mut guard) = self.buffer_pool.new_page()?;
        let slot = SlottedPage::init(&mut guard[..], page_id, self.max_slots).insert_record(bytes);
        let Some(slot) = slot else {
            bail!(StorageError::RecordTooLarge {
                size: bytes.len(),
                max: MAX_RECORD_SIZE,
            });
        };
        guard.stamp_lsn(lsn);
        drop(guard);

        let mut tail = self.buffer_pool.fetch_page_write(tail_id)?;
        SlottedPage::open(&mut tail[..], self.max_slots).set_next_page_id(Some(page_id));
        tail.stamp_lsn(lsn);
        debug!("record chain extended: {} -> {}", tail_id, page_id);
        Ok(RecordId::new(page_id, slot))
    }

    /// The record at `rid`, or `None` if the slot is free or the page is not a record page.
    fn read_slot(&self, rid: RecordId) -> Result<Option<Vec<u8>>> {
        if rid.page_id.0 >= self.buffer_pool.num_pages() {
            return Ok(None);
        }
        let guard = self.buffer_pool.fetch_page(rid.page_id)?;
        let page = SlottedPage::open(&guard[..], self.max_slots);
        if page.page_id() != rid.page_id {
            return Ok(None);
        }
        Ok(page.get_record(rid.slot_id).map(<[u8]>::to_vec))
    }

    /// The row at `rid`, provided it still belongs to `key`.
    fn read_row_bytes(&self, rid: RecordId, key: &Value) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = self.read_slot(rid)? else {
            return Ok(None);
        };
        match self.schema.key_of_encoded(&bytes) {
            Ok(found) if &found == key => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    /// Deletes the slot at `rid` if it still holds the row for `key`.
    fn remove_slot_of(&self, rid: RecordId, key: &Value, lsn: Lsn) -> Result<bool> {
        if self.read_row_bytes(rid, key)?.is_none() {
            return Ok(false);
        }
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let deleted = SlottedPage::open(&mut guard[..], self.max_slots).delete_record(rid.slot_id);
        guard.stamp_lsn(lsn);
        Ok(deleted)
    }
}
