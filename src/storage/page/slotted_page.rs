//! Slotted record page.
//!
//! ```text
//! [0:4)   page id
//! [4:8)   number of directory slots
//! [8:12)  free space pointer (end of the record region)
//! [12:16) next record page id, -1 if none
//! [16 .. freeSpacePtr)            record bytes, growing up
//! [P - numSlots*12 .. P)          slot directory, slot i at [P-(i+1)*12, P-i*12)
//! ```
//!
//! A slot entry is `{offset:int32, length:int32, valid:byte}` padded to 12 bytes. All
//! integers are big-endian. Slot ids are stable for the lifetime of a record on its page,
//! compaction included.

use crate::storage::page::PageId;
use byteorder::{BigEndian, ByteOrder};

pub const PAGE_HEADER_SIZE: usize = 16;
pub const SLOT_SIZE: usize = 12;
pub const DEFAULT_MAX_SLOTS: usize = 128;

const PAGE_ID_OFFSET: usize = 0;
const NUM_SLOTS_OFFSET: usize = 4;
const FREE_SPACE_PTR_OFFSET: usize = 8;
const NEXT_PAGE_OFFSET: usize = 12;

pub type SlotId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: usize,
    length: usize,
    valid: bool,
}

/// View over a page buffer laid out as a slotted page.
///
/// Works over anything byte-like: a buffer pool guard, a plain `Vec<u8>` in tests.
pub struct SlottedPage<B> {
    data: B,
    max_slots: usize,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Wraps an already formatted page.
    pub fn open(data: B, max_slots: usize) -> Self {
        Self { data, max_slots }
    }

    pub fn page_id(&self) -> PageId {
        PageId(self.read_i32(PAGE_ID_OFFSET) as u32)
    }

    /// Directory length, capped at what the page could physically hold.
    pub fn num_slots(&self) -> usize {
        let capacity = (self.bytes().len() - PAGE_HEADER_SIZE) / SLOT_SIZE;
        (self.read_i32(NUM_SLOTS_OFFSET).max(0) as usize).min(capacity)
    }

    pub fn next_page_id(&self) -> Option<PageId> {
        PageId::from_raw(self.read_i32(NEXT_PAGE_OFFSET))
    }

    /// Bytes between the end of the record region and the slot directory.
    pub fn free_space(&self) -> usize {
        self.directory_start().saturating_sub(self.free_space_ptr())
    }

    /// Whether `insert_record` would accept a record of `len` bytes, counting the space a
    /// compaction would recover.
    pub fn can_fit(&self, len: usize) -> bool {
        let num_slots = self.num_slots();
        let mut live_bytes = 0;
        let mut has_free_slot = false;
        for i in 0..num_slots {
            match self.live_slot(i) {
                Some(slot) => live_bytes += slot.length,
                None => has_free_slot = true,
            }
        }
        let slots_needed = match has_free_slot {
            true => num_slots,
            false if num_slots < self.max_slots => num_slots + 1,
            false => return false,
        };
        PAGE_HEADER_SIZE + live_bytes + len + slots_needed * SLOT_SIZE <= self.bytes().len()
    }

    pub fn get_record(&self, slot_id: SlotId) -> Option<&[u8]> {
        let slot = self.valid_slot(slot_id)?;
        Some(&self.bytes()[slot.offset..slot.offset + slot.length])
    }

    /// Iterates `(slot id, record)` over every valid slot in slot order.
    pub fn valid_records(&self) -> impl Iterator<Item = (SlotId, &[u8])> + '_ {
        (0..self.num_slots()).filter_map(move |i| {
            let slot_id = i as SlotId;
            self.get_record(slot_id).map(|record| (slot_id, record))
        })
    }

    pub fn into_inner(self) -> B {
        self.data
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn read_i32(&self, offset: usize) -> i32 {
        BigEndian::read_i32(&self.bytes()[offset..offset + 4])
    }

    fn free_space_ptr(&self) -> usize {
        let ptr = self.read_i32(FREE_SPACE_PTR_OFFSET).max(PAGE_HEADER_SIZE as i32) as usize;
        ptr.min(self.directory_start())
    }

    fn directory_start(&self) -> usize {
        self.bytes().len() - self.num_slots() * SLOT_SIZE
    }

    fn slot_position(&self, slot_index: usize) -> usize {
        self.bytes().len() - (slot_index + 1) * SLOT_SIZE
    }

    fn slot(&self, slot_index: usize) -> Slot {
        let pos = self.slot_position(slot_index);
        let bytes = self.bytes();
        Slot {
            offset: BigEndian::read_i32(&bytes[pos..pos + 4]).max(0) as usize,
            length: BigEndian::read_i32(&bytes[pos + 4..pos + 8]).max(0) as usize,
            valid: bytes[pos + 8] != 0,
        }
    }

    fn valid_slot(&self, slot_id: SlotId) -> Option<Slot> {
        let index = slot_id as usize;
        if index >= self.num_slots() {
            return None;
        }
        self.live_slot(index)
    }

    /// The slot at `slot_index` if it is valid and its record lies inside the record
    /// region. Anything else reads as a free slot.
    fn live_slot(&self, slot_index: usize) -> Option<Slot> {
        let slot = self.slot(slot_index);
        let in_bounds = slot.offset >= PAGE_HEADER_SIZE
            && slot
                .offset
                .checked_add(slot.length)
                .is_some_and(|end| end <= self.directory_start());
        (slot.valid && in_bounds).then_some(slot)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    /// Formats `data` as an empty record page.
    pub fn init(data: B, page_id: PageId, max_slots: usize) -> Self {
        let mut page = Self { data, max_slots };
        page.write_i32(PAGE_ID_OFFSET, page_id.0 as i32);
        page.write_i32(NUM_SLOTS_OFFSET, 0);
        page.write_i32(FREE_SPACE_PTR_OFFSET, PAGE_HEADER_SIZE as i32);
        page.write_i32(NEXT_PAGE_OFFSET, PageId::to_raw(None));
        page
    }

    pub fn set_next_page_id(&mut self, next: Option<PageId>) {
        self.write_i32(NEXT_PAGE_OFFSET, PageId::to_raw(next));
    }

    /// Stores `record` and returns its slot, or `None` when the page has no room even
    /// after compaction.
    pub fn insert_record(&mut self, record: &[u8]) -> Option<SlotId> {
        if let Some(slot_id) = self.try_insert(record) {
            return Some(slot_id);
        }
        self.compact();
        self.try_insert(record)
    }

    /// Marks the slot invalid. Space is reclaimed by the next compaction.
    pub fn delete_record(&mut self, slot_id: SlotId) -> bool {
        match self.valid_slot(slot_id) {
            Some(slot) => {
                self.set_slot(
                    slot_id as usize,
                    Slot {
                        valid: false,
                        ..slot
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Replaces a record, keeping its slot id.
    ///
    /// Records that do not grow are rewritten in place. Larger ones move to the end of the
    /// record region, compacting once if needed; on failure the old record is untouched.
    pub fn update_record(&mut self, slot_id: SlotId, record: &[u8]) -> bool {
        let Some(slot) = self.valid_slot(slot_id) else {
            return false;
        };

        if record.len() <= slot.length {
            self.bytes_mut()[slot.offset..slot.offset + record.len()].copy_from_slice(record);
            self.set_slot(
                slot_id as usize,
                Slot {
                    length: record.len(),
                    ..slot
                },
            );
            return true;
        }

        if self.free_space() < record.len() {
            self.compact();
            if self.free_space() < record.len() {
                return false;
            }
        }

        let offset = self.append_bytes(record);
        self.set_slot(
            slot_id as usize,
            Slot {
                offset,
                length: record.len(),
                valid: true,
            },
        );
        true
    }

    /// Repacks valid records from the end of the header, rewrites their offsets and
    /// drops invalid slots at the tail of the directory.
    pub fn compact(&mut self) {
        let num_slots = self.num_slots();
        let mut live: Vec<(usize, Slot)> = (0..num_slots)
            .filter_map(|i| self.live_slot(i).map(|slot| (i, slot)))
            .collect();
        // Slots pointing outside the record region are dropped along the way.
        for i in 0..num_slots {
            if self.live_slot(i).is_none() {
                self.set_slot(
                    i,
                    Slot {
                        offset: 0,
                        length: 0,
                        valid: false,
                    },
                );
            }
        }
        live.sort_by_key(|(_, slot)| slot.offset);

        // Records only ever move towards the header, so ascending copies never clobber
        // bytes that are still to be moved.
        let mut write_ptr = PAGE_HEADER_SIZE;
        for (index, slot) in live {
            self.bytes_mut()
                .copy_within(slot.offset..slot.offset + slot.length, write_ptr);
            self.set_slot(
                index,
                Slot {
                    offset: write_ptr,
                    ..slot
                },
            );
            write_ptr += slot.length;
        }

        let mut kept = num_slots;
        while kept > 0 && !self.slot(kept - 1).valid {
            kept -= 1;
        }

        self.write_i32(NUM_SLOTS_OFFSET, kept as i32);
        self.write_i32(FREE_SPACE_PTR_OFFSET, write_ptr as i32);
    }

    fn try_insert(&mut self, record: &[u8]) -> Option<SlotId> {
        let num_slots = self.num_slots();
        let reusable = (0..num_slots).find(|&i| self.live_slot(i).is_none());

        let (slot_index, directory_growth) = match reusable {
            Some(index) => (index, 0),
            None if num_slots < self.max_slots => (num_slots, SLOT_SIZE),
            None => return None,
        };
        if self.free_space() < record.len() + directory_growth {
            return None;
        }

        if directory_growth > 0 {
            self.write_i32(NUM_SLOTS_OFFSET, (num_slots + 1) as i32);
        }
        let offset = self.append_bytes(record);
        self.set_slot(
            slot_index,
            Slot {
                offset,
                length: record.len(),
                valid: true,
            },
        );
        Some(slot_index as SlotId)
    }

    /// Copies `record` to the free space pointer and advances it.
    fn append_bytes(&mut self, record: &[u8]) -> usize {
        let offset = self.free_space_ptr();
        self.bytes_mut()[offset..offset + record.len()].copy_from_slice(record);
        self.write_i32(FREE_SPACE_PTR_OFFSET, (offset + record.len()) as i32);
        offset
    }

    fn set_slot(&mut self, slot_index: usize, slot: Slot) {
        let pos = self.slot_position(slot_index);
        let bytes = self.bytes_mut();
        BigEndian::write_i32(&mut bytes[pos..pos + 4], slot.offset as i32);
        BigEndian::write_i32(&mut bytes[pos + 4..pos + 8], slot.length as i32);
        bytes[pos + 8] = slot.valid as u8;
        bytes[pos + 9..pos + SLOT_SIZE].fill(0);
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        BigEndian::write_i32(&mut self.bytes_mut()[offset..offset + 4], value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    fn new_page() -> SlottedPage<Vec<u8>> {
        SlottedPage::init(vec![0u8; PAGE_SIZE], PageId(3), DEFAULT_MAX_SLOTS)
    }

    #[test]
    fn test_initial_header() {
        let page = new_page();
        assert_eq!(page.page_id(), PageId(3));
        assert_eq!(page.num_slots(), 0);
        assert_eq!(page.next_page_id(), None);
        assert_eq!(page.free_space(), PAGE_SIZE - PAGE_HEADER_SIZE);

        let bytes = page.into_inner();
        assert_eq!(&bytes[0..4], &3i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &16i32.to_be_bytes());
        assert_eq!(&bytes[12..16], &(-1i32).to_be_bytes());
    }

    #[test]
    fn test_insert_and_get() {
        let mut page = new_page();
        let first = page.insert_record(b"Hello, World!").unwrap();
        let second = page.insert_record(b"Second record").unwrap();

        assert_eq!((first, second), (0, 1));
        assert_eq!(page.get_record(first), Some(&b"Hello, World!"[..]));
        assert_eq!(page.get_record(second), Some(&b"Second record"[..]));
        assert_eq!(page.get_record(2), None);
        assert_eq!(
            page.free_space(),
            PAGE_SIZE - PAGE_HEADER_SIZE - 13 - 13 - 2 * SLOT_SIZE
        );
    }

    #[test]
    fn test_slot_directory_layout() {
        let mut page = new_page();
        page.insert_record(b"abc").unwrap();
        page.insert_record(b"defgh").unwrap();
        let bytes = page.into_inner();

        assert_eq!(&bytes[4..8], &2i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &24i32.to_be_bytes());

        let slot0 = PAGE_SIZE - SLOT_SIZE;
        assert_eq!(&bytes[slot0..slot0 + 4], &16i32.to_be_bytes());
        assert_eq!(&bytes[slot0 + 4..slot0 + 8], &3i32.to_be_bytes());
        assert_eq!(bytes[slot0 + 8], 1);

        let slot1 = PAGE_SIZE - 2 * SLOT_SIZE;
        assert_eq!(&bytes[slot1..slot1 + 4], &19i32.to_be_bytes());
        assert_eq!(&bytes[slot1 + 4..slot1 + 8], &5i32.to_be_bytes());
        assert_eq!(&bytes[16..24], b"abcdefgh");
    }

    #[test]
    fn test_delete_marks_slot_and_reuses_it() {
        let mut page = new_page();
        let a = page.insert_record(b"aaaa").unwrap();
        let b = page.insert_record(b"bbbb").unwrap();

        assert!(page.delete_record(a));
        assert!(!page.delete_record(a));
        assert_eq!(page.get_record(a), None);
        assert_eq!(page.get_record(b), Some(&b"bbbb"[..]));

        // The invalid slot is handed out again without growing the directory.
        let c = page.insert_record(b"cc").unwrap();
        assert_eq!(c, a);
        assert_eq!(page.num_slots(), 2);
        assert_eq!(page.get_record(c), Some(&b"cc"[..]));
    }

    #[test]
    fn test_full_page_rejects_insert() {
        let mut page = new_page();
        let record = vec![0xAA; 1000];
        let mut count = 0;
        while page.insert_record(&record).is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert!(page.free_space() < record.len() + SLOT_SIZE);
        assert!(!page.can_fit(record.len()));
        assert!(page.can_fit(8));
        assert!(page.insert_record(&[1u8; 8]).is_some());
    }

    #[test]
    fn test_insert_compacts_deleted_space() {
        let mut page = new_page();
        let record = vec![0x11; 1000];
        let ids: Vec<_> = (0..4).map(|_| page.insert_record(&record).unwrap()).collect();

        page.delete_record(ids[1]);
        let survivor = page.get_record(ids[2]).unwrap().to_vec();

        // Reuses the freed slot; only compaction can make the bytes available.
        let big = vec![0x22; 1000];
        assert!(page.can_fit(big.len()));
        let slot = page.insert_record(&big).unwrap();
        assert_eq!(slot, ids[1]);
        assert_eq!(page.get_record(slot), Some(&big[..]));
        assert_eq!(page.get_record(ids[2]), Some(&survivor[..]));
        assert_eq!(page.get_record(ids[0]), Some(&record[..]));
    }

    #[test]
    fn test_compact_keeps_slot_ids_and_trims_tail() {
        let mut page = new_page();
        let a = page.insert_record(b"first").unwrap();
        let b = page.insert_record(b"second").unwrap();
        let c = page.insert_record(b"third").unwrap();
        let d = page.insert_record(b"fourth").unwrap();

        page.delete_record(a);
        page.delete_record(d);
        page.compact();

        assert_eq!(page.num_slots(), 3);
        assert_eq!(page.get_record(b), Some(&b"second"[..]));
        assert_eq!(page.get_record(c), Some(&b"third"[..]));
        assert_eq!(page.get_record(a), None);
        assert_eq!(
            page.free_space(),
            PAGE_SIZE - PAGE_HEADER_SIZE - 11 - 3 * SLOT_SIZE
        );
        let records: Vec<_> = page.valid_records().map(|(id, _)| id).collect();
        assert_eq!(records, vec![b, c]);
    }

    #[test]
    fn test_update_in_place_and_relocate() {
        let mut page = new_page();
        let a = page.insert_record(b"0123456789").unwrap();
        let b = page.insert_record(b"tail").unwrap();

        assert!(page.update_record(a, b"short"));
        assert_eq!(page.get_record(a), Some(&b"short"[..]));

        assert!(page.update_record(a, b"a much longer record"));
        assert_eq!(page.get_record(a), Some(&b"a much longer record"[..]));
        assert_eq!(page.get_record(b), Some(&b"tail"[..]));

        assert!(!page.update_record(7, b"missing"));
    }

    #[test]
    fn test_update_too_large_keeps_old_record() {
        let mut page = new_page();
        let a = page.insert_record(b"keep me").unwrap();
        let filler = vec![0u8; PAGE_SIZE - PAGE_HEADER_SIZE - 2 * SLOT_SIZE - 100];
        page.insert_record(&filler).unwrap();

        assert!(!page.update_record(a, &vec![1u8; 200]));
        assert_eq!(page.get_record(a), Some(&b"keep me"[..]));
    }

    #[test]
    fn test_max_slots_cap() {
        let mut page = SlottedPage::init(vec![0u8; PAGE_SIZE], PageId(1), 2);
        assert!(page.insert_record(b"x").is_some());
        assert!(page.insert_record(b"y").is_some());
        assert_eq!(page.insert_record(b"z"), None);

        page.delete_record(0);
        assert_eq!(page.insert_record(b"z"), Some(0));
    }

    #[test]
    fn test_next_page_and_reopen() {
        let mut page = new_page();
        page.insert_record(b"persist").unwrap();
        page.set_next_page_id(Some(PageId(9)));

        let reopened = SlottedPage::open(page.into_inner(), DEFAULT_MAX_SLOTS);
        assert_eq!(reopened.page_id(), PageId(3));
        assert_eq!(reopened.next_page_id(), Some(PageId(9)));
        assert_eq!(reopened.get_record(0), Some(&b"persist"[..]));
    }

    #[test]
    fn test_empty_record() {
        let mut page = new_page();
        let slot = page.insert_record(&[]).unwrap();
        assert_eq!(page.get_record(slot), Some(&[][..]));
    }

    #[test]
    fn test_garbage_page_reads_as_empty() {
        let page = SlottedPage::open(vec![0x7Fu8; PAGE_SIZE], DEFAULT_MAX_SLOTS);
        assert_eq!(page.num_slots(), (PAGE_SIZE - PAGE_HEADER_SIZE) / SLOT_SIZE);
        assert_eq!(page.get_record(0), None);
        assert_eq!(page.get_record(SlotId::MAX), None);
        assert_eq!(page.valid_records().count(), 0);
        assert!(!page.can_fit(1));

        // Compaction discards the bogus directory and makes the page usable again.
        let mut page = SlottedPage::open(vec![0x7Fu8; PAGE_SIZE], DEFAULT_MAX_SLOTS);
        page.compact();
        assert_eq!(page.num_slots(), 0);
        let slot = page.insert_record(b"row").unwrap();
        assert_eq!(page.get_record(slot), Some(&b"row"[..]));
    }

    #[test]
    fn test_index_node_page_reads_as_empty() {
        use crate::access::btree::Node;
        use crate::access::{RecordId, Value};

        let keys: Vec<Value> = (0..40).map(|i| Value::from(format!("key-{:04}", i))).collect();
        let values = (0..40).map(|i| RecordId::new(PageId(2), i)).collect();
        let node: Node<Value, RecordId> = Node::Leaf {
            keys,
            values,
            next: Some(PageId(7)),
        };
        let mut bytes = vec![0u8; PAGE_SIZE];
        node.write_to(PageId(5), &mut bytes).unwrap();

        let page = SlottedPage::open(bytes, DEFAULT_MAX_SLOTS);
        assert_ne!(page.page_id(), PageId(5));
        for slot in 0..64 {
            if let Some(record) = page.get_record(slot) {
                assert!(record.len() < PAGE_SIZE);
            }
        }
        assert!(!page.can_fit(PAGE_SIZE));
    }
}
