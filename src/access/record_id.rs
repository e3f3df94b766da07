use crate::storage::page::{PageId, SlotId};
use anyhow::{bail, Result};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Location of a row: the record page and its slot in that page's directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot_id: SlotId,
}

impl RecordId {
    pub const ENCODED_SIZE: usize = 8;

    pub fn new(page_id: PageId, slot_id: SlotId) -> Self {
        Self { page_id, slot_id }
    }

    /// Big-endian `pageId:int32, slotId:int32`.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        BigEndian::write_i32(&mut buf[0..4], self.page_id.0 as i32);
        BigEndian::write_i32(&mut buf[4..8], self.slot_id as i32);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_SIZE {
            bail!(
                "RecordId needs {} bytes, got {}",
                Self::ENCODED_SIZE,
                bytes.len()
            );
        }
        let page = BigEndian::read_i32(&bytes[0..4]);
        let slot = BigEndian::read_i32(&bytes[4..8]);
        if page <= 0 || !(0..=SlotId::MAX as i32).contains(&slot) {
            bail!("Invalid RecordId ({}, {})", page, slot);
        }
        Ok(Self::new(PageId(page as u32), slot as SlotId))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_id)
    }
}
