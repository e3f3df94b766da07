pub mod slotted_page;

use std::fmt;

pub use slotted_page::{SlotId, SlottedPage, DEFAULT_MAX_SLOTS, PAGE_HEADER_SIZE, SLOT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

/// Page holding the file signature, format version, page size and page count.
pub const METADATA_PAGE_ID: PageId = PageId(0);

/// The B+Tree root never moves off this page.
pub const INDEX_ROOT_PAGE_ID: PageId = PageId(1);

/// Head of the linked chain of record pages.
pub const FIRST_RECORD_PAGE_ID: PageId = PageId(2);

/// On-disk marker for "no page".
pub const NO_PAGE: i32 = -1;

impl PageId {
    /// Encodes an optional page reference as the `int32` used in page layouts.
    pub fn to_raw(page_id: Option<PageId>) -> i32 {
        match page_id {
            Some(PageId(id)) => id as i32,
            None => NO_PAGE,
        }
    }

    /// Decodes an `int32` page reference; any negative value means "none".
    pub fn from_raw(raw: i32) -> Option<PageId> {
        u32::try_from(raw).ok().map(PageId)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
