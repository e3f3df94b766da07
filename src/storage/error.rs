//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer pool is full: all {capacity} frames are pinned")]
    BufferPoolFull { capacity: usize },

    #[error("Page {0} is pinned and cannot be dropped from the buffer pool")]
    PagePinned(PageId),

    #[error("Page {0} has not been allocated")]
    PageNotAllocated(PageId),

    #[error("Not a minidb database file: {0}")]
    InvalidDatabaseFile(String),

    #[error("Unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: i16, expected: i16 },

    #[error("Page size mismatch: file uses {found} bytes, expected {expected}")]
    PageSizeMismatch { found: i32, expected: i32 },

    #[error("Record of {size} bytes cannot fit in a page (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Index entry of {size} bytes exceeds the {max} bytes a node entry may use")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Node on page {page_id} needs {required} bytes but a page holds {available}")]
    NodeTooLarge {
        page_id: PageId,
        required: usize,
        available: usize,
    },

    #[error("Incomplete WAL record")]
    IncompleteRecord,

    #[error("Corrupted WAL record: {0}")]
    CorruptedRecord(String),

    #[error("WAL has been closed")]
    WalClosed,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
