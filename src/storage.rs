//! Storage layer for minidb.
//!
//! Everything below the index and record layers lives here:
//!
//! - **PageManager**: fixed-size page I/O against the database file, page allocation
//!   and the metadata page
//! - **SlottedPage**: record layout inside a page (header, tail-growing slot directory)
//! - **BufferPool**: pinned page cache with LRU eviction that honours write-ahead ordering
//! - **WAL**: checksummed append-only log with LSNs and a listener hook
//!
//! Page 0 of the database file is reserved for metadata and never handed out by the pool.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPoolManager, LogFlusher, PageReadGuard, PageWriteGuard};
pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{PageId, SlottedPage};
