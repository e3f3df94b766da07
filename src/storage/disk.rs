pub mod page_manager;

pub use page_manager::{FileMetadata, PageManager, DB_SIGNATURE, FORMAT_VERSION, PAGE_SIZE};
