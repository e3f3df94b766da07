//! Access layer: rows, their locations and the primary-key index.
//!
//! - **Value / Schema**: typed column values and the row codec
//! - **RecordId**: `(page, slot)` address of a stored row
//! - **BPlusTree**: disk-resident ordered index over the buffer pool
//! - **RecordStorage**: logged row insert/delete/fetch on chained slotted pages
//!
//! Everything here works in terms of logical rows and keys; page layout stays in the
//! storage layer.

pub mod btree;
pub mod record_id;
pub mod record_storage;
pub mod value;

pub use btree::{BPlusTree, NodeCodec, TreeStats};
pub use record_id::RecordId;
pub use record_storage::{RebuildStats, RecordStorage};
pub use value::{Column, DataType, Row, Schema, Value};
