//! Write-ahead log.
//!
//! - record framing, checksums and LSNs (`record`)
//! - the append/flush manager with torn-tail recovery and listener queues (`manager`)

pub mod manager;
pub mod record;

pub use manager::{WalConfig, WalListener, WalManager};
pub use record::{LogRecord, LogRecordType, Lsn};
