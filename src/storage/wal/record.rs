//! WAL record format.
//!
//! Every record is framed as
//!
//! ```text
//! [frameLen:i32][lsn:i64][type:i8][txId:i64][keyLen:i32][key][valueLen:i32][value][checksum:i64]
//! ```
//!
//! big-endian throughout. `frameLen` counts every byte after itself. The checksum is the
//! CRC32 of the payload (lsn through value), widened to 64 bits. A key or value length of
//! -1 encodes an absent field.

use crate::storage::error::{StorageError, StorageResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

const LEN_PREFIX: usize = 4;
const CHECKSUM_LEN: usize = 8;
/// lsn + type + txId + keyLen + valueLen
const FIXED_PAYLOAD_LEN: usize = 8 + 1 + 8 + 4 + 4;
const ABSENT: i32 = -1;

/// Log sequence number. Valid LSNs start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);
    pub const FIRST: Lsn = Lsn(1);

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogRecordType {
    Put = 1,
    Delete = 2,
    Done = 3,
    Checkpoint = 4,
}

impl TryFrom<i8> for LogRecordType {
    type Error = StorageError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LogRecordType::Put),
            2 => Ok(LogRecordType::Delete),
            3 => Ok(LogRecordType::Done),
            4 => Ok(LogRecordType::Checkpoint),
            other => Err(StorageError::CorruptedRecord(format!(
                "unknown record type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for LogRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogRecordType::Put => "PUT",
            LogRecordType::Delete => "DELETE",
            LogRecordType::Done => "DONE",
            LogRecordType::Checkpoint => "CHECKPOINT",
        };
        f.write_str(name)
    }
}

/// One logged operation. The LSN is assigned by the WAL manager on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub record_type: LogRecordType,
    pub tx_id: u64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl LogRecord {
    fn unassigned(
        record_type: LogRecordType,
        tx_id: u64,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            lsn: Lsn::INVALID,
            record_type,
            tx_id,
            key,
            value,
        }
    }

    /// A row written by `tx_id`; `value` carries the serialized row.
    pub fn put(tx_id: u64, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::unassigned(
            LogRecordType::Put,
            tx_id,
            Some(key.into()),
            Some(value.into()),
        )
    }

    /// A row removed by `tx_id`; `key` is the serialized record id, `value` the old row.
    pub fn delete(tx_id: u64, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::unassigned(
            LogRecordType::Delete,
            tx_id,
            Some(key.into()),
            Some(value.into()),
        )
    }

    /// Marks every preceding operation of `tx_id` as complete.
    pub fn done(tx_id: u64) -> Self {
        Self::unassigned(LogRecordType::Done, tx_id, None, None)
    }

    pub fn checkpoint() -> Self {
        Self::unassigned(LogRecordType::Checkpoint, 0, None, None)
    }

    fn payload_len(&self) -> usize {
        FIXED_PAYLOAD_LEN
            + self.key.as_ref().map_or(0, Bytes::len)
            + self.value.as_ref().map_or(0, Bytes::len)
    }

    /// Serializes the record including its frame length and checksum.
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload_len + CHECKSUM_LEN);
        buf.put_i32((payload_len + CHECKSUM_LEN) as i32);

        buf.put_u64(self.lsn.0);
        buf.put_i8(self.record_type as i8);
        buf.put_u64(self.tx_id);
        put_field(&mut buf, self.key.as_ref());
        put_field(&mut buf, self.value.as_ref());

        let checksum = crc32fast::hash(&buf[LEN_PREFIX..]);
        buf.put_u64(checksum as u64);
        buf.freeze()
    }

    /// Decodes the record at the start of `buf`, returning it and the bytes consumed.
    ///
    /// Fails with [`StorageError::IncompleteRecord`] when `buf` ends mid-record and
    /// [`StorageError::CorruptedRecord`] when the frame is inconsistent.
    pub fn decode(buf: &[u8]) -> StorageResult<(LogRecord, usize)> {
        if buf.len() < LEN_PREFIX {
            return Err(StorageError::IncompleteRecord);
        }
        let frame_len = (&buf[..LEN_PREFIX]).get_i32();
        let min_frame = (FIXED_PAYLOAD_LEN + CHECKSUM_LEN) as i32;
        if frame_len < min_frame {
            return Err(StorageError::CorruptedRecord(format!(
                "frame length {} below minimum {}",
                frame_len, min_frame
            )));
        }

        let total = LEN_PREFIX + frame_len as usize;
        if buf.len() < total {
            return Err(StorageError::IncompleteRecord);
        }

        let payload = &buf[LEN_PREFIX..total - CHECKSUM_LEN];
        let stored_checksum = (&buf[total - CHECKSUM_LEN..total]).get_u64();
        let checksum = crc32fast::hash(payload) as u64;
        if stored_checksum != checksum {
            return Err(StorageError::CorruptedRecord(format!(
                "checksum mismatch: stored {:#x}, computed {:#x}",
                stored_checksum, checksum
            )));
        }

        let mut cursor = payload;
        let lsn = Lsn(cursor.get_u64());
        let record_type = LogRecordType::try_from(cursor.get_i8())?;
        let tx_id = cursor.get_u64();
        let key = take_field(&mut cursor)?;
        let value = take_field(&mut cursor)?;
        if cursor.has_remaining() {
            return Err(StorageError::CorruptedRecord(format!(
                "{} trailing bytes inside frame",
                cursor.remaining()
            )));
        }

        let record = LogRecord {
            lsn,
            record_type,
            tx_id,
            key,
            value,
        };
        Ok((record, total))
    }

    /// True when `bytes` holds exactly one well-formed record with a matching checksum.
    pub fn is_valid(bytes: &[u8]) -> bool {
        matches!(LogRecord::decode(bytes), Ok((_, consumed)) if consumed == bytes.len())
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} tx={} key={} value={}",
            self.lsn,
            self.record_type,
            self.tx_id,
            self.key.as_ref().map_or(0, Bytes::len),
            self.value.as_ref().map_or(0, Bytes::len)
        )
    }
}

fn put_field(buf: &mut BytesMut, field: Option<&Bytes>) {
    match field {
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32(ABSENT),
    }
}

fn take_field(cursor: &mut &[u8]) -> StorageResult<Option<Bytes>> {
    if cursor.remaining() < 4 {
        return Err(StorageError::CorruptedRecord(
            "truncated field length".to_string(),
        ));
    }
    let len = cursor.get_i32();
    if len == ABSENT {
        return Ok(None);
    }
    if len < 0 || len as usize > cursor.remaining() {
        return Err(StorageError::CorruptedRecord(format!(
            "field length {} exceeds frame",
            len
        )));
    }
    Ok(Some(cursor.copy_to_bytes(len as usize)))
}
