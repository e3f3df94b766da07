//! Byte encodings for keys and values stored in tree nodes.

use crate::access::record_id::RecordId;
use crate::access::value::Value;
use anyhow::{bail, Result};
use byteorder::{BigEndian, ByteOrder};

/// Encoding of a key or value inside a node page. The node layer adds the length prefix.
pub trait NodeCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl NodeCodec for i32 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 4 {
            bail!("i32 needs 4 bytes, got {}", bytes.len());
        }
        Ok(BigEndian::read_i32(bytes))
    }
}

impl NodeCodec for i64 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            bail!("i64 needs 8 bytes, got {}", bytes.len());
        }
        Ok(BigEndian::read_i64(bytes))
    }
}

impl NodeCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl NodeCodec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl NodeCodec for RecordId {
    fn encode(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        RecordId::from_bytes(bytes)
    }
}

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_BYTES: u8 = 4;

/// Self-describing: one tag byte, then the payload.
impl NodeCodec for Value {
    fn encode(&self) -> Vec<u8> {
        let (tag, mut payload) = match self {
            Value::Null => (TAG_NULL, Vec::new()),
            Value::Int(v) => (TAG_INT, v.encode()),
            Value::Long(v) => (TAG_LONG, v.encode()),
            Value::Str(v) => (TAG_STR, v.encode()),
            Value::Bytes(v) => (TAG_BYTES, v.clone()),
        };
        payload.insert(0, tag);
        payload
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&tag, payload)) = bytes.split_first() else {
            bail!("Empty value encoding");
        };
        match tag {
            TAG_NULL if payload.is_empty() => Ok(Value::Null),
            TAG_INT => Ok(Value::Int(i32::decode(payload)?)),
            TAG_LONG => Ok(Value::Long(i64::decode(payload)?)),
            TAG_STR => Ok(Value::Str(String::decode(payload)?)),
            TAG_BYTES => Ok(Value::Bytes(payload.to_vec())),
            _ => bail!("Invalid value encoding with tag {}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageId;

    #[test]
    fn test_value_encodings() -> Result<()> {
        for value in [
            Value::Null,
            Value::Int(-5),
            Value::Long(i64::MAX),
            Value::from("key"),
            Value::Bytes(vec![0, 255]),
        ] {
            assert_eq!(Value::decode(&value.encode())?, value);
        }
        assert_eq!(Value::Int(1).encode(), vec![TAG_INT, 0, 0, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_invalid_encodings() {
        assert!(i32::decode(&[1, 2]).is_err());
        assert!(i64::decode(&[0; 4]).is_err());
        assert!(String::decode(&[0xff, 0xfe]).is_err());
        assert!(Value::decode(&[]).is_err());
        assert!(Value::decode(&[9, 1]).is_err());
        assert!(Value::decode(&[TAG_NULL, 1]).is_err());
    }

    #[test]
    fn test_record_id_encoding() -> Result<()> {
        let rid = RecordId::new(PageId(3), 12);
        assert_eq!(RecordId::decode(&rid.encode())?, rid);
        Ok(())
    }
}
