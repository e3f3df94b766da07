//! In-memory tree nodes and their page encoding.
//!
//! Page layout (big-endian):
//! ```text
//! [tag:u8 (0 = internal, 1 = leaf)][keyCount:i32]
//! leaf:     keyCount x ([keyLen:i32][key][valueLen:i32][value]), [nextLeaf:i32, -1 = none]
//! internal: keyCount x ([keyLen:i32][key]), (keyCount + 1) x [child:i32]
//! ```

use super::codec::NodeCodec;
use crate::storage::error::StorageError;
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use anyhow::{bail, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

const INTERNAL_TAG: u8 = 0;
const LEAF_TAG: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Node<K, V> {
    Leaf {
        keys: Vec<K>,
        values: Vec<V>,
        next: Option<PageId>,
    },
    Internal {
        keys: Vec<K>,
        children: Vec<PageId>,
    },
}

impl<K, V> Node<K, V> {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn keys(&self) -> &[K] {
        match self {
            Node::Leaf { keys, .. } | Node::Internal { keys, .. } => keys,
        }
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

impl<K: NodeCodec, V: NodeCodec> Node<K, V> {
    /// Serializes into `page`, failing without touching it if the node does not fit.
    pub fn write_to(&self, page_id: PageId, page: &mut [u8]) -> Result<()> {
        let encoded = self.encode()?;
        if encoded.len() > page.len() {
            bail!(StorageError::NodeTooLarge {
                page_id,
                required: encoded.len(),
                available: page.len(),
            });
        }
        page[..encoded.len()].copy_from_slice(&encoded);
        page[encoded.len()..].fill(0);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        match self {
            Node::Leaf { keys, values, next } => {
                buf.push(LEAF_TAG);
                buf.write_i32::<BigEndian>(keys.len() as i32)?;
                for (key, value) in keys.iter().zip(values) {
                    write_field(&mut buf, &key.encode())?;
                    write_field(&mut buf, &value.encode())?;
                }
                buf.write_i32::<BigEndian>(PageId::to_raw(*next))?;
            }
            Node::Internal { keys, children } => {
                buf.push(INTERNAL_TAG);
                buf.write_i32::<BigEndian>(keys.len() as i32)?;
                for key in keys {
                    write_field(&mut buf, &key.encode())?;
                }
                for child in children {
                    buf.write_i32::<BigEndian>(child.0 as i32)?;
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(page: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(page);
        let tag = cursor.read_u8()?;
        let count = cursor.read_i32::<BigEndian>()?;
        if count < 0 || count as usize > page.len() {
            bail!("Corrupted node: key count {}", count);
        }
        let count = count as usize;

        match tag {
            LEAF_TAG => {
                let mut keys = Vec::with_capacity(count);
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(K::decode(&read_field(&mut cursor)?)?);
                    values.push(V::decode(&read_field(&mut cursor)?)?);
                }
                let next = PageId::from_raw(cursor.read_i32::<BigEndian>()?);
                Ok(Node::Leaf { keys, values, next })
            }
            INTERNAL_TAG => {
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(K::decode(&read_field(&mut cursor)?)?);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    let child = cursor.read_i32::<BigEndian>()?;
                    if child <= 0 {
                        bail!("Corrupted node: child page {}", child);
                    }
                    children.push(PageId(child as u32));
                }
                Ok(Node::Internal { keys, children })
            }
            _ => bail!("Corrupted node: unknown tag {}", tag),
        }
    }
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    buf.write_i32::<BigEndian>(bytes.len() as i32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_field(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_i32::<BigEndian>()?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len < 0 || len as usize > remaining {
        bail!("Corrupted node: field length {}", len);
    }
    let mut field = vec![0u8; len as usize];
    cursor.read_exact(&mut field)?;
    Ok(field)
}
