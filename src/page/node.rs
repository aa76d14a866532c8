//! Node codec
//!
//! ## Leaf Node
//! ```text
//! ┌──────────┬─────────┬───────────┬───────────┬──────┬─────────┐
//! │ flags(1) │ pad (1) │ ksize (2) │ dsize (4) │ key  │ payload │
//! └──────────┴─────────┴───────────┴───────────┴──────┴─────────┘
//! ```
//! The payload depends on the flags:
//! - none: the value itself (`dsize` bytes)
//! - `NODE_BIG`: 8-byte first page of the overflow run; `dsize` is the value length
//! - `NODE_SUB`: a named bucket record
//! - `NODE_DUP`: an inline sorted run of duplicate values
//! - `NODE_SUB | NODE_DUP`: the record of a duplicate sub-tree
//!
//! ## Branch Node
//! ```text
//! ┌───────────┬────────────┬──────┐
//! │ ksize (2) │ child (8)  │ key  │
//! └───────────┴────────────┴──────┘
//! ```

use crate::error::{Result, StrataError};

use super::{BucketRecord, PageId};

pub const LEAF_NODE_HEADER: usize = 8;
pub const BRANCH_NODE_HEADER: usize = 10;

/// Value lives on an overflow run
pub const NODE_BIG: u8 = 0x01;
/// Value is a bucket record
pub const NODE_SUB: u8 = 0x02;
/// Value holds duplicates
pub const NODE_DUP: u8 = 0x04;

/// Tagged leaf payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafValue<'a> {
    Inline(&'a [u8]),
    Overflow { page: PageId, len: usize },
    Bucket(BucketRecord),
    DupRun(&'a [u8]),
    DupTree(BucketRecord),
}

impl LeafValue<'_> {
    fn flags(&self) -> u8 {
        match self {
            LeafValue::Inline(_) => 0,
            LeafValue::Overflow { .. } => NODE_BIG,
            LeafValue::Bucket(_) => NODE_SUB,
            LeafValue::DupRun(_) => NODE_DUP,
            LeafValue::DupTree(_) => NODE_SUB | NODE_DUP,
        }
    }

    /// Bytes the payload occupies inside the node
    pub fn payload_len(&self) -> usize {
        match self {
            LeafValue::Inline(v) | LeafValue::DupRun(v) => v.len(),
            LeafValue::Overflow { .. } => 8,
            LeafValue::Bucket(_) | LeafValue::DupTree(_) => BucketRecord::ENCODED_SIZE,
        }
    }
}

/// A decoded leaf node borrowing from its page
#[derive(Debug, Clone, Copy)]
pub struct LeafNode<'a> {
    pub key: &'a [u8],
    pub value: LeafValue<'a>,
}

/// Encoded size of a leaf node
pub fn leaf_size(key_len: usize, payload_len: usize) -> usize {
    LEAF_NODE_HEADER + key_len + payload_len
}

pub fn encode_leaf(key: &[u8], value: &LeafValue<'_>) -> Vec<u8> {
    let payload_len = value.payload_len();
    let dsize = match value {
        LeafValue::Overflow { len, .. } => *len,
        _ => payload_len,
    };

    let mut out = Vec::with_capacity(leaf_size(key.len(), payload_len));
    out.push(value.flags());
    out.push(0);
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(&(dsize as u32).to_le_bytes());
    out.extend_from_slice(key);

    match value {
        LeafValue::Inline(v) | LeafValue::DupRun(v) => out.extend_from_slice(v),
        LeafValue::Overflow { page, .. } => out.extend_from_slice(&page.to_le_bytes()),
        LeafValue::Bucket(record) | LeafValue::DupTree(record) => {
            let mut buf = [0u8; BucketRecord::ENCODED_SIZE];
            record.encode_into(&mut buf);
            out.extend_from_slice(&buf);
        }
    }
    out
}

/// Read `(flags, ksize, dsize)` from a leaf node header
fn leaf_header(bytes: &[u8]) -> Result<(u8, usize, usize)> {
    if bytes.len() < LEAF_NODE_HEADER {
        return Err(StrataError::Corrupted("truncated leaf node header".into()));
    }
    let ksize = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    let dsize = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    Ok((bytes[0], ksize, dsize))
}

fn payload_len_for(flags: u8, dsize: usize) -> Result<usize> {
    match flags {
        0 | NODE_DUP => Ok(dsize),
        NODE_BIG => Ok(8),
        NODE_SUB => Ok(BucketRecord::ENCODED_SIZE),
        f if f == NODE_SUB | NODE_DUP => Ok(BucketRecord::ENCODED_SIZE),
        other => Err(StrataError::Corrupted(format!(
            "invalid leaf node flags {:#04x}",
            other
        ))),
    }
}

/// Total encoded length of the leaf node starting at `bytes`
pub(super) fn leaf_node_len(bytes: &[u8]) -> Result<usize> {
    let (flags, ksize, dsize) = leaf_header(bytes)?;
    Ok(leaf_size(ksize, payload_len_for(flags, dsize)?))
}

pub fn decode_leaf(bytes: &[u8]) -> Result<LeafNode<'_>> {
    let (flags, ksize, dsize) = leaf_header(bytes)?;
    let payload_len = payload_len_for(flags, dsize)?;
    let total = leaf_size(ksize, payload_len);
    if bytes.len() < total {
        return Err(StrataError::Corrupted("truncated leaf node".into()));
    }

    let key = &bytes[LEAF_NODE_HEADER..LEAF_NODE_HEADER + ksize];
    let payload = &bytes[LEAF_NODE_HEADER + ksize..total];

    let value = match flags {
        0 => LeafValue::Inline(payload),
        NODE_DUP => LeafValue::DupRun(payload),
        NODE_BIG => LeafValue::Overflow {
            page: u64::from_le_bytes(payload.try_into().unwrap_or_default()),
            len: dsize,
        },
        NODE_SUB => LeafValue::Bucket(BucketRecord::decode(payload)?),
        _ => LeafValue::DupTree(BucketRecord::decode(payload)?),
    };
    Ok(LeafNode { key, value })
}

pub fn encode_branch(key: &[u8], child: PageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(BRANCH_NODE_HEADER + key.len());
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(&child.to_le_bytes());
    out.extend_from_slice(key);
    out
}

pub(super) fn branch_node_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < BRANCH_NODE_HEADER {
        return Err(StrataError::Corrupted("truncated branch node header".into()));
    }
    Ok(BRANCH_NODE_HEADER + u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
}

/// Decode a branch node into `(key, child)`
pub fn decode_branch(bytes: &[u8]) -> Result<(&[u8], PageId)> {
    let len = branch_node_len(bytes)?;
    if bytes.len() < len {
        return Err(StrataError::Corrupted("truncated branch node".into()));
    }
    let child = u64::from_le_bytes(bytes[2..10].try_into().unwrap_or_default());
    Ok((&bytes[BRANCH_NODE_HEADER..len], child))
}
