//! Duplicate values
//!
//! A key in a `DUP_SORT` bucket holds a sorted set of values. Small sets
//! live inline in the leaf node as a run:
//! ```text
//! plain:     [len u16][bytes] [len u16][bytes] ...
//! DUP_FIXED: [size u16][v0][v1][v2] ...
//! ```
//! Once the run would push the node past the inline limit it is promoted to
//! a sub-tree whose keys are the values (with empty payloads).

use crate::btree::{KeyOrder, PageRead, TreeCursor};
use crate::error::{Result, StrataError};
use crate::page::{BucketFlags, BucketRecord, LeafValue};

pub(crate) fn encode_run(values: &[Vec<u8>], fixed: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if fixed {
        let size = values.first().map_or(0, Vec::len);
        out.extend_from_slice(&(size as u16).to_le_bytes());
        for value in values {
            out.extend_from_slice(value);
        }
    } else {
        for value in values {
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            out.extend_from_slice(value);
        }
    }
    out
}

pub(crate) fn decode_run(bytes: &[u8], fixed: bool) -> Result<Vec<Vec<u8>>> {
    let corrupted = || StrataError::Corrupted("malformed duplicate run".into());

    if fixed {
        if bytes.len() < 2 {
            return Err(corrupted());
        }
        let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let body = &bytes[2..];
        if size == 0 || body.len() % size != 0 {
            return Err(corrupted());
        }
        return Ok(body.chunks(size).map(<[u8]>::to_vec).collect());
    }

    let mut values = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(corrupted());
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < 2 + len {
            return Err(corrupted());
        }
        values.push(rest[2..2 + len].to_vec());
        rest = &rest[2 + len..];
    }
    Ok(values)
}

/// Which end of a duplicate set to land on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    First,
    Last,
}

/// Position within the values of the current key
#[derive(Debug, Clone)]
pub(crate) enum DupPos {
    /// Bucket without duplicates
    Single,
    Run { values: Vec<Vec<u8>>, index: usize },
    Tree { record: BucketRecord, cursor: TreeCursor },
}

impl DupPos {
    /// Open the duplicate set stored in `value` at one of its ends
    pub fn open<R: PageRead>(src: &R, flags: BucketFlags, value: &LeafValue<'_>, edge: Edge) -> Result<Self> {
        match value {
            LeafValue::DupRun(bytes) => {
                let values = decode_run(bytes, flags.contains(BucketFlags::DUP_FIXED))?;
                if values.is_empty() {
                    return Err(StrataError::Corrupted("empty duplicate run".into()));
                }
                let index = match edge {
                    Edge::First => 0,
                    Edge::Last => values.len() - 1,
                };
                Ok(DupPos::Run { values, index })
            }
            LeafValue::DupTree(record) => {
                let mut cursor = TreeCursor::new(KeyOrder::for_dups(flags));
                let found = match edge {
                    Edge::First => cursor.first(src, record.root)?,
                    Edge::Last => cursor.last(src, record.root)?,
                };
                if !found {
                    return Err(StrataError::Corrupted("empty duplicate sub-tree".into()));
                }
                Ok(DupPos::Tree {
                    record: *record,
                    cursor,
                })
            }
            other => Err(StrataError::Corrupted(format!(
                "expected duplicates, found {:?}",
                other
            ))),
        }
    }

    /// Open the set positioned at the first value `>= target`. Returns
    /// `None` when every value sorts below it, else whether it matched.
    pub fn open_at<R: PageRead>(
        src: &R,
        flags: BucketFlags,
        value: &LeafValue<'_>,
        target: &[u8],
    ) -> Result<Option<(Self, bool)>> {
        let order = KeyOrder::for_dups(flags);
        match value {
            LeafValue::DupRun(bytes) => {
                let values = decode_run(bytes, flags.contains(BucketFlags::DUP_FIXED))?;
                let index = match values.binary_search_by(|v| order.compare(v, target)) {
                    Ok(i) => return Ok(Some((DupPos::Run { values, index: i }, true))),
                    Err(i) => i,
                };
                if index == values.len() {
                    return Ok(None);
                }
                Ok(Some((DupPos::Run { values, index }, false)))
            }
            LeafValue::DupTree(record) => {
                let mut cursor = TreeCursor::new(order);
                if !cursor.seek_range(src, record.root, target)? {
                    return Ok(None);
                }
                let (page, index) = cursor.leaf(src)?;
                let exact = order.compare(page.key(index)?, target).is_eq();
                Ok(Some((
                    DupPos::Tree {
                        record: *record,
                        cursor,
                    },
                    exact,
                )))
            }
            other => Err(StrataError::Corrupted(format!(
                "expected duplicates, found {:?}",
                other
            ))),
        }
    }

    /// Value under the position; `None` for a bucket without duplicates
    pub fn current<R: PageRead>(&self, src: &R) -> Result<Option<Vec<u8>>> {
        match self {
            DupPos::Single => Ok(None),
            DupPos::Run { values, index } => Ok(values.get(*index).cloned()),
            DupPos::Tree { cursor, .. } => {
                let (page, index) = cursor.leaf(src)?;
                Ok(Some(page.key(index)?.to_vec()))
            }
        }
    }

    /// Move to the neighbouring value; false (and unchanged) at either end
    pub fn step<R: PageRead>(&mut self, src: &R, forward: bool) -> Result<bool> {
        match self {
            DupPos::Single => Ok(false),
            DupPos::Run { values, index } => {
                if forward && *index + 1 < values.len() {
                    *index += 1;
                    Ok(true)
                } else if !forward && *index > 0 {
                    *index -= 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            DupPos::Tree { cursor, .. } => {
                if forward {
                    cursor.next(src)
                } else {
                    cursor.prev(src)
                }
            }
        }
    }

    /// Jump to one end of the set
    pub fn edge<R: PageRead>(&mut self, src: &R, edge: Edge) -> Result<()> {
        match self {
            DupPos::Single => Ok(()),
            DupPos::Run { values, index } => {
                *index = match edge {
                    Edge::First => 0,
                    Edge::Last => values.len().saturating_sub(1),
                };
                Ok(())
            }
            DupPos::Tree { record, cursor } => {
                match edge {
                    Edge::First => cursor.first(src, record.root)?,
                    Edge::Last => cursor.last(src, record.root)?,
                };
                Ok(())
            }
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            DupPos::Single => 1,
            DupPos::Run { values, .. } => values.len() as u64,
            DupPos::Tree { record, .. } => record.entries,
        }
    }
}
