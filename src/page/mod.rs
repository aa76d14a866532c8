//! Page Module
//!
//! Binary layout and typed views over fixed-size pages. This layer knows
//! nothing about tree shape; it only keeps the per-page invariants.
//!
//! ## Page Layout (branch / leaf)
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (16 bytes)                                            │
//! │   pgno: u64 | flags: u16 | pad: u16 | lower: u16 | upper: u16│
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slot array: u16 node offsets, grows toward the tail   ──►    │
//! │                                                              │
//! │                       free space                             │
//! │                                                              │
//! │ ◄── node data, grows from the tail toward the head           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `lower` is the end of the slot array and `upper` the start of node data;
//! `lower <= upper` always holds and `upper - lower` is the free space.
//!
//! Overflow pages reuse the lower/upper word as a u32 page span; their data
//! starts right after the header and continues across the contiguous run.

mod meta;
mod node;
mod record;

use std::fmt;

pub use meta::{Meta, MAGIC, META_SIZE, VERSION};
pub use node::{
    decode_branch, decode_leaf, encode_branch, encode_leaf, leaf_size, LeafNode, LeafValue,
    BRANCH_NODE_HEADER, LEAF_NODE_HEADER, NODE_BIG, NODE_DUP, NODE_SUB,
};
pub use record::{BucketFlags, BucketRecord};

use crate::error::{Result, StrataError};

// =============================================================================
// Shared Constants
// =============================================================================

/// Page number type
pub type PageId = u64;

/// Sentinel root of an empty tree
pub const INVALID_PAGE: PageId = u64::MAX;

/// Number of meta pages at the head of the file (pages 0 and 1)
pub const META_PAGE_COUNT: u64 = 2;

/// Page header size: pgno (8) + flags (2) + pad (2) + lower (2) + upper (2)
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one slot in the index array
pub const SLOT_SIZE: usize = 2;

/// Minimum keys a branch page keeps before it is rebalanced
pub const MIN_PAGE_KEYS: usize = 2;

/// Fill threshold (per mille) below which a page is rebalanced
pub const FILL_THRESHOLD: usize = 250;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 32768;

/// Largest encoded node (plus its slot) such that two always share a page
pub fn max_node_size(page_size: usize) -> usize {
    (((page_size - PAGE_HEADER_SIZE) / MIN_PAGE_KEYS) & !1) - SLOT_SIZE
}

/// Largest key that still fits a leaf node carrying a bucket record
pub fn max_key_size_for(page_size: usize) -> usize {
    max_node_size(page_size) - LEAF_NODE_HEADER - BucketRecord::ENCODED_SIZE
}

/// Number of contiguous pages needed to hold `len` bytes of overflow data
pub fn overflow_span(page_size: usize, len: usize) -> usize {
    (PAGE_HEADER_SIZE + len).div_ceil(page_size)
}

// =============================================================================
// Page Kind
// =============================================================================

/// On-disk page type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageKind {
    Branch = 0x01,
    Leaf = 0x02,
    Overflow = 0x04,
    Meta = 0x08,
}

impl PageKind {
    pub fn from_flags(flags: u16) -> Result<Self> {
        match flags {
            0x01 => Ok(PageKind::Branch),
            0x02 => Ok(PageKind::Leaf),
            0x04 => Ok(PageKind::Overflow),
            0x08 => Ok(PageKind::Meta),
            other => Err(StrataError::Corrupted(format!(
                "unknown page type flags {:#06x}",
                other
            ))),
        }
    }
}

// =============================================================================
// Page
// =============================================================================

/// An owned page buffer (one page, or a whole overflow run)
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    buf: Vec<u8>,
}

impl Page {
    /// Create an empty branch, leaf or meta page
    pub fn new(id: PageId, kind: PageKind, page_size: usize) -> Self {
        let mut page = Self {
            buf: vec![0u8; page_size],
        };
        page.set_id(id);
        page.write_u16(8, kind as u16);
        page.set_lower(PAGE_HEADER_SIZE);
        page.set_upper(page_size);
        page
    }

    /// Create an overflow run holding `data`
    pub fn new_overflow(id: PageId, page_size: usize, data: &[u8]) -> Self {
        let span = overflow_span(page_size, data.len());
        let mut page = Self {
            buf: vec![0u8; span * page_size],
        };
        page.set_id(id);
        page.write_u16(8, PageKind::Overflow as u16);
        page.buf[12..16].copy_from_slice(&(span as u32).to_le_bytes());
        page.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
        page
    }

    /// Wrap raw bytes read from the store
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Fail with `Corrupted` unless the header names `expected`
    pub fn check_id(&self, expected: PageId) -> Result<()> {
        if self.id() != expected {
            return Err(StrataError::Corrupted(format!(
                "page {} carries header pgno {}",
                expected,
                self.id()
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Header Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> PageId {
        u64::from_le_bytes(self.buf[0..8].try_into().unwrap_or_default())
    }

    pub fn set_id(&mut self, id: PageId) {
        self.buf[0..8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn kind(&self) -> Result<PageKind> {
        PageKind::from_flags(self.read_u16(8))
    }

    pub fn is_leaf(&self) -> bool {
        self.read_u16(8) == PageKind::Leaf as u16
    }

    pub fn is_branch(&self) -> bool {
        self.read_u16(8) == PageKind::Branch as u16
    }

    pub fn lower(&self) -> usize {
        self.read_u16(12) as usize
    }

    /// Offset of node data; a full 65536-byte value never occurs because
    /// pages are capped at 32 KiB
    pub fn upper(&self) -> usize {
        self.read_u16(14) as usize
    }

    /// Pages spanned by an overflow run (1 for every other kind)
    pub fn span(&self) -> usize {
        if self.read_u16(8) == PageKind::Overflow as u16 {
            u32::from_le_bytes(self.buf[12..16].try_into().unwrap_or_default()) as usize
        } else {
            1
        }
    }

    /// Free bytes between the slot array and node data
    pub fn remaining(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Number of nodes on a branch or leaf page
    pub fn count(&self) -> usize {
        (self.lower().saturating_sub(PAGE_HEADER_SIZE)) / SLOT_SIZE
    }

    pub fn page_size(&self) -> usize {
        self.buf.len() / self.span().max(1)
    }

    /// Bytes used by slots and nodes
    pub fn used(&self) -> usize {
        self.page_size() - PAGE_HEADER_SIZE - self.remaining()
    }

    /// Fill ratio in per mille of the usable area
    pub fn fill(&self) -> usize {
        self.used() * 1000 / (self.page_size() - PAGE_HEADER_SIZE)
    }

    /// Whether a node of `len` bytes (plus its slot) still fits
    pub fn fits(&self, len: usize) -> bool {
        len + SLOT_SIZE <= self.remaining()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    // -------------------------------------------------------------------------
    // Node Access
    // -------------------------------------------------------------------------

    fn slot(&self, index: usize) -> usize {
        self.read_u16(PAGE_HEADER_SIZE + index * SLOT_SIZE) as usize
    }

    fn set_slot(&mut self, index: usize, offset: usize) {
        self.write_u16(PAGE_HEADER_SIZE + index * SLOT_SIZE, offset as u16);
    }

    /// Raw encoded node at `index`
    pub fn node(&self, index: usize) -> Result<&[u8]> {
        if index >= self.count() {
            return Err(StrataError::Corrupted(format!(
                "node index {} out of range on page {} ({} nodes)",
                index,
                self.id(),
                self.count()
            )));
        }
        let offset = self.slot(index);
        let tail = &self.buf[offset.min(self.buf.len())..];
        let len = if self.is_branch() {
            node::branch_node_len(tail)?
        } else {
            node::leaf_node_len(tail)?
        };
        if offset < self.upper() || offset + len > self.page_size() {
            return Err(StrataError::Corrupted(format!(
                "node {} on page {} lies outside the data area",
                index,
                self.id()
            )));
        }
        Ok(&self.buf[offset..offset + len])
    }

    /// Key of the node at `index` (branch or leaf)
    pub fn key(&self, index: usize) -> Result<&[u8]> {
        let bytes = self.node(index)?;
        if self.is_branch() {
            Ok(decode_branch(bytes)?.0)
        } else {
            Ok(decode_leaf(bytes)?.key)
        }
    }

    /// Decoded leaf node at `index`
    pub fn leaf(&self, index: usize) -> Result<LeafNode<'_>> {
        decode_leaf(self.node(index)?)
    }

    /// Child page number of the branch node at `index`
    pub fn child(&self, index: usize) -> Result<PageId> {
        Ok(decode_branch(self.node(index)?)?.1)
    }

    /// Rewrite the child pointer of a branch node in place
    pub fn set_child(&mut self, index: usize, child: PageId) -> Result<()> {
        self.node(index)?;
        let offset = self.slot(index) + 2;
        self.buf[offset..offset + 8].copy_from_slice(&child.to_le_bytes());
        Ok(())
    }

    /// All encoded nodes, in slot order
    pub fn nodes(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.count()).map(|i| self.node(i).map(<[u8]>::to_vec)).collect()
    }

    /// Insert an encoded node so that it becomes slot `index`
    pub fn insert_node(&mut self, index: usize, node: &[u8]) -> Result<()> {
        let count = self.count();
        if index > count || !self.fits(node.len()) {
            return Err(StrataError::Corrupted(format!(
                "cannot insert {}-byte node at {} on page {} ({} free)",
                node.len(),
                index,
                self.id(),
                self.remaining()
            )));
        }

        let upper = self.upper() - node.len();
        self.buf[upper..upper + node.len()].copy_from_slice(node);

        let start = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        let lower = self.lower();
        self.buf.copy_within(start..lower, start + SLOT_SIZE);
        self.set_slot(index, upper);

        self.set_lower(lower + SLOT_SIZE);
        self.set_upper(upper);
        Ok(())
    }

    /// Remove the node at `index`, compacting the data area
    pub fn remove_node(&mut self, index: usize) -> Result<()> {
        let len = self.node(index)?.len();
        let offset = self.slot(index);
        let upper = self.upper();
        let count = self.count();

        self.buf.copy_within(upper..offset, upper + len);
        for i in 0..count {
            let slot = self.slot(i);
            if slot < offset {
                self.set_slot(i, slot + len);
            }
        }

        let start = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        let lower = self.lower();
        self.buf.copy_within(start + SLOT_SIZE..lower, start);

        self.set_lower(lower - SLOT_SIZE);
        self.set_upper(upper + len);
        Ok(())
    }

    /// Replace every node, keeping id and kind
    pub fn rebuild(&mut self, nodes: &[Vec<u8>]) -> Result<()> {
        let page_size = self.page_size();
        self.buf[PAGE_HEADER_SIZE..].fill(0);
        self.set_lower(PAGE_HEADER_SIZE);
        self.set_upper(page_size);
        for (i, node) in nodes.iter().enumerate() {
            self.insert_node(i, node)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Overflow Access
    // -------------------------------------------------------------------------

    /// First `len` data bytes of an overflow run
    pub fn overflow_data(&self, len: usize) -> Result<&[u8]> {
        if PAGE_HEADER_SIZE + len > self.buf.len() {
            return Err(StrataError::Corrupted(format!(
                "overflow run {} holds fewer than {} bytes",
                self.id(),
                len
            )));
        }
        Ok(&self.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len])
    }

    /// Overwrite the data of an overflow run in place
    pub fn write_overflow(&mut self, data: &[u8]) -> Result<()> {
        if PAGE_HEADER_SIZE + data.len() > self.buf.len() {
            return Err(StrataError::Corrupted(format!(
                "overflow run {} too small for {} bytes",
                self.id(),
                data.len()
            )));
        }
        self.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn set_lower(&mut self, lower: usize) {
        self.write_u16(12, lower as u16);
    }

    fn set_upper(&mut self, upper: usize) {
        self.write_u16(14, upper as u16);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("kind", &self.kind().ok())
            .field("count", &self.count())
            .field("remaining", &self.remaining())
            .finish()
    }
}
