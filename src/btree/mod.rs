//! B+Tree Engine
//!
//! Search, insertion, deletion, split, merge and rebalance over the pages
//! reachable from one bucket root. The engine keeps no state of its own: a
//! `TreeCursor` carries the root-to-leaf path as a `(page, index)` stack and
//! every operation goes through a page source supplied by the transaction.
//!
//! ## Branch Pages
//! Node 0 of a branch page has an implicit empty key; child `i` covers keys
//! `>= key(i)` and `< key(i + 1)`. Search picks the rightmost key `<=` target.
//!
//! ## Mutation
//! Writers must call through `PageWrite`, which copies a page into the
//! transaction's dirty set before it may be changed. The stack is only kept
//! exact for non-splitting inserts; after a split or a delete the cursor is
//! reset and callers re-seek.

mod delete;
mod insert;
mod overflow;

use std::cmp::Ordering;

use crate::error::{Result, StrataError};
use crate::page::{BucketFlags, Page, PageId, INVALID_PAGE};

pub use overflow::{free_overflow, free_tree, read_overflow, write_overflow};

// =============================================================================
// Page Access
// =============================================================================

/// Read access to pages as seen by one transaction
pub trait PageRead {
    fn page_size(&self) -> usize;

    /// Owned copy of the page (or overflow run) at `id`
    fn read(&self, id: PageId) -> Result<Page>;
}

/// Copy-on-write access used by write transactions
pub trait PageWrite: PageRead {
    /// Make `id` writable; returns the page number now holding the copy
    fn touch(&mut self, id: PageId) -> Result<PageId>;

    /// Reserve `span` contiguous page numbers
    fn alloc(&mut self, span: usize) -> Result<PageId>;

    /// Store a page that was touched or allocated in this transaction
    fn write(&mut self, page: Page) -> Result<()>;

    /// Release `span` pages starting at `id`
    fn free(&mut self, id: PageId, span: usize) -> Result<()>;
}

// =============================================================================
// Key Order
// =============================================================================

/// Comparator for the keys of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    Lexicographic,
    /// 4- or 8-byte little-endian unsigned integers
    Integer,
}

impl KeyOrder {
    /// Order of the keys of a bucket with `flags`
    pub fn for_keys(flags: BucketFlags) -> Self {
        if flags.contains(BucketFlags::INTEGER_KEY) {
            KeyOrder::Integer
        } else {
            KeyOrder::Lexicographic
        }
    }

    /// Order of the duplicate values of a bucket with `flags`
    pub fn for_dups(flags: BucketFlags) -> Self {
        if flags.contains(BucketFlags::INTEGER_DUP) {
            KeyOrder::Integer
        } else {
            KeyOrder::Lexicographic
        }
    }

    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Lexicographic => a.cmp(b),
            KeyOrder::Integer => match (int_value(a), int_value(b)) {
                (Some(x), Some(y)) => x.cmp(&y).then(a.len().cmp(&b.len())),
                _ => a.cmp(b),
            },
        }
    }

    /// Whether `key` is acceptable under this order
    pub fn accepts(self, key: &[u8]) -> bool {
        match self {
            KeyOrder::Lexicographic => true,
            KeyOrder::Integer => int_value(key).is_some(),
        }
    }
}

fn int_value(bytes: &[u8]) -> Option<u64> {
    match bytes.len() {
        4 => Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64),
        8 => Some(u64::from_le_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

// =============================================================================
// Tree Cursor
// =============================================================================

/// Root-to-leaf path into one tree
#[derive(Debug, Clone)]
pub struct TreeCursor {
    order: KeyOrder,
    stack: Vec<(PageId, usize)>,
}

impl TreeCursor {
    pub fn new(order: KeyOrder) -> Self {
        Self {
            order,
            stack: Vec::new(),
        }
    }

    pub fn order(&self) -> KeyOrder {
        self.order
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }

    pub fn is_positioned(&self) -> bool {
        !self.stack.is_empty()
    }

    /// The `(page, index)` path, root first
    pub fn stack(&self) -> &[(PageId, usize)] {
        &self.stack
    }

    /// Leaf page and index the cursor points at
    pub fn leaf<R: PageRead>(&self, src: &R) -> Result<(Page, usize)> {
        let &(id, index) = self.stack.last().ok_or(StrataError::NotFound)?;
        let page = src.read(id)?;
        if !page.is_leaf() {
            return Err(StrataError::Corrupted(format!(
                "cursor stack ends at non-leaf page {}",
                id
            )));
        }
        if index >= page.count() {
            return Err(StrataError::NotFound);
        }
        Ok((page, index))
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// Descend to the leaf that would hold `key`, positioned at its lower
    /// bound. Returns whether the key is present. The leaf index may equal the
    /// leaf's count when `key` sorts after every key on it.
    pub fn search<R: PageRead>(&mut self, src: &R, root: PageId, key: &[u8]) -> Result<bool> {
        self.stack.clear();
        if root == INVALID_PAGE {
            return Ok(false);
        }

        let mut id = root;
        loop {
            let page = src.read(id)?;
            if page.is_branch() {
                let index = self.branch_index(&page, key)?;
                self.stack.push((id, index));
                id = page.child(index)?;
                continue;
            }
            if !page.is_leaf() {
                return Err(StrataError::Corrupted(format!(
                    "page {} is neither branch nor leaf",
                    id
                )));
            }

            let (index, exact) = self.leaf_index(&page, key)?;
            self.stack.push((id, index));
            return Ok(exact);
        }
    }

    /// Position at the first key `>= key`; false when there is none
    pub fn seek_range<R: PageRead>(&mut self, src: &R, root: PageId, key: &[u8]) -> Result<bool> {
        self.search(src, root, key)?;
        let Some(&(id, index)) = self.stack.last() else {
            return Ok(false);
        };
        if index < src.read(id)?.count() {
            return Ok(true);
        }
        if self.next(src)? {
            return Ok(true);
        }
        self.stack.clear();
        Ok(false)
    }

    fn branch_index(&self, page: &Page, key: &[u8]) -> Result<usize> {
        // Rightmost index in 1..count whose key is <= target, else 0
        let (mut lo, mut hi) = (1, page.count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.order.compare(page.key(mid)?, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo - 1)
    }

    fn leaf_index(&self, page: &Page, key: &[u8]) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, page.count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.order.compare(page.key(mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    // -------------------------------------------------------------------------
    // Traversal
    // -------------------------------------------------------------------------

    pub fn first<R: PageRead>(&mut self, src: &R, root: PageId) -> Result<bool> {
        self.stack.clear();
        if root == INVALID_PAGE {
            return Ok(false);
        }
        self.descend_edge(src, root, true)
    }

    pub fn last<R: PageRead>(&mut self, src: &R, root: PageId) -> Result<bool> {
        self.stack.clear();
        if root == INVALID_PAGE {
            return Ok(false);
        }
        self.descend_edge(src, root, false)
    }

    /// Step to the next leaf entry. At the end the cursor stays where it was.
    pub fn next<R: PageRead>(&mut self, src: &R) -> Result<bool> {
        let Some(&(leaf_id, index)) = self.stack.last() else {
            return Ok(false);
        };
        if index + 1 < src.read(leaf_id)?.count() {
            if let Some(top) = self.stack.last_mut() {
                top.1 = index + 1;
            }
            return Ok(true);
        }

        for level in (0..self.stack.len() - 1).rev() {
            let (id, index) = self.stack[level];
            let branch = src.read(id)?;
            if index + 1 < branch.count() {
                let child = branch.child(index + 1)?;
                let saved = self.stack.clone();
                self.stack.truncate(level + 1);
                self.stack[level].1 = index + 1;
                if self.descend_edge(src, child, true)? {
                    return Ok(true);
                }
                self.stack = saved;
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Step to the previous leaf entry. At the start the cursor stays put.
    pub fn prev<R: PageRead>(&mut self, src: &R) -> Result<bool> {
        let Some(&(_, index)) = self.stack.last() else {
            return Ok(false);
        };
        if index > 0 {
            if let Some(top) = self.stack.last_mut() {
                top.1 = index - 1;
            }
            return Ok(true);
        }

        for level in (0..self.stack.len() - 1).rev() {
            let (id, index) = self.stack[level];
            if index > 0 {
                let child = src.read(id)?.child(index - 1)?;
                let saved = self.stack.clone();
                self.stack.truncate(level + 1);
                self.stack[level].1 = index - 1;
                if self.descend_edge(src, child, false)? {
                    return Ok(true);
                }
                self.stack = saved;
                return Ok(false);
            }
        }
        Ok(false)
    }

    fn descend_edge<R: PageRead>(&mut self, src: &R, mut id: PageId, leftmost: bool) -> Result<bool> {
        loop {
            let page = src.read(id)?;
            let count = page.count();
            if page.is_branch() {
                if count == 0 {
                    return Err(StrataError::Corrupted(format!("empty branch page {}", id)));
                }
                let index = if leftmost { 0 } else { count - 1 };
                self.stack.push((id, index));
                id = page.child(index)?;
                continue;
            }

            let index = if leftmost { 0 } else { count.saturating_sub(1) };
            self.stack.push((id, index));
            return Ok(count > 0);
        }
    }
}
