//! Deletion and rebalancing
//!
//! A page is rebalanced once it drops below the fill threshold or below its
//! minimum key count (1 for leaves, `MIN_PAGE_KEYS` for branches). The left
//! sibling is preferred, the right one is used for a leftmost child. One node
//! is borrowed when the sibling can spare it and is either well filled or too
//! full to merge with; otherwise the right page of the pair is merged into
//! the left and the parent loses one separator.

use crate::error::{Result, StrataError};
use crate::page::{
    decode_branch, decode_leaf, encode_branch, BucketRecord, Page, INVALID_PAGE,
    FILL_THRESHOLD, MIN_PAGE_KEYS, PAGE_HEADER_SIZE,
};

use super::{PageWrite, TreeCursor};

impl TreeCursor {
    /// Remove the leaf node under the cursor, then rebalance. The cursor is
    /// left unpositioned.
    pub fn delete<W: PageWrite>(&mut self, w: &mut W, rec: &mut BucketRecord) -> Result<()> {
        let Some(&(_, index)) = self.stack.last() else {
            return Err(StrataError::BadTransaction("delete on an unpositioned cursor".into()));
        };
        self.touch_path(w, rec)?;

        let level = self.stack.len() - 1;
        let mut leaf = w.read(self.stack[level].0)?;
        leaf.remove_node(index)?;
        w.write(leaf)?;

        self.rebalance(w, rec, level)?;
        self.stack.clear();
        Ok(())
    }

    fn rebalance<W: PageWrite>(&mut self, w: &mut W, rec: &mut BucketRecord, level: usize) -> Result<()> {
        let page_id = self.stack[level].0;
        let page = w.read(page_id)?;
        let min_keys = min_keys(&page);
        if page.fill() >= FILL_THRESHOLD && page.count() >= min_keys {
            return Ok(());
        }
        if level == 0 {
            return self.collapse_root(w, rec);
        }

        let (parent_id, index) = self.stack[level - 1];
        let mut parent = w.read(parent_id)?;
        if parent.count() < 2 {
            return Ok(());
        }

        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling = w.read(parent.child(sibling_index)?)?;
        let (left_index, right_index) = if sibling_index < index {
            (sibling_index, index)
        } else {
            (index, sibling_index)
        };

        let separator_len = if page.is_branch() {
            parent.key(right_index)?.len()
        } else {
            0
        };
        let mergeable = page.used() + sibling.used() + separator_len
            <= page.page_size() - PAGE_HEADER_SIZE;
        let can_lend = sibling.count() > min_keys
            && (sibling.fill() >= FILL_THRESHOLD || !mergeable);

        if !can_lend && !mergeable {
            return Ok(());
        }

        // Only now copy the sibling; the parent is already dirty
        let sibling_copy = w.touch(sibling.id())?;
        if sibling_copy != sibling.id() {
            parent.set_child(sibling_index, sibling_copy)?;
            w.write(parent)?;
        }

        if can_lend {
            self.borrow(w, rec, level, index, sibling_index)
        } else {
            self.merge(w, rec, level, left_index, right_index)?;
            self.rebalance(w, rec, level - 1)
        }
    }

    /// Drop an empty root leaf, or promote the only child of a root branch
    fn collapse_root<W: PageWrite>(&mut self, w: &mut W, rec: &mut BucketRecord) -> Result<()> {
        loop {
            let root = w.read(rec.root)?;
            if root.is_leaf() {
                if root.count() == 0 {
                    w.free(rec.root, 1)?;
                    rec.root = INVALID_PAGE;
                    rec.depth = 0;
                    rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
                }
                return Ok(());
            }
            if root.count() != 1 {
                return Ok(());
            }

            let child = root.child(0)?;
            w.free(rec.root, 1)?;
            rec.root = child;
            rec.depth = rec.depth.saturating_sub(1);
            rec.branch_pages = rec.branch_pages.saturating_sub(1);
            if !self.stack.is_empty() {
                self.stack.remove(0);
            }
        }
    }

    /// Move one node from the sibling into the underfull page
    fn borrow<W: PageWrite>(
        &mut self,
        w: &mut W,
        rec: &mut BucketRecord,
        level: usize,
        index: usize,
        sibling_index: usize,
    ) -> Result<()> {
        let parent = w.read(self.stack[level - 1].0)?;
        let mut page = w.read(parent.child(index)?)?;
        let mut sibling = w.read(parent.child(sibling_index)?)?;

        let (separator_index, separator) = if sibling_index < index {
            // Last node of the left sibling becomes our first
            let last = sibling.count() - 1;
            let moved = sibling.node(last)?.to_vec();
            sibling.remove_node(last)?;

            if page.is_leaf() {
                let key = decode_leaf(&moved)?.key.to_vec();
                page.insert_node(0, &moved)?;
                (index, key)
            } else {
                let (key, child) = decode_branch(&moved)?;
                let key = key.to_vec();
                let old_separator = parent.key(index)?.to_vec();
                make_first_explicit(&mut page, &old_separator)?;
                page.insert_node(0, &encode_branch(&[], child))?;
                (index, key)
            }
        } else {
            // First node of the right sibling becomes our last
            let moved = sibling.node(0)?.to_vec();
            sibling.remove_node(0)?;

            if page.is_leaf() {
                page.insert_node(page.count(), &moved)?;
                (sibling_index, sibling.key(0)?.to_vec())
            } else {
                let (_, child) = decode_branch(&moved)?;
                let old_separator = parent.key(sibling_index)?.to_vec();
                page.insert_node(page.count(), &encode_branch(&old_separator, child))?;

                let (next_key, next_child) = decode_branch(sibling.node(0)?)?;
                let next_key = next_key.to_vec();
                sibling.remove_node(0)?;
                sibling.insert_node(0, &encode_branch(&[], next_child))?;
                (sibling_index, next_key)
            }
        };

        w.write(page)?;
        w.write(sibling)?;
        self.set_separator(w, rec, level - 1, separator_index, &separator)
    }

    /// Fold the right page of the pair into the left one
    fn merge<W: PageWrite>(
        &mut self,
        w: &mut W,
        rec: &mut BucketRecord,
        level: usize,
        left_index: usize,
        right_index: usize,
    ) -> Result<()> {
        let parent_id = self.stack[level - 1].0;
        let mut parent = w.read(parent_id)?;
        let right_id = parent.child(right_index)?;
        let mut left = w.read(parent.child(left_index)?)?;
        let right = w.read(right_id)?;

        let mut nodes = right.nodes()?;
        if right.is_branch() && !nodes.is_empty() {
            let (_, child) = decode_branch(&nodes[0])?;
            nodes[0] = encode_branch(parent.key(right_index)?, child);
        }
        let base = left.count();
        for (i, node) in nodes.iter().enumerate() {
            left.insert_node(base + i, node)?;
        }
        w.write(left)?;

        parent.remove_node(right_index)?;
        w.write(parent)?;
        w.free(right_id, 1)?;

        if right.is_leaf() {
            rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
        } else {
            rec.branch_pages = rec.branch_pages.saturating_sub(1);
        }
        tracing::trace!("Merged page {} into its left sibling", right_id);
        Ok(())
    }

    /// Rewrite the key of branch node `index` on the page at `level`
    fn set_separator<W: PageWrite>(
        &mut self,
        w: &mut W,
        rec: &mut BucketRecord,
        level: usize,
        index: usize,
        key: &[u8],
    ) -> Result<()> {
        let mut page = w.read(self.stack[level].0)?;
        let child = page.child(index)?;
        page.remove_node(index)?;
        w.write(page)?;
        self.insert_at(w, rec, level, index, &encode_branch(key, child))
    }
}

fn min_keys(page: &Page) -> usize {
    if page.is_leaf() {
        1
    } else {
        MIN_PAGE_KEYS
    }
}

/// Give node 0 of a branch page a real key before a node is put in front
fn make_first_explicit(page: &mut Page, key: &[u8]) -> Result<()> {
    let child = page.child(0)?;
    page.remove_node(0)?;
    page.insert_node(0, &encode_branch(key, child))
}
