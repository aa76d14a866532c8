//! Insertion and page splits

use crate::error::{Result, StrataError};
use crate::page::{
    decode_branch, decode_leaf, encode_branch, BucketRecord, Page, PageKind, PAGE_HEADER_SIZE,
    SLOT_SIZE,
};

use super::{PageWrite, TreeCursor};

impl TreeCursor {
    /// Copy every page on the path into the dirty set, rewiring child
    /// pointers (and the root) to the copies.
    pub fn touch_path<W: PageWrite>(&mut self, w: &mut W, rec: &mut BucketRecord) -> Result<()> {
        for level in 0..self.stack.len() {
            let (id, _) = self.stack[level];
            let copy = w.touch(id)?;
            if copy == id {
                continue;
            }

            self.stack[level].0 = copy;
            if level == 0 {
                rec.root = copy;
            } else {
                let (parent_id, index) = self.stack[level - 1];
                let mut parent = w.read(parent_id)?;
                parent.set_child(index, copy)?;
                w.write(parent)?;
            }
        }
        Ok(())
    }

    /// Insert an encoded leaf node at the position found by `search`
    pub fn insert<W: PageWrite>(&mut self, w: &mut W, rec: &mut BucketRecord, node: &[u8]) -> Result<()> {
        if rec.is_empty() {
            let id = w.alloc(1)?;
            let mut leaf = Page::new(id, PageKind::Leaf, w.page_size());
            leaf.insert_node(0, node)?;
            w.write(leaf)?;

            rec.root = id;
            rec.depth = 1;
            rec.leaf_pages = 1;
            self.stack = vec![(id, 0)];
            return Ok(());
        }

        let Some(&(_, index)) = self.stack.last() else {
            return Err(StrataError::BadTransaction("insert on an unpositioned cursor".into()));
        };
        self.touch_path(w, rec)?;
        self.insert_at(w, rec, self.stack.len() - 1, index, node)
    }

    /// Replace the leaf node under the cursor
    pub fn replace<W: PageWrite>(&mut self, w: &mut W, rec: &mut BucketRecord, node: &[u8]) -> Result<()> {
        let Some(&(_, index)) = self.stack.last() else {
            return Err(StrataError::BadTransaction("replace on an unpositioned cursor".into()));
        };
        self.touch_path(w, rec)?;

        let level = self.stack.len() - 1;
        let mut page = w.read(self.stack[level].0)?;
        page.remove_node(index)?;
        w.write(page)?;
        self.insert_at(w, rec, level, index, node)
    }

    pub(super) fn insert_at<W: PageWrite>(
        &mut self,
        w: &mut W,
        rec: &mut BucketRecord,
        level: usize,
        index: usize,
        node: &[u8],
    ) -> Result<()> {
        let mut page = w.read(self.stack[level].0)?;
        if page.fits(node.len()) {
            page.insert_node(index, node)?;
            self.stack[level].1 = index;
            return w.write(page);
        }
        self.split(w, rec, level, index, node)
    }

    /// Split the page at `level` while inserting `node` at `index`. The
    /// upper part moves to a new right sibling whose separator is inserted
    /// into the parent, splitting upwards as needed.
    fn split<W: PageWrite>(
        &mut self,
        w: &mut W,
        rec: &mut BucketRecord,
        level: usize,
        index: usize,
        node: &[u8],
    ) -> Result<()> {
        let page_size = w.page_size();
        let left_id = self.stack[level].0;
        let mut left = w.read(left_id)?;
        let is_leaf = left.is_leaf();

        let mut nodes = left.nodes()?;
        nodes.insert(index, node.to_vec());
        let at = split_point(&nodes, page_size).ok_or_else(|| {
            StrataError::Corrupted(format!("no valid split point on page {}", left_id))
        })?;
        let mut right_nodes = nodes.split_off(at);

        let separator = if is_leaf {
            decode_leaf(&right_nodes[0])?.key.to_vec()
        } else {
            // The first key of a branch page is implicit
            let (key, child) = decode_branch(&right_nodes[0])?;
            let key = key.to_vec();
            right_nodes[0] = encode_branch(&[], child);
            key
        };

        let right_id = w.alloc(1)?;
        let kind = if is_leaf { PageKind::Leaf } else { PageKind::Branch };
        let mut right = Page::new(right_id, kind, page_size);
        right.rebuild(&right_nodes)?;
        left.rebuild(&nodes)?;
        w.write(left)?;
        w.write(right)?;

        if is_leaf {
            rec.leaf_pages += 1;
        } else {
            rec.branch_pages += 1;
        }

        let separator_node = encode_branch(&separator, right_id);
        if level == 0 {
            let root_id = w.alloc(1)?;
            let mut root = Page::new(root_id, PageKind::Branch, page_size);
            root.insert_node(0, &encode_branch(&[], left_id))?;
            root.insert_node(1, &separator_node)?;
            w.write(root)?;

            rec.root = root_id;
            rec.depth += 1;
            rec.branch_pages += 1;
            tracing::trace!("Root split: new root {} (depth {})", root_id, rec.depth);
        } else {
            let parent_index = self.stack[level - 1].1;
            self.insert_at(w, rec, level - 1, parent_index + 1, &separator_node)?;
        }

        self.stack.clear();
        Ok(())
    }
}

/// Index at which to cut `nodes` so both halves fit a page: the count
/// midpoint, or the nearest index to it that works.
fn split_point(nodes: &[Vec<u8>], page_size: usize) -> Option<usize> {
    let capacity = page_size - PAGE_HEADER_SIZE;
    let mut prefix = Vec::with_capacity(nodes.len() + 1);
    prefix.push(0usize);
    for node in nodes {
        prefix.push(prefix[prefix.len() - 1] + node.len() + SLOT_SIZE);
    }
    let total = prefix[nodes.len()];
    let fits = |at: usize| prefix[at] <= capacity && total - prefix[at] <= capacity;

    let count = nodes.len();
    let mid = count / 2;
    (0..count)
        .flat_map(|d| [mid.checked_sub(d), mid.checked_add(d)])
        .flatten()
        .find(|&at| at >= 1 && at < count && fits(at))
}
