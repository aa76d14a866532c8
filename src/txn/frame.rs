//! Transaction frames and page access
//!
//! A write transaction keeps a stack of frames: the top-level frame plus at
//! most one nested child. Each frame owns the pages it has copied, its own
//! view of the allocator and the bucket records it works with. Page lookups
//! walk the frames top-down and fall back to the mapped file.

use std::collections::{HashMap, HashSet};

use crate::btree::{read_overflow, KeyOrder, PageRead, PageWrite, TreeCursor};
use crate::error::{Result, StrataError};
use crate::freelist::{record_key, FreeList, FreeRecord};
use crate::page::{BucketRecord, LeafValue, Meta, Page, PageId};
use crate::store::PageStore;

/// A bucket opened in a transaction
#[derive(Debug, Clone)]
pub(crate) struct BucketSlot {
    /// Unique within the transaction; slot indices are reused after a
    /// nested abort, ids never are
    pub id: u64,
    pub name: String,
    pub record: BucketRecord,
    /// Record changed since it was loaded from the main tree
    pub dirty: bool,
    pub dropped: bool,
}

/// Working state of one transaction level
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub dirty: HashMap<PageId, Page>,
    /// Pages allocated by this frame
    pub fresh: HashSet<PageId>,
    /// Pages an outer frame allocated that this frame released; the outer
    /// copies are dropped when this frame is merged
    pub loosed: HashSet<PageId>,
    pub freelist: FreeList,
    /// First page number past the end of the file as this frame sees it
    pub next_page: PageId,
    pub free_root: BucketRecord,
    pub main: BucketRecord,
    pub buckets: Vec<BucketSlot>,
}

impl Frame {
    pub fn from_meta(meta: &Meta) -> Self {
        Self {
            dirty: HashMap::new(),
            fresh: HashSet::new(),
            loosed: HashSet::new(),
            freelist: FreeList::new(),
            next_page: meta.last_page + 1,
            free_root: meta.free,
            main: meta.main,
            buckets: Vec::new(),
        }
    }

    /// Start a nested frame: records by value, no pages of its own
    pub fn child(&self) -> Self {
        Self {
            dirty: HashMap::new(),
            fresh: HashSet::new(),
            loosed: HashSet::new(),
            freelist: self.freelist.clone(),
            next_page: self.next_page,
            free_root: self.free_root,
            main: self.main,
            buckets: self.buckets.clone(),
        }
    }

    /// Fold a committed child into this frame
    pub fn merge_child(&mut self, child: Frame) {
        for id in &child.loosed {
            self.dirty.remove(id);
            self.fresh.remove(id);
        }
        self.dirty.extend(child.dirty);
        self.fresh.extend(child.fresh);
        self.freelist = child.freelist;
        self.next_page = child.next_page;
        self.free_root = child.free_root;
        self.main = child.main;
        self.buckets = child.buckets;
    }
}

/// Limits a write context enforces
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Page numbers available under the maximum map size
    pub max_pages: u64,
    pub max_dirty: usize,
    pub max_key_size: usize,
}

fn lookup(frames: &[Frame], store: &PageStore, id: PageId) -> Result<Page> {
    for frame in frames.iter().rev() {
        if let Some(page) = frame.dirty.get(&id) {
            return Ok(page.clone());
        }
    }
    store.read_page(id)
}

// =============================================================================
// Read View
// =============================================================================

/// Pages as one transaction sees them
pub(crate) struct PageView<'a> {
    frames: &'a [Frame],
    store: &'a PageStore,
}

impl<'a> PageView<'a> {
    pub fn new(frames: &'a [Frame], store: &'a PageStore) -> Self {
        Self { frames, store }
    }
}

impl PageRead for PageView<'_> {
    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn read(&self, id: PageId) -> Result<Page> {
        lookup(self.frames, self.store, id)
    }
}

// =============================================================================
// Write Context
// =============================================================================

/// Copy-on-write page access for the top frame of a write transaction
pub(crate) struct WriteCtx<'a> {
    frames: &'a mut Vec<Frame>,
    spilled: &'a mut HashSet<PageId>,
    store: &'a PageStore,
    limits: Limits,
    /// Records with ids below this are safe to reuse
    oldest: u64,
    /// Free-list save in progress: allocate only by extending
    saving: bool,
}

impl<'a> WriteCtx<'a> {
    pub fn new(
        frames: &'a mut Vec<Frame>,
        spilled: &'a mut HashSet<PageId>,
        store: &'a PageStore,
        limits: Limits,
        oldest: u64,
    ) -> Self {
        Self {
            frames,
            spilled,
            store,
            limits,
            oldest,
            saving: false,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn set_saving(&mut self, saving: bool) {
        self.saving = saving;
    }

    pub fn top(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn dirty_count(&self) -> usize {
        self.frames.iter().map(|f| f.dirty.len()).sum()
    }

    fn check_dirty_limit(&self) -> Result<()> {
        if self.dirty_count() >= self.limits.max_dirty {
            return Err(StrataError::TransactionTooBig);
        }
        Ok(())
    }

    /// Pull the next reusable free-list record into the reclaimed set.
    /// Returns false once no record older than the oldest reader remains.
    fn load_record(&mut self) -> Result<bool> {
        let (exhausted, next, root) = {
            let top = self.top();
            (top.freelist.is_exhausted(), top.freelist.next_key(), top.free_root.root)
        };
        if exhausted {
            return Ok(false);
        }
        if next >= self.oldest {
            self.top().freelist.mark_exhausted();
            return Ok(false);
        }

        let mut cursor = TreeCursor::new(KeyOrder::Integer);
        if !cursor.seek_range(&*self, root, &record_key(next))? {
            self.top().freelist.mark_exhausted();
            return Ok(false);
        }

        let (page, index) = cursor.leaf(&*self)?;
        let node = page.leaf(index)?;
        let txnid = u64::from_le_bytes(node.key.try_into().map_err(|_| {
            StrataError::Corrupted(format!("free-list key of {} bytes", node.key.len()))
        })?);
        if txnid >= self.oldest {
            self.top().freelist.mark_exhausted();
            return Ok(false);
        }

        let bytes = match node.value {
            LeafValue::Inline(bytes) => bytes.to_vec(),
            LeafValue::Overflow { page, len } => read_overflow(&*self, page, len)?,
            other => {
                return Err(StrataError::Corrupted(format!(
                    "unexpected free-list value {:?}",
                    other
                )))
            }
        };
        let record = FreeRecord::decode(&bytes)?;
        tracing::trace!("Reclaiming {} pages freed by txn {}", record.pages.len(), txnid);
        self.top().freelist.absorb(txnid, &record.pages);
        Ok(true)
    }
}

impl PageRead for WriteCtx<'_> {
    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn read(&self, id: PageId) -> Result<Page> {
        lookup(self.frames, self.store, id)
    }
}

impl PageWrite for WriteCtx<'_> {
    fn touch(&mut self, id: PageId) -> Result<PageId> {
        let top = self.frames.len() - 1;
        if self.frames[top].dirty.contains_key(&id) {
            return Ok(id);
        }
        self.check_dirty_limit()?;

        // Already owned by this transaction: copy under the same number
        let inherited = self.frames[..top]
            .iter()
            .rev()
            .find_map(|f| f.dirty.get(&id).cloned());
        if let Some(page) = inherited {
            self.frames[top].dirty.insert(id, page);
            return Ok(id);
        }
        if self.spilled.contains(&id) {
            let page = self.store.read_page(id)?;
            self.frames[top].dirty.insert(id, page);
            return Ok(id);
        }

        let mut page = self.store.read_page(id)?;
        let span = page.span();
        let copy = self.alloc(span)?;
        page.set_id(copy);
        self.top().dirty.insert(copy, page);
        self.free(id, span)?;
        Ok(copy)
    }

    fn alloc(&mut self, span: usize) -> Result<PageId> {
        self.check_dirty_limit()?;

        if !self.saving {
            loop {
                if let Some(id) = self.top().freelist.take_run(span) {
                    self.top().fresh.insert(id);
                    return Ok(id);
                }
                if !self.load_record()? {
                    break;
                }
            }
        }

        let max_pages = self.limits.max_pages;
        let top = self.top();
        let id = top.next_page;
        let end = id + span as u64;
        if end > max_pages {
            return Err(StrataError::MapFull);
        }
        top.next_page = end;
        top.fresh.insert(id);
        Ok(id)
    }

    fn write(&mut self, page: Page) -> Result<()> {
        let top = self.top();
        let id = page.id();
        if !top.dirty.contains_key(&id) && !top.fresh.contains(&id) {
            return Err(StrataError::BadTransaction(format!(
                "page {} written without being touched",
                id
            )));
        }
        top.dirty.insert(id, page);
        Ok(())
    }

    fn free(&mut self, id: PageId, span: usize) -> Result<()> {
        let top = self.frames.len() - 1;
        self.frames[top].dirty.remove(&id);
        let fresh_here = self.frames[top].fresh.contains(&id);
        let fresh_below = self.frames[..top].iter().any(|f| f.fresh.contains(&id));
        if self.saving || !(fresh_here || fresh_below) {
            self.frames[top].freelist.free(id, span);
            return Ok(());
        }

        // Loose: never visible outside this transaction, reuse at once
        let frame = &mut self.frames[top];
        frame.freelist.release(id, span);
        if fresh_here {
            frame.fresh.remove(&id);
            self.spilled.remove(&id);
        } else {
            // The outer frame keeps its copy until this one commits
            frame.loosed.insert(id);
        }
        Ok(())
    }
}

/// Write every dirty page of the top-level frame to the file early
pub(crate) fn spill(frame: &mut Frame, spilled: &mut HashSet<PageId>, store: &mut PageStore) -> Result<usize> {
    for page in frame.dirty.values() {
        store.write_page(page)?;
    }
    let count = frame.dirty.len();
    spilled.extend(frame.dirty.drain().map(|(id, _)| id));
    Ok(count)
}
