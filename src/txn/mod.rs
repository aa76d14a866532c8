//! Transaction Manager
//!
//! Read transactions pin a snapshot: the meta record current when they
//! began, registered in the reader table so no page it can reach is reused.
//! Write transactions hold the database's writer lock for their whole life
//! and work on copies of pages (see `frame`), which only become visible when
//! commit flips the meta page.
//!
//! ```text
//! begin_write ──► Frame 0 ──► begin_nested ──► Frame 1
//!                   ▲                            │
//!                   └──── commit_nested (merge) ─┘
//!                         abort_nested  (drop)
//! ```
//!
//! Every mutation bumps the transaction's version so cursors can notice
//! changes made through other handles. Nesting, `reset` and `renew` bump
//! the epoch instead, which retires every cursor opened before.

mod bucket;
mod commit;
mod frame;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::MutexGuard;

use crate::btree::{read_overflow, KeyOrder, TreeCursor};
use crate::cursor::{self, Cursor, PutFlags};
use crate::db::Database;
use crate::error::{Result, StrataError};
use crate::freelist::FreeRecord;
use crate::page::{BucketRecord, LeafValue, Meta, PageId};
use crate::store::{PageStore, ReaderSlot};

pub use bucket::{Bucket, Stat};
pub(crate) use frame::{Limits, PageView, WriteCtx};

use frame::{spill, BucketSlot, Frame};

/// Source of transaction serial numbers; ties bucket handles to their owner
static SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) enum Mode {
    /// `slot` is `None` while the transaction is parked by `reset`
    Read { slot: Option<ReaderSlot> },
    Write,
}

/// Tree a write is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeRef {
    Main,
    Free,
    Bucket(usize),
}

/// Mutable state of one transaction
pub(crate) struct TxnState {
    pub mode: Mode,
    /// Snapshot id for readers, id being written for writers
    pub txnid: u64,
    pub frames: Vec<Frame>,
    pub spilled: HashSet<PageId>,
    /// Free-list records below this id may be reused
    pub oldest: u64,
    pub version: u64,
    /// Id handed to the next bucket slot
    pub next_bucket: u64,
    /// A fatal error hit a write; only abort is left
    pub failed: bool,
    pub finished: bool,
}

impl TxnState {
    fn check_usable(&self) -> Result<()> {
        if self.finished {
            return Err(StrataError::BadTransaction("transaction already finished".into()));
        }
        if let Mode::Read { slot: None } = self.mode {
            return Err(StrataError::BadTransaction("transaction is reset; renew it first".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_usable()?;
        if let Mode::Read { .. } = self.mode {
            return Err(StrataError::ReadOnly);
        }
        if self.failed {
            return Err(StrataError::BadTransaction(
                "an earlier write failed; the transaction must be aborted".into(),
            ));
        }
        Ok(())
    }

    fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn slot(&self, index: usize) -> Result<&BucketSlot> {
        match self.top().buckets.get(index) {
            Some(slot) if !slot.dropped => Ok(slot),
            _ => Err(StrataError::BadBucket),
        }
    }

    /// Slot `index`, provided it still holds the bucket with `id`
    fn slot_with_id(&self, index: usize, id: u64) -> Result<&BucketSlot> {
        match self.slot(index)? {
            slot if slot.id == id => Ok(slot),
            _ => Err(StrataError::BadBucket),
        }
    }

    pub(crate) fn record(&self, tree: TreeRef) -> Result<BucketRecord> {
        match tree {
            TreeRef::Main => Ok(self.top().main),
            TreeRef::Free => Ok(self.top().free_root),
            TreeRef::Bucket(index) => Ok(self.slot(index)?.record),
        }
    }

    fn set_record(&mut self, tree: TreeRef, record: BucketRecord) {
        let top = self.top_mut();
        match tree {
            TreeRef::Main => top.main = record,
            TreeRef::Free => top.free_root = record,
            TreeRef::Bucket(index) => {
                if let Some(slot) = top.buckets.get_mut(index) {
                    if slot.record != record {
                        slot.record = record;
                        slot.dirty = true;
                    }
                }
            }
        }
    }

    pub(crate) fn read_tree<T>(
        &self,
        store: &PageStore,
        tree: TreeRef,
        f: impl FnOnce(&PageView<'_>, &BucketRecord) -> Result<T>,
    ) -> Result<T> {
        self.check_usable()?;
        let record = self.record(tree)?;
        f(&PageView::new(&self.frames, store), &record)
    }

    /// Run a mutation against `tree` and keep the updated record. A fatal
    /// error leaves the transaction failed.
    pub(crate) fn write_tree<T>(
        &mut self,
        store: &PageStore,
        limits: Limits,
        tree: TreeRef,
        f: impl FnOnce(&mut WriteCtx<'_>, &mut BucketRecord) -> Result<T>,
    ) -> Result<T> {
        self.check_writable()?;
        let mut record = self.record(tree)?;

        let result = {
            let mut ctx = WriteCtx::new(&mut self.frames, &mut self.spilled, store, limits, self.oldest);
            f(&mut ctx, &mut record)
        };

        match result {
            Ok(value) => {
                self.set_record(tree, record);
                self.version += 1;
                Ok(value)
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::warn!("Txn {} failed: {}", self.txnid, e);
                    self.failed = true;
                }
                Err(e)
            }
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A read-only or read-write transaction
pub struct Transaction<'db> {
    db: &'db Database,
    serial: u64,
    state: RefCell<TxnState>,
    epoch: Cell<u64>,
    _writer: Option<MutexGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin_read(db: &'db Database) -> Result<Self> {
        let (slot, meta) = db.readers.register(|| {
            let meta = *db.meta.read().current();
            (meta.txnid, meta)
        })?;
        tracing::trace!("Read txn on snapshot {} (slot {})", meta.txnid, slot.index());

        Ok(Self::new(
            db,
            TxnState {
                mode: Mode::Read { slot: Some(slot) },
                txnid: meta.txnid,
                frames: vec![Frame::from_meta(&meta)],
                spilled: HashSet::new(),
                oldest: meta.txnid,
                version: 0,
                next_bucket: 0,
                failed: false,
                finished: false,
            },
            None,
        ))
    }

    pub(crate) fn begin_write(db: &'db Database, writer: MutexGuard<'db, ()>) -> Self {
        let meta: Meta = *db.meta.read().current();
        let txnid = meta.txnid + 1;
        let oldest = db.readers.oldest().map_or(txnid, |o| o.min(txnid));
        tracing::trace!("Write txn {} (oldest reader {})", txnid, oldest);

        Self::new(
            db,
            TxnState {
                mode: Mode::Write,
                txnid,
                frames: vec![Frame::from_meta(&meta)],
                spilled: HashSet::new(),
                oldest,
                version: 0,
                next_bucket: 0,
                failed: false,
                finished: false,
            },
            Some(writer),
        )
    }

    fn new(db: &'db Database, state: TxnState, writer: Option<MutexGuard<'db, ()>>) -> Self {
        Self {
            db,
            serial: SERIAL.fetch_add(1, Ordering::Relaxed),
            state: RefCell::new(state),
            epoch: Cell::new(0),
            _writer: writer,
        }
    }

    /// Snapshot id of a reader, or the id a writer will commit as
    pub fn id(&self) -> u64 {
        self.state.borrow().txnid
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.state.borrow().mode, Mode::Read { .. })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.borrow().version
    }

    fn bump_epoch(&self) {
        self.epoch.set(self.epoch.get() + 1);
    }

    // -------------------------------------------------------------------------
    // Page access for cursors and buckets
    // -------------------------------------------------------------------------

    pub(crate) fn view<T>(
        &self,
        tree: TreeRef,
        f: impl FnOnce(&PageView<'_>, &BucketRecord) -> Result<T>,
    ) -> Result<T> {
        let state = self.state.borrow();
        let store = self.db.store.read();
        state.read_tree(&store, tree, f)
    }

    pub(crate) fn update<T>(
        &self,
        tree: TreeRef,
        f: impl FnOnce(&mut WriteCtx<'_>, &mut BucketRecord) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.borrow_mut();
        state.check_writable()?;
        self.maybe_spill(&mut state)?;

        let store = self.db.store.read();
        state.write_tree(&store, self.db.limits(), tree, f)
    }

    pub(crate) fn view_bucket<T>(
        &self,
        bucket: &Bucket,
        f: impl FnOnce(&PageView<'_>, &BucketRecord) -> Result<T>,
    ) -> Result<T> {
        self.view(self.tree_of(bucket)?, f)
    }

    pub(crate) fn update_bucket<T>(
        &self,
        bucket: &Bucket,
        f: impl FnOnce(&mut WriteCtx<'_>, &mut BucketRecord) -> Result<T>,
    ) -> Result<T> {
        self.update(self.tree_of(bucket)?, f)
    }

    /// Write the whole top-level dirty set early once it grows too large
    fn maybe_spill(&self, state: &mut TxnState) -> Result<()> {
        if state.frames.len() != 1 || state.frames[0].dirty.len() <= self.db.config().spill_threshold {
            return Ok(());
        }

        let mut store = self.db.store.write();
        let TxnState { frames, spilled, .. } = &mut *state;
        match spill(&mut frames[0], spilled, &mut store) {
            Ok(count) => {
                tracing::debug!("Txn {} spilled {} dirty pages", state.txnid, count);
                Ok(())
            }
            Err(e) => {
                state.failed = true;
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Key/Value Operations
    // -------------------------------------------------------------------------

    /// Value stored under `key`; the first duplicate in a `DUP_SORT` bucket
    pub fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Vec<u8>> {
        self.view_bucket(bucket, |src, rec| cursor::get(src, rec, key))
    }

    pub fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        self.update_bucket(bucket, |w, rec| {
            let max_key_size = w.limits().max_key_size;
            cursor::put(w, rec, key, value, flags, max_key_size)
        })
    }

    /// Delete `key`. With `value` in a `DUP_SORT` bucket only that
    /// duplicate goes; elsewhere `value` is ignored.
    pub fn del(&self, bucket: &Bucket, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.update_bucket(bucket, |w, rec| cursor::delete(w, rec, key, value))
    }

    /// Open a cursor over `bucket`
    pub fn cursor(&self, bucket: &Bucket) -> Result<Cursor<'_, 'db>> {
        Cursor::new(self, *bucket)
    }

    /// Pages recorded in the free list as seen by this transaction
    pub fn free_page_count(&self) -> Result<u64> {
        self.view(TreeRef::Free, |src, rec| {
            let mut tree = TreeCursor::new(KeyOrder::Integer);
            let mut total = 0u64;
            let mut more = tree.first(src, rec.root)?;
            while more {
                let (page, index) = tree.leaf(src)?;
                let bytes = match page.leaf(index)?.value {
                    LeafValue::Inline(bytes) => bytes.to_vec(),
                    LeafValue::Overflow { page, len } => read_overflow(src, page, len)?,
                    other => {
                        return Err(StrataError::Corrupted(format!(
                            "unexpected free-list value {:?}",
                            other
                        )))
                    }
                };
                total += FreeRecord::decode(&bytes)?.pages.len() as u64;
                more = tree.next(src)?;
            }
            Ok(total)
        })
    }

    // -------------------------------------------------------------------------
    // Nested Transactions
    // -------------------------------------------------------------------------

    /// Start a child of this write transaction. Only one child may be
    /// active; cursors opened so far become stale.
    pub fn begin_nested(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_writable()?;
        if state.frames.len() > 1 {
            return Err(StrataError::BadTransaction("a nested transaction is already active".into()));
        }
        let child = state.frames[0].child();
        state.frames.push(child);
        self.bump_epoch();
        tracing::trace!("Txn {} began a nested transaction", state.txnid);
        Ok(())
    }

    /// Fold the active child into its parent
    pub fn commit_nested(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_writable()?;
        if state.frames.len() < 2 {
            return Err(StrataError::BadTransaction("no nested transaction is active".into()));
        }
        if let Some(child) = state.frames.pop() {
            state.frames[0].merge_child(child);
        }
        state.version += 1;
        self.bump_epoch();
        Ok(())
    }

    /// Throw away everything the active child did
    pub fn abort_nested(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_usable()?;
        if state.frames.len() < 2 {
            return Err(StrataError::BadTransaction("no nested transaction is active".into()));
        }
        state.frames.pop();
        // A fatal error inside the child leaves the parent untouched
        state.failed = false;
        state.version += 1;
        self.bump_epoch();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reader Reuse
    // -------------------------------------------------------------------------

    /// Release the snapshot of a read transaction but keep the handle
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_usable()?;
        let Mode::Read { slot } = &mut state.mode else {
            return Err(StrataError::BadTransaction("only read transactions can be reset".into()));
        };
        if let Some(slot) = slot.take() {
            self.db.readers.unregister(slot);
        }
        self.bump_epoch();
        Ok(())
    }

    /// Resume a reset read transaction on the latest snapshot
    pub fn renew(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.finished {
            return Err(StrataError::BadTransaction("transaction already finished".into()));
        }
        match state.mode {
            Mode::Read { slot: None } => {}
            Mode::Read { .. } => {
                return Err(StrataError::BadTransaction("transaction must be reset before renew".into()))
            }
            Mode::Write => {
                return Err(StrataError::BadTransaction("only read transactions can be renewed".into()))
            }
        }

        let (slot, meta) = self.db.readers.register(|| {
            let meta = *self.db.meta.read().current();
            (meta.txnid, meta)
        })?;

        let buckets = std::mem::take(&mut state.frames[0].buckets);
        state.mode = Mode::Read { slot: Some(slot) };
        state.txnid = meta.txnid;
        state.oldest = meta.txnid;
        state.frames = vec![Frame::from_meta(&meta)];
        state.version += 1;
        drop(state);

        self.reload_buckets(buckets)?;
        self.bump_epoch();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------------

    /// Make every change durable and visible. A failed commit leaves the
    /// database as it was before the transaction.
    pub fn commit(self) -> Result<()> {
        let result = {
            let mut state = self.state.borrow_mut();
            let result = match state.mode {
                Mode::Write => commit::commit(self.db, &mut state),
                Mode::Read { .. } => state.check_usable(),
            };
            self.release(&mut state);
            result
        };
        if let Err(e) = &result {
            tracing::warn!("Commit failed: {}", e);
        }
        result
    }

    /// Discard every change
    pub fn abort(self) {
        let mut state = self.state.borrow_mut();
        tracing::trace!("Txn {} aborted", state.txnid);
        self.release(&mut state);
    }

    fn release(&self, state: &mut TxnState) {
        if state.finished {
            return;
        }
        if let Mode::Read { slot } = &mut state.mode {
            if let Some(slot) = slot.take() {
                self.db.readers.unregister(slot);
            }
        }
        state.frames.clear();
        state.spilled.clear();
        state.finished = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        self.release(&mut state);
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Transaction")
            .field("txnid", &state.txnid)
            .field("mode", &state.mode)
            .field("nested", &(state.frames.len() > 1))
            .field("finished", &state.finished)
            .finish()
    }
}
