//! Cursor Module
//!
//! Public cursors over one bucket of a transaction. A cursor remembers the
//! key and value it stands on, so it survives changes made through other
//! handles of the same transaction: whenever the transaction's version moves
//! on, the cursor finds its entry again before doing anything else.
//!
//! After `delete` the cursor sits in the gap the entry left behind. `next`
//! then yields the entry that followed it and `prev` the one before.

mod dup;
mod write;

use std::ops::BitOr;

use crate::btree::{KeyOrder, TreeCursor};
use crate::error::{Result, StrataError};
use crate::page::{BucketFlags, BucketRecord};
use crate::txn::{Bucket, PageView, Transaction};

use dup::{DupPos, Edge};

pub(crate) use write::{check_key, delete, get, plain_value, put};

/// Flags for `put`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PutFlags(u32);

impl PutFlags {
    /// Fail with `KeyExists` if the key is already present
    pub const NO_OVERWRITE: PutFlags = PutFlags(0x10);
    /// Fail with `KeyExists` if the exact key/value pair is present
    pub const NO_DUP_DATA: PutFlags = PutFlags(0x20);

    pub const fn empty() -> Self {
        PutFlags(0)
    }

    pub fn contains(self, other: PutFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PutFlags {
    type Output = PutFlags;

    fn bitor(self, rhs: PutFlags) -> PutFlags {
        PutFlags(self.0 | rhs.0)
    }
}

/// A key and its value
pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Unset,
    Entry,
    /// Where a deleted entry used to be
    Gap,
}

/// Positioned iterator over one bucket
pub struct Cursor<'t, 'db> {
    txn: &'t Transaction<'db>,
    bucket: Bucket,
    flags: BucketFlags,
    epoch: u64,
    version: u64,
    tree: TreeCursor,
    dup: DupPos,
    position: Position,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl<'t, 'db> Cursor<'t, 'db> {
    pub(crate) fn new(txn: &'t Transaction<'db>, bucket: Bucket) -> Result<Self> {
        let flags = txn.bucket_flags(&bucket)?;
        Ok(Self {
            txn,
            bucket,
            flags,
            epoch: txn.epoch(),
            version: txn.version(),
            tree: TreeCursor::new(KeyOrder::for_keys(flags)),
            dup: DupPos::Single,
            position: Position::Unset,
            key: Vec::new(),
            value: Vec::new(),
        })
    }

    /// Bucket this cursor walks
    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    // -------------------------------------------------------------------------
    // Positioning
    // -------------------------------------------------------------------------

    pub fn first(&mut self) -> Result<Entry> {
        self.read(|c, src, rec| {
            if !c.tree.first(src, rec.root)? {
                c.position = Position::Unset;
                return Err(StrataError::NotFound);
            }
            c.load(src, Edge::First)?;
            Ok(c.entry())
        })
    }

    pub fn last(&mut self) -> Result<Entry> {
        self.read(|c, src, rec| {
            if !c.tree.last(src, rec.root)? {
                c.position = Position::Unset;
                return Err(StrataError::NotFound);
            }
            c.load(src, Edge::Last)?;
            Ok(c.entry())
        })
    }

    /// Next entry, stepping through duplicates before moving to the next key
    pub fn next(&mut self) -> Result<Entry> {
        self.read(|c, src, rec| {
            match c.position {
                Position::Unset => {
                    if !c.tree.first(src, rec.root)? {
                        return Err(StrataError::NotFound);
                    }
                    c.load(src, Edge::First)?;
                }
                Position::Entry => {
                    if c.dup.step(src, true)? {
                        c.refresh_value(src)?;
                    } else if c.tree.next(src)? {
                        c.load(src, Edge::First)?;
                    } else {
                        return Err(StrataError::NotFound);
                    }
                }
                Position::Gap => {
                    let (key, value) = (c.key.clone(), c.value.clone());
                    if !c.seek_at_least(src, rec, &key, Some(value.as_slice()))? {
                        return Err(StrataError::NotFound);
                    }
                }
            }
            Ok(c.entry())
        })
    }

    pub fn prev(&mut self) -> Result<Entry> {
        self.read(|c, src, rec| {
            match c.position {
                Position::Unset => {
                    if !c.tree.last(src, rec.root)? {
                        return Err(StrataError::NotFound);
                    }
                    c.load(src, Edge::Last)?;
                }
                Position::Entry => {
                    if c.dup.step(src, false)? {
                        c.refresh_value(src)?;
                    } else if c.tree.prev(src)? {
                        c.load(src, Edge::Last)?;
                    } else {
                        return Err(StrataError::NotFound);
                    }
                }
                Position::Gap => {
                    let (key, value) = (c.key.clone(), c.value.clone());
                    c.seek_below(src, rec, &key, Some(value.as_slice()))?;
                }
            }
            Ok(c.entry())
        })
    }

    /// Entry under the cursor
    pub fn current(&mut self) -> Result<Entry> {
        self.read(|c, _, _| match c.position {
            Position::Entry => Ok(c.entry()),
            _ => Err(StrataError::NotFound),
        })
    }

    /// Position at `key`; the first of its duplicates in a `DUP_SORT` bucket
    pub fn seek(&mut self, key: &[u8]) -> Result<Entry> {
        self.read(|c, src, rec| {
            if !c.tree.search(src, rec.root, key)? {
                c.position = Position::Unset;
                return Err(StrataError::NotFound);
            }
            c.load(src, Edge::First)?;
            Ok(c.entry())
        })
    }

    /// Position at the first key `>= key`
    pub fn seek_range(&mut self, key: &[u8]) -> Result<Entry> {
        self.read(|c, src, rec| {
            if !c.seek_at_least(src, rec, key, None)? {
                c.position = Position::Unset;
                return Err(StrataError::NotFound);
            }
            Ok(c.entry())
        })
    }

    /// Position at the exact key/value pair
    pub fn seek_both(&mut self, key: &[u8], value: &[u8]) -> Result<Entry> {
        self.read(|c, src, rec| {
            let order = KeyOrder::for_keys(c.flags);
            let dup_order = KeyOrder::for_dups(c.flags);
            let found = c.seek_at_least(src, rec, key, Some(value))?
                && order.compare(&c.key, key).is_eq()
                && dup_order.compare(&c.value, value).is_eq();
            if !found {
                c.position = Position::Unset;
                return Err(StrataError::NotFound);
            }
            Ok(c.entry())
        })
    }

    // -------------------------------------------------------------------------
    // Duplicates
    // -------------------------------------------------------------------------

    pub fn first_dup(&mut self) -> Result<Entry> {
        self.dup_edge(Edge::First)
    }

    pub fn last_dup(&mut self) -> Result<Entry> {
        self.dup_edge(Edge::Last)
    }

    /// Next duplicate of the current key
    pub fn next_dup(&mut self) -> Result<Entry> {
        self.dup_step(true)
    }

    /// Previous duplicate of the current key
    pub fn prev_dup(&mut self) -> Result<Entry> {
        self.dup_step(false)
    }

    /// First duplicate of the next key
    pub fn next_nodup(&mut self) -> Result<Entry> {
        self.read(|c, src, rec| {
            match c.position {
                Position::Unset => {
                    if !c.tree.first(src, rec.root)? {
                        return Err(StrataError::NotFound);
                    }
                }
                Position::Entry => {
                    if !c.tree.next(src)? {
                        return Err(StrataError::NotFound);
                    }
                }
                Position::Gap => {
                    let key = c.key.clone();
                    if !c.tree.seek_range(src, rec.root, &key)? {
                        return Err(StrataError::NotFound);
                    }
                    let (page, index) = c.tree.leaf(src)?;
                    let same = c.tree.order().compare(page.key(index)?, &key).is_eq();
                    if same && !c.tree.next(src)? {
                        c.position = Position::Gap;
                        return Err(StrataError::NotFound);
                    }
                }
            }
            c.load(src, Edge::First)?;
            Ok(c.entry())
        })
    }

    /// Last duplicate of the previous key
    pub fn prev_nodup(&mut self) -> Result<Entry> {
        self.read(|c, src, rec| {
            match c.position {
                Position::Unset => {
                    if !c.tree.last(src, rec.root)? {
                        return Err(StrataError::NotFound);
                    }
                }
                Position::Entry => {
                    if !c.tree.prev(src)? {
                        return Err(StrataError::NotFound);
                    }
                }
                Position::Gap => {
                    let key = c.key.clone();
                    let found = if c.tree.seek_range(src, rec.root, &key)? {
                        c.tree.prev(src)?
                    } else {
                        c.tree.last(src, rec.root)?
                    };
                    if !found {
                        return Err(StrataError::NotFound);
                    }
                    let (page, index) = c.tree.leaf(src)?;
                    if c.tree.order().compare(page.key(index)?, &key).is_ge() {
                        return Err(StrataError::NotFound);
                    }
                }
            }
            c.load(src, Edge::Last)?;
            Ok(c.entry())
        })
    }

    /// Number of values stored under the current key
    pub fn count(&mut self) -> Result<u64> {
        self.read(|c, _, _| match c.position {
            Position::Entry => Ok(c.dup.count()),
            _ => Err(StrataError::NotFound),
        })
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Store `value` under `key` and position the cursor on it
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        self.check_epoch()?;
        self.txn.update_bucket(&self.bucket, |w, rec| {
            let max_key_size = w.limits().max_key_size;
            put(w, rec, key, value, flags, max_key_size)
        })?;

        let dup = self.flags.is_dup().then_some(value);
        self.read(|c, src, rec| {
            if !c.seek_at_least(src, rec, key, dup)? {
                return Err(StrataError::Corrupted("entry vanished after put".into()));
            }
            Ok(())
        })
    }

    /// Delete the entry under the cursor; only that value in a `DUP_SORT`
    /// bucket
    pub fn delete(&mut self) -> Result<()> {
        self.delete_entry(false)
    }

    /// Delete the current key together with all of its duplicates
    pub fn delete_dups(&mut self) -> Result<()> {
        self.delete_entry(true)
    }

    /// Release the cursor
    pub fn close(self) {}

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn check_epoch(&self) -> Result<()> {
        if self.epoch != self.txn.epoch() {
            return Err(StrataError::StaleCursor);
        }
        Ok(())
    }

    /// Run `f` against the transaction's view of the bucket, after finding
    /// the cursor's entry again if the transaction changed underneath it
    fn read<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &PageView<'_>, &BucketRecord) -> Result<T>,
    ) -> Result<T> {
        self.check_epoch()?;
        let txn = self.txn;
        let bucket = self.bucket;
        let version = txn.version();

        txn.view_bucket(&bucket, |src, rec| {
            if self.version != version {
                self.version = version;
                self.resync(src, rec)?;
            }
            f(self, src, rec)
        })
    }

    fn resync(&mut self, src: &PageView<'_>, rec: &BucketRecord) -> Result<()> {
        if self.position != Position::Entry {
            return Ok(());
        }
        let (key, value) = (self.key.clone(), self.value.clone());
        let dup = self.flags.is_dup().then_some(value.as_slice());
        if self.seek_at_least(src, rec, &key, dup)?
            && self.tree.order().compare(&self.key, &key).is_eq()
            && (dup.is_none() || KeyOrder::for_dups(self.flags).compare(&self.value, &value).is_eq())
        {
            return Ok(());
        }

        // Gone: behave as if it had been deleted here
        self.key = key;
        self.value = value;
        self.position = Position::Gap;
        Ok(())
    }

    fn delete_entry(&mut self, all: bool) -> Result<()> {
        // Make sure the entry still exists
        self.current()?;

        let key = self.key.clone();
        let value = (self.flags.is_dup() && !all).then(|| self.value.clone());
        self.txn
            .update_bucket(&self.bucket, |w, rec| delete(w, rec, &key, value.as_deref()))?;

        self.position = Position::Gap;
        self.tree.reset();
        self.dup = DupPos::Single;
        self.version = self.txn.version();
        Ok(())
    }

    fn dup_edge(&mut self, edge: Edge) -> Result<Entry> {
        self.require_dup()?;
        self.read(|c, src, _| {
            if c.position != Position::Entry {
                return Err(StrataError::NotFound);
            }
            c.dup.edge(src, edge)?;
            c.refresh_value(src)?;
            Ok(c.entry())
        })
    }

    fn dup_step(&mut self, forward: bool) -> Result<Entry> {
        self.require_dup()?;
        self.read(|c, src, _| {
            if c.position != Position::Entry || !c.dup.step(src, forward)? {
                return Err(StrataError::NotFound);
            }
            c.refresh_value(src)?;
            Ok(c.entry())
        })
    }

    fn require_dup(&self) -> Result<()> {
        if !self.flags.is_dup() {
            return Err(StrataError::IncompatibleFlags);
        }
        Ok(())
    }

    fn entry(&self) -> Entry {
        (self.key.clone(), self.value.clone())
    }

    /// Read the node under the tree cursor into the cursor
    fn load(&mut self, src: &PageView<'_>, edge: Edge) -> Result<()> {
        let (page, index) = self.tree.leaf(src)?;
        let node = page.leaf(index)?;
        self.key = node.key.to_vec();
        if self.flags.is_dup() {
            self.dup = DupPos::open(src, self.flags, &node.value, edge)?;
            self.refresh_value(src)?;
        } else {
            self.dup = DupPos::Single;
            self.value = plain_value(src, &node.value)?;
        }
        self.position = Position::Entry;
        Ok(())
    }

    fn refresh_value(&mut self, src: &PageView<'_>) -> Result<()> {
        if let Some(value) = self.dup.current(src)? {
            self.value = value;
        }
        Ok(())
    }

    /// Position at the first entry at or after `(key, value)`
    fn seek_at_least(
        &mut self,
        src: &PageView<'_>,
        rec: &BucketRecord,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        if !self.tree.seek_range(src, rec.root, key)? {
            return Ok(false);
        }

        let (page, index) = self.tree.leaf(src)?;
        let node = page.leaf(index)?;
        let same_key = self.tree.order().compare(node.key, key).is_eq();

        match value {
            Some(target) if same_key && self.flags.is_dup() => {
                if let Some((pos, _)) = DupPos::open_at(src, self.flags, &node.value, target)? {
                    self.key = node.key.to_vec();
                    self.dup = pos;
                    self.refresh_value(src)?;
                    self.position = Position::Entry;
                    return Ok(true);
                }
                if !self.tree.next(src)? {
                    return Ok(false);
                }
                self.load(src, Edge::First)?;
            }
            _ => self.load(src, Edge::First)?,
        }
        Ok(true)
    }

    /// Position at the last entry before `(key, value)`
    fn seek_below(
        &mut self,
        src: &PageView<'_>,
        rec: &BucketRecord,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        if self.seek_at_least(src, rec, key, value)? {
            if self.dup.step(src, false)? {
                return self.refresh_value(src);
            }
            if self.tree.prev(src)? {
                return self.load(src, Edge::Last);
            }
            self.position = Position::Gap;
            return Err(StrataError::NotFound);
        }

        if !self.tree.last(src, rec.root)? {
            return Err(StrataError::NotFound);
        }
        self.load(src, Edge::Last)
    }
}

impl std::fmt::Debug for Cursor<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("bucket", &self.bucket)
            .field("position", &self.position)
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish()
    }
}
