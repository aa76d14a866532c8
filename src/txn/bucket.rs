//! Named buckets
//!
//! Each bucket is a tree of its own whose root record is stored in the main
//! tree under the bucket's name. A transaction opens a bucket into a slot of
//! its top frame and works on the slot's copy of the record; changed records
//! are written back to the main tree at commit.

use crate::btree::{free_tree, KeyOrder, PageRead, PageWrite, TreeCursor};
use crate::cursor::check_key;
use crate::error::{Result, StrataError};
use crate::page::{encode_leaf, BucketFlags, BucketRecord, LeafValue};

use super::frame::BucketSlot;
use super::{Transaction, TreeRef};

/// Handle to a bucket opened in one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    slot: usize,
    id: u64,
    owner: u64,
    flags: BucketFlags,
}

impl Bucket {
    pub fn flags(&self) -> BucketFlags {
        self.flags
    }
}

/// Size statistics of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: usize,
    pub depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
}

impl<'db> Transaction<'db> {
    /// Open `name`, creating it with `flags` if it does not exist yet
    pub fn create_bucket(&self, name: &str, flags: BucketFlags) -> Result<Bucket> {
        flags.validate()?;
        self.check_name(name)?;

        if let Some(bucket) = self.find_open(name)? {
            if bucket.flags != flags {
                return Err(StrataError::IncompatibleFlags);
            }
            return Ok(bucket);
        }

        match self.lookup(name)? {
            Some(record) => {
                if record.flags != flags {
                    return Err(StrataError::IncompatibleFlags);
                }
                self.check_capacity()?;
                Ok(self.attach(name, record))
            }
            None => {
                if self.is_read_only() {
                    return Err(StrataError::ReadOnly);
                }
                self.check_capacity()?;

                let record = BucketRecord::empty(flags);
                self.update(TreeRef::Main, |w, main| put_record(w, main, name, &record))?;
                tracing::debug!("Created bucket {:?} ({:#x})", name, flags.bits());
                Ok(self.attach(name, record))
            }
        }
    }

    /// Open an existing bucket
    pub fn open_bucket(&self, name: &str) -> Result<Bucket> {
        self.check_name(name)?;
        if let Some(bucket) = self.find_open(name)? {
            return Ok(bucket);
        }
        let record = self.lookup(name)?.ok_or(StrataError::NotFound)?;
        self.check_capacity()?;
        Ok(self.attach(name, record))
    }

    /// Delete a bucket and release all of its pages
    pub fn drop_bucket(&self, bucket: Bucket) -> Result<()> {
        let tree = self.tree_of(&bucket)?;
        let name = self.slot_name(bucket.slot)?;

        self.update(tree, |w, rec| free_tree(w, rec))?;
        self.update(TreeRef::Main, |w, main| remove_record(w, main, &name))?;

        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.top_mut().buckets.get_mut(bucket.slot) {
            slot.dropped = true;
            slot.dirty = false;
        }
        tracing::debug!("Dropped bucket {:?}", name);
        Ok(())
    }

    /// Delete every entry of a bucket, keeping the bucket
    pub fn clear_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.update_bucket(bucket, |w, rec| free_tree(w, rec))
    }

    /// Names of all buckets, in order
    pub fn bucket_names(&self) -> Result<Vec<String>> {
        self.view(TreeRef::Main, |src, main| {
            let mut names = Vec::new();
            let mut tree = TreeCursor::new(KeyOrder::Lexicographic);
            let mut more = tree.first(src, main.root)?;
            while more {
                let (page, index) = tree.leaf(src)?;
                let key = page.key(index)?;
                let name = String::from_utf8(key.to_vec())
                    .map_err(|_| StrataError::Corrupted("bucket name is not UTF-8".into()))?;
                names.push(name);
                more = tree.next(src)?;
            }
            Ok(names)
        })
    }

    pub fn stat(&self, bucket: &Bucket) -> Result<Stat> {
        self.view_bucket(bucket, |src, rec| {
            Ok(Stat {
                page_size: src.page_size(),
                depth: rec.depth,
                branch_pages: rec.branch_pages,
                leaf_pages: rec.leaf_pages,
                overflow_pages: rec.overflow_pages,
                entries: rec.entries,
            })
        })
    }

    pub(crate) fn bucket_flags(&self, bucket: &Bucket) -> Result<BucketFlags> {
        self.tree_of(bucket)?;
        Ok(bucket.flags)
    }

    /// Tree addressed by a handle, if the handle belongs to this transaction
    pub(crate) fn tree_of(&self, bucket: &Bucket) -> Result<TreeRef> {
        if bucket.owner != self.serial {
            return Err(StrataError::BadBucket);
        }
        self.state.borrow().slot_with_id(bucket.slot, bucket.id)?;
        Ok(TreeRef::Bucket(bucket.slot))
    }

    /// Look every slot up again after `renew`
    pub(super) fn reload_buckets(&self, slots: Vec<BucketSlot>) -> Result<()> {
        for old in slots {
            let found = if old.dropped { None } else { self.lookup(&old.name)? };
            let mut state = self.state.borrow_mut();
            let buckets = &mut state.top_mut().buckets;
            match found {
                Some(record) if record.flags == old.record.flags => buckets.push(BucketSlot {
                    record,
                    dirty: false,
                    dropped: false,
                    ..old
                }),
                _ => buckets.push(BucketSlot { dropped: true, ..old }),
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn check_name(&self, name: &str) -> Result<()> {
        check_key(KeyOrder::Lexicographic, name.as_bytes(), self.db.limits().max_key_size)
    }

    fn check_capacity(&self) -> Result<()> {
        let state = self.state.borrow();
        let open = state.top().buckets.iter().filter(|b| !b.dropped).count();
        if open >= self.db.config().max_buckets {
            return Err(StrataError::BucketFull);
        }
        Ok(())
    }

    fn find_open(&self, name: &str) -> Result<Option<Bucket>> {
        let state = self.state.borrow();
        state.check_usable()?;
        Ok(state
            .top()
            .buckets
            .iter()
            .position(|b| !b.dropped && b.name == name)
            .map(|slot| {
                let found = &state.top().buckets[slot];
                Bucket {
                    slot,
                    id: found.id,
                    owner: self.serial,
                    flags: found.record.flags,
                }
            }))
    }

    fn slot_name(&self, slot: usize) -> Result<String> {
        Ok(self.state.borrow().slot(slot)?.name.clone())
    }

    /// Record stored in the main tree under `name`
    fn lookup(&self, name: &str) -> Result<Option<BucketRecord>> {
        self.view(TreeRef::Main, |src, main| {
            let mut tree = TreeCursor::new(KeyOrder::Lexicographic);
            if !tree.search(src, main.root, name.as_bytes())? {
                return Ok(None);
            }
            let (page, index) = tree.leaf(src)?;
            match page.leaf(index)?.value {
                LeafValue::Bucket(record) => Ok(Some(record)),
                other => Err(StrataError::Corrupted(format!(
                    "main tree entry {:?} holds {:?}",
                    name, other
                ))),
            }
        })
    }

    fn attach(&self, name: &str, record: BucketRecord) -> Bucket {
        let mut state = self.state.borrow_mut();
        let id = state.next_bucket;
        state.next_bucket += 1;
        let buckets = &mut state.top_mut().buckets;
        buckets.push(BucketSlot {
            id,
            name: name.to_string(),
            record,
            dirty: false,
            dropped: false,
        });
        Bucket {
            slot: buckets.len() - 1,
            id,
            owner: self.serial,
            flags: record.flags,
        }
    }
}

/// Insert or replace the record stored under `name` in the main tree
pub(crate) fn put_record<W: PageWrite>(
    w: &mut W,
    main: &mut BucketRecord,
    name: &str,
    record: &BucketRecord,
) -> Result<()> {
    let node = encode_leaf(name.as_bytes(), &LeafValue::Bucket(*record));
    let mut tree = TreeCursor::new(KeyOrder::Lexicographic);
    if tree.search(w, main.root, name.as_bytes())? {
        tree.replace(w, main, &node)
    } else {
        tree.insert(w, main, &node)?;
        main.entries += 1;
        Ok(())
    }
}

fn remove_record<W: PageWrite>(w: &mut W, main: &mut BucketRecord, name: &str) -> Result<()> {
    let mut tree = TreeCursor::new(KeyOrder::Lexicographic);
    if !tree.search(w, main.root, name.as_bytes())? {
        return Err(StrataError::NotFound);
    }
    tree.delete(w, main)?;
    main.entries -= 1;
    Ok(())
}
