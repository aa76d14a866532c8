//! Value-level operations shared by cursors and transaction shortcuts

use crate::btree::{
    free_overflow, free_tree, read_overflow, write_overflow, KeyOrder, PageRead, PageWrite,
    TreeCursor,
};
use crate::error::{Result, StrataError};
use crate::page::{
    encode_leaf, leaf_size, max_node_size, BucketFlags, BucketRecord, LeafValue,
};

use super::dup::{decode_run, encode_run};
use super::PutFlags;

/// Reject empty, oversized or badly shaped keys
pub(crate) fn check_key(order: KeyOrder, key: &[u8], max_key_size: usize) -> Result<()> {
    if key.is_empty() {
        return Err(StrataError::BadValueSize("empty key".into()));
    }
    if key.len() > max_key_size {
        return Err(StrataError::BadValueSize(format!(
            "key of {} bytes exceeds the {}-byte limit",
            key.len(),
            max_key_size
        )));
    }
    if !order.accepts(key) {
        return Err(StrataError::BadValueSize(format!(
            "integer key must be 4 or 8 bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

fn check_dup(flags: BucketFlags, value: &[u8], max_key_size: usize) -> Result<()> {
    if value.is_empty() {
        return Err(StrataError::BadValueSize("empty duplicate value".into()));
    }
    if value.len() > max_key_size {
        return Err(StrataError::BadValueSize(format!(
            "duplicate value of {} bytes exceeds the {}-byte limit",
            value.len(),
            max_key_size
        )));
    }
    if !KeyOrder::for_dups(flags).accepts(value) {
        return Err(StrataError::BadValueSize(format!(
            "integer duplicate must be 4 or 8 bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

/// Plain value of a leaf node in a bucket without duplicates
pub(crate) fn plain_value<R: PageRead>(src: &R, value: &LeafValue<'_>) -> Result<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.to_vec()),
        LeafValue::Overflow { page, len } => read_overflow(src, *page, *len),
        other => Err(StrataError::Corrupted(format!(
            "unexpected value {:?} in a plain bucket",
            other
        ))),
    }
}

/// Value for `key`; the first duplicate in a `DUP_SORT` bucket
pub(crate) fn get<R: PageRead>(src: &R, rec: &BucketRecord, key: &[u8]) -> Result<Vec<u8>> {
    let mut tree = TreeCursor::new(KeyOrder::for_keys(rec.flags));
    if !tree.search(src, rec.root, key)? {
        return Err(StrataError::NotFound);
    }
    let (page, index) = tree.leaf(src)?;
    let node = page.leaf(index)?;
    match node.value {
        LeafValue::DupRun(bytes) => decode_run(bytes, rec.flags.contains(BucketFlags::DUP_FIXED))?
            .into_iter()
            .next()
            .ok_or_else(|| StrataError::Corrupted("empty duplicate run".into())),
        LeafValue::DupTree(sub) => {
            let mut cursor = TreeCursor::new(KeyOrder::for_dups(rec.flags));
            if !cursor.first(src, sub.root)? {
                return Err(StrataError::Corrupted("empty duplicate sub-tree".into()));
            }
            let (page, index) = cursor.leaf(src)?;
            Ok(page.key(index)?.to_vec())
        }
        ref value => plain_value(src, value),
    }
}

// =============================================================================
// Put
// =============================================================================

pub(crate) fn put<W: PageWrite>(
    w: &mut W,
    rec: &mut BucketRecord,
    key: &[u8],
    value: &[u8],
    flags: PutFlags,
    max_key_size: usize,
) -> Result<()> {
    let order = KeyOrder::for_keys(rec.flags);
    check_key(order, key, max_key_size)?;
    if value.len() > u32::MAX as usize {
        return Err(StrataError::BadValueSize(format!("value of {} bytes", value.len())));
    }

    if rec.flags.is_dup() {
        return put_dup(w, rec, key, value, flags, max_key_size);
    }

    let mut tree = TreeCursor::new(order);
    let exists = tree.search(w, rec.root, key)?;
    if exists {
        if flags.contains(PutFlags::NO_OVERWRITE) {
            return Err(StrataError::KeyExists);
        }
        let (page, index) = tree.leaf(w)?;
        if let LeafValue::Overflow { page: run, .. } = page.leaf(index)?.value {
            free_overflow(w, rec, run)?;
        }
    }

    let node = if leaf_size(key.len(), value.len()) > max_node_size(w.page_size()) {
        let run = write_overflow(w, rec, value)?;
        encode_leaf(key, &LeafValue::Overflow { page: run, len: value.len() })
    } else {
        encode_leaf(key, &LeafValue::Inline(value))
    };

    if exists {
        tree.replace(w, rec, &node)
    } else {
        tree.insert(w, rec, &node)?;
        rec.entries += 1;
        Ok(())
    }
}

fn put_dup<W: PageWrite>(
    w: &mut W,
    rec: &mut BucketRecord,
    key: &[u8],
    value: &[u8],
    flags: PutFlags,
    max_key_size: usize,
) -> Result<()> {
    check_dup(rec.flags, value, max_key_size)?;
    let fixed = rec.flags.contains(BucketFlags::DUP_FIXED);
    let dup_order = KeyOrder::for_dups(rec.flags);

    let mut tree = TreeCursor::new(KeyOrder::for_keys(rec.flags));
    if !tree.search(w, rec.root, key)? {
        let values = [value.to_vec()];
        let run = encode_run(&values, fixed);
        let node = if leaf_size(key.len(), run.len()) <= max_node_size(w.page_size()) {
            encode_leaf(key, &LeafValue::DupRun(&run))
        } else {
            encode_leaf(key, &LeafValue::DupTree(promote(w, rec.flags, &values)?))
        };
        // Promotion only allocates, so the search position still holds
        tree.insert(w, rec, &node)?;
        rec.entries += 1;
        return Ok(());
    }
    if flags.contains(PutFlags::NO_OVERWRITE) {
        return Err(StrataError::KeyExists);
    }

    let (page, index) = tree.leaf(w)?;
    let node = match page.leaf(index)?.value {
        LeafValue::DupRun(bytes) => {
            let mut values = decode_run(bytes, fixed)?;
            if fixed && values.first().is_some_and(|v| v.len() != value.len()) {
                return Err(StrataError::BadValueSize(format!(
                    "fixed duplicates are {} bytes, got {}",
                    values[0].len(),
                    value.len()
                )));
            }
            match values.binary_search_by(|v| dup_order.compare(v, value)) {
                Ok(_) if flags.contains(PutFlags::NO_DUP_DATA) => return Err(StrataError::KeyExists),
                Ok(_) => return Ok(()),
                Err(at) => values.insert(at, value.to_vec()),
            }

            let run = encode_run(&values, fixed);
            if leaf_size(key.len(), run.len()) <= max_node_size(w.page_size()) {
                encode_leaf(key, &LeafValue::DupRun(&run))
            } else {
                let sub = promote(w, rec.flags, &values)?;
                encode_leaf(key, &LeafValue::DupTree(sub))
            }
        }
        LeafValue::DupTree(mut sub) => {
            if fixed && sub.entries > 0 {
                let mut first = TreeCursor::new(dup_order);
                if first.first(w, sub.root)? {
                    let (p, i) = first.leaf(w)?;
                    let size = p.key(i)?.len();
                    if size != value.len() {
                        return Err(StrataError::BadValueSize(format!(
                            "fixed duplicates are {} bytes, got {}",
                            size,
                            value.len()
                        )));
                    }
                }
            }
            let mut dups = TreeCursor::new(dup_order);
            if dups.search(w, sub.root, value)? {
                if flags.contains(PutFlags::NO_DUP_DATA) {
                    return Err(StrataError::KeyExists);
                }
                return Ok(());
            }
            dups.insert(w, &mut sub, &encode_leaf(value, &LeafValue::Inline(&[])))?;
            sub.entries += 1;
            encode_leaf(key, &LeafValue::DupTree(sub))
        }
        other => {
            return Err(StrataError::Corrupted(format!(
                "unexpected value {:?} in a duplicate bucket",
                other
            )))
        }
    };

    tree.replace(w, rec, &node)?;
    rec.entries += 1;
    Ok(())
}

/// Move a sorted run of duplicates into a new sub-tree
fn promote<W: PageWrite>(w: &mut W, flags: BucketFlags, values: &[Vec<u8>]) -> Result<BucketRecord> {
    let mut sub = BucketRecord::empty(BucketFlags::empty());
    let mut cursor = TreeCursor::new(KeyOrder::for_dups(flags));
    for value in values {
        cursor.search(w, sub.root, value)?;
        cursor.insert(w, &mut sub, &encode_leaf(value, &LeafValue::Inline(&[])))?;
        sub.entries += 1;
    }
    tracing::trace!("Promoted {} duplicates to a sub-tree", values.len());
    Ok(sub)
}

// =============================================================================
// Delete
// =============================================================================

/// Delete `key`, or only its duplicate `value` in a `DUP_SORT` bucket.
/// `value` is ignored for buckets without duplicates.
pub(crate) fn delete<W: PageWrite>(
    w: &mut W,
    rec: &mut BucketRecord,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<()> {
    let mut tree = TreeCursor::new(KeyOrder::for_keys(rec.flags));
    if !tree.search(w, rec.root, key)? {
        return Err(StrataError::NotFound);
    }

    let fixed = rec.flags.contains(BucketFlags::DUP_FIXED);
    let dup_order = KeyOrder::for_dups(rec.flags);
    let (page, index) = tree.leaf(w)?;

    match page.leaf(index)?.value {
        LeafValue::Inline(_) => {
            tree.delete(w, rec)?;
            rec.entries -= 1;
        }
        LeafValue::Overflow { page: run, .. } => {
            free_overflow(w, rec, run)?;
            tree.delete(w, rec)?;
            rec.entries -= 1;
        }
        LeafValue::DupRun(bytes) => {
            let mut values = decode_run(bytes, fixed)?;
            let removed = match value {
                None => values.len(),
                Some(target) => {
                    let at = values
                        .binary_search_by(|v| dup_order.compare(v, target))
                        .map_err(|_| StrataError::NotFound)?;
                    values.remove(at);
                    1
                }
            };
            if value.is_none() || values.is_empty() {
                tree.delete(w, rec)?;
            } else {
                let run = encode_run(&values, fixed);
                tree.replace(w, rec, &encode_leaf(key, &LeafValue::DupRun(&run)))?;
            }
            rec.entries -= removed as u64;
        }
        LeafValue::DupTree(mut sub) => match value {
            None => {
                let removed = sub.entries;
                free_tree(w, &mut sub)?;
                tree.delete(w, rec)?;
                rec.entries -= removed;
            }
            Some(target) => {
                let mut dups = TreeCursor::new(dup_order);
                if !dups.search(w, sub.root, target)? {
                    return Err(StrataError::NotFound);
                }
                dups.delete(w, &mut sub)?;
                sub.entries -= 1;
                if sub.is_empty() {
                    tree.delete(w, rec)?;
                } else {
                    tree.replace(w, rec, &encode_leaf(key, &LeafValue::DupTree(sub)))?;
                }
                rec.entries -= 1;
            }
        },
        other => {
            return Err(StrataError::Corrupted(format!(
                "unexpected value {:?} in a user bucket",
                other
            )))
        }
    }
    Ok(())
}
