//! Top-level commit
//!
//! 1. Write changed bucket records into the main tree
//! 2. Save the free list: drop the records this transaction reclaimed and
//!    store its own record (freed plus unused reclaimed pages)
//! 3. Write every dirty page at its page number and flush
//! 4. Flip the meta page
//!
//! Nothing before step 4 is reachable from the authoritative meta, so a
//! failure anywhere leaves the previous commit intact.

use crate::btree::{KeyOrder, PageRead, PageWrite, TreeCursor};
use crate::config::SyncMode;
use crate::cursor::{delete, put, PutFlags};
use crate::db::Database;
use crate::error::{Result, StrataError};
use crate::freelist::{record_key, FreeRecord};
use crate::page::{encode_leaf, BucketRecord, LeafValue, Meta, PAGE_HEADER_SIZE};
use crate::store::PageStore;

use super::bucket::put_record;
use super::frame::{Limits, WriteCtx};
use super::{TreeRef, TxnState};

/// Rounds after which a free-list save gives up chasing its own changes
const MAX_SAVE_ROUNDS: usize = 16;

pub(super) fn commit(db: &Database, state: &mut TxnState) -> Result<()> {
    state.check_writable()?;
    if state.frames.len() > 1 {
        return Err(StrataError::BadTransaction("a nested transaction is still active".into()));
    }
    if state.version == 0 {
        tracing::trace!("Txn {} made no changes", state.txnid);
        return Ok(());
    }

    let limits = db.limits();
    {
        let store = db.store.read();
        save_buckets(state, &store, limits)?;
        save_free_list(state, &store, limits)?;
    }

    let frame = &state.frames[0];
    let sync = db.config().sync_mode;
    let mut store = db.store.write();
    let meta = Meta {
        page_size: store.page_size() as u32,
        free: frame.free_root,
        main: frame.main,
        last_page: frame.next_page - 1,
        txnid: state.txnid,
    };

    store.ensure_pages(frame.next_page)?;
    for page in frame.dirty.values() {
        store.write_page(page)?;
    }
    if sync != SyncMode::NoSync {
        store.flush()?;
    }
    db.meta.write().commit(&mut store, meta, sync)?;

    tracing::debug!(
        "Committed txn {} ({} dirty, {} spilled, {} freed, last page {})",
        state.txnid,
        frame.dirty.len(),
        state.spilled.len(),
        frame.freelist.freed_count(),
        meta.last_page
    );
    Ok(())
}

fn save_buckets(state: &mut TxnState, store: &PageStore, limits: Limits) -> Result<()> {
    let changed: Vec<(String, BucketRecord)> = state.frames[0]
        .buckets
        .iter()
        .filter(|b| b.dirty && !b.dropped)
        .map(|b| (b.name.clone(), b.record))
        .collect();

    for (name, record) in &changed {
        state.write_tree(store, limits, TreeRef::Main, |w, main| put_record(w, main, name, record))?;
    }
    for slot in state.frames[0].buckets.iter_mut() {
        slot.dirty = false;
    }
    Ok(())
}

fn save_free_list(state: &mut TxnState, store: &PageStore, limits: Limits) -> Result<()> {
    let txnid = state.txnid;
    let key = record_key(txnid);
    let loaded = state.frames[0].freelist.loaded().to_vec();

    state.write_tree(store, limits, TreeRef::Free, |w, free| {
        w.set_saving(true);
        for id in &loaded {
            delete(w, free, &record_key(*id), None)?;
        }

        for round in 0.. {
            let pending = w.top().freelist.pending();
            if pending.is_empty() {
                break;
            }

            let bytes = FreeRecord { pages: pending.clone() }.encode()?;
            if !rewrite_in_place(w, free, &key, &bytes)? {
                put(w, free, &key, &bytes, PutFlags::empty(), key.len())?;
            }
            if w.top().freelist.pending() == pending {
                tracing::trace!("Txn {} freed {} pages", txnid, pending.len());
                break;
            }
            if round == MAX_SAVE_ROUNDS {
                tracing::warn!("Free-list record of txn {} did not settle; some pages stay unused", txnid);
                break;
            }
        }
        Ok(())
    })
}

/// Overwrite this transaction's own overflow record if its run still has
/// room, so saving the record does not free and allocate yet more pages
fn rewrite_in_place(w: &mut WriteCtx<'_>, free: &mut BucketRecord, key: &[u8], bytes: &[u8]) -> Result<bool> {
    let mut tree = TreeCursor::new(KeyOrder::Integer);
    if !tree.search(w, free.root, key)? {
        return Ok(false);
    }
    let (page, index) = tree.leaf(w)?;
    let LeafValue::Overflow { page: run, .. } = page.leaf(index)?.value else {
        return Ok(false);
    };
    if !w.top().fresh.contains(&run) {
        return Ok(false);
    }

    let mut data = w.read(run)?;
    if PAGE_HEADER_SIZE + bytes.len() > data.span() * w.page_size() {
        return Ok(false);
    }
    data.write_overflow(bytes)?;
    w.write(data)?;
    tree.replace(w, free, &encode_leaf(key, &LeafValue::Overflow { page: run, len: bytes.len() }))?;
    Ok(true)
}
