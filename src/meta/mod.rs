//! Meta Manager
//!
//! Owns the two alternating meta pages at page numbers 0 and 1. The valid
//! slot with the higher transaction id is authoritative; a commit writes the
//! other slot (`txnid % 2`) and only becomes visible once that write is
//! flushed.
//!
//! ## Recovery
//! A crash during a meta write can only damage the slot being written, which
//! is never the authoritative one. At open, a slot failing validation is
//! logged and skipped; both slots failing is fatal.

use crate::config::SyncMode;
use crate::error::{Result, StrataError};
use crate::page::{Meta, Page, PageKind, MAX_PAGE_SIZE, META_PAGE_COUNT, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use crate::store::PageStore;

/// Tracks the authoritative meta record
#[derive(Debug, Clone)]
pub struct MetaManager {
    current: Meta,
}

impl MetaManager {
    /// Write two fresh meta pages into an empty store
    pub fn init(store: &mut PageStore) -> Result<Self> {
        let meta = Meta::initial(store.page_size());
        store.ensure_pages(META_PAGE_COUNT)?;
        for slot in 0..META_PAGE_COUNT {
            store.write_page(&meta.to_page(slot))?;
        }
        store.flush()?;

        tracing::info!(
            "Initialized new database at {} (page size {})",
            store.path().display(),
            store.page_size()
        );
        Ok(Self { current: meta })
    }

    /// Read both slots and adopt the valid one with the higher txn id
    pub fn load(store: &PageStore) -> Result<Self> {
        let slots: Vec<Result<Meta>> = (0..META_PAGE_COUNT)
            .map(|slot| read_slot(store, slot))
            .collect();

        let mut best: Option<Meta> = None;
        for (slot, result) in slots.into_iter().enumerate() {
            match result {
                Ok(meta) => {
                    if best.map_or(true, |b| meta.txnid > b.txnid) {
                        best = Some(meta);
                    }
                }
                Err(e) => {
                    tracing::warn!("Meta slot {} failed validation: {}", slot, e);
                }
            }
        }

        let current = best.ok_or_else(|| {
            StrataError::Corrupted(format!(
                "both meta pages of {} are invalid",
                store.path().display()
            ))
        })?;

        tracing::info!(
            "Opened {} at txn {} (last page {})",
            store.path().display(),
            current.txnid,
            current.last_page
        );
        Ok(Self { current })
    }

    /// Find the page size recorded in an existing file.
    ///
    /// Slot 0 sits at offset 0 regardless of page size; slot 1 is probed at
    /// the configured size first and then at every supported size.
    pub fn detect_page_size(raw: &[u8], configured: usize) -> Result<usize> {
        if let Some(size) = probe(raw, 0) {
            return Ok(size);
        }

        let mut candidates = vec![configured];
        let mut size = MIN_PAGE_SIZE;
        while size <= MAX_PAGE_SIZE {
            if size != configured {
                candidates.push(size);
            }
            size *= 2;
        }

        candidates
            .into_iter()
            .find(|&size| probe(raw, size) == Some(size))
            .ok_or_else(|| StrataError::Corrupted("no valid meta page found".into()))
    }

    pub fn current(&self) -> &Meta {
        &self.current
    }

    /// Slot the next commit writes to
    pub fn next_slot(&self) -> u64 {
        (self.current.txnid + 1) % META_PAGE_COUNT
    }

    /// Write `meta` to its slot, flush it and make it current.
    ///
    /// On a flush failure the slot is invalidated and the previous meta stays
    /// authoritative.
    pub fn commit(&mut self, store: &mut PageStore, meta: Meta, sync: SyncMode) -> Result<()> {
        if meta.txnid != self.current.txnid + 1 {
            return Err(StrataError::BadTransaction(format!(
                "meta txn {} does not follow {}",
                meta.txnid, self.current.txnid
            )));
        }

        let slot = meta.txnid % META_PAGE_COUNT;
        store.write_page(&meta.to_page(slot))?;

        if sync == SyncMode::Full {
            if let Err(e) = store.flush_page(slot) {
                tracing::warn!("Meta flush for txn {} failed: {}", meta.txnid, e);
                let blank = Page::new(slot, PageKind::Meta, store.page_size());
                store.write_page(&blank)?;
                return Err(e);
            }
        }

        self.current = meta;
        Ok(())
    }
}

fn read_slot(store: &PageStore, slot: u64) -> Result<Meta> {
    let page = store.read_page(slot)?;
    let meta = Meta::from_page(&page)?;
    if meta.page_size as usize != store.page_size() {
        return Err(StrataError::InvalidFormat(format!(
            "meta slot {} records page size {} but the file uses {}",
            slot,
            meta.page_size,
            store.page_size()
        )));
    }
    Ok(meta)
}

/// Page size recorded by a valid meta record at `offset`
fn probe(raw: &[u8], offset: usize) -> Option<usize> {
    let start = offset + PAGE_HEADER_SIZE;
    let meta = Meta::decode(raw.get(start..)?).ok()?;
    let size = meta.page_size as usize;
    let valid = size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size);
    valid.then_some(size)
}
