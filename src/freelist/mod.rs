//! Free-List Allocator
//!
//! Page numbers no longer referenced by the committed tree are recorded in
//! the reserved free-list bucket, one `FreeRecord` per freeing transaction,
//! keyed by that transaction's id. A record only becomes reusable once every
//! live reader started after the transaction that wrote it.
//!
//! `FreeList` is the in-memory side a write transaction works with:
//! - `reclaimed`: sorted pages safe to hand out now
//! - `freed`: pages released by this transaction, reusable only after it
//! - `loaded`: ids of records pulled into `reclaimed`, deleted at commit
//!
//! Loading records out of the bucket is driven by the transaction, which
//! owns the tree access; this module keeps the bookkeeping and the record
//! codec.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::page::PageId;

/// Value stored under each transaction id in the free-list bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRecord {
    pub pages: Vec<PageId>,
}

impl FreeRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Free-list key for a transaction id
pub fn record_key(txnid: u64) -> [u8; 8] {
    txnid.to_le_bytes()
}

/// Per-frame allocator state
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    reclaimed: Vec<PageId>,
    freed: Vec<PageId>,
    loaded: Vec<u64>,
    exhausted: bool,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the first run of `n` consecutive reclaimed pages
    pub fn take_run(&mut self, n: usize) -> Option<PageId> {
        if n == 0 || self.reclaimed.len() < n {
            return None;
        }

        let mut start = 0;
        for i in 1..=self.reclaimed.len() {
            if i - start == n {
                let first = self.reclaimed[start];
                self.reclaimed.drain(start..i);
                return Some(first);
            }
            if i < self.reclaimed.len() && self.reclaimed[i] != self.reclaimed[i - 1] + 1 {
                start = i;
            }
        }
        None
    }

    /// Add the pages of record `txnid` to the reclaimable set
    pub fn absorb(&mut self, txnid: u64, pages: &[PageId]) {
        self.loaded.push(txnid);
        self.reclaimed.extend_from_slice(pages);
        self.reclaimed.sort_unstable();
        self.reclaimed.dedup();
    }

    /// Return pages allocated and released by the same transaction
    pub fn release(&mut self, id: PageId, span: usize) {
        for page in id..id + span as u64 {
            if let Err(at) = self.reclaimed.binary_search(&page) {
                self.reclaimed.insert(at, page);
            }
        }
    }

    /// Record pages released by this transaction
    pub fn free(&mut self, id: PageId, span: usize) {
        self.freed.extend(id..id + span as u64);
    }

    /// Next record key to look at
    pub fn next_key(&self) -> u64 {
        self.loaded.iter().max().map_or(0, |last| last + 1)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    pub fn loaded(&self) -> &[u64] {
        &self.loaded
    }

    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.len()
    }

    pub fn freed_count(&self) -> usize {
        self.freed.len()
    }

    /// Every page this transaction must write back: freed plus unused
    /// reclaimed, sorted and deduplicated
    pub fn pending(&self) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self.freed.iter().chain(&self.reclaimed).copied().collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}
