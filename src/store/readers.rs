//! Reader slot table
//!
//! Each live read transaction holds one slot recording the snapshot id it
//! pinned. The writer asks for the minimum to know which freed pages no
//! reader can still observe.

use parking_lot::Mutex;

use crate::error::{Result, StrataError};

/// Handle to an occupied slot; returned by `register`
#[derive(Debug, PartialEq, Eq)]
pub struct ReaderSlot(usize);

impl ReaderSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Fixed-capacity table of pinned snapshot ids
pub struct ReaderTable {
    slots: Mutex<Vec<Option<u64>>>,
}

impl ReaderTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Claim a slot and pin the snapshot produced by `snapshot`.
    ///
    /// The snapshot is taken while the table lock is held, so a writer that
    /// computes `oldest()` either sees this reader or committed before the
    /// snapshot was read.
    pub fn register<T>(&self, snapshot: impl FnOnce() -> (u64, T)) -> Result<(ReaderSlot, T)> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(StrataError::ReadersFull)?;

        let (txnid, value) = snapshot();
        slots[index] = Some(txnid);
        Ok((ReaderSlot(index), value))
    }

    pub fn unregister(&self, slot: ReaderSlot) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(slot.0) {
            *entry = None;
        }
    }

    /// Minimum pinned snapshot id, if any reader is live
    pub fn oldest(&self) -> Option<u64> {
        self.slots.lock().iter().flatten().copied().min()
    }

    /// Number of occupied slots
    pub fn active(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }
}
