//! Bucket records
//!
//! The fixed-size record describing one rooted tree. It is stored in the
//! meta page (free-list and main buckets), in the main tree (named buckets)
//! and inside leaf nodes (duplicate sub-trees).
//!
//! ```text
//! ┌──────────┬──────────┬─────────────┬───────────┬───────────────┬───────────┬──────────┐
//! │ flags(4) │ depth(4) │ branches(8) │ leaves(8) │ overflows(8)  │ entries(8)│ root (8) │
//! └──────────┴──────────┴─────────────┴───────────┴───────────────┴───────────┴──────────┘
//! ```

use std::ops::BitOr;

use crate::error::{Result, StrataError};

use super::{PageId, INVALID_PAGE};

/// Bucket configuration flags, persisted with the bucket record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BucketFlags(u32);

impl BucketFlags {
    /// Keys may carry several sorted values
    pub const DUP_SORT: BucketFlags = BucketFlags(0x04);
    /// Keys are 4- or 8-byte little-endian integers compared numerically
    pub const INTEGER_KEY: BucketFlags = BucketFlags(0x08);
    /// All duplicates of a key have the same size
    pub const DUP_FIXED: BucketFlags = BucketFlags(0x10);
    /// Duplicates are little-endian integers compared numerically
    pub const INTEGER_DUP: BucketFlags = BucketFlags(0x20);

    const ALL: u32 = 0x04 | 0x08 | 0x10 | 0x20;

    pub const fn empty() -> Self {
        BucketFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL == 0 {
            Some(BucketFlags(bits))
        } else {
            None
        }
    }

    pub fn contains(self, other: BucketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_dup(self) -> bool {
        self.contains(Self::DUP_SORT)
    }

    /// Dup-only flags without `DUP_SORT` make no sense
    pub fn validate(self) -> Result<()> {
        let dup_only = Self::DUP_FIXED.0 | Self::INTEGER_DUP.0;
        if self.0 & dup_only != 0 && !self.is_dup() {
            return Err(StrataError::IncompatibleFlags);
        }
        Ok(())
    }
}

impl BitOr for BucketFlags {
    type Output = BucketFlags;

    fn bitor(self, rhs: BucketFlags) -> BucketFlags {
        BucketFlags(self.0 | rhs.0)
    }
}

/// Root record of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRecord {
    pub flags: BucketFlags,
    /// Levels in the tree; 0 when empty, 1 for a single leaf
    pub depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
    pub root: PageId,
}

impl BucketRecord {
    pub const ENCODED_SIZE: usize = 48;

    /// A record for an empty tree
    pub fn empty(flags: BucketFlags) -> Self {
        Self {
            flags,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: INVALID_PAGE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == INVALID_PAGE
    }

    pub fn encode_into(&self, out: &mut [u8; Self::ENCODED_SIZE]) {
        out[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[4..8].copy_from_slice(&self.depth.to_le_bytes());
        out[8..16].copy_from_slice(&self.branch_pages.to_le_bytes());
        out[16..24].copy_from_slice(&self.leaf_pages.to_le_bytes());
        out[24..32].copy_from_slice(&self.overflow_pages.to_le_bytes());
        out[32..40].copy_from_slice(&self.entries.to_le_bytes());
        out[40..48].copy_from_slice(&self.root.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(StrataError::Corrupted(format!(
                "bucket record needs {} bytes, got {}",
                Self::ENCODED_SIZE,
                bytes.len()
            )));
        }
        let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let u64_at = |o: usize| u64::from_le_bytes(bytes[o..o + 8].try_into().unwrap_or_default());

        let flags = BucketFlags::from_bits(u32_at(0)).ok_or_else(|| {
            StrataError::Corrupted(format!("unknown bucket flags {:#x}", u32_at(0)))
        })?;

        Ok(Self {
            flags,
            depth: u32_at(4),
            branch_pages: u64_at(8),
            leaf_pages: u64_at(16),
            overflow_pages: u64_at(24),
            entries: u64_at(32),
            root: u64_at(40),
        })
    }
}
