//! Meta record
//!
//! ## Layout (after the 16-byte page header)
//! ```text
//! ┌───────────┬─────────────┬──────────────┬──────────┐
//! │ Magic (4) │ Version (4) │ PageSize (4) │ Flags (4)│
//! ├───────────┴─────────────┴──────────────┴──────────┤
//! │ Free-list bucket record (48)                      │
//! │ Main bucket record (48)                           │
//! ├──────────────────┬───────────────┬────────────────┤
//! │ LastPage (8)     │ TxnId (8)     │ CRC32 (4)      │
//! └──────────────────┴───────────────┴────────────────┘
//! ```
//! The CRC covers every byte before it, so a torn meta write is detected
//! as an invalid slot.

use crate::error::{Result, StrataError};

use super::{
    BucketFlags, BucketRecord, Page, PageId, PageKind, META_PAGE_COUNT, PAGE_HEADER_SIZE,
};

/// Magic number identifying a stratakv file
pub const MAGIC: u32 = 0xBEEF_C0DE;

/// Current file format version
pub const VERSION: u32 = 1;

/// Encoded meta size: 16 + 48 + 48 + 8 + 8 + 4
pub const META_SIZE: usize = 132;

const CRC_OFFSET: usize = META_SIZE - 4;

/// The authoritative description of one committed database state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub free: BucketRecord,
    pub main: BucketRecord,
    /// Highest page number in use
    pub last_page: PageId,
    pub txnid: u64,
}

impl Meta {
    /// State of a freshly created file
    pub fn initial(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            free: BucketRecord::empty(BucketFlags::INTEGER_KEY),
            main: BucketRecord::empty(BucketFlags::empty()),
            last_page: META_PAGE_COUNT - 1,
            txnid: 0,
        }
    }

    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut out = [0u8; META_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        // 12..16 reserved flags

        let mut record = [0u8; BucketRecord::ENCODED_SIZE];
        self.free.encode_into(&mut record);
        out[16..64].copy_from_slice(&record);
        self.main.encode_into(&mut record);
        out[64..112].copy_from_slice(&record);

        out[112..120].copy_from_slice(&self.last_page.to_le_bytes());
        out[120..128].copy_from_slice(&self.txnid.to_le_bytes());

        let crc = crc32fast::hash(&out[..CRC_OFFSET]);
        out[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Validate magic, version and checksum, then decode
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_SIZE {
            return Err(StrataError::InvalidFormat(format!(
                "meta record truncated ({} bytes)",
                bytes.len()
            )));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC {
            return Err(StrataError::InvalidFormat(format!(
                "bad magic {:#010x}",
                magic
            )));
        }

        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "unsupported version {} (expected {})",
                version, VERSION
            )));
        }

        let stored = u32::from_le_bytes([
            bytes[CRC_OFFSET],
            bytes[CRC_OFFSET + 1],
            bytes[CRC_OFFSET + 2],
            bytes[CRC_OFFSET + 3],
        ]);
        let computed = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if stored != computed {
            return Err(StrataError::InvalidFormat(format!(
                "meta checksum mismatch (stored {:#010x}, computed {:#010x})",
                stored, computed
            )));
        }

        let page_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let free = BucketRecord::decode(&bytes[16..64])
            .map_err(|e| StrataError::InvalidFormat(e.to_string()))?;
        let main = BucketRecord::decode(&bytes[64..112])
            .map_err(|e| StrataError::InvalidFormat(e.to_string()))?;

        Ok(Self {
            page_size,
            free,
            main,
            last_page: u64::from_le_bytes(bytes[112..120].try_into().unwrap_or_default()),
            txnid: u64::from_le_bytes(bytes[120..128].try_into().unwrap_or_default()),
        })
    }

    /// Lay the record out on a fresh meta page
    pub fn to_page(&self, id: PageId) -> Page {
        let mut page = Page::new(id, PageKind::Meta, self.page_size as usize);
        page.as_bytes_mut()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE]
            .copy_from_slice(&self.encode());
        page
    }

    /// Read the record from a meta page, checking the page type first
    pub fn from_page(page: &Page) -> Result<Self> {
        match page.kind() {
            Ok(PageKind::Meta) => {}
            _ => {
                return Err(StrataError::InvalidFormat(format!(
                    "page {} is not a meta page",
                    page.id()
                )))
            }
        }
        Self::decode(&page.as_bytes()[PAGE_HEADER_SIZE..])
    }
}
