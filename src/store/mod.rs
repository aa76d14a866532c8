//! Store Module
//!
//! The collaborators the engine consumes at its boundary:
//! - `PageStore`: the memory-mapped backing file, addressed by page number
//! - `ReaderTable`: the shared slot table of live read snapshots
//!
//! ## Growth
//! The file length always equals the mapping length. Growing flushes the
//! current mapping, extends the file and remaps it, so it needs `&mut self`:
//! no page slice can outlive a remap. Pages handed out are owned copies.

mod readers;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, StrataError};
use crate::page::{Page, PageId, PageKind, PAGE_HEADER_SIZE};

pub use readers::{ReaderSlot, ReaderTable};

/// Memory-mapped backing file
pub struct PageStore {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    page_size: usize,
    max_size: u64,
    created: bool,
}

impl PageStore {
    /// Open or create the backing file and map at least `map_size` bytes
    pub fn open(path: &Path, page_size: usize, map_size: u64, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_size = file.metadata()?.len();
        let created = file_size == 0;

        let target = file_size.max(round_up(map_size, page_size as u64));
        if target > file_size {
            file.set_len(target)?;
        }

        // SAFETY: the mapping is owned by the store and only accessed through
        // bounds-checked copies; remapping requires `&mut self`, so no borrowed
        // slice can survive it.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        tracing::debug!(
            "Mapped {} ({} bytes, created={})",
            path.display(),
            mmap.len(),
            created
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            page_size,
            max_size: max_size.max(target),
            created,
        })
    }

    /// Whether `open` found an empty file
    pub fn is_new(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Adopt the page size recorded in an existing file
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    /// Current mapping length in bytes
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Raw mapped bytes; used only to sniff meta pages at open
    pub fn raw(&self) -> &[u8] {
        &self.mmap
    }

    // -------------------------------------------------------------------------
    // Page I/O
    // -------------------------------------------------------------------------

    /// Copy out the page (or whole overflow run) at `id`
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        let page_size = self.page_size;
        let offset = id
            .checked_mul(page_size as u64)
            .ok_or(StrataError::PageNotFound(id))? as usize;
        if offset + page_size > self.mmap.len() {
            return Err(StrataError::PageNotFound(id));
        }

        let head = &self.mmap[offset..offset + page_size];
        let flags = u16::from_le_bytes([head[8], head[9]]);
        let len = if flags == PageKind::Overflow as u16 {
            let span = u32::from_le_bytes([head[12], head[13], head[14], head[15]]) as usize;
            span.max(1) * page_size
        } else {
            page_size
        };
        if offset + len > self.mmap.len() || len < PAGE_HEADER_SIZE {
            return Err(StrataError::Corrupted(format!(
                "overflow run at page {} extends past the end of the map",
                id
            )));
        }

        let page = Page::from_bytes(self.mmap[offset..offset + len].to_vec());
        page.check_id(id)?;
        Ok(page)
    }

    /// Write a page (or overflow run) at its own page number, growing as needed
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let offset = page.id() * self.page_size as u64;
        let bytes = page.as_bytes();
        self.ensure_len(offset + bytes.len() as u64)?;

        let offset = offset as usize;
        self.mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Make the mapping cover `pages` pages
    pub fn ensure_pages(&mut self, pages: u64) -> Result<()> {
        self.ensure_len(pages * self.page_size as u64)
    }

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------

    /// Flush the whole mapping to disk
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Flush one page to disk
    pub fn flush_page(&self, id: PageId) -> Result<()> {
        let offset = id as usize * self.page_size;
        self.mmap.flush_range(offset, self.page_size)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn ensure_len(&mut self, required: u64) -> Result<()> {
        let current = self.mmap.len() as u64;
        if required <= current {
            return Ok(());
        }
        if required > self.max_size {
            return Err(StrataError::MapFull);
        }

        let new_len = round_up(required.max(current.saturating_mul(2)), self.page_size as u64)
            .min(self.max_size);

        self.mmap.flush()?;
        self.file.set_len(new_len)?;

        // SAFETY: `&mut self` guarantees no slice of the old mapping is alive;
        // the file was extended before remapping.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };

        tracing::debug!("Grew map from {} to {} bytes", current, new_len);
        Ok(())
    }
}

fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}
