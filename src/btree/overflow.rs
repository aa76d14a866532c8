//! Overflow runs and whole-tree release

use crate::error::{Result, StrataError};
use crate::page::{overflow_span, BucketRecord, LeafValue, Page, PageId, PageKind};

use super::{PageRead, PageWrite};

/// Store `data` on a fresh contiguous run; returns its first page number
pub fn write_overflow<W: PageWrite>(w: &mut W, rec: &mut BucketRecord, data: &[u8]) -> Result<PageId> {
    let page_size = w.page_size();
    let span = overflow_span(page_size, data.len());
    let id = w.alloc(span)?;
    w.write(Page::new_overflow(id, page_size, data))?;
    rec.overflow_pages += span as u64;
    Ok(id)
}

pub fn read_overflow<R: PageRead>(src: &R, id: PageId, len: usize) -> Result<Vec<u8>> {
    let run = src.read(id)?;
    if run.kind()? != PageKind::Overflow {
        return Err(StrataError::Corrupted(format!(
            "page {} referenced as overflow is {:?}",
            id,
            run.kind()?
        )));
    }
    Ok(run.overflow_data(len)?.to_vec())
}

pub fn free_overflow<W: PageWrite>(w: &mut W, rec: &mut BucketRecord, id: PageId) -> Result<()> {
    let span = w.read(id)?.span();
    w.free(id, span)?;
    rec.overflow_pages = rec.overflow_pages.saturating_sub(span as u64);
    Ok(())
}

/// Release every page of the tree, including overflow runs and duplicate
/// sub-trees hanging off its leaves, and reset the record to empty.
/// Named bucket records are not followed.
pub fn free_tree<W: PageWrite>(w: &mut W, rec: &mut BucketRecord) -> Result<()> {
    if rec.is_empty() {
        return Ok(());
    }

    let mut pending = vec![rec.root];
    while let Some(id) = pending.pop() {
        let page = w.read(id)?;
        if page.is_branch() {
            for i in 0..page.count() {
                pending.push(page.child(i)?);
            }
        } else {
            for i in 0..page.count() {
                match page.leaf(i)?.value {
                    LeafValue::Overflow { page: run, .. } => {
                        let span = w.read(run)?.span();
                        w.free(run, span)?;
                    }
                    LeafValue::DupTree(mut sub) => free_tree(w, &mut sub)?,
                    _ => {}
                }
            }
        }
        w.free(id, 1)?;
    }

    *rec = BucketRecord::empty(rec.flags);
    Ok(())
}
