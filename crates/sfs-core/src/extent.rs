//! Extent list arithmetic: coalescing fresh blocks onto an entry and cutting
//! it back to a smaller block count.

use sfs_error::{Result, SfsError};
use sfs_types::{BlockNumber, Extent, MAX_EXTENTS};

/// Coalesce `blocks` onto the end of `extents`.
///
/// A block that follows the previous one extends the current run; anything
/// else opens a new extent. Fails without touching `extents` when the result
/// would need more than [`MAX_EXTENTS`] runs.
pub fn append_blocks(extents: &mut Vec<Extent>, blocks: &[BlockNumber]) -> Result<()> {
    let mut merged = extents.clone();
    for &block in blocks {
        match merged.last_mut() {
            Some(last) if last.end() == block && last.len < u32::MAX => last.len += 1,
            _ => {
                if merged.len() == MAX_EXTENTS {
                    return Err(SfsError::ExtentLimit { max: MAX_EXTENTS });
                }
                merged.push(Extent::new(block, 1));
            }
        }
    }
    *extents = merged;
    Ok(())
}

/// Keep the first `keep` blocks and return every block past that point.
pub fn truncate(extents: &mut Vec<Extent>, keep: u64) -> Vec<BlockNumber> {
    let mut freed = Vec::new();
    let mut remaining = keep;
    let mut kept = Vec::with_capacity(extents.len());
    for extent in extents.drain(..) {
        let len = u64::from(extent.len);
        if remaining >= len {
            remaining -= len;
            kept.push(extent);
        } else if remaining > 0 {
            // remaining < len <= u32::MAX
            let head = remaining as u32;
            kept.push(Extent::new(extent.start, head));
            freed.extend((extent.start.0 + remaining..extent.end().0).map(BlockNumber));
            remaining = 0;
        } else {
            freed.extend(extent.blocks());
        }
    }
    *extents = kept;
    freed
}

/// Block holding byte `offset` of the entry, or `None` past the last extent.
#[must_use]
pub fn block_at(extents: &[Extent], block_size: u32, offset: u64) -> Option<BlockNumber> {
    let mut index = offset / u64::from(block_size);
    for extent in extents {
        let len = u64::from(extent.len);
        if index < len {
            return Some(BlockNumber(extent.start.0 + index));
        }
        index -= len;
    }
    None
}
