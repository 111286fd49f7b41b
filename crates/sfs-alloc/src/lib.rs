#![forbid(unsafe_code)]
//! Block allocator for the SFS data region.
//!
//! The bitmap holds one bit per block of the whole image (LSB-first within
//! each byte). Every block before `data_start` is marked used at format time
//! and is never handed out or released.
//!
//! Allocation is first-fit from `data_start`. Each allocate or free
//! rewrites the full bitmap region; if that write fails, the in-memory
//! bitmap is restored before the error is returned.

use parking_lot::RwLock;
use sfs_block::{BlockDevice, read_region, write_region};
use sfs_error::{Result, SfsError};
use sfs_types::{BlockNumber, Geometry};
use tracing::{debug, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| u64::from(byte.count_zeros()))
        .sum::<u64>();

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        free += (0..remainder).filter(|bit| (byte >> bit) & 1 == 0).count() as u64;
    }
    free
}

/// Collect the first `n` clear bits in `[start, count)`. Returns fewer than
/// `n` indices when the bitmap runs out.
#[must_use]
pub fn bitmap_first_free(bitmap: &[u8], start: u64, count: u64, n: u64) -> Vec<u64> {
    let span = count.saturating_sub(start).min(n);
    let mut out = Vec::with_capacity(usize::try_from(span).unwrap_or(0));
    let mut idx = start;
    while idx < count && (out.len() as u64) < n {
        let byte = bitmap[(idx / 8) as usize];
        if byte == 0xFF && idx % 8 == 0 {
            idx += 8;
            continue;
        }
        if !bitmap_get(bitmap, idx) {
            out.push(idx);
        }
        idx += 1;
    }
    out
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Bitmap-backed first-fit allocator.
#[derive(Debug)]
pub struct BlockAllocator {
    geometry: Geometry,
    bitmap: RwLock<Vec<u8>>,
}

impl BlockAllocator {
    fn region_len(geometry: &Geometry) -> usize {
        geometry.bitmap_blocks as usize * geometry.block_size as usize
    }

    /// Build a fresh bitmap with every reserved block marked and write it.
    pub fn format(dev: &dyn BlockDevice, geometry: Geometry) -> Result<Self> {
        let mut bitmap = vec![0_u8; Self::region_len(&geometry)];
        for block in 0..geometry.data_start.0 {
            bitmap_set(&mut bitmap, block);
        }
        write_region(dev, geometry.bitmap_start, &bitmap)?;
        debug!(
            reserved = geometry.data_start.0,
            total = geometry.total_blocks,
            "bitmap_formatted"
        );
        Ok(Self {
            geometry,
            bitmap: RwLock::new(bitmap),
        })
    }

    /// Read the bitmap region from disk.
    pub fn load(dev: &dyn BlockDevice, geometry: Geometry) -> Result<Self> {
        let bitmap = read_region(dev, geometry.bitmap_start, geometry.bitmap_blocks)?;
        if let Some(block) = (0..geometry.data_start.0).find(|b| !bitmap_get(&bitmap, *b)) {
            return Err(SfsError::Corruption {
                block: geometry.bitmap_start.0,
                detail: format!("reserved block {block} is not marked used"),
            });
        }
        Ok(Self {
            geometry,
            bitmap: RwLock::new(bitmap),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Claim `n` blocks first-fit, persist the bitmap, and zero-fill them.
    ///
    /// Either all `n` blocks are returned or none stay marked.
    pub fn allocate(&self, dev: &dyn BlockDevice, n: u64) -> Result<Vec<BlockNumber>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut bitmap = self.bitmap.write();
        let available = bitmap_count_free(&bitmap, self.geometry.total_blocks);
        if n > available {
            debug!(requested = n, available, "allocate_no_space");
            return Err(SfsError::NoSpace);
        }
        let found = bitmap_first_free(
            &bitmap,
            self.geometry.data_start.0,
            self.geometry.total_blocks,
            n,
        );
        if (found.len() as u64) < n {
            debug!(requested = n, available = found.len(), "allocate_no_space");
            return Err(SfsError::NoSpace);
        }

        for &idx in &found {
            bitmap_set(&mut bitmap, idx);
        }
        if let Err(err) = write_region(dev, self.geometry.bitmap_start, &bitmap) {
            for &idx in &found {
                bitmap_clear(&mut bitmap, idx);
            }
            warn!(requested = n, error = %err, "allocate_persist_failed_rolled_back");
            return Err(err);
        }

        let zero = vec![0_u8; self.geometry.block_size as usize];
        for &idx in &found {
            if let Err(err) = dev.write_block(BlockNumber(idx), &zero) {
                for &undo in &found {
                    bitmap_clear(&mut bitmap, undo);
                }
                if let Err(persist) = write_region(dev, self.geometry.bitmap_start, &bitmap) {
                    warn!(error = %persist, "allocate_undo_persist_failed");
                }
                warn!(block = idx, error = %err, "allocate_zero_fill_failed");
                return Err(err);
            }
        }

        trace!(
            count = n,
            first = found.first().copied().unwrap_or_default(),
            "blocks_allocated"
        );
        Ok(found.into_iter().map(BlockNumber).collect())
    }

    /// Release `blocks`. Already-free blocks and reserved blocks are skipped.
    /// Returns how many bits were actually cleared.
    pub fn free(&self, dev: &dyn BlockDevice, blocks: &[BlockNumber]) -> Result<u64> {
        let mut bitmap = self.bitmap.write();
        let mut cleared = Vec::with_capacity(blocks.len());
        for &block in blocks {
            if !self.geometry.is_data_block(block) {
                warn!(block = block.0, "free_outside_data_region_ignored");
                continue;
            }
            if bitmap_get(&bitmap, block.0) {
                bitmap_clear(&mut bitmap, block.0);
                cleared.push(block.0);
            }
        }
        if cleared.is_empty() {
            return Ok(0);
        }
        if let Err(err) = write_region(dev, self.geometry.bitmap_start, &bitmap) {
            for &idx in &cleared {
                bitmap_set(&mut bitmap, idx);
            }
            warn!(count = cleared.len(), error = %err, "free_persist_failed_rolled_back");
            return Err(err);
        }
        trace!(count = cleared.len(), "blocks_freed");
        Ok(cleared.len() as u64)
    }

    #[must_use]
    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        bitmap_get(&self.bitmap.read(), block.0)
    }

    /// Number of clear bits across the whole image.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        bitmap_count_free(&self.bitmap.read(), self.geometry.total_blocks)
    }

    /// Rewrite the bitmap region from memory.
    pub fn persist(&self, dev: &dyn BlockDevice) -> Result<()> {
        let bitmap = self.bitmap.read();
        write_region(dev, self.geometry.bitmap_start, &bitmap)
    }

    /// Copy of the in-memory bitmap.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bitmap.read().clone()
    }
}
