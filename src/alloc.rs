//! Block allocator: a bitmap over the data blocks.
//!
//! Allocation scans from a rotating hint so successive files spread across
//! the device instead of piling onto the low blocks. One internal mutex
//! protects the bitmap and the hint together.

use parking_lot::Mutex;
use std::io::{Read, Write};

use crate::bitmap::Bitmap;
use crate::error::{FsResult, StorageError};

/// Usage counters, as reported by [`BlockAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub usage_percent: u32,
}

struct AllocState {
    map: Bitmap,
    hint: u32,
}

/// Thread-safe bitmap allocator for data blocks. Block 0 belongs to the
/// superblock and is marked used at construction.
pub struct BlockAllocator {
    total_blocks: u32,
    state: Mutex<AllocState>,
}

impl BlockAllocator {
    /// Fresh allocator with every data block free.
    pub fn new(total_blocks: u32, hint_initial: u32) -> BlockAllocator {
        let mut map = Bitmap::new(total_blocks as usize);
        if total_blocks > 0 {
            map.set(0);
        }
        BlockAllocator {
            total_blocks,
            state: Mutex::new(AllocState {
                map,
                hint: hint_initial.max(1) % total_blocks.max(1),
            }),
        }
    }

    /// Rebuild from a previously serialized bitmap.
    pub fn from_bitmap(map: Bitmap, hint_initial: u32) -> BlockAllocator {
        let total_blocks = map.len() as u32;
        BlockAllocator {
            total_blocks,
            state: Mutex::new(AllocState {
                map,
                hint: hint_initial.max(1) % total_blocks.max(1),
            }),
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Allocate one block, advancing the hint past it.
    pub fn allocate_block(&self) -> FsResult<u32> {
        let mut state = self.state.lock();
        let block = state
            .map
            .find_clear_from(state.hint as usize)
            .ok_or(StorageError::OutOfSpace {
                requested: 1,
                available: 0,
            })? as u32;
        state.map.set(block as usize);
        state.hint = (block + 1) % self.total_blocks;
        log::debug!("allocated block {}", block);
        Ok(block)
    }

    /// Allocate `n` blocks, preferring one contiguous run starting at the
    /// hint. When no run of `n` exists after one full scan, falls back to
    /// scattered allocation. A scattered failure rolls back every block
    /// marked by this call before returning `OutOfSpace`.
    pub fn allocate_blocks(&self, n: u32) -> FsResult<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();

        if let Some(start) = state.map.find_clear_run(state.hint as usize, n as usize) {
            let start = start as u32;
            for block in start..start + n {
                state.map.set(block as usize);
            }
            state.hint = (start + n) % self.total_blocks;
            log::debug!("allocated {} contiguous blocks at {}", n, start);
            return Ok((start..start + n).collect());
        }

        log::warn!("no contiguous run of {} blocks, allocating scattered", n);
        let mut taken = Vec::with_capacity(n as usize);
        for _ in 0..n {
            match state.map.find_clear_from(state.hint as usize) {
                Some(block) => {
                    state.map.set(block);
                    state.hint = (block as u32 + 1) % self.total_blocks;
                    taken.push(block as u32);
                }
                None => {
                    for &block in &taken {
                        state.map.clear(block as usize);
                    }
                    let available = state.map.count_clear() as u64;
                    return Err(StorageError::OutOfSpace {
                        requested: u64::from(n),
                        available,
                    }
                    .into());
                }
            }
        }
        log::debug!("allocated {} scattered blocks", n);
        Ok(taken)
    }

    /// Free one block. Freeing an already-free block is a warning-only
    /// no-op; block 0 and out-of-range ids are rejected.
    pub fn deallocate_block(&self, block: u32) -> FsResult<()> {
        if block == 0 || block >= self.total_blocks {
            return Err(StorageError::InvalidBlock(block).into());
        }
        let mut state = self.state.lock();
        if !state.map.get(block as usize) {
            log::warn!("ignoring deallocate of already-free block {}", block);
            return Ok(());
        }
        state.map.clear(block as usize);
        log::debug!("deallocated block {}", block);
        Ok(())
    }

    /// Free a set of blocks. Invalid ids fail the call; already-free ids
    /// inside the set only warn.
    pub fn deallocate_blocks(&self, blocks: &[u32]) -> FsResult<()> {
        for &block in blocks {
            self.deallocate_block(block)?;
        }
        Ok(())
    }

    /// True when the block is unallocated. Out-of-range ids report used.
    pub fn is_free(&self, block: u32) -> bool {
        block < self.total_blocks && !self.state.lock().map.get(block as usize)
    }

    /// Set the bit for `block` without touching the hint (replay path).
    pub fn mark_used(&self, block: u32) -> FsResult<()> {
        if block >= self.total_blocks {
            return Err(StorageError::InvalidBlock(block).into());
        }
        self.state.lock().map.set(block as usize);
        Ok(())
    }

    /// Clear the bit for `block` without touching the hint (replay path).
    pub fn mark_free(&self, block: u32) -> FsResult<()> {
        if block == 0 || block >= self.total_blocks {
            return Err(StorageError::InvalidBlock(block).into());
        }
        self.state.lock().map.clear(block as usize);
        Ok(())
    }

    /// Number of free blocks.
    pub fn free_count(&self) -> u32 {
        self.state.lock().map.count_clear() as u32
    }

    /// Number of used blocks, including block 0.
    pub fn used_count(&self) -> u32 {
        self.state.lock().map.count_set() as u32
    }

    pub fn stats(&self) -> BlockStats {
        let state = self.state.lock();
        let used = state.map.count_set() as u32;
        BlockStats {
            total_blocks: self.total_blocks,
            free_blocks: self.total_blocks - used,
            used_blocks: used,
            usage_percent: if self.total_blocks == 0 {
                0
            } else {
                used * 100 / self.total_blocks
            },
        }
    }

    /// Write the bitmap verbatim, prefixed by its length in bits.
    pub fn serialize<W: Write>(&self, w: &mut W) -> FsResult<()> {
        self.state.lock().map.serialize(w)
    }

    /// Read back a bitmap written by [`BlockAllocator::serialize`],
    /// rejecting a length mismatch.
    pub fn deserialize<R: Read>(
        r: &mut R,
        expected_blocks: u32,
        hint_initial: u32,
    ) -> FsResult<BlockAllocator> {
        let map = Bitmap::deserialize(r, expected_blocks as usize)?;
        Ok(BlockAllocator::from_bitmap(map, hint_initial))
    }

    /// Compact the bitmap view so the first `used_count` bits are used and
    /// the rest are free.
    ///
    /// This is a maintenance operation for an idle filesystem only: it does
    /// NOT move block contents, so the caller must relocate data to the low
    /// blocks afterwards or the mapping is wrong.
    pub fn defragment(&self) {
        let mut state = self.state.lock();
        let used = state.map.count_set();
        let len = state.map.len();
        let mut map = Bitmap::new(len);
        for i in 0..used {
            map.set(i);
        }
        state.map = map;
        state.hint = (used % len.max(1)) as u32;
        log::info!("defragmented bitmap: {} used bits compacted", used);
    }
}
