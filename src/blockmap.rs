//! Logical file offsets to device blocks, through the inode's pointer tree.
//!
//! Indices 0..11 are direct. With K = block_size / 4 pointers per block, the
//! next K indices go through `indirect`, the next K^2 through
//! `double_indirect`, and the next K^3 through `triple_indirect`. A zero
//! entry anywhere is a hole: reads return zeros, writes materialize the
//! missing pointer blocks.
//!
//! All device access and allocation goes through a [`BlockSink`], which the
//! facade implements so every change lands in the active transaction.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsResult, StorageError};
use crate::inode::Inode;
use crate::DIRECT_POINTERS;

/// Read-only capability over the block space. Observation from read-only
/// contexts goes through this; it can never stage a change.
pub trait BlockSource {
    fn block_size(&self) -> u32;
    fn read_block(&self, block: u32) -> FsResult<Vec<u8>>;
}

/// Mutating capability. Implementations log every write, allocation, and
/// free into the active transaction.
pub trait BlockSink: BlockSource {
    fn write_block(&self, block: u32, data: &[u8]) -> FsResult<()>;
    fn alloc_block(&self) -> FsResult<u32>;
    fn free_block(&self, block: u32) -> FsResult<()>;
}

/// Pointers per pointer block.
fn fanout(block_size: u32) -> u64 {
    u64::from(block_size / 4)
}

/// Largest representable file for a given block size.
pub fn max_file_size(block_size: u32) -> u64 {
    let k = fanout(block_size) as u128;
    let blocks = DIRECT_POINTERS as u128 + k + k * k + k * k * k;
    (blocks * block_size as u128).min(u64::MAX as u128) as u64
}

/// Number of data blocks needed for `size` bytes.
pub fn blocks_for(size: u64, block_size: u32) -> u64 {
    size.div_ceil(u64::from(block_size))
}

/// Where a logical block index lands in the pointer tree.
enum Level {
    Direct(usize),
    Indirect(u64),
    Double(u64, u64),
    Triple(u64, u64, u64),
}

fn locate(idx: u64, block_size: u32) -> FsResult<Level> {
    let k = fanout(block_size);
    let direct = DIRECT_POINTERS as u64;
    if idx < direct {
        return Ok(Level::Direct(idx as usize));
    }
    let idx = idx - direct;
    if idx < k {
        return Ok(Level::Indirect(idx));
    }
    let idx = idx - k;
    if idx < k * k {
        return Ok(Level::Double(idx / k, idx % k));
    }
    let idx = idx - k * k;
    if idx < k * k * k {
        return Ok(Level::Triple(idx / (k * k), (idx / k) % k, idx % k));
    }
    Err(StorageError::InvalidBlock(u32::MAX).into())
}

fn read_pointer<S: BlockSource + ?Sized>(src: &S, block: u32, slot: u64) -> FsResult<u32> {
    if block == 0 {
        return Ok(0);
    }
    let data = src.read_block(block)?;
    Ok(LittleEndian::read_u32(&data[slot as usize * 4..]))
}

fn write_pointer<S: BlockSink + ?Sized>(sink: &S, block: u32, slot: u64, value: u32) -> FsResult<()> {
    let mut data = sink.read_block(block)?;
    LittleEndian::write_u32(&mut data[slot as usize * 4..], value);
    sink.write_block(block, &data)
}

/// Allocate a zeroed pointer block.
fn alloc_pointer_block<S: BlockSink + ?Sized>(sink: &S) -> FsResult<u32> {
    let block = sink.alloc_block()?;
    sink.write_block(block, &[])?;
    Ok(block)
}

/// Device block holding logical index `idx`, or 0 for a hole.
pub fn lookup<S: BlockSource + ?Sized>(inode: &Inode, idx: u64, src: &S) -> FsResult<u32> {
    let bs = src.block_size();
    match locate(idx, bs)? {
        Level::Direct(i) => Ok(inode.direct[i]),
        Level::Indirect(i) => read_pointer(src, inode.indirect, i),
        Level::Double(i, j) => {
            let mid = read_pointer(src, inode.double_indirect, i)?;
            read_pointer(src, mid, j)
        }
        Level::Triple(i, j, l) => {
            let mid = read_pointer(src, inode.triple_indirect, i)?;
            let leaf = read_pointer(src, mid, j)?;
            read_pointer(src, leaf, l)
        }
    }
}

/// Ensure a data block exists for logical index `idx`, materializing pointer
/// blocks on demand. Returns `(block, fresh)`; a fresh block's on-device
/// content is undefined and the caller must fully overwrite it.
pub fn ensure<S: BlockSink + ?Sized>(inode: &mut Inode, idx: u64, sink: &S) -> FsResult<(u32, bool)> {
    let bs = sink.block_size();

    // Walk down, materializing each missing pointer block.
    let slots: Vec<u64> = match locate(idx, bs)? {
        Level::Direct(i) => {
            if inode.direct[i] != 0 {
                return Ok((inode.direct[i], false));
            }
            let block = sink.alloc_block()?;
            inode.direct[i] = block;
            inode.blocks += 1;
            return Ok((block, true));
        }
        Level::Indirect(i) => vec![i],
        Level::Double(i, j) => vec![i, j],
        Level::Triple(i, j, l) => vec![i, j, l],
    };

    let root = match slots.len() {
        1 => &mut inode.indirect,
        2 => &mut inode.double_indirect,
        _ => &mut inode.triple_indirect,
    };
    if *root == 0 {
        *root = alloc_pointer_block(sink)?;
    }
    let mut at = *root;
    for (depth, &slot) in slots.iter().enumerate() {
        let last = depth == slots.len() - 1;
        let mut next = read_pointer(sink, at, slot)?;
        if next == 0 {
            if last {
                next = sink.alloc_block()?;
                inode.blocks += 1;
                write_pointer(sink, at, slot, next)?;
                return Ok((next, true));
            }
            next = alloc_pointer_block(sink)?;
            write_pointer(sink, at, slot, next)?;
        } else if last {
            return Ok((next, false));
        }
        at = next;
    }
    unreachable!("pointer walk always terminates at the leaf slot");
}

/// Free an entire pointer subtree. `level` 0 is a data block.
fn free_subtree<S: BlockSink + ?Sized>(
    inode: &mut Inode,
    root: u32,
    level: u32,
    sink: &S,
) -> FsResult<()> {
    if root == 0 {
        return Ok(());
    }
    if level == 0 {
        sink.free_block(root)?;
        inode.blocks = inode.blocks.saturating_sub(1);
        return Ok(());
    }
    let k = fanout(sink.block_size());
    let data = sink.read_block(root)?;
    for slot in 0..k {
        let child = LittleEndian::read_u32(&data[slot as usize * 4..]);
        free_subtree(inode, child, level - 1, sink)?;
    }
    sink.free_block(root)
}

/// Trim a subtree to its first `keep` data blocks. Returns true when the
/// subtree became empty and its root was freed.
fn trim_subtree<S: BlockSink + ?Sized>(
    inode: &mut Inode,
    root: u32,
    level: u32,
    keep: u64,
    sink: &S,
) -> FsResult<bool> {
    if root == 0 {
        return Ok(true);
    }
    if keep == 0 {
        free_subtree(inode, root, level, sink)?;
        return Ok(true);
    }
    let k = fanout(sink.block_size());
    let child_span = k.pow(level - 1);
    let mut data = sink.read_block(root)?;
    let mut dirty = false;
    for slot in 0..k {
        let child = LittleEndian::read_u32(&data[slot as usize * 4..]);
        let child_start = slot * child_span;
        if child_start + child_span <= keep {
            continue;
        }
        if child_start >= keep {
            free_subtree(inode, child, level - 1, sink)?;
            if child != 0 {
                LittleEndian::write_u32(&mut data[slot as usize * 4..], 0);
                dirty = true;
            }
        } else if level > 1 {
            // Straddling child: trim inside it.
            if trim_subtree(inode, child, level - 1, keep - child_start, sink)? && child != 0 {
                LittleEndian::write_u32(&mut data[slot as usize * 4..], 0);
                dirty = true;
            }
        }
    }
    if dirty {
        sink.write_block(root, &data)?;
    }
    Ok(false)
}

/// Shrink the file to `new_size` bytes, freeing unreferenced data blocks and
/// pruning pointer blocks that empty out. Growing is a no-op here; writes
/// extend the tree on demand.
pub fn truncate<S: BlockSink + ?Sized>(inode: &mut Inode, new_size: u64, sink: &S) -> FsResult<()> {
    let bs = sink.block_size();
    let keep = blocks_for(new_size, bs);
    let k = fanout(bs);
    let direct = DIRECT_POINTERS as u64;

    for i in 0..DIRECT_POINTERS {
        if (i as u64) >= keep && inode.direct[i] != 0 {
            sink.free_block(inode.direct[i])?;
            inode.direct[i] = 0;
            inode.blocks = inode.blocks.saturating_sub(1);
        }
    }

    let keep_indirect = keep.saturating_sub(direct).min(k);
    if trim_subtree(inode, inode.indirect, 1, keep_indirect, sink)? {
        inode.indirect = 0;
    }

    let keep_double = keep.saturating_sub(direct + k).min(k * k);
    if trim_subtree(inode, inode.double_indirect, 2, keep_double, sink)? {
        inode.double_indirect = 0;
    }

    let keep_triple = keep.saturating_sub(direct + k + k * k).min(k * k * k);
    if trim_subtree(inode, inode.triple_indirect, 3, keep_triple, sink)? {
        inode.triple_indirect = 0;
    }

    inode.size = new_size.min(inode.size);
    Ok(())
}

/// Read `len` bytes at `offset`, clamped to the file size. Holes read as
/// zeros.
pub fn read_range<S: BlockSource + ?Sized>(
    inode: &Inode,
    offset: u64,
    len: u64,
    src: &S,
) -> FsResult<Vec<u8>> {
    let bs = u64::from(src.block_size());
    if offset >= inode.size {
        return Ok(Vec::new());
    }
    let end = offset.saturating_add(len).min(inode.size);
    let mut out = vec![0u8; (end - offset) as usize];

    let mut pos = offset;
    while pos < end {
        let idx = pos / bs;
        let within = pos % bs;
        let chunk = (bs - within).min(end - pos) as usize;
        let block = lookup(inode, idx, src)?;
        if block != 0 {
            let data = src.read_block(block)?;
            let dst = (pos - offset) as usize;
            out[dst..dst + chunk].copy_from_slice(&data[within as usize..within as usize + chunk]);
        }
        pos += chunk as u64;
    }
    Ok(out)
}

/// Write `data` at `offset`, materializing blocks and growing the size as
/// needed.
pub fn write_range<S: BlockSink + ?Sized>(
    inode: &mut Inode,
    offset: u64,
    data: &[u8],
    sink: &S,
) -> FsResult<()> {
    if data.is_empty() {
        inode.size = inode.size.max(offset);
        return Ok(());
    }
    let bs = u64::from(sink.block_size());
    let end = offset + data.len() as u64;
    if end > max_file_size(sink.block_size()) {
        return Err(StorageError::OutOfSpace {
            requested: blocks_for(end, sink.block_size()),
            available: 0,
        }
        .into());
    }

    let mut pos = offset;
    while pos < end {
        let idx = pos / bs;
        let within = pos % bs;
        let chunk = (bs - within).min(end - pos) as usize;
        let (block, fresh) = ensure(inode, idx, sink)?;

        let src = (pos - offset) as usize;
        if chunk as u64 == bs {
            sink.write_block(block, &data[src..src + chunk])?;
        } else {
            // Partial block: merge with existing content, or zeros when the
            // block is fresh (its device content is undefined).
            let mut buf = if fresh {
                vec![0u8; bs as usize]
            } else {
                sink.read_block(block)?
            };
            buf[within as usize..within as usize + chunk].copy_from_slice(&data[src..src + chunk]);
            sink.write_block(block, &buf)?;
        }
        pos += chunk as u64;
    }
    inode.size = inode.size.max(end);
    Ok(())
}

/// Every data block referenced by the inode, in logical order.
pub fn data_blocks<S: BlockSource + ?Sized>(inode: &Inode, src: &S) -> FsResult<Vec<u32>> {
    let bs = src.block_size();
    let mut out = Vec::new();
    for idx in 0..blocks_for(inode.size, bs) {
        let block = lookup(inode, idx, src)?;
        if block != 0 {
            out.push(block);
        }
    }
    Ok(out)
}
