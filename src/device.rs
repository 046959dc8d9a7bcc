//! Backing device access.
//!
//! A device is a flat byte space. [`BlockIo`] layers block addressing and
//! bounds checks on top once the geometry is known from the superblock.
//! Unwritten regions read as zeros, which is what a freshly formatted device
//! expects.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::{FsResult, StorageError, SystemError};

/// Byte-addressed backing store. Implementations must be safe to share
/// between threads; the trait serializes nothing by itself.
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`. Short reads past the end
    /// of the device fill the remainder with zeros.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<()>;

    /// Write all of `buf` at `offset`, extending the device if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> FsResult<()>;

    /// Flush device contents to durable storage.
    fn sync(&self) -> FsResult<()>;
}

/// A device backed by a regular file.
pub struct FileDevice {
    file: Mutex<File>,
}

impl FileDevice {
    /// Create (or truncate) the backing file.
    pub fn create<P: AsRef<Path>>(path: P) -> FsResult<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(SystemError::Io)?;
        Ok(FileDevice {
            file: Mutex::new(file),
        })
    }

    /// Open an existing backing file.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(SystemError::Io)?;
        Ok(FileDevice {
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(SystemError::Io)?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]).map_err(SystemError::Io)? {
                0 => break,
                n => filled += n,
            }
        }
        // Past EOF reads as zeros.
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(SystemError::Io)?;
        file.write_all(buf).map_err(SystemError::Io)?;
        Ok(())
    }

    fn sync(&self) -> FsResult<()> {
        self.file.lock().sync_data().map_err(SystemError::Io)?;
        Ok(())
    }
}

/// In-memory device for tests and throwaway filesystems.
#[derive(Default)]
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new() -> MemDevice {
        MemDevice::default()
    }

    /// Total bytes currently stored.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let data = self.data.lock();
        let offset = offset as usize;
        let available = data.len().saturating_sub(offset);
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        buf[n..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> FsResult<()> {
        Ok(())
    }
}

/// Block-addressed view of a device with a fixed geometry.
///
/// Block N occupies bytes [N * block_size, (N + 1) * block_size). The
/// metadata region (inode table + allocation bitmap) starts right after the
/// last block.
#[derive(Clone)]
pub struct BlockIo {
    device: Arc<dyn BlockDevice>,
    block_size: u32,
    total_blocks: u32,
}

impl BlockIo {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: u32, total_blocks: u32) -> BlockIo {
        BlockIo {
            device,
            block_size,
            total_blocks,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Byte offset where the metadata region begins.
    pub fn meta_offset(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }

    fn check(&self, block: u32) -> FsResult<()> {
        if block >= self.total_blocks {
            return Err(StorageError::InvalidBlock(block).into());
        }
        Ok(())
    }

    /// Read a whole block.
    pub fn read_block(&self, block: u32) -> FsResult<Vec<u8>> {
        self.check(block)?;
        let mut buf = vec![0u8; self.block_size as usize];
        self.device
            .read_at(u64::from(block) * u64::from(self.block_size), &mut buf)?;
        Ok(buf)
    }

    /// Write a block. `data` may be shorter than the block; the remainder is
    /// zero-filled.
    pub fn write_block(&self, block: u32, data: &[u8]) -> FsResult<()> {
        self.check(block)?;
        if data.len() > self.block_size as usize {
            return Err(StorageError::InvalidBlock(block).into());
        }
        let offset = u64::from(block) * u64::from(self.block_size);
        if data.len() == self.block_size as usize {
            self.device.write_at(offset, data)
        } else {
            let mut buf = vec![0u8; self.block_size as usize];
            buf[..data.len()].copy_from_slice(data);
            self.device.write_at(offset, &buf)
        }
    }

    /// Zero a whole block.
    pub fn zero_block(&self, block: u32) -> FsResult<()> {
        self.write_block(block, &[])
    }

    /// Read `len` bytes from the metadata region.
    pub fn read_meta(&self, len: usize) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.device.read_at(self.meta_offset(), &mut buf)?;
        Ok(buf)
    }

    /// Overwrite the metadata region.
    pub fn write_meta(&self, data: &[u8]) -> FsResult<()> {
        self.device.write_at(self.meta_offset(), data)
    }

    pub fn sync(&self) -> FsResult<()> {
        self.device.sync()
    }
}
