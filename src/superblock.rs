//! Superblock: durable global metadata in block 0.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::checksum::checksum32;
use crate::device::BlockIo;
use crate::error::{FsResult, StorageError, SystemError};
use crate::{unix_now, MAGIC, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, MIN_INODE_COUNT, MIN_TOTAL_BLOCKS, ROOT_INODE, VERSION};

/// Serialized size: 52 bytes of fields plus 64 bytes of reserved padding.
/// The on-disk copy is zero-filled out to the block size.
pub const SUPERBLOCK_DISK_SIZE: usize = 116;

const PADDING: usize = 64;

/// Global filesystem metadata. Lives in block 0 for the device's lifetime;
/// created by format, destroyed only by re-format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
    pub root_inode: u32,
    pub last_mount_time: u64,
    pub last_write_time: u64,
    pub version: u32,
    pub checksum: u32,
}

impl Superblock {
    /// Build the superblock for a fresh format. One block is reserved for
    /// the superblock itself and one inode for the root directory, so the
    /// free counters start at `total - 1` and `inode_count - 1`.
    ///
    /// The inode table gets one slot per four blocks, at least
    /// `MIN_INODE_COUNT`, clamped to `total_blocks` so the smallest legal
    /// devices still validate.
    pub fn initialize(total_blocks: u32, block_size: u32) -> Superblock {
        let inode_count = (total_blocks / 4).max(MIN_INODE_COUNT).min(total_blocks);
        let now = unix_now();
        let mut sb = Superblock {
            magic: MAGIC,
            block_size,
            total_blocks,
            free_blocks: total_blocks - 1,
            inode_count,
            free_inodes: inode_count - 1,
            root_inode: ROOT_INODE,
            last_mount_time: now,
            last_write_time: now,
            version: VERSION,
            checksum: 0,
        };
        sb.update_checksum();
        log::info!(
            "initialized superblock: {} blocks of {} bytes, {} inodes",
            total_blocks,
            block_size,
            inode_count
        );
        sb
    }

    /// Serialize to the fixed 116-byte on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUPERBLOCK_DISK_SIZE);
        buf.write_u32::<LittleEndian>(self.magic).unwrap();
        buf.write_u32::<LittleEndian>(self.block_size).unwrap();
        buf.write_u32::<LittleEndian>(self.total_blocks).unwrap();
        buf.write_u32::<LittleEndian>(self.free_blocks).unwrap();
        buf.write_u32::<LittleEndian>(self.inode_count).unwrap();
        buf.write_u32::<LittleEndian>(self.free_inodes).unwrap();
        buf.write_u32::<LittleEndian>(self.root_inode).unwrap();
        buf.write_u64::<LittleEndian>(self.last_mount_time).unwrap();
        buf.write_u64::<LittleEndian>(self.last_write_time).unwrap();
        buf.write_u32::<LittleEndian>(self.version).unwrap();
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.extend_from_slice(&[0u8; PADDING]);
        debug_assert_eq!(buf.len(), SUPERBLOCK_DISK_SIZE);
        buf
    }

    /// Parse the on-disk form. Does not validate; call [`Superblock::validate`].
    pub fn decode(data: &[u8]) -> FsResult<Superblock> {
        if data.len() < SUPERBLOCK_DISK_SIZE {
            return Err(SystemError::FilesystemCorrupt(format!(
                "superblock too short: {} bytes",
                data.len()
            ))
            .into());
        }
        let mut r = Cursor::new(data);
        Ok(Superblock {
            magic: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            block_size: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            total_blocks: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            free_blocks: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            inode_count: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            free_inodes: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            root_inode: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            last_mount_time: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            last_write_time: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            version: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
            checksum: r.read_u32::<LittleEndian>().map_err(SystemError::Io)?,
        })
    }

    fn compute_checksum(&self) -> u32 {
        let mut copy = self.clone();
        copy.checksum = 0;
        checksum32(&copy.encode())
    }

    /// Recompute and store the checksum. Call after any field change.
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Validate every structural invariant, including the checksum.
    pub fn validate(&self) -> FsResult<()> {
        let fail = |msg: String| -> FsResult<()> {
            log::error!("superblock validation failed: {}", msg);
            Err(SystemError::FilesystemCorrupt(msg).into())
        };

        if self.magic != MAGIC {
            return fail(format!("bad magic {:#010x}", self.magic));
        }
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return fail(format!("bad block size {}", self.block_size));
        }
        if self.total_blocks < MIN_TOTAL_BLOCKS {
            return fail(format!("bad total blocks {}", self.total_blocks));
        }
        if self.inode_count == 0 || self.inode_count > self.total_blocks {
            return fail(format!("bad inode count {}", self.inode_count));
        }
        if self.free_blocks > self.total_blocks {
            return fail(format!(
                "free blocks {} exceeds total {}",
                self.free_blocks, self.total_blocks
            ));
        }
        if self.free_inodes > self.inode_count {
            return fail(format!(
                "free inodes {} exceeds count {}",
                self.free_inodes, self.inode_count
            ));
        }
        if self.root_inode == 0 || self.root_inode >= self.inode_count {
            return fail(format!("bad root inode {}", self.root_inode));
        }
        if self.checksum != self.compute_checksum() {
            return fail("checksum mismatch".into());
        }
        Ok(())
    }

    /// Write to block 0 of the device.
    pub fn persist(&self, io: &BlockIo) -> FsResult<()> {
        io.write_block(0, &self.encode())
    }

    /// Read from block 0 of the device.
    pub fn load(io: &BlockIo) -> FsResult<Superblock> {
        let block = io.read_block(0)?;
        Superblock::decode(&block)
    }

    /// Claim one free block, failing `OutOfSpace` at zero.
    pub fn reserve_block(&mut self) -> FsResult<()> {
        if self.free_blocks == 0 {
            return Err(StorageError::OutOfSpace {
                requested: 1,
                available: 0,
            }
            .into());
        }
        self.free_blocks -= 1;
        self.update_checksum();
        Ok(())
    }

    /// Return one block to the free pool.
    pub fn release_block(&mut self) {
        debug_assert!(self.free_blocks < self.total_blocks);
        self.free_blocks = (self.free_blocks + 1).min(self.total_blocks);
        self.update_checksum();
    }

    /// Claim one free inode, failing `OutOfSpace` at zero.
    pub fn reserve_inode(&mut self) -> FsResult<()> {
        if self.free_inodes == 0 {
            return Err(StorageError::OutOfSpace {
                requested: 1,
                available: 0,
            }
            .into());
        }
        self.free_inodes -= 1;
        self.update_checksum();
        Ok(())
    }

    /// Return one inode to the free pool.
    pub fn release_inode(&mut self) {
        debug_assert!(self.free_inodes < self.inode_count);
        self.free_inodes = (self.free_inodes + 1).min(self.inode_count);
        self.update_checksum();
    }

    /// Record a mount.
    pub fn update_mount_time(&mut self) {
        self.last_mount_time = unix_now();
        self.update_checksum();
    }

    /// Record a metadata flush.
    pub fn update_write_time(&mut self) {
        self.last_write_time = unix_now();
        self.update_checksum();
    }

    /// True when at least `blocks` blocks are free.
    pub fn has_space_for(&self, blocks: u32) -> bool {
        self.free_blocks >= blocks
    }

    /// True when at least `inodes` inodes are free.
    pub fn has_inodes_for(&self, inodes: u32) -> bool {
        self.free_inodes >= inodes
    }

    /// Percentage of blocks in use, 0-100.
    pub fn usage_percent(&self) -> u32 {
        if self.total_blocks == 0 {
            return 0;
        }
        (self.total_blocks - self.free_blocks) * 100 / self.total_blocks
    }

    /// Percentage of inodes in use, 0-100.
    pub fn inode_usage_percent(&self) -> u32 {
        if self.inode_count == 0 {
            return 0;
        }
        (self.inode_count - self.free_inodes) * 100 / self.inode_count
    }
}
