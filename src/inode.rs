//! Inode records and the fixed-capacity inode table.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::bitmap::Bitmap;
use crate::checksum::checksum32;
use crate::error::{FsResult, StorageError, SystemError};
use crate::{unix_now, DIRECT_POINTERS, S_IFDIR, S_IFMT, S_IFREG};

/// Serialized inode record size. 118 bytes of fields plus reserved padding.
/// 128 divides every legal block size, keeping table serialization aligned.
pub const INODE_SIZE: usize = 128;

const INODE_PADDING: usize = 10;

/// Per-file or per-directory metadata.
///
/// `replication_count` is reserved for future distributed layouts: it is
/// preserved on disk, defaults to 1, and is ignored by all logic here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub direct: [u32; DIRECT_POINTERS],
    pub indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
    pub replication_count: u32,
    pub checksum: u32,
    pub link_count: u32,
}

impl Inode {
    /// A zeroed record, as stored in a free table slot.
    pub fn zeroed() -> Inode {
        Inode {
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: [0; DIRECT_POINTERS],
            indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
            replication_count: 0,
            checksum: 0,
            link_count: 0,
        }
    }

    /// Fresh live inode with current timestamps and a single link.
    pub fn new(mode: u16, uid: u16, gid: u16) -> Inode {
        let now = unix_now();
        let mut inode = Inode {
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            replication_count: 1,
            link_count: 1,
            ..Inode::zeroed()
        };
        inode.update_checksum();
        inode
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Permission bits as "rwxr-xr-x".
    pub fn permissions_string(&self) -> String {
        let mut s = String::with_capacity(9);
        for shift in [6u16, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        s
    }

    pub fn touch_atime(&mut self) {
        self.atime = unix_now();
        self.update_checksum();
    }

    pub fn touch_mtime(&mut self) {
        let now = unix_now();
        self.mtime = now;
        self.ctime = now;
        self.update_checksum();
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = unix_now();
        self.update_checksum();
    }

    /// Serialize to the fixed 128-byte record.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INODE_SIZE);
        buf.write_u16::<LittleEndian>(self.mode).unwrap();
        buf.write_u16::<LittleEndian>(self.uid).unwrap();
        buf.write_u16::<LittleEndian>(self.gid).unwrap();
        buf.write_u64::<LittleEndian>(self.size).unwrap();
        buf.write_u64::<LittleEndian>(self.blocks).unwrap();
        buf.write_u64::<LittleEndian>(self.atime).unwrap();
        buf.write_u64::<LittleEndian>(self.mtime).unwrap();
        buf.write_u64::<LittleEndian>(self.ctime).unwrap();
        for ptr in self.direct {
            buf.write_u32::<LittleEndian>(ptr).unwrap();
        }
        buf.write_u32::<LittleEndian>(self.indirect).unwrap();
        buf.write_u32::<LittleEndian>(self.double_indirect).unwrap();
        buf.write_u32::<LittleEndian>(self.triple_indirect).unwrap();
        buf.write_u32::<LittleEndian>(self.replication_count).unwrap();
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.write_u32::<LittleEndian>(self.link_count).unwrap();
        buf.extend_from_slice(&[0u8; INODE_PADDING]);
        debug_assert_eq!(buf.len(), INODE_SIZE);
        buf
    }

    /// Parse a 128-byte record.
    pub fn decode(data: &[u8]) -> FsResult<Inode> {
        if data.len() < INODE_SIZE {
            return Err(SystemError::FilesystemCorrupt(format!(
                "inode record too short: {} bytes",
                data.len()
            ))
            .into());
        }
        let mut r = Cursor::new(data);
        let mut inode = Inode {
            mode: r.read_u16::<LittleEndian>().map_err(SystemError::Io)?,
            uid: r.read_u16::<LittleEndian>().map_err(SystemError::Io)?,
            gid: r.read_u16::<LittleEndian>().map_err(SystemError::Io)?,
            size: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            blocks: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            atime: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            mtime: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            ctime: r.read_u64::<LittleEndian>().map_err(SystemError::Io)?,
            ..Inode::zeroed()
        };
        for ptr in inode.direct.iter_mut() {
            *ptr = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        }
        inode.indirect = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        inode.double_indirect = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        inode.triple_indirect = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        inode.replication_count = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        inode.checksum = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        inode.link_count = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        Ok(inode)
    }

    fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        checksum32(&copy.encode())
    }

    /// Recompute and store the checksum. Call after any field change.
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// True when the stored checksum matches the record.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// Fixed-capacity array of inode records plus a parallel free bitmap.
///
/// Slot 0 is permanently reserved invalid; slot 1 belongs to the root
/// directory after format.
#[derive(Debug, Clone)]
pub struct InodeTable {
    inodes: Vec<Inode>,
    used: Bitmap,
    hint: u32,
}

impl InodeTable {
    /// Empty table with `count` slots. Slot 0 starts marked used so it is
    /// never handed out.
    pub fn new(count: u32) -> InodeTable {
        let mut used = Bitmap::new(count as usize);
        if count > 0 {
            used.set(0);
        }
        InodeTable {
            inodes: vec![Inode::zeroed(); count as usize],
            used,
            hint: 1,
        }
    }

    /// Total number of slots, including reserved slot 0.
    pub fn capacity(&self) -> u32 {
        self.inodes.len() as u32
    }

    /// Number of unallocated slots.
    pub fn free_count(&self) -> u32 {
        self.used.count_clear() as u32
    }

    /// Number of live inodes, excluding reserved slot 0.
    pub fn live_count(&self) -> u32 {
        (self.used.count_set() - 1) as u32
    }

    /// True when slot `n` is unallocated.
    pub fn is_free(&self, n: u32) -> bool {
        (n as usize) < self.inodes.len() && !self.used.get(n as usize)
    }

    /// Allocate a free slot, scanning from the rotating hint. The slot is
    /// zeroed; the caller stores the record with [`InodeTable::write`].
    pub fn allocate(&mut self) -> FsResult<u32> {
        let n = self
            .used
            .find_clear_from(self.hint as usize)
            .ok_or(StorageError::OutOfSpace {
                requested: 1,
                available: 0,
            })? as u32;
        self.used.set(n as usize);
        self.inodes[n as usize] = Inode::zeroed();
        self.hint = (n + 1) % self.capacity();
        log::debug!("allocated inode {}", n);
        Ok(n)
    }

    /// Claim a specific slot (used by format for the root directory and by
    /// WAL replay).
    pub fn allocate_at(&mut self, n: u32) -> FsResult<()> {
        if n == 0 || n >= self.capacity() {
            return Err(StorageError::InodeNotFound(n).into());
        }
        self.used.set(n as usize);
        Ok(())
    }

    /// Release a slot and zero its record. Releasing an already-free slot is
    /// a warning-only no-op.
    pub fn deallocate(&mut self, n: u32) {
        if n == 0 || n >= self.capacity() {
            log::warn!("ignoring deallocate of invalid inode {}", n);
            return;
        }
        if !self.used.get(n as usize) {
            log::warn!("ignoring deallocate of already-free inode {}", n);
            return;
        }
        self.used.clear(n as usize);
        self.inodes[n as usize] = Inode::zeroed();
        log::debug!("deallocated inode {}", n);
    }

    /// Snapshot of a live inode record.
    pub fn read(&self, n: u32) -> FsResult<Inode> {
        if n == 0 || n >= self.capacity() || !self.used.get(n as usize) {
            return Err(StorageError::InodeNotFound(n).into());
        }
        Ok(self.inodes[n as usize])
    }

    /// Store a record into a live slot.
    pub fn write(&mut self, n: u32, inode: Inode) -> FsResult<()> {
        if n == 0 || n >= self.capacity() || !self.used.get(n as usize) {
            return Err(StorageError::InodeNotFound(n).into());
        }
        self.inodes[n as usize] = inode;
        Ok(())
    }

    /// Iterate over `(inode_number, record)` for every live slot.
    pub fn live(&self) -> impl Iterator<Item = (u32, &Inode)> + '_ {
        self.inodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(n, _)| self.used.get(*n))
            .map(|(n, inode)| (n as u32, inode))
    }

    /// Serialize: slot count, each record, then the free bitmap.
    pub fn serialize<W: Write>(&self, w: &mut W) -> FsResult<()> {
        w.write_u32::<LittleEndian>(self.capacity())
            .map_err(SystemError::Io)?;
        for inode in &self.inodes {
            w.write_all(&inode.encode()).map_err(SystemError::Io)?;
        }
        self.used.serialize(w)
    }

    /// Mirror of [`InodeTable::serialize`], validating the slot count.
    pub fn deserialize<R: Read>(r: &mut R, expected_count: u32) -> FsResult<InodeTable> {
        let count = r.read_u32::<LittleEndian>().map_err(SystemError::Io)?;
        if count != expected_count {
            return Err(SystemError::FilesystemCorrupt(format!(
                "inode table has {} slots, superblock says {}",
                count, expected_count
            ))
            .into());
        }
        let mut inodes = Vec::with_capacity(count as usize);
        let mut record = vec![0u8; INODE_SIZE];
        for _ in 0..count {
            r.read_exact(&mut record).map_err(SystemError::Io)?;
            inodes.push(Inode::decode(&record)?);
        }
        let used = Bitmap::deserialize(r, count as usize)?;
        Ok(InodeTable {
            inodes,
            used,
            hint: 1,
        })
    }

    /// Serialized size in bytes for a table of `count` slots.
    pub fn serialized_size(count: u32) -> usize {
        4 + count as usize * INODE_SIZE + Bitmap::serialized_size(count as usize)
    }
}
