//! The file-system facade: public operations over the mounted state.
//!
//! Every mutating operation runs inside a transaction. Without an explicit
//! caller-driven scope the operation begins, stages, and commits its own
//! transaction while holding the writer locks it needs; with one open (see
//! [`FileSystem::begin_transaction`]) mutations from the opening thread
//! stage into that scope and become durable only at
//! [`FileSystem::commit_transaction`]. Other threads keep auto-committing.
//!
//! Lock order, outermost first: mount lock, inode locks in ascending inode
//! number, allocator/table mutexes, WAL mutex.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::alloc::BlockAllocator;
use crate::bitmap::Bitmap;
use crate::blockmap::{self, BlockSink, BlockSource};
use crate::checksum::checksum32;
use crate::config::{validate_block_size, FsConfig};
use crate::device::{BlockDevice, BlockIo, FileDevice};
use crate::dir;
use crate::error::{
    ConcurrencyError, FsResult, PathError, StorageError, SystemError,
};
use crate::inode::{Inode, InodeTable};
use crate::locks::LockTable;
use crate::paths;
use crate::superblock::{Superblock, SUPERBLOCK_DISK_SIZE};
use crate::txn::{ReplayTarget, TransactionGuard, TransactionManager};
use crate::wal::{WalOp, WalRecord};
use crate::{unix_now, MIN_TOTAL_BLOCKS, ROOT_INODE, S_IFDIR, S_IFMT, S_IFREG};

/// Geometry and usage summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilesystemInfo {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub block_size: u32,
    pub usage_percentage: f64,
}

/// Content census plus transaction activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemStats {
    pub total_files: u32,
    pub total_directories: u32,
    pub total_data_size: u64,
    pub active_transactions: u32,
}

/// An open explicit transaction scope, bound to the thread that opened it.
/// Mutations from any other thread do not join it.
#[derive(Clone, Copy)]
struct AmbientScope {
    owner: ThreadId,
    tx: u64,
}

/// Everything owned by a mounted filesystem. Dropped on unmount, which
/// releases the device and the WAL file on every path out.
struct Mounted {
    io: BlockIo,
    superblock: Mutex<Superblock>,
    inodes: Mutex<InodeTable>,
    allocator: BlockAllocator,
    locks: LockTable,
    txns: TransactionManager,
    ambient: Mutex<Option<AmbientScope>>,
    atime_updates: bool,
}

/// The public filesystem handle. Cheap to create; all state lives behind
/// the mount.
pub struct FileSystem {
    state: RwLock<Option<Mounted>>,
    config: FsConfig,
}

impl Default for FileSystem {
    fn default() -> Self {
        FileSystem::new()
    }
}

// ---------------------------------------------------------------------------
// Replay and block capabilities
// ---------------------------------------------------------------------------

impl BlockSource for Mounted {
    fn block_size(&self) -> u32 {
        self.io.block_size()
    }

    fn read_block(&self, block: u32) -> FsResult<Vec<u8>> {
        self.io.read_block(block)
    }
}

impl ReplayTarget for Mounted {
    /// Idempotent redo. Called at commit (where the deferred frees take
    /// effect) and again during recovery replay.
    fn apply(&self, record: &WalRecord) -> FsResult<()> {
        match record.op {
            WalOp::Begin | WalOp::Commit | WalOp::Abort | WalOp::DirAdd | WalOp::DirRemove => {
                Ok(())
            }
            WalOp::WriteBlock => self.io.write_block(record.block, &record.new_data),
            WalOp::AllocBlock => {
                if self.allocator.is_free(record.block) {
                    self.allocator.mark_used(record.block)?;
                    self.superblock.lock().reserve_block()?;
                }
                Ok(())
            }
            WalOp::FreeBlock => {
                if !self.allocator.is_free(record.block) {
                    self.allocator.mark_free(record.block)?;
                    self.superblock.lock().release_block();
                }
                Ok(())
            }
            WalOp::AllocInode => {
                let mut inodes = self.inodes.lock();
                if inodes.is_free(record.inode) {
                    inodes.allocate_at(record.inode)?;
                    self.superblock.lock().reserve_inode()?;
                }
                Ok(())
            }
            WalOp::FreeInode => {
                let mut inodes = self.inodes.lock();
                if !inodes.is_free(record.inode) {
                    inodes.deallocate(record.inode);
                    self.superblock.lock().release_inode();
                }
                Ok(())
            }
            WalOp::Create => {
                let inode = Inode::decode(&record.new_data)?;
                let mut inodes = self.inodes.lock();
                inodes.allocate_at(record.inode)?;
                inodes.write(record.inode, inode)
            }
        }
    }

    /// Reverse one staged record using its before-image. Deferred frees were
    /// never applied, so they undo as no-ops.
    fn undo(&self, record: &WalRecord) -> FsResult<()> {
        match record.op {
            WalOp::Begin
            | WalOp::Commit
            | WalOp::Abort
            | WalOp::DirAdd
            | WalOp::DirRemove
            | WalOp::FreeBlock
            | WalOp::FreeInode => Ok(()),
            WalOp::WriteBlock => self.io.write_block(record.block, &record.old_data),
            WalOp::AllocBlock => {
                if !self.allocator.is_free(record.block) {
                    self.allocator.mark_free(record.block)?;
                    self.superblock.lock().release_block();
                }
                Ok(())
            }
            WalOp::AllocInode => {
                let mut inodes = self.inodes.lock();
                if !inodes.is_free(record.inode) {
                    inodes.deallocate(record.inode);
                    self.superblock.lock().release_inode();
                }
                Ok(())
            }
            WalOp::Create => {
                if record.old_data.is_empty() {
                    // Fresh inode: the AllocInode undo clears the slot.
                    return Ok(());
                }
                let inode = Inode::decode(&record.old_data)?;
                let mut inodes = self.inodes.lock();
                inodes.allocate_at(record.inode)?;
                inodes.write(record.inode, inode)
            }
        }
    }
}

/// Mutation context: one façade operation inside one transaction. Every
/// change is staged into the transaction and applied to the live state, so
/// rollback can reverse it and recovery can replay it.
struct OpCtx<'a> {
    m: &'a Mounted,
    tx: u64,
}

impl OpCtx<'_> {
    fn stage(&self, record: WalRecord) -> FsResult<()> {
        self.m.txns.append(self.tx, record)
    }

    /// Capture the old inode image, stage the new one, and store it.
    fn set_inode(&self, ino: u32, inode: &Inode) -> FsResult<()> {
        let old = self.m.inodes.lock().read(ino)?.encode();
        self.stage(
            WalRecord::new(self.tx, WalOp::Create, ino, 0).with_images(old, inode.encode()),
        )?;
        self.m.inodes.lock().write(ino, *inode)
    }

    fn alloc_inode(&self) -> FsResult<u32> {
        let ino = self.m.inodes.lock().allocate()?;
        if let Err(err) = self.m.superblock.lock().reserve_inode() {
            self.m.inodes.lock().deallocate(ino);
            return Err(err);
        }
        self.stage(WalRecord::new(self.tx, WalOp::AllocInode, ino, 0))?;
        Ok(ino)
    }

    /// Deferred: the slot is reclaimed when the transaction commits.
    fn free_inode(&self, ino: u32) -> FsResult<()> {
        self.stage(WalRecord::new(self.tx, WalOp::FreeInode, ino, 0))
    }

    fn dir_marker(&self, op: WalOp, dir_ino: u32, name: &str) -> FsResult<()> {
        self.stage(
            WalRecord::new(self.tx, op, dir_ino, 0)
                .with_images(Vec::new(), name.as_bytes().to_vec()),
        )
    }

    /// Replace a directory's content with `image` and stamp its inode.
    fn write_directory(&self, dir_ino: u32, image: &[u8]) -> FsResult<()> {
        let mut inode = self.m.inodes.lock().read(dir_ino)?;
        blockmap::write_range(&mut inode, 0, image, self)?;
        blockmap::truncate(&mut inode, image.len() as u64, self)?;
        inode.touch_mtime();
        self.set_inode(dir_ino, &inode)
    }
}

impl BlockSource for OpCtx<'_> {
    fn block_size(&self) -> u32 {
        self.m.io.block_size()
    }

    fn read_block(&self, block: u32) -> FsResult<Vec<u8>> {
        self.m.io.read_block(block)
    }
}

impl BlockSink for OpCtx<'_> {
    fn write_block(&self, block: u32, data: &[u8]) -> FsResult<()> {
        let old = self.m.io.read_block(block)?;
        let mut new = vec![0u8; self.m.io.block_size() as usize];
        new[..data.len()].copy_from_slice(data);
        self.stage(
            WalRecord::new(self.tx, WalOp::WriteBlock, 0, block).with_images(old, new.clone()),
        )?;
        self.m.io.write_block(block, &new)
    }

    fn alloc_block(&self) -> FsResult<u32> {
        let block = self.m.allocator.allocate_block()?;
        if let Err(err) = self.m.superblock.lock().reserve_block() {
            let _ = self.m.allocator.deallocate_block(block);
            return Err(err);
        }
        self.stage(WalRecord::new(self.tx, WalOp::AllocBlock, 0, block))?;
        Ok(block)
    }

    /// Deferred: the bit stays set until commit so the block cannot be
    /// recycled by a transaction that might still roll back.
    fn free_block(&self, block: u32) -> FsResult<()> {
        if block == 0 || block >= self.m.io.total_blocks() {
            return Err(StorageError::InvalidBlock(block).into());
        }
        self.stage(WalRecord::new(self.tx, WalOp::FreeBlock, 0, block))
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

impl FileSystem {
    pub fn new() -> FileSystem {
        FileSystem::with_config(FsConfig::default())
    }

    pub fn with_config(config: FsConfig) -> FileSystem {
        FileSystem {
            state: RwLock::new(None),
            config,
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn is_mounted(&self) -> bool {
        self.state.read().is_some()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Write a fresh filesystem onto the device. Everything previously on
    /// it is lost. The root directory becomes inode 1 with mode 0755 and
    /// link count 2 (its implicit "." and "..").
    pub fn format(
        &self,
        device: Arc<dyn BlockDevice>,
        total_blocks: u32,
        block_size: u32,
    ) -> FsResult<()> {
        let state = self.state.write();
        if state.is_some() {
            return Err(SystemError::AlreadyMounted.into());
        }
        validate_block_size(block_size)?;
        if total_blocks < MIN_TOTAL_BLOCKS {
            return Err(SystemError::Configuration(format!(
                "device too small: {} blocks (minimum {})",
                total_blocks, MIN_TOTAL_BLOCKS
            ))
            .into());
        }

        let sb = Superblock::initialize(total_blocks, block_size);
        let io = BlockIo::new(device, block_size, total_blocks);

        let mut table = InodeTable::new(sb.inode_count);
        table.allocate_at(ROOT_INODE)?;
        let mut root = Inode::new(S_IFDIR | 0o755, 0, 0);
        root.link_count = 2;
        root.update_checksum();
        table.write(ROOT_INODE, root)?;

        let allocator = BlockAllocator::new(total_blocks, self.config.allocator_hint_initial);

        io.zero_block(0)?;
        sb.persist(&io)?;
        write_metadata(&io, &sb, &table, &allocator)?;
        io.sync()?;
        log::info!(
            "formatted device: {} blocks of {} bytes",
            total_blocks,
            block_size
        );
        Ok(())
    }

    /// Convenience: create a backing file and format it.
    pub fn format_file<P: AsRef<Path>>(
        &self,
        path: P,
        total_blocks: u32,
        block_size: u32,
    ) -> FsResult<()> {
        let device = Arc::new(FileDevice::create(path)?);
        self.format(device, total_blocks, block_size)
    }

    /// Load the superblock, inode table, and bitmap, replay the WAL, and
    /// bring the filesystem online.
    pub fn mount(&self, device: Arc<dyn BlockDevice>) -> FsResult<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(SystemError::AlreadyMounted.into());
        }

        let mut head = vec![0u8; SUPERBLOCK_DISK_SIZE];
        device.read_at(0, &mut head)?;
        let sb = Superblock::decode(&head)?;
        sb.validate()?;

        let io = BlockIo::new(device, sb.block_size, sb.total_blocks);
        let (table, allocator) = load_metadata(&io, &sb, self.config.allocator_hint_initial)?;
        let txns = TransactionManager::open(&self.config.wal_path, self.config.transaction_timeout)?;

        let mounted = Mounted {
            io,
            superblock: Mutex::new(sb),
            inodes: Mutex::new(table),
            allocator,
            locks: LockTable::new(),
            txns,
            ambient: Mutex::new(None),
            atime_updates: self.config.atime_updates,
        };

        let report = mounted.txns.recover(&mounted)?;
        if report.committed_transactions > 0 || report.truncated_bytes > 0 {
            log::info!(
                "mount recovery applied {} transactions",
                report.committed_transactions
            );
        }

        // Checkpoint what replay rebuilt, then start from an empty log.
        mounted.superblock.lock().update_mount_time();
        flush_mounted(&mounted)?;
        mounted.txns.reset_log()?;

        *state = Some(mounted);
        log::info!("mounted filesystem");
        Ok(())
    }

    /// Convenience: open a backing file and mount it.
    pub fn mount_file<P: AsRef<Path>>(&self, path: P) -> FsResult<()> {
        let device = Arc::new(FileDevice::open(path)?);
        self.mount(device)
    }

    /// Flush all in-memory state, persist the superblock, and close the
    /// WAL. Flush errors are logged but never stop the device from being
    /// released.
    pub fn unmount(&self) -> FsResult<()> {
        let mut state = self.state.write();
        let mounted = state.take().ok_or(SystemError::NotMounted)?;

        let open_txns = mounted.txns.active_count();
        if open_txns > 0 {
            log::warn!("unmounting with {} active transactions", open_txns);
        }
        {
            let sb = mounted.superblock.lock();
            log::info!(
                "unmounting: {}% of blocks and {}% of inodes in use",
                sb.usage_percent(),
                sb.inode_usage_percent()
            );
        }

        mounted.superblock.lock().update_write_time();
        match flush_mounted(&mounted) {
            Ok(()) => {
                // Metadata is durable, the log is redundant.
                if let Err(err) = mounted.txns.reset_log() {
                    log::error!("failed to reset wal during unmount: {}", err);
                }
            }
            Err(err) => {
                // Keep the log so the next mount can replay it.
                log::error!("failed to flush state during unmount: {}", err);
            }
        }
        drop(mounted);
        log::info!("unmounted filesystem");
        Ok(())
    }

    /// Persist in-memory metadata and discard the now-redundant log.
    pub fn checkpoint(&self) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        m.txns.checkpoint()?;
        flush_mounted(m)?;
        m.txns.reset_log()
    }

    // -- files --------------------------------------------------------------

    /// Create an empty regular file.
    pub fn create_file(&self, path: &str, mode: u16) -> FsResult<()> {
        self.create_node(path, S_IFREG | (mode & !S_IFMT), false)
    }

    /// Create an empty directory.
    pub fn create_directory(&self, path: &str, mode: u16) -> FsResult<()> {
        self.create_node(path, S_IFDIR | (mode & !S_IFMT), true)
    }

    fn create_node(&self, path: &str, mode: u16, directory: bool) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let (parent_path, name) = paths::split_parent(path)?;
        let parent_ino = self.resolve(m, &parent_path).map_err(|err| {
            if err.is_not_found() {
                PathError::DirectoryNotFound(parent_path.clone()).into()
            } else {
                err
            }
        })?;

        let parent_lock = m.locks.lock_for(parent_ino);
        let _guard = parent_lock.write();

        let parent = m.inodes.lock().read(parent_ino)?;
        if !parent.is_directory() {
            return Err(PathError::NotADirectory(parent_path).into());
        }
        let mut image = blockmap::read_range(&parent, 0, parent.size, m)?;
        if dir::find(&image, name)?.is_some() {
            return Err(PathError::FileAlreadyExists(path.to_string()).into());
        }
        if !m.superblock.lock().has_inodes_for(1) {
            return Err(StorageError::OutOfSpace {
                requested: 1,
                available: 0,
            }
            .into());
        }

        self.with_txn(m, |ctx| {
            let ino = ctx.alloc_inode()?;
            let mut inode = Inode::new(mode, 0, 0);
            if directory {
                inode.link_count = 2;
                inode.update_checksum();
            }
            ctx.set_inode(ino, &inode)?;
            dir::add_entry(&mut image, name, ino)?;
            ctx.write_directory(parent_ino, &image)?;
            ctx.dir_marker(WalOp::DirAdd, parent_ino, name)?;
            log::debug!("created {} as inode {}", path, ino);
            Ok(())
        })
    }

    /// Remove a regular file. The inode and its blocks are reclaimed when
    /// the link count reaches zero.
    pub fn delete_file(&self, path: &str) -> FsResult<()> {
        self.delete_node(path, false)
    }

    /// Remove an empty directory.
    pub fn delete_directory(&self, path: &str) -> FsResult<()> {
        self.delete_node(path, true)
    }

    fn delete_node(&self, path: &str, directory: bool) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let (parent_path, name) = paths::split_parent(path)?;

        // Resolve, then lock parent and child in ascending inode order, then
        // confirm the name still maps to the same inode.
        for _attempt in 0..3 {
            let parent_ino = self.resolve(m, &parent_path)?;
            let child_ino = self.resolve(m, path)?;

            let locks = m.locks.locks_sorted(&[parent_ino, child_ino]);
            let _guards: Vec<_> = locks.iter().map(|l| l.write()).collect();

            let parent = m.inodes.lock().read(parent_ino)?;
            let mut image = blockmap::read_range(&parent, 0, parent.size, m)?;
            if dir::find(&image, name)? != Some(child_ino) {
                continue;
            }

            let mut child = m.inodes.lock().read(child_ino)?;
            if directory {
                if !child.is_directory() {
                    return Err(PathError::NotADirectory(path.to_string()).into());
                }
                let child_image = blockmap::read_range(&child, 0, child.size, m)?;
                if !dir::is_empty(&child_image)? {
                    return Err(PathError::DirectoryNotEmpty(path.to_string()).into());
                }
            } else if !child.is_file() {
                return Err(PathError::NotAFile(path.to_string()).into());
            }

            return self.with_txn(m, |ctx| {
                dir::remove_entry(&mut image, name)?;
                ctx.write_directory(parent_ino, &image)?;
                ctx.dir_marker(WalOp::DirRemove, parent_ino, name)?;

                child.link_count = child.link_count.saturating_sub(if directory { 2 } else { 1 });
                if child.link_count == 0 || directory {
                    blockmap::truncate(&mut child, 0, ctx)?;
                    ctx.free_inode(child_ino)?;
                } else {
                    child.touch_ctime();
                    ctx.set_inode(child_ino, &child)?;
                }
                log::debug!("deleted {} (inode {})", path, child_ino);
                Ok(())
            });
        }
        Err(ConcurrencyError::ConcurrentAccess(path.to_string()).into())
    }

    /// Full contents of a file.
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.read_file_range(path, 0, u64::MAX)
    }

    /// Up to `len` bytes starting at `offset`, clamped to the file size.
    pub fn read_file_range(&self, path: &str, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let ino = self.resolve(m, path)?;

        let lock = m.locks.lock_for(ino);
        let _guard = lock.read();

        let inode = m.inodes.lock().read(ino)?;
        if !inode.is_file() {
            return Err(PathError::NotAFile(path.to_string()).into());
        }
        let data = blockmap::read_range(&inode, offset, len, m)?;

        if m.atime_updates {
            // atime is in-memory only; it reaches disk with the next
            // metadata flush.
            let mut inodes = m.inodes.lock();
            if let Ok(mut stamped) = inodes.read(ino) {
                stamped.touch_atime();
                let _ = inodes.write(ino, stamped);
            }
        }
        Ok(data)
    }

    /// Atomically replace a file's contents. The old extent is only freed
    /// when the replacement commits, so the new content needs its own
    /// blocks up front.
    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        {
            let state = self.state.read();
            let m = state.as_ref().ok_or(SystemError::NotMounted)?;
            let needed = blockmap::blocks_for(data.len() as u64, m.io.block_size());
            let sb = m.superblock.lock();
            if !sb.has_space_for(needed.min(u64::from(u32::MAX)) as u32) {
                return Err(StorageError::OutOfSpace {
                    requested: needed,
                    available: u64::from(sb.free_blocks),
                }
                .into());
            }
        }
        self.update_file(path, |inode, ctx| {
            blockmap::truncate(inode, 0, ctx)?;
            blockmap::write_range(inode, 0, data, ctx)
        })
    }

    /// Extend a file past its current size.
    pub fn append_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.update_file(path, |inode, ctx| {
            blockmap::write_range(inode, inode.size, data, ctx)
        })
    }

    fn update_file<F>(&self, path: &str, mutate: F) -> FsResult<()>
    where
        F: FnOnce(&mut Inode, &OpCtx<'_>) -> FsResult<()>,
    {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let ino = self.resolve(m, path)?;

        let lock = m.locks.lock_for(ino);
        let _guard = lock.write();

        let mut inode = m.inodes.lock().read(ino)?;
        if !inode.is_file() {
            return Err(PathError::NotAFile(path.to_string()).into());
        }

        self.with_txn(m, |ctx| {
            mutate(&mut inode, ctx)?;
            inode.touch_mtime();
            ctx.set_inode(ino, &inode)
        })
    }

    /// True when the path names an existing regular file.
    pub fn file_exists(&self, path: &str) -> FsResult<bool> {
        self.exists_as(path, |inode| inode.is_file())
    }

    /// True when the path names an existing directory.
    pub fn directory_exists(&self, path: &str) -> FsResult<bool> {
        self.exists_as(path, |inode| inode.is_directory())
    }

    fn exists_as(&self, path: &str, pred: impl Fn(&Inode) -> bool) -> FsResult<bool> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        match self.resolve(m, path) {
            Ok(ino) => Ok(pred(&m.inodes.lock().read(ino)?)),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Size of a file in bytes.
    pub fn get_file_size(&self, path: &str) -> FsResult<u64> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let ino = self.resolve(m, path)?;
        let inode = m.inodes.lock().read(ino)?;
        if !inode.is_file() {
            return Err(PathError::NotAFile(path.to_string()).into());
        }
        Ok(inode.size)
    }

    // -- directories --------------------------------------------------------

    /// Names of the live entries in a directory, in storage order.
    pub fn list_directory(&self, path: &str) -> FsResult<Vec<String>> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let ino = self.resolve(m, path)?;

        let lock = m.locks.lock_for(ino);
        let _guard = lock.read();

        let inode = m.inodes.lock().read(ino)?;
        if !inode.is_directory() {
            return Err(PathError::NotADirectory(path.to_string()).into());
        }
        let image = blockmap::read_range(&inode, 0, inode.size, m)?;
        Ok(dir::entries(&image)?.into_iter().map(|e| e.name).collect())
    }

    /// Atomically move `old` to `new` within one transaction. `new` must
    /// not exist. Renames never cross a mount.
    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let (old_parent_path, old_name) = paths::split_parent(old)?;
        let (new_parent_path, new_name) = paths::split_parent(new)?;

        for _attempt in 0..3 {
            let old_parent = self.resolve(m, &old_parent_path)?;
            let new_parent = self.resolve(m, &new_parent_path).map_err(|err| {
                if err.is_not_found() {
                    PathError::DirectoryNotFound(new_parent_path.clone()).into()
                } else {
                    err
                }
            })?;
            let child = self.resolve(m, old)?;

            let locks = m.locks.locks_sorted(&[old_parent, new_parent, child]);
            let _guards: Vec<_> = locks.iter().map(|l| l.write()).collect();

            let old_dir = m.inodes.lock().read(old_parent)?;
            let new_dir = m.inodes.lock().read(new_parent)?;
            if !new_dir.is_directory() {
                return Err(PathError::NotADirectory(new_parent_path.clone()).into());
            }
            let mut old_image = blockmap::read_range(&old_dir, 0, old_dir.size, m)?;
            if dir::find(&old_image, old_name)? != Some(child) {
                continue;
            }

            return self.with_txn(m, |ctx| {
                if old_parent == new_parent {
                    dir::remove_entry(&mut old_image, old_name)?;
                    dir::add_entry(&mut old_image, new_name, child)?;
                    ctx.write_directory(old_parent, &old_image)?;
                } else {
                    let mut new_image = blockmap::read_range(&new_dir, 0, new_dir.size, m)?;
                    // add first so a duplicate name fails before anything
                    // is unlinked
                    dir::add_entry(&mut new_image, new_name, child)?;
                    dir::remove_entry(&mut old_image, old_name)?;
                    ctx.write_directory(new_parent, &new_image)?;
                    ctx.write_directory(old_parent, &old_image)?;
                }
                ctx.dir_marker(WalOp::DirRemove, old_parent, old_name)?;
                ctx.dir_marker(WalOp::DirAdd, new_parent, new_name)?;

                let mut moved = m.inodes.lock().read(child)?;
                moved.touch_ctime();
                ctx.set_inode(child, &moved)?;
                log::debug!("renamed {} -> {}", old, new);
                Ok(())
            });
        }
        Err(ConcurrencyError::ConcurrentAccess(old.to_string()).into())
    }

    // -- metadata -----------------------------------------------------------

    /// Snapshot of the inode behind a path.
    pub fn get_inode(&self, path: &str) -> FsResult<Inode> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let ino = self.resolve(m, path)?;
        let inode = m.inodes.lock().read(ino);
        inode
    }

    /// Replace the permission bits, keeping the type bits.
    pub fn set_permissions(&self, path: &str, mode: u16) -> FsResult<()> {
        self.update_metadata(path, |inode| {
            inode.mode = (inode.mode & S_IFMT) | (mode & !S_IFMT);
        })
    }

    /// Change owner and group.
    pub fn set_ownership(&self, path: &str, uid: u16, gid: u16) -> FsResult<()> {
        self.update_metadata(path, |inode| {
            inode.uid = uid;
            inode.gid = gid;
        })
    }

    fn update_metadata(&self, path: &str, mutate: impl FnOnce(&mut Inode)) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let ino = self.resolve(m, path)?;

        let lock = m.locks.lock_for(ino);
        let _guard = lock.write();

        let mut inode = m.inodes.lock().read(ino)?;
        mutate(&mut inode);
        inode.touch_ctime();
        self.with_txn(m, |ctx| ctx.set_inode(ino, &inode))
    }

    // -- transactions -------------------------------------------------------

    /// Open an explicit transaction scope. Until commit or rollback, every
    /// mutating operation issued from the calling thread stages into it;
    /// operations from other threads still commit on their own. Only one
    /// explicit scope can be open at a time.
    pub fn begin_transaction(&self) -> FsResult<u64> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let mut ambient = m.ambient.lock();
        if ambient.is_some() {
            return Err(ConcurrencyError::ConcurrentAccess(
                "an explicit transaction is already open".into(),
            )
            .into());
        }
        let tx = m.txns.begin();
        *ambient = Some(AmbientScope {
            owner: thread::current().id(),
            tx,
        });
        Ok(tx)
    }

    /// Make an explicit transaction durable.
    pub fn commit_transaction(&self, tx: u64) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        {
            let mut ambient = m.ambient.lock();
            if ambient.map(|scope| scope.tx) == Some(tx) {
                *ambient = None;
            }
        }
        m.txns.commit(tx, m)
    }

    /// Abort an explicit transaction, reversing every staged mutation.
    pub fn rollback_transaction(&self, tx: u64) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        {
            let mut ambient = m.ambient.lock();
            if ambient.map(|scope| scope.tx) == Some(tx) {
                *ambient = None;
            }
        }
        m.txns.rollback(tx, m)
    }

    /// Abort every transaction that outlived the configured timeout.
    /// Returns how many were reaped.
    pub fn sweep_expired_transactions(&self) -> FsResult<usize> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let reaped = m.txns.sweep_expired(Instant::now(), m);
        let mut ambient = m.ambient.lock();
        if let Some(scope) = *ambient {
            if !m.txns.is_active(scope.tx) {
                *ambient = None;
            }
        }
        Ok(reaped)
    }

    // -- admin --------------------------------------------------------------

    pub fn get_filesystem_info(&self) -> FsResult<FilesystemInfo> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let sb = m.superblock.lock();
        Ok(FilesystemInfo {
            total_blocks: sb.total_blocks,
            free_blocks: sb.free_blocks,
            total_inodes: sb.inode_count,
            free_inodes: sb.free_inodes,
            block_size: sb.block_size,
            usage_percentage: f64::from(sb.total_blocks - sb.free_blocks) * 100.0
                / f64::from(sb.total_blocks),
        })
    }

    pub fn get_filesystem_stats(&self) -> FsResult<FilesystemStats> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let inodes = m.inodes.lock();
        let mut stats = FilesystemStats {
            total_files: 0,
            total_directories: 0,
            total_data_size: 0,
            active_transactions: m.txns.active_count(),
        };
        for (_, inode) in inodes.live() {
            if inode.is_directory() {
                stats.total_directories += 1;
            } else if inode.is_file() {
                stats.total_files += 1;
                stats.total_data_size += inode.size;
            }
        }
        Ok(stats)
    }

    /// Verify every cross-structure invariant. Returns the first
    /// inconsistency as `FilesystemCorrupt` (or the specific inode error).
    pub fn check_filesystem(&self) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let sb = m.superblock.lock().clone();
        sb.validate()?;

        let used = m.allocator.used_count();
        if used + sb.free_blocks != sb.total_blocks {
            return Err(SystemError::FilesystemCorrupt(format!(
                "block accounting: {} used + {} free != {} total",
                used, sb.free_blocks, sb.total_blocks
            ))
            .into());
        }

        let inodes = m.inodes.lock();
        let live = inodes.live_count();
        if live + sb.free_inodes != sb.inode_count {
            return Err(SystemError::FilesystemCorrupt(format!(
                "inode accounting: {} live + {} free != {}",
                live, sb.free_inodes, sb.inode_count
            ))
            .into());
        }

        let now = unix_now();
        for (ino, inode) in inodes.live() {
            if !inode.verify_checksum() {
                return Err(StorageError::InodeCorrupt(ino).into());
            }
            if inode.link_count == 0 {
                return Err(SystemError::FilesystemCorrupt(format!(
                    "live inode {} has zero links",
                    ino
                ))
                .into());
            }
            if inode.mtime > now || inode.ctime > now {
                return Err(SystemError::FilesystemCorrupt(format!(
                    "inode {} has timestamps in the future",
                    ino
                ))
                .into());
            }
            let referenced = blockmap::data_blocks(inode, m)?;
            if referenced.len() as u64 > blockmap::blocks_for(inode.size, sb.block_size) {
                return Err(SystemError::FilesystemCorrupt(format!(
                    "inode {} references {} blocks for {} bytes",
                    ino,
                    referenced.len(),
                    inode.size
                ))
                .into());
            }
            for block in referenced {
                if m.allocator.is_free(block) {
                    return Err(SystemError::FilesystemCorrupt(format!(
                        "inode {} references free block {}",
                        ino, block
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Recompute derived state (free counters, inode checksums) from the
    /// authoritative structures and persist the result. Returns the number
    /// of repairs made.
    pub fn repair_filesystem(&self) -> FsResult<u32> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        let mut fixes = 0u32;

        let free_blocks = m.allocator.free_count();
        let live_inodes = m.inodes.lock().live_count();
        {
            let mut sb = m.superblock.lock();
            if sb.free_blocks != free_blocks {
                log::warn!(
                    "repair: free_blocks {} -> {}",
                    sb.free_blocks,
                    free_blocks
                );
                sb.free_blocks = free_blocks;
                fixes += 1;
            }
            let free_inodes = sb.inode_count - live_inodes;
            if sb.free_inodes != free_inodes {
                log::warn!(
                    "repair: free_inodes {} -> {}",
                    sb.free_inodes,
                    free_inodes
                );
                sb.free_inodes = free_inodes;
                fixes += 1;
            }
            sb.update_checksum();
        }

        {
            let mut inodes = m.inodes.lock();
            let stale: Vec<u32> = inodes
                .live()
                .filter(|(_, inode)| !inode.verify_checksum())
                .map(|(ino, _)| ino)
                .collect();
            for ino in stale {
                let mut inode = inodes.read(ino)?;
                inode.update_checksum();
                inodes.write(ino, inode)?;
                log::warn!("repair: rewrote checksum of inode {}", ino);
                fixes += 1;
            }
        }

        flush_mounted(m)?;
        Ok(fixes)
    }

    /// Compact the allocator's bitmap view. Idle-maintenance only: no data
    /// moves, so the caller must relocate block contents afterwards. Fails
    /// while any transaction is active.
    pub fn defragment(&self) -> FsResult<()> {
        let state = self.state.read();
        let m = state.as_ref().ok_or(SystemError::NotMounted)?;
        if m.txns.active_count() > 0 {
            return Err(ConcurrencyError::ConcurrentAccess(
                "defragment requires an idle filesystem".into(),
            )
            .into());
        }
        m.allocator.defragment();
        let mut sb = m.superblock.lock();
        sb.free_blocks = m.allocator.free_count();
        sb.update_checksum();
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    /// Walk a path from the root, component by component.
    fn resolve(&self, m: &Mounted, path: &str) -> FsResult<u32> {
        let parts = paths::components(path)?;
        let mut ino = ROOT_INODE;
        for (i, part) in parts.iter().enumerate() {
            let inode = m.inodes.lock().read(ino)?;
            if !inode.is_directory() {
                return Err(PathError::NotADirectory(format!(
                    "/{}",
                    parts[..i].join("/")
                ))
                .into());
            }
            let lock = m.locks.lock_for(ino);
            let _guard = lock.read();
            let image = blockmap::read_range(&inode, 0, inode.size, m)?;
            match dir::find(&image, part)? {
                Some(next) => ino = next,
                None => {
                    return Err(if i + 1 < parts.len() {
                        PathError::DirectoryNotFound(format!("/{}", parts[..=i].join("/"))).into()
                    } else {
                        PathError::FileNotFound(path.to_string()).into()
                    });
                }
            }
        }
        Ok(ino)
    }

    /// Run a mutation inside a transaction: the open explicit scope if this
    /// thread started one, otherwise a fresh single-operation transaction
    /// committed on success and rolled back on error. A failure inside an
    /// explicit scope aborts the whole scope.
    fn with_txn<R>(&self, m: &Mounted, f: impl FnOnce(&OpCtx<'_>) -> FsResult<R>) -> FsResult<R> {
        let ambient = *m.ambient.lock();
        match ambient {
            Some(scope) if scope.owner == thread::current().id() => {
                let tx = scope.tx;
                let ctx = OpCtx { m, tx };
                match f(&ctx) {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        log::warn!(
                            "operation failed inside explicit transaction {}, aborting it: {}",
                            tx,
                            err
                        );
                        if let Err(rb) = m.txns.rollback(tx, m) {
                            log::error!("rollback of transaction {} failed: {}", tx, rb);
                        }
                        let mut ambient = m.ambient.lock();
                        if ambient.map(|scope| scope.tx) == Some(tx) {
                            *ambient = None;
                        }
                        Err(err)
                    }
                }
            }
            _ => {
                let guard = TransactionGuard::begin(&m.txns, m);
                let ctx = OpCtx { m, tx: guard.id() };
                let value = f(&ctx)?;
                guard.commit()?;
                Ok(value)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata region
// ---------------------------------------------------------------------------

fn metadata_size(sb: &Superblock) -> usize {
    InodeTable::serialized_size(sb.inode_count)
        + Bitmap::serialized_size(sb.total_blocks as usize)
        + 4
}

/// Serialize the inode table and bitmap into the region after the last
/// block, sealed with a checksum.
fn write_metadata(
    io: &BlockIo,
    sb: &Superblock,
    table: &InodeTable,
    allocator: &BlockAllocator,
) -> FsResult<()> {
    let mut buf = Vec::with_capacity(metadata_size(sb));
    table.serialize(&mut buf)?;
    allocator.serialize(&mut buf)?;
    let sum = checksum32(&buf);
    buf.extend_from_slice(&sum.to_le_bytes());
    io.write_meta(&buf)
}

fn load_metadata(
    io: &BlockIo,
    sb: &Superblock,
    hint_initial: u32,
) -> FsResult<(InodeTable, BlockAllocator)> {
    let buf = io.read_meta(metadata_size(sb))?;
    let (body, tail) = buf.split_at(buf.len() - 4);
    let stored = LittleEndian::read_u32(tail);
    if stored != checksum32(body) {
        return Err(SystemError::FilesystemCorrupt(
            "metadata region checksum mismatch".into(),
        )
        .into());
    }
    let mut r = body;
    let table = InodeTable::deserialize(&mut r, sb.inode_count)?;
    let allocator = BlockAllocator::deserialize(&mut r, sb.total_blocks, hint_initial)?;
    Ok((table, allocator))
}

/// Persist superblock plus metadata region and sync the device.
fn flush_mounted(m: &Mounted) -> FsResult<()> {
    let sb = m.superblock.lock().clone();
    sb.persist(&m.io)?;
    let inodes = m.inodes.lock();
    write_metadata(&m.io, &sb, &inodes, &m.allocator)?;
    drop(inodes);
    m.io.sync()
}
