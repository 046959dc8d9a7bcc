//! walfs - a single-node, block-structured file system with ACID semantics.
//!
//! Files and directories persist onto a fixed-size backing device as numbered
//! fixed-size blocks. Metadata lives in an indexed inode table, and every
//! mutation is serialized through a write-ahead log so that commit/rollback
//! semantics survive crashes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              FileSystem facade               │
//! │  create/read/write/delete, rename, metadata  │
//! └──────┬───────────┬───────────┬───────────────┘
//!        │           │           │
//!   Path resolver    │     TransactionManager
//!   + directory      │      (WAL append, recovery)
//!     format         │           │
//! ┌──────▼───────────▼───────────▼───────────────┐
//! │  Superblock │ InodeTable │ BlockAllocator    │
//! └──────┬───────────┬───────────┬───────────────┘
//!        │           │           │
//! ┌──────▼───────────▼───────────▼───────────────┐
//! │         BlockDevice (file or memory)         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Disk layout
//!
//! ```text
//! Block 0:                  Superblock (padded to block_size)
//! Blocks 1..total_blocks:   File and directory data
//! After the last block:     Inode table + allocation bitmap
//!                           (rewritten on unmount/checkpoint)
//! ```
//!
//! The WAL is a separate append-only file. A transaction becomes durable when
//! its COMMIT record reaches the log; recovery replays committed transactions
//! and discards everything else.

pub mod alloc;
pub mod bitmap;
pub mod blockmap;
pub mod checksum;
pub mod config;
pub mod device;
pub mod dir;
pub mod error;
pub mod fs;
pub mod inode;
pub mod locks;
pub mod paths;
pub mod superblock;
pub mod txn;
pub mod wal;

pub use alloc::{BlockAllocator, BlockStats};
pub use config::FsConfig;
pub use device::{BlockDevice, BlockIo, FileDevice, MemDevice};
pub use error::{
    ConcurrencyError, FsError, FsResult, PathError, StorageError, SystemError, TransactionError,
};
pub use fs::{FileSystem, FilesystemInfo, FilesystemStats};
pub use inode::{Inode, InodeTable};
pub use superblock::Superblock;
pub use txn::{TransactionGuard, TransactionManager, TxnState};
pub use wal::{WalOp, WalRecord};

/// Magic number identifying a walfs superblock.
pub const MAGIC: u32 = 0xDF5F_0001;

/// On-disk format version.
pub const VERSION: u32 = 1;

/// Inode number of the root directory. Inode 0 is reserved invalid.
pub const ROOT_INODE: u32 = 1;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Smallest formattable device, in blocks.
pub const MIN_TOTAL_BLOCKS: u32 = 10;

/// Preferred lower bound on the inode table size. Devices with fewer
/// blocks than this clamp the table to one slot per block instead.
pub const MIN_INODE_COUNT: u32 = 16;

/// Number of direct block pointers in an inode.
pub const DIRECT_POINTERS: usize = 12;

/// Maximum length of a single path component, in bytes.
pub const MAX_FILENAME: usize = 255;

/// Regular file bit in the inode mode field.
pub const S_IFREG: u16 = 0o100000;

/// Directory bit in the inode mode field.
pub const S_IFDIR: u16 = 0o040000;

/// Mask extracting the file type from the mode field.
pub const S_IFMT: u16 = 0o170000;

/// Seconds since the Unix epoch. Saturates to 0 if the clock is before 1970.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
