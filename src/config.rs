//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FsResult, SystemError};
use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Tunables for a [`crate::FileSystem`] instance.
///
/// `block_size` is a format-time parameter and intentionally not part of this
/// struct; it is read back from the superblock at mount.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Active transactions older than this are eligible for forced abort by
    /// the sweeper.
    pub transaction_timeout: Duration,
    /// Location of the write-ahead log file.
    pub wal_path: PathBuf,
    /// Whether reads update the inode access time. atime changes are never
    /// WAL-logged; they reach disk with the next metadata flush.
    pub atime_updates: bool,
    /// Initial scan position for the block allocator's rotating hint.
    pub allocator_hint_initial: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            transaction_timeout: Duration::from_secs(30),
            wal_path: PathBuf::from("walfs.wal"),
            atime_updates: true,
            allocator_hint_initial: 1,
        }
    }
}

/// Check a format-time block size: power of two in [512, 65536].
pub fn validate_block_size(block_size: u32) -> FsResult<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(SystemError::Configuration(format!(
            "block size {} must be a power of two in [{}, {}]",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        ))
        .into());
    }
    Ok(())
}
