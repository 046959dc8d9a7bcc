//! Error taxonomy.
//!
//! One flat enum per category, composed into [`FsError`]. Every public
//! operation returns [`FsResult`]; nothing is reported through panics.

use thiserror::Error;

/// Result type used across the crate.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Errors arising from path syntax and namespace lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Path is not absolute, has an empty or oversized component, or is
    /// otherwise malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// A non-directory was encountered where a directory was required.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// A directory was encountered where a regular file was required.
    #[error("not a file: {0}")]
    NotAFile(String),
    /// No entry with this name exists.
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// A parent directory on the path does not exist.
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),
    /// An entry with this name already exists.
    #[error("already exists: {0}")]
    FileAlreadyExists(String),
    /// The directory still contains live entries.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    /// The caller lacks permission for the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Errors arising from block and inode storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The allocator cannot satisfy the request.
    #[error("out of space: requested {requested}, {available} available")]
    OutOfSpace { requested: u64, available: u64 },
    /// Block number is reserved or out of range.
    #[error("invalid block {0}")]
    InvalidBlock(u32),
    /// Block contents failed an integrity check.
    #[error("block {0} corrupt")]
    BlockCorrupt(u32),
    /// Inode number is out of range or not allocated.
    #[error("inode {0} not found")]
    InodeNotFound(u32),
    /// Inode record failed its checksum.
    #[error("inode {0} corrupt")]
    InodeCorrupt(u32),
}

/// Errors arising from the transaction lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// No transaction with this id is known.
    #[error("transaction {0} not found")]
    TransactionNotFound(u64),
    /// The transaction was aborted (explicitly or by the sweeper).
    #[error("transaction {0} aborted")]
    TransactionAborted(u64),
    /// The transaction already committed; it can no longer be rolled back.
    #[error("transaction {0} already committed")]
    AlreadyCommitted(u64),
    /// The transaction exceeded the configured timeout.
    #[error("transaction {0} timed out")]
    TransactionTimeout(u64),
}

/// Errors arising from the filesystem as a whole.
#[derive(Debug, Error)]
pub enum SystemError {
    /// Operation requires a mounted filesystem.
    #[error("filesystem not mounted")]
    NotMounted,
    /// A filesystem is already mounted on this handle.
    #[error("filesystem already mounted")]
    AlreadyMounted,
    /// On-disk state failed validation.
    #[error("filesystem corrupt: {0}")]
    FilesystemCorrupt(String),
    /// Underlying device or log I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A configuration value is out of range.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Contention hints. Internal retries handle most contention; this surfaces
/// only where the caller must decide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    /// The operation conflicts with another in-flight operation.
    #[error("concurrent access: {0}")]
    ConcurrentAccess(String),
}

/// Top-level error type returned by every public operation.
#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::System(SystemError::Io(err))
    }
}

impl FsError {
    /// True when the error is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FsError::Path(PathError::FileNotFound(_))
                | FsError::Path(PathError::DirectoryNotFound(_))
        )
    }

    /// True when the error is an exhausted block or inode pool.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, FsError::Storage(StorageError::OutOfSpace { .. }))
    }
}
