//! Write-ahead log: record codec and the append-only log file.
//!
//! The log is a bare concatenation of records, no outer framing. Layout per
//! record, little-endian: transaction_id u64, op_type u32, inode_number u32,
//! block_number u32, timestamp u64, checksum u32, old_len u32 + old bytes,
//! new_len u32 + new bytes. A record whose checksum fails marks the end of
//! the trustworthy log; recovery truncates there.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::checksum::checksum32_seeded;
use crate::error::{FsResult, SystemError};
use crate::unix_now;

/// Upper bound on a single payload; anything larger is treated as log
/// corruption rather than an allocation request.
const MAX_PAYLOAD: u32 = 1 << 26;

/// Operation recorded in a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WalOp {
    /// First record of every transaction.
    Begin = 0,
    /// Inode image write (creation or update); payloads are encoded records.
    Create = 1,
    /// Data block content replacement.
    WriteBlock = 2,
    /// Inode bitmap bit set + free-inode counter decrement.
    AllocInode = 3,
    /// Inode freed; applied at commit.
    FreeInode = 4,
    /// Block bitmap bit set + free-block counter decrement.
    AllocBlock = 5,
    /// Block freed; applied at commit.
    FreeBlock = 6,
    /// Directory entry added (audit marker; content travels as WriteBlock).
    DirAdd = 7,
    /// Directory entry removed (audit marker).
    DirRemove = 8,
    /// Terminator: everything staged for this transaction is durable.
    Commit = 9,
    /// Terminator: discard everything staged for this transaction.
    Abort = 10,
}

impl WalOp {
    pub fn from_u32(raw: u32) -> Option<WalOp> {
        Some(match raw {
            0 => WalOp::Begin,
            1 => WalOp::Create,
            2 => WalOp::WriteBlock,
            3 => WalOp::AllocInode,
            4 => WalOp::FreeInode,
            5 => WalOp::AllocBlock,
            6 => WalOp::FreeBlock,
            7 => WalOp::DirAdd,
            8 => WalOp::DirRemove,
            9 => WalOp::Commit,
            10 => WalOp::Abort,
            _ => return None,
        })
    }
}

/// One durable unit of change. `old_data` carries the before-image for
/// rollback, `new_data` the after-image for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub tx_id: u64,
    pub op: WalOp,
    pub inode: u32,
    pub block: u32,
    pub timestamp: u64,
    pub checksum: u32,
    pub old_data: Vec<u8>,
    pub new_data: Vec<u8>,
}

impl WalRecord {
    pub fn new(tx_id: u64, op: WalOp, inode: u32, block: u32) -> WalRecord {
        WalRecord {
            tx_id,
            op,
            inode,
            block,
            timestamp: unix_now(),
            checksum: 0,
            old_data: Vec::new(),
            new_data: Vec::new(),
        }
    }

    pub fn with_images(mut self, old_data: Vec<u8>, new_data: Vec<u8>) -> WalRecord {
        self.old_data = old_data;
        self.new_data = new_data;
        self
    }

    /// Checksum over every field except the checksum itself, plus both
    /// payload bodies.
    pub fn compute_checksum(&self) -> u32 {
        let mut sum = 0u32;
        sum ^= self.tx_id as u32;
        sum ^= (self.tx_id >> 32) as u32;
        sum ^= self.op as u32;
        sum ^= self.inode;
        sum ^= self.block;
        sum ^= self.timestamp as u32;
        sum ^= (self.timestamp >> 32) as u32;
        sum = checksum32_seeded(sum, &self.old_data);
        checksum32_seeded(sum, &self.new_data)
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Append the record to a writer in the on-disk layout.
    pub fn encode<W: Write>(&self, w: &mut W) -> FsResult<()> {
        w.write_u64::<LittleEndian>(self.tx_id).map_err(SystemError::Io)?;
        w.write_u32::<LittleEndian>(self.op as u32).map_err(SystemError::Io)?;
        w.write_u32::<LittleEndian>(self.inode).map_err(SystemError::Io)?;
        w.write_u32::<LittleEndian>(self.block).map_err(SystemError::Io)?;
        w.write_u64::<LittleEndian>(self.timestamp).map_err(SystemError::Io)?;
        w.write_u32::<LittleEndian>(self.checksum).map_err(SystemError::Io)?;
        w.write_u32::<LittleEndian>(self.old_data.len() as u32)
            .map_err(SystemError::Io)?;
        w.write_all(&self.old_data).map_err(SystemError::Io)?;
        w.write_u32::<LittleEndian>(self.new_data.len() as u32)
            .map_err(SystemError::Io)?;
        w.write_all(&self.new_data).map_err(SystemError::Io)?;
        Ok(())
    }

    /// Read one record. `Ok(None)` means a clean end of log; any partial
    /// read, unknown op, oversized payload, or checksum mismatch is an
    /// error, and the caller discards the log from the record's offset.
    pub fn decode<R: Read>(r: &mut R) -> FsResult<Option<WalRecord>> {
        let corrupt = |what: &str| SystemError::FilesystemCorrupt(format!("wal record: {}", what));

        // Distinguish clean EOF from a torn header.
        let mut head = [0u8; 8];
        let mut filled = 0;
        while filled < head.len() {
            match r.read(&mut head[filled..]).map_err(SystemError::Io)? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < head.len() {
            return Err(corrupt("torn header").into());
        }
        let tx_id = u64::from_le_bytes(head);

        let op_raw = r.read_u32::<LittleEndian>().map_err(|_| corrupt("torn header"))?;
        let op = WalOp::from_u32(op_raw).ok_or_else(|| corrupt(&format!("unknown op {}", op_raw)))?;
        let inode = r.read_u32::<LittleEndian>().map_err(|_| corrupt("torn header"))?;
        let block = r.read_u32::<LittleEndian>().map_err(|_| corrupt("torn header"))?;
        let timestamp = r.read_u64::<LittleEndian>().map_err(|_| corrupt("torn header"))?;
        let checksum = r.read_u32::<LittleEndian>().map_err(|_| corrupt("torn header"))?;

        let old_len = r.read_u32::<LittleEndian>().map_err(|_| corrupt("torn payload"))?;
        if old_len > MAX_PAYLOAD {
            return Err(corrupt("old payload length").into());
        }
        let mut old_data = vec![0u8; old_len as usize];
        r.read_exact(&mut old_data).map_err(|_| corrupt("torn payload"))?;

        let new_len = r.read_u32::<LittleEndian>().map_err(|_| corrupt("torn payload"))?;
        if new_len > MAX_PAYLOAD {
            return Err(corrupt("new payload length").into());
        }
        let mut new_data = vec![0u8; new_len as usize];
        r.read_exact(&mut new_data).map_err(|_| corrupt("torn payload"))?;

        let record = WalRecord {
            tx_id,
            op,
            inode,
            block,
            timestamp,
            checksum,
            old_data,
            new_data,
        };
        if !record.is_valid() {
            return Err(corrupt("checksum mismatch").into());
        }
        Ok(Some(record))
    }

    /// Encoded size in bytes: a 32-byte header, two length prefixes, and the
    /// payloads.
    pub fn encoded_size(&self) -> u64 {
        40 + self.old_data.len() as u64 + self.new_data.len() as u64
    }
}

/// Append-only writer over the log file.
pub struct WalWriter {
    file: File,
    path: PathBuf,
}

impl WalWriter {
    /// Open (creating if absent) the log for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<WalWriter> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path.as_ref())
            .map_err(SystemError::Io)?;
        Ok(WalWriter {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Durability comes from a later [`WalWriter::flush`].
    pub fn append(&mut self, record: &WalRecord) -> FsResult<()> {
        record.encode(&mut self.file)
    }

    /// Flush appended records to durable storage.
    pub fn flush(&mut self) -> FsResult<()> {
        self.file.sync_data().map_err(SystemError::Io)?;
        Ok(())
    }

    /// Cut the log to `len` bytes (recovery discards a corrupt tail).
    pub fn truncate(&mut self, len: u64) -> FsResult<()> {
        self.file.set_len(len).map_err(SystemError::Io)?;
        self.file.sync_data().map_err(SystemError::Io)?;
        Ok(())
    }

    /// Discard the whole log (after a checkpoint made it redundant).
    pub fn reset(&mut self) -> FsResult<()> {
        self.truncate(0)
    }
}

/// Read every well-formed record from the log. Returns the records and the
/// byte offset where the trustworthy prefix ends; a corrupt tail is
/// reported, not returned.
pub fn scan<P: AsRef<Path>>(path: P) -> FsResult<(Vec<WalRecord>, u64)> {
    let mut data = Vec::new();
    match File::open(path.as_ref()) {
        Ok(mut f) => {
            f.read_to_end(&mut data).map_err(SystemError::Io)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), 0));
        }
        Err(e) => return Err(SystemError::Io(e).into()),
    }

    let mut records = Vec::new();
    let mut cursor = std::io::Cursor::new(&data);
    let mut good = 0u64;
    loop {
        match WalRecord::decode(&mut cursor) {
            Ok(Some(record)) => {
                records.push(record);
                good = cursor.position();
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!(
                    "discarding wal tail at offset {} of {}: {}",
                    good,
                    data.len(),
                    err
                );
                break;
            }
        }
    }
    Ok((records, good))
}
