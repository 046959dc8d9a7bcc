//! Word-packed bitmap used by the block allocator and the inode table.
//!
//! A set bit means the slot is in use. Scans skip fully-set words so a mostly
//! full map stays cheap to search.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{FsResult, SystemError};

const WORD_BITS: usize = 64;

/// Fixed-length bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap with `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Bitmap {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Number of bits in the map.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when bit `i` is set.
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] & (1u64 << (i % WORD_BITS)) != 0
    }

    /// Set bit `i`.
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
    }

    /// Clear bit `i`.
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] &= !(1u64 << (i % WORD_BITS));
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of clear bits.
    pub fn count_clear(&self) -> usize {
        self.len - self.count_set()
    }

    /// Find the first clear bit at or after `start`, wrapping once around the
    /// whole map. Returns `None` when every bit is set.
    pub fn find_clear_from(&self, start: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let start = start % self.len;
        let mut i = start;
        let mut examined = 0usize;
        while examined < self.len {
            if i >= self.len {
                i = 0;
            }
            // Skip whole words that are fully set.
            if i % WORD_BITS == 0
                && i + WORD_BITS <= self.len
                && self.words[i / WORD_BITS] == u64::MAX
            {
                i += WORD_BITS;
                examined += WORD_BITS;
                continue;
            }
            if !self.get(i) {
                return Some(i);
            }
            i += 1;
            examined += 1;
        }
        None
    }

    /// Find `n` consecutive clear bits, trying start positions from `start`
    /// and wrapping around the map once. The run itself never wraps. Returns
    /// the first index of the run.
    pub fn find_clear_run(&self, start: usize, n: usize) -> Option<usize> {
        if n == 0 || n > self.len {
            return None;
        }
        let len = self.len;
        let start = start % len;
        let mut candidates = 0usize;
        let mut pos = start;
        while candidates < len {
            if pos + n > len {
                candidates += len - pos;
                pos = 0;
                continue;
            }
            match (pos..pos + n).find(|&i| self.get(i)) {
                None => return Some(pos),
                Some(used) => {
                    candidates += used + 1 - pos;
                    pos = used + 1;
                    if pos >= len {
                        pos = 0;
                    }
                }
            }
        }
        None
    }

    /// Serialize as a bit-length prefix (u32) followed by the raw bytes,
    /// least significant bit first.
    pub fn serialize<W: Write>(&self, w: &mut W) -> FsResult<()> {
        w.write_u32::<LittleEndian>(self.len as u32)
            .map_err(SystemError::Io)?;
        for chunk in self.bytes() {
            w.write_all(&[chunk]).map_err(SystemError::Io)?;
        }
        Ok(())
    }

    /// Read back a bitmap written by [`Bitmap::serialize`]. `expected_len`
    /// guards against loading a bitmap for the wrong geometry.
    pub fn deserialize<R: Read>(r: &mut R, expected_len: usize) -> FsResult<Bitmap> {
        let len = r.read_u32::<LittleEndian>().map_err(SystemError::Io)? as usize;
        if len != expected_len {
            return Err(SystemError::FilesystemCorrupt(format!(
                "bitmap length {} does not match expected {}",
                len, expected_len
            ))
            .into());
        }
        let mut bytes = vec![0u8; len.div_ceil(8)];
        r.read_exact(&mut bytes).map_err(SystemError::Io)?;
        let mut map = Bitmap::new(len);
        for (byte_idx, &b) in bytes.iter().enumerate() {
            for bit in 0..8 {
                let i = byte_idx * 8 + bit;
                if i < len && b & (1 << bit) != 0 {
                    map.set(i);
                }
            }
        }
        Ok(map)
    }

    /// Serialized size in bytes, including the length prefix.
    pub fn serialized_size(len: usize) -> usize {
        4 + len.div_ceil(8)
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.len.div_ceil(8)).map(move |byte_idx| {
            let word = self.words[byte_idx * 8 / WORD_BITS];
            ((word >> ((byte_idx * 8) % WORD_BITS)) & 0xFF) as u8
        })
    }
}
