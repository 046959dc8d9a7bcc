//! On-disk directory format.
//!
//! A directory's content is a packed sequence of entries:
//! `(inode_number: u32, name_len: u16, name bytes, zero-pad to 4 bytes)`.
//! An entry with inode number 0 is a tombstone; its `name_len` keeps the
//! slot width so the stream stays parseable. "." and ".." are never stored.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsResult, PathError, SystemError};
use crate::paths::validate_name;

const ENTRY_HEADER: usize = 6;

/// A live directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
}

/// Slot width for a name of `name_len` bytes.
fn slot_size(name_len: usize) -> usize {
    (ENTRY_HEADER + name_len).div_ceil(4) * 4
}

struct Slot {
    offset: usize,
    inode: u32,
    name_len: usize,
}

impl Slot {
    fn width(&self) -> usize {
        slot_size(self.name_len)
    }
}

fn slots(image: &[u8]) -> FsResult<Vec<Slot>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < image.len() {
        if offset + ENTRY_HEADER > image.len() {
            return Err(SystemError::FilesystemCorrupt(format!(
                "truncated directory entry at offset {}",
                offset
            ))
            .into());
        }
        let inode = LittleEndian::read_u32(&image[offset..]);
        let name_len = LittleEndian::read_u16(&image[offset + 4..]) as usize;
        let width = slot_size(name_len);
        if offset + width > image.len() {
            return Err(SystemError::FilesystemCorrupt(format!(
                "directory entry at offset {} overruns content",
                offset
            ))
            .into());
        }
        out.push(Slot {
            offset,
            inode,
            name_len,
        });
        offset += width;
    }
    Ok(out)
}

fn slot_name(image: &[u8], slot: &Slot) -> FsResult<String> {
    let start = slot.offset + ENTRY_HEADER;
    String::from_utf8(image[start..start + slot.name_len].to_vec()).map_err(|_| {
        SystemError::FilesystemCorrupt(format!(
            "non-utf8 directory entry name at offset {}",
            slot.offset
        ))
        .into()
    })
}

fn write_slot(image: &mut [u8], offset: usize, inode: u32, name: &[u8]) {
    let width = slot_size(name.len());
    image[offset..offset + width].fill(0);
    LittleEndian::write_u32(&mut image[offset..], inode);
    LittleEndian::write_u16(&mut image[offset + 4..], name.len() as u16);
    image[offset + ENTRY_HEADER..offset + ENTRY_HEADER + name.len()].copy_from_slice(name);
}

/// All live entries, in storage order.
pub fn entries(image: &[u8]) -> FsResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    for slot in slots(image)? {
        if slot.inode != 0 {
            out.push(DirEntry {
                inode: slot.inode,
                name: slot_name(image, &slot)?,
            });
        }
    }
    Ok(out)
}

/// Look up a name, returning its inode number.
pub fn find(image: &[u8], name: &str) -> FsResult<Option<u32>> {
    for slot in slots(image)? {
        if slot.inode != 0 && slot_name(image, &slot)? == name {
            return Ok(Some(slot.inode));
        }
    }
    Ok(None)
}

/// Number of live entries.
pub fn live_count(image: &[u8]) -> FsResult<usize> {
    Ok(slots(image)?.iter().filter(|s| s.inode != 0).count())
}

/// True when the directory holds no live entries.
pub fn is_empty(image: &[u8]) -> FsResult<bool> {
    live_count(image).map(|n| n == 0)
}

/// Add an entry, reusing the first tombstone wide enough, else appending at
/// the tail. Fails `FileAlreadyExists` when the name is present.
pub fn add_entry(image: &mut Vec<u8>, name: &str, inode: u32) -> FsResult<()> {
    validate_name(name)?;
    if find(image, name)?.is_some() {
        return Err(PathError::FileAlreadyExists(name.to_string()).into());
    }
    let needed = slot_size(name.len());

    for slot in slots(image)? {
        if slot.inode != 0 {
            continue;
        }
        let width = slot.width();
        if width == needed {
            write_slot(image, slot.offset, inode, name.as_bytes());
            return Ok(());
        }
        // A wider tombstone is split: the remainder must still frame a
        // minimal slot.
        if width >= needed + slot_size(0) {
            let rest = width - needed;
            write_slot(image, slot.offset, inode, name.as_bytes());
            let rest_offset = slot.offset + needed;
            image[rest_offset..rest_offset + rest].fill(0);
            LittleEndian::write_u16(
                &mut image[rest_offset + 4..],
                (rest - ENTRY_HEADER) as u16,
            );
            return Ok(());
        }
    }

    let offset = image.len();
    image.resize(offset + needed, 0);
    write_slot(image, offset, inode, name.as_bytes());
    Ok(())
}

/// Tombstone an entry and trim trailing tombstones so the content can
/// shrink. Returns the removed inode number.
pub fn remove_entry(image: &mut Vec<u8>, name: &str) -> FsResult<u32> {
    let mut removed = None;
    for slot in slots(image)? {
        if slot.inode != 0 && slot_name(image, &slot)? == name {
            let inode = slot.inode;
            LittleEndian::write_u32(&mut image[slot.offset..], 0);
            let start = slot.offset + ENTRY_HEADER;
            image[start..start + slot.name_len].fill(0);
            removed = Some(inode);
            break;
        }
    }
    let inode = removed.ok_or_else(|| PathError::FileNotFound(name.to_string()))?;

    // Drop tombstones at the tail so the directory shrinks.
    loop {
        let parsed = slots(image)?;
        match parsed.last() {
            Some(last) if last.inode == 0 => {
                image.truncate(last.offset);
            }
            _ => break,
        }
    }
    Ok(inode)
}
