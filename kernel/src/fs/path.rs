//! Directory entries and path resolution.
//!
//! A directory's data is an array of fixed 256-byte entries (NUL-padded
//! name + inode number); its inode `size` counts entries. `namei` walks
//! components from the root or the calling thread's working directory,
//! taking each directory's inode lock only for the duration of the scan.

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::FsError;
use crate::task;

use super::cache;
use super::inode::{blockmap, iadd_block, InodeStatus, InodeType, MemInode};
use super::itable::{iget, iput};
use super::{DIR_ENTRY_SIZE, ENTRIES_PER_BLOCK, MAX_NAME_LEN, ROOT_INUM};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inum: u64,
}

pub(crate) fn encode_entry(name: &str, inum: u64, out: &mut [u8]) {
    debug_assert!(name.len() <= MAX_NAME_LEN);
    out.fill(0);
    out[..name.len()].copy_from_slice(name.as_bytes());
    LittleEndian::write_u64(&mut out[DIR_ENTRY_SIZE - 8..], inum);
}

pub(crate) fn decode_entry(slot: &[u8]) -> DirEntry {
    let end = slot
        .iter()
        .take(MAX_NAME_LEN + 1)
        .position(|b| *b == 0)
        .unwrap_or(MAX_NAME_LEN + 1);
    DirEntry {
        name: String::from_utf8_lossy(&slot[..end]).into_owned(),
        inum: LittleEndian::read_u64(&slot[DIR_ENTRY_SIZE - 8..]),
    }
}

fn entry_location(index: u64) -> (u64, usize) {
    (index / ENTRIES_PER_BLOCK, (index % ENTRIES_PER_BLOCK) as usize * DIR_ENTRY_SIZE)
}

/// All entries of a directory, in slot order. Caller holds the inode lock.
pub(crate) fn dir_entries(dir: &MemInode) -> Result<Vec<DirEntry>, FsError> {
    let mut out = Vec::with_capacity(dir.size as usize);
    let mut index = 0u64;
    for block_off in 0..dir.size_blocks {
        let bnum = blockmap(dir, block_off)?;
        let buf = cache::bread(bnum)?;
        for slot in 0..ENTRIES_PER_BLOCK as usize {
            if index >= dir.size {
                break;
            }
            out.push(decode_entry(&buf.data[slot * DIR_ENTRY_SIZE..]));
            index += 1;
        }
        cache::brelse(buf);
    }
    Ok(out)
}

/// Find `name` in the directory. Caller holds the inode lock.
pub(crate) fn dir_lookup(dir: &MemInode, name: &str) -> Result<Option<u64>, FsError> {
    let mut index = 0u64;
    for block_off in 0..dir.size_blocks {
        let bnum = blockmap(dir, block_off)?;
        let buf = cache::bread(bnum)?;
        for slot in 0..ENTRIES_PER_BLOCK as usize {
            if index >= dir.size {
                break;
            }
            let e = decode_entry(&buf.data[slot * DIR_ENTRY_SIZE..]);
            if e.name == name {
                cache::brelse(buf);
                return Ok(Some(e.inum));
            }
            index += 1;
        }
        cache::brelse(buf);
    }
    Ok(None)
}

/// Append a `{name, inum}` entry, extending the directory by a block
/// when the last one is full. Caller holds the inode lock.
pub(crate) fn dir_add_entry(dir: &mut MemInode, name: &str, inum: u64) -> Result<(), FsError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    let index = dir.size;
    let (block_off, byte_off) = entry_location(index);
    if block_off >= dir.size_blocks {
        let b = super::sblock::balloc()?;
        cache::bwrite(cache::Buf::zeroed(b))?;
        iadd_block(dir, b)?;
        dir.size_blocks += 1;
    }
    let bnum = blockmap(dir, block_off)?;
    let mut buf = cache::bread(bnum)?;
    encode_entry(name, inum, &mut buf.data[byte_off..byte_off + DIR_ENTRY_SIZE]);
    cache::bwrite(buf)?;
    dir.size += 1;
    dir.status = InodeStatus::Modified;
    Ok(())
}

/// Remove the entry naming `inum` by moving the last entry into its slot.
/// Caller holds the inode lock.
pub(crate) fn dir_remove_entry(dir: &mut MemInode, inum: u64) -> Result<(), FsError> {
    let entries = dir_entries(dir)?;
    let Some(pos) = entries.iter().position(|e| e.inum == inum) else {
        return Err(FsError::NotFound);
    };
    let last = dir.size - 1;
    if pos as u64 != last {
        let moved = &entries[last as usize];
        let (block_off, byte_off) = entry_location(pos as u64);
        let bnum = blockmap(dir, block_off)?;
        let mut buf = cache::bread(bnum)?;
        encode_entry(&moved.name, moved.inum, &mut buf.data[byte_off..byte_off + DIR_ENTRY_SIZE]);
        cache::bwrite(buf)?;
    }
    dir.size -= 1;
    dir.status = InodeStatus::Modified;
    Ok(())
}

/// Split a path into its parent (None for a bare name) and final name.
pub(crate) fn split_path(path: &str) -> Result<(Option<String>, String), FsError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidPath);
    }
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => {
            let parent = if parent.is_empty() { "/" } else { parent };
            Ok((Some(parent.to_string()), name.to_string()))
        }
        None => Ok((None, trimmed.to_string())),
    }
}

/// Resolve a path to an inode number. Absolute paths start at the root,
/// others at the calling thread's working directory.
pub fn namei(path: &str) -> Result<u64, FsError> {
    if path.is_empty() {
        return Err(FsError::InvalidPath);
    }
    let start = if path.starts_with('/') { ROOT_INUM } else { task::cwd() };
    name_from(start, path)
}

/// Resolve `path` relative to the directory inode `start`.
pub(crate) fn name_from(start: u64, path: &str) -> Result<u64, FsError> {
    let mut current = start;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let dir = iget(current)?;
        let next = {
            let ino = dir.lock();
            if ino.itype != InodeType::Directory {
                Err(FsError::NotADirectory)
            } else if ino.status == InodeStatus::ToDelete {
                Err(FsError::NotFound)
            } else {
                dir_lookup(&ino, component)
            }
        };
        iput(dir);
        match next? {
            Some(inum) => current = inum,
            None => return Err(FsError::NotFound),
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_codec_roundtrip() {
        let mut slot = [0u8; DIR_ENTRY_SIZE];
        encode_entry("hello.txt", 42, &mut slot);
        let e = decode_entry(&slot);
        assert_eq!(e.name, "hello.txt");
        assert_eq!(e.inum, 42);
    }

    #[test]
    fn sixteen_entries_per_block() {
        assert_eq!(ENTRIES_PER_BLOCK, 16);
        assert_eq!(entry_location(0), (0, 0));
        assert_eq!(entry_location(15), (0, 15 * DIR_ENTRY_SIZE));
        assert_eq!(entry_location(16), (1, 0));
    }

    #[test]
    fn split_path_variants() {
        assert_eq!(split_path("/a/b/c").unwrap(), (Some("/a/b".into()), "c".into()));
        assert_eq!(split_path("/a").unwrap(), (Some("/".into()), "a".into()));
        assert_eq!(split_path("name").unwrap(), (None, "name".into()));
        assert_eq!(split_path("a/b/").unwrap(), (Some("a".into()), "b".into()));
        assert!(split_path("/").is_err());
        assert!(split_path("").is_err());
    }
}
