//! The filesystem (minifile): superblock and bitmaps, buffer layer,
//! inode table, directories, and the file API.
//!
//! On-disk layout: block 0 superblock, inode region from block 1
//! (128-byte inodes, 32 per block), inode bitmap, block bitmap, data.
//! Inodes carry 11 direct pointers plus single/double/triple indirect
//! blocks of 512 pointers each. Directory data is 256-byte entries; a
//! directory inode's `size` counts entries, a file's counts bytes.
//!
//! Every operation returns an error rather than leaving disk state
//! half-applied beyond block granularity; there are no transactions.

pub mod bitmap;
pub mod cache;
pub mod diskutil;
pub mod inode;
pub mod itable;
pub mod path;
pub mod sblock;

pub use crate::drivers::disk::DISK_BLOCK_SIZE;

use crate::sync::Mutex;
use crate::task;

use cache::Buf;
use inode::{blockmap, iadd_block, iclear, iupdate, InodeHandle, InodeStatus, InodeType, MemInode};
use itable::{iget, iput};
use path::{dir_add_entry, dir_entries, dir_lookup, dir_remove_entry, name_from, namei, split_path};

pub use crate::errors::FsError;
pub use path::namei as resolve_path;

pub const INODE_SIZE: usize = 128;
pub const INODE_PER_BLOCK: u64 = (DISK_BLOCK_SIZE / INODE_SIZE) as u64;
pub const INODE_START_BLOCK: u64 = 1;

pub const POINTERS_PER_BLOCK: u64 = (DISK_BLOCK_SIZE / 8) as u64;
pub const DIRECT_BLOCKS: u64 = 11;
pub const INDIRECT_BLOCKS: u64 = POINTERS_PER_BLOCK;
pub const DOUBLE_BLOCKS: u64 = POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;
pub const TRIPLE_BLOCKS: u64 = POINTERS_PER_BLOCK * POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;
pub const MAX_FILE_BLOCKS: u64 = DIRECT_BLOCKS + INDIRECT_BLOCKS + DOUBLE_BLOCKS + TRIPLE_BLOCKS;

pub const DIR_ENTRY_SIZE: usize = 256;
pub const MAX_NAME_LEN: usize = DIR_ENTRY_SIZE - 8 - 1;
pub const ENTRIES_PER_BLOCK: u64 = (DISK_BLOCK_SIZE / DIR_ENTRY_SIZE) as u64;

pub const ROOT_INUM: u64 = 1;
pub const MAX_MEM_INODES: usize = 128;

pub(crate) fn inode_to_block(num: u64) -> u64 {
    (num - 1) / INODE_PER_BLOCK + INODE_START_BLOCK
}

pub(crate) fn inode_offset(num: u64) -> usize {
    ((num - 1) % INODE_PER_BLOCK) as usize * INODE_SIZE
}

/// Permanent reference to the root directory, held from mount on.
static ROOT: Mutex<Option<InodeHandle>> = Mutex::new(None);

/// Mount the filesystem from the initialized disk device: validate the
/// superblock, load the bitmaps, recount the free counters, and pin the
/// root inode. Must run on a minithread.
pub fn mount() -> Result<(), FsError> {
    cache::init();
    let buf = cache::bread(0)?;
    let mut sb = sblock::SuperBlock::decode(&buf.data).ok_or(FsError::BadSuperblock)?;
    cache::brelse(buf);
    if !sb.is_valid() {
        return Err(FsError::BadSuperblock);
    }

    let mut inode_raw = Vec::with_capacity(sb.bitmap_blocks() as usize * DISK_BLOCK_SIZE);
    for b in sb.inode_bitmap_first..=sb.inode_bitmap_last {
        inode_raw.extend_from_slice(&cache::bread(b)?.data);
    }
    let mut block_raw = Vec::with_capacity(sb.bitmap_blocks() as usize * DISK_BLOCK_SIZE);
    for b in sb.block_bitmap_first..=sb.block_bitmap_last {
        block_raw.extend_from_slice(&cache::bread(b)?.data);
    }
    let inode_bitmap = bitmap::Bitmap::from_bytes(inode_raw, sb.total_inodes as usize);
    let block_bitmap = bitmap::Bitmap::from_bytes(block_raw, sb.disk_num_blocks as usize);
    sb.free_inodes = inode_bitmap.count_zero() as u64;
    sb.free_blocks = block_bitmap.count_zero() as u64;
    log::debug!(
        "[fs] mounted: {} blocks, {} free, {} free inodes",
        sb.disk_num_blocks,
        sb.free_blocks,
        sb.free_inodes
    );

    *sblock::FS.lock() = Some(sblock::FsState { sb, inode_bitmap, block_bitmap });
    itable::init();

    let root = iget(ROOT_INUM)?;
    let ok = root.lock().itype == InodeType::Directory;
    if !ok {
        iput(root);
        return Err(FsError::BadSuperblock);
    }
    *ROOT.lock() = Some(root);
    Ok(())
}

pub fn is_mounted() -> bool {
    sblock::FS.lock().is_some()
}

/// Release a thread's cached working-directory reference (cleanup path).
pub(crate) fn release_cwd(handle: InodeHandle) {
    iput(handle);
}

// ── Open files ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OpenMode {
    read: bool,
    write: bool,
    append: bool,
}

fn parse_mode(mode: &str) -> Result<(OpenMode, bool), FsError> {
    let m = match mode {
        "r" => (OpenMode { read: true, write: false, append: false }, false),
        "r+" => (OpenMode { read: true, write: true, append: false }, false),
        "w" => (OpenMode { read: false, write: true, append: false }, true),
        "w+" => (OpenMode { read: true, write: true, append: false }, true),
        "a" => (OpenMode { read: false, write: true, append: true }, false),
        "a+" => (OpenMode { read: true, write: true, append: true }, false),
        _ => return Err(FsError::InvalidMode),
    };
    Ok(m)
}

/// An open file handle: an inode reference plus a byte cursor.
pub struct File {
    inode: InodeHandle,
    cursor: u64,
    mode: OpenMode,
}

/// Create `path` (truncating an existing file) and open it for writing.
pub fn creat(path: &str) -> Result<File, FsError> {
    if path.ends_with('/') {
        return Err(FsError::InvalidPath);
    }
    let handle = match namei(path) {
        Ok(inum) => {
            let h = iget(inum)?;
            let r = {
                let mut ino = h.lock();
                if ino.itype != InodeType::File {
                    Err(FsError::IsADirectory)
                } else {
                    iclear(&mut ino).and_then(|_| iupdate(&ino))
                }
            };
            if let Err(e) = r {
                iput(h);
                return Err(e);
            }
            h
        }
        Err(FsError::NotFound) => create_node(path, InodeType::File)?,
        Err(e) => return Err(e),
    };
    Ok(File {
        inode: handle,
        cursor: 0,
        mode: OpenMode { read: false, write: true, append: false },
    })
}

/// Open `path` with a stdio-style mode string (r, w, a, and + variants).
pub fn open(path: &str, mode: &str) -> Result<File, FsError> {
    let (m, truncate) = parse_mode(mode)?;
    let handle = match namei(path) {
        Ok(inum) => {
            let h = iget(inum)?;
            let r = {
                let mut ino = h.lock();
                if ino.itype != InodeType::File {
                    Err(FsError::IsADirectory)
                } else if truncate {
                    iclear(&mut ino).and_then(|_| iupdate(&ino))
                } else {
                    Ok(())
                }
            };
            if let Err(e) = r {
                iput(h);
                return Err(e);
            }
            h
        }
        Err(FsError::NotFound) if m.write => create_node(path, InodeType::File)?,
        Err(e) => return Err(e),
    };
    let cursor = if m.append { handle.lock().size } else { 0 };
    Ok(File { inode: handle, cursor, mode: m })
}

impl File {
    pub fn inum(&self) -> u64 {
        self.inode.inum()
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.inode.lock().size
    }

    /// Read up to `buf.len()` bytes at the cursor; stops at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.mode.read {
            return Err(FsError::BadMode);
        }
        let ino = self.inode.lock();
        let remaining = ino.size.saturating_sub(self.cursor);
        let mut left = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;
        while left > 0 {
            let block_off = self.cursor / DISK_BLOCK_SIZE as u64;
            let byte_off = (self.cursor % DISK_BLOCK_SIZE as u64) as usize;
            let step = (DISK_BLOCK_SIZE - byte_off).min(left);
            let bnum = blockmap(&ino, block_off)?;
            let b = cache::bread(bnum)?;
            buf[done..done + step].copy_from_slice(&b.data[byte_off..byte_off + step]);
            cache::brelse(b);
            self.cursor += step as u64;
            done += step;
            left -= step;
        }
        Ok(done)
    }

    /// Write at the cursor, extending the file (and allocating data and
    /// pointer blocks) as needed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, FsError> {
        if !self.mode.write {
            return Err(FsError::BadMode);
        }
        let mut ino = self.inode.lock();
        let mut done = 0;
        while done < data.len() {
            let block_off = self.cursor / DISK_BLOCK_SIZE as u64;
            let byte_off = (self.cursor % DISK_BLOCK_SIZE as u64) as usize;
            while ino.size_blocks <= block_off {
                let b = sblock::balloc()?;
                cache::bwrite(Buf::zeroed(b))?;
                iadd_block(&mut ino, b)?;
                ino.size_blocks += 1;
            }
            let step = (DISK_BLOCK_SIZE - byte_off).min(data.len() - done);
            let bnum = blockmap(&ino, block_off)?;
            let buf = if step == DISK_BLOCK_SIZE {
                Buf { num: bnum, data: data[done..done + step].to_vec() }
            } else {
                let mut b = cache::bread(bnum)?;
                b.data[byte_off..byte_off + step].copy_from_slice(&data[done..done + step]);
                b
            };
            cache::bwrite(buf)?;
            self.cursor += step as u64;
            done += step;
            if self.cursor > ino.size {
                ino.size = self.cursor;
                ino.status = InodeStatus::Modified;
            }
        }
        iupdate(&ino)?;
        Ok(done)
    }
}

/// Close a file, dropping its inode reference (deletion happens here if
/// the file was unlinked while open).
pub fn close(file: File) {
    iput(file.inode);
}

// ── Namespace operations ────────────────────────────────────────────

/// Allocate an inode of `itype`, link it under its parent, and return a
/// referenced handle to the initialized child.
fn create_node(path: &str, itype: InodeType) -> Result<InodeHandle, FsError> {
    let (parent_path, name) = split_path(path)?;
    let parent_inum = match parent_path {
        Some(p) => namei(&p)?,
        None => task::cwd(),
    };
    let parent = iget(parent_inum)?;

    let inum = {
        let mut pino = parent.lock();
        if pino.itype != InodeType::Directory {
            Err(FsError::NotADirectory)
        } else if pino.status == InodeStatus::ToDelete {
            Err(FsError::NotFound)
        } else {
            match dir_lookup(&pino, &name) {
                Err(e) => Err(e),
                Ok(Some(_)) => Err(FsError::Exists),
                Ok(None) => sblock::ialloc().and_then(|inum| {
                    match dir_add_entry(&mut pino, &name, inum).and_then(|_| iupdate(&pino)) {
                        Ok(()) => Ok(inum),
                        Err(e) => {
                            sblock::ifree(inum);
                            Err(e)
                        }
                    }
                }),
            }
        }
    };
    let inum = match inum {
        Ok(v) => {
            iput(parent);
            v
        }
        Err(e) => {
            iput(parent);
            return Err(e);
        }
    };

    let child = iget(inum)?;
    let r = {
        let mut ino = child.lock();
        *ino = MemInode::empty(inum);
        ino.num = inum;
        ino.itype = itype;
        ino.status = InodeStatus::Modified;
        if itype == InodeType::Directory {
            dir_add_entry(&mut ino, ".", inum)
                .and_then(|_| dir_add_entry(&mut ino, "..", parent_inum))
                .and_then(|_| iupdate(&ino))
        } else {
            iupdate(&ino)
        }
    };
    if let Err(e) = r {
        iput(child);
        return Err(e);
    }
    Ok(child)
}

/// Create a directory; "." and ".." are written into its first block.
pub fn mkdir(path: &str) -> Result<(), FsError> {
    let child = create_node(path, InodeType::Directory)?;
    iput(child);
    Ok(())
}

fn remove_node(path: &str, want_dir: bool) -> Result<(), FsError> {
    let inum = namei(path)?;
    if inum == ROOT_INUM {
        return Err(FsError::RootForbidden);
    }
    let (parent_path, _) = split_path(path)?;
    let parent_inum = match parent_path {
        Some(p) => namei(&p)?,
        None => task::cwd(),
    };

    let node = iget(inum)?;
    let r = {
        let mut ino = node.lock();
        match (want_dir, ino.itype) {
            (true, InodeType::Directory) => {
                // "." and ".." are the only entries of an empty directory.
                if ino.size > 2 {
                    Err(FsError::NotEmpty)
                } else {
                    ino.status = InodeStatus::ToDelete;
                    Ok(())
                }
            }
            (false, InodeType::File) => {
                ino.status = InodeStatus::ToDelete;
                Ok(())
            }
            (true, _) => Err(FsError::NotADirectory),
            (false, _) => Err(FsError::IsADirectory),
        }
    };
    if let Err(e) = r {
        iput(node);
        return Err(e);
    }
    iput(node);

    let parent = iget(parent_inum)?;
    let r = {
        let mut pino = parent.lock();
        dir_remove_entry(&mut pino, inum).and_then(|_| iupdate(&pino))
    };
    iput(parent);
    r
}

/// Delete a file: the directory entry goes now, the data when the last
/// reference is dropped.
pub fn unlink(path: &str) -> Result<(), FsError> {
    remove_node(path, false)
}

/// Remove an empty directory. The root is non-removable.
pub fn rmdir(path: &str) -> Result<(), FsError> {
    remove_node(path, true)
}

/// Status of a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stat {
    /// A regular file and its size in bytes.
    File(u64),
    Directory,
}

pub fn stat(path: &str) -> Result<Stat, FsError> {
    let inum = namei(path)?;
    let h = iget(inum)?;
    let st = {
        let ino = h.lock();
        match ino.itype {
            InodeType::File => Ok(Stat::File(ino.size)),
            InodeType::Directory => Ok(Stat::Directory),
            InodeType::Empty => Err(FsError::NotFound),
        }
    };
    iput(h);
    st
}

/// Change the calling thread's working directory; the thread keeps a
/// reference to the inode until the next `cd` or its exit.
pub fn cd(path: &str) -> Result<(), FsError> {
    let inum = namei(path)?;
    let h = iget(inum)?;
    let ok = {
        let ino = h.lock();
        ino.itype == InodeType::Directory && ino.status != InodeStatus::ToDelete
    };
    if !ok {
        iput(h);
        return Err(FsError::NotADirectory);
    }
    if let Some(old) = task::swap_cwd(inum, Some(h)) {
        iput(old);
    }
    Ok(())
}

/// List a directory (or name a file); `None` lists the working directory.
pub fn ls(path: Option<&str>) -> Result<Vec<String>, FsError> {
    let inum = match path {
        Some(p) if !p.is_empty() => namei(p)?,
        _ => task::cwd(),
    };
    let h = iget(inum)?;
    let r = {
        let ino = h.lock();
        match ino.itype {
            InodeType::Directory => {
                dir_entries(&ino).map(|es| es.into_iter().map(|e| e.name).collect())
            }
            InodeType::File => {
                let name = path
                    .and_then(|p| split_path(p).ok())
                    .map(|(_, n)| n)
                    .unwrap_or_default();
                Ok(vec![name])
            }
            InodeType::Empty => Err(FsError::NotFound),
        }
    };
    iput(h);
    r
}

/// Reconstruct the working directory's absolute path by walking "..".
pub fn pwd() -> Result<String, FsError> {
    let mut current = task::cwd();
    if current == ROOT_INUM {
        return Ok("/".to_string());
    }
    let mut parts = Vec::new();
    while current != ROOT_INUM {
        let parent_inum = name_from(current, "..")?;
        let parent = iget(parent_inum)?;
        let name = {
            let pino = parent.lock();
            dir_entries(&pino).map(|es| {
                es.into_iter()
                    .find(|e| e.inum == current && e.name != "." && e.name != "..")
                    .map(|e| e.name)
            })
        };
        iput(parent);
        match name? {
            Some(n) => parts.push(n),
            None => return Err(FsError::NotFound),
        }
        current = parent_inum;
    }
    parts.reverse();
    Ok(format!("/{}", parts.join("/")))
}

// ── Consistency ─────────────────────────────────────────────────────

/// Verify that the in-memory free counters, the in-memory bitmaps, and
/// the persisted bitmap blocks all agree.
pub fn consistency_check() -> Result<(), FsError> {
    sblock::with_fs(|state| {
        let sb = state.sb;
        if state.inode_bitmap.count_zero() as u64 != sb.free_inodes
            || state.block_bitmap.count_zero() as u64 != sb.free_blocks
        {
            return Err(FsError::Inconsistent);
        }

        let mut raw = Vec::new();
        for b in sb.inode_bitmap_first..=sb.inode_bitmap_last {
            raw.extend_from_slice(&cache::bread(b)?.data);
        }
        let persisted = bitmap::Bitmap::from_bytes(raw, sb.total_inodes as usize);
        if persisted.count_zero() as u64 != sb.free_inodes {
            return Err(FsError::Inconsistent);
        }

        let mut raw = Vec::new();
        for b in sb.block_bitmap_first..=sb.block_bitmap_last {
            raw.extend_from_slice(&cache::bread(b)?.data);
        }
        let persisted = bitmap::Bitmap::from_bytes(raw, sb.disk_num_blocks as usize);
        if persisted.count_zero() as u64 != sb.free_blocks {
            return Err(FsError::Inconsistent);
        }
        Ok(())
    })
}

/// Snapshot of the free counters, for tests and tools.
pub fn free_counts() -> Result<(u64, u64), FsError> {
    sblock::with_fs(|state| Ok((state.sb.free_inodes, state.sb.free_blocks)))
}
