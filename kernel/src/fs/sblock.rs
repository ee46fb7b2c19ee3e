//! Superblock, on-disk layout, and block/inode allocation.
//!
//! Block 0 holds the superblock; inode slots start at block 1, followed
//! by the inode bitmap, the block bitmap, and the data region. Allocation
//! scans the in-memory bitmap for the first zero bit and persists the
//! affected bitmap block synchronously; the free counters live in memory
//! and are recomputed from the bitmaps at mount.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::FsError;
use crate::sync::Mutex;

use super::bitmap::Bitmap;
use super::cache::{self, Buf};
use super::DISK_BLOCK_SIZE;

/// Superblock magic ("Mini").
pub const MAGIC: u32 = 0x4D69_6E69;

/// Bits covered by one bitmap block.
pub const BITS_PER_BLOCK: u64 = (DISK_BLOCK_SIZE * 8) as u64;

/// Bytes the superblock occupies at the front of block 0.
pub const SUPERBLOCK_SIZE: usize = 4 + 12 * 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    pub disk_num_blocks: u64,
    pub total_inodes: u64,
    pub first_inode_block: u64,
    pub inode_bitmap_first: u64,
    pub inode_bitmap_last: u64,
    pub block_bitmap_first: u64,
    pub block_bitmap_last: u64,
    pub first_data_block: u64,
    pub total_data_blocks: u64,
    pub root_inum: u64,
    pub free_inodes: u64,
    pub free_blocks: u64,
}

impl SuperBlock {
    /// Compute the layout for a disk of `n` blocks. One inode per block
    /// of capacity; root inode number 1.
    pub fn format(n: u64) -> Self {
        let inode_blocks = (n - 1) / super::INODE_PER_BLOCK + 1;
        let bitmap_blocks = (n - 1) / BITS_PER_BLOCK + 1;
        let inode_bitmap_first = 1 + inode_blocks;
        let inode_bitmap_last = inode_bitmap_first + bitmap_blocks - 1;
        let block_bitmap_first = inode_bitmap_last + 1;
        let block_bitmap_last = block_bitmap_first + bitmap_blocks - 1;
        SuperBlock {
            magic: MAGIC,
            disk_num_blocks: n,
            total_inodes: n,
            first_inode_block: 1,
            inode_bitmap_first,
            inode_bitmap_last,
            block_bitmap_first,
            block_bitmap_last,
            first_data_block: block_bitmap_last + 1,
            total_data_blocks: n - 1 - block_bitmap_last,
            root_inum: super::ROOT_INUM,
            free_inodes: 0,
            free_blocks: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
            && self.disk_num_blocks > self.block_bitmap_last
            && self.root_inum == super::ROOT_INUM
    }

    pub fn encode(&self, out: &mut [u8]) {
        let mut w: &mut [u8] = out;
        w.write_u32::<LittleEndian>(self.magic).unwrap();
        for v in [
            self.disk_num_blocks,
            self.total_inodes,
            self.first_inode_block,
            self.inode_bitmap_first,
            self.inode_bitmap_last,
            self.block_bitmap_first,
            self.block_bitmap_last,
            self.first_data_block,
            self.total_data_blocks,
            self.root_inum,
            self.free_inodes,
            self.free_blocks,
        ] {
            w.write_u64::<LittleEndian>(v).unwrap();
        }
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return None;
        }
        let mut r = buf;
        let magic = r.read_u32::<LittleEndian>().ok()?;
        let mut vals = [0u64; 12];
        for v in vals.iter_mut() {
            *v = r.read_u64::<LittleEndian>().ok()?;
        }
        Some(SuperBlock {
            magic,
            disk_num_blocks: vals[0],
            total_inodes: vals[1],
            first_inode_block: vals[2],
            inode_bitmap_first: vals[3],
            inode_bitmap_last: vals[4],
            block_bitmap_first: vals[5],
            block_bitmap_last: vals[6],
            first_data_block: vals[7],
            total_data_blocks: vals[8],
            root_inum: vals[9],
            free_inodes: vals[10],
            free_blocks: vals[11],
        })
    }

    /// Number of blocks each bitmap spans.
    pub fn bitmap_blocks(&self) -> u64 {
        self.inode_bitmap_last - self.inode_bitmap_first + 1
    }
}

/// Mounted filesystem state, guarded by the filesystem-wide lock.
pub(crate) struct FsState {
    pub sb: SuperBlock,
    pub inode_bitmap: Bitmap,
    pub block_bitmap: Bitmap,
}

pub(crate) static FS: Mutex<Option<FsState>> = Mutex::new(None);

pub(crate) fn with_fs<R>(f: impl FnOnce(&mut FsState) -> Result<R, FsError>) -> Result<R, FsError> {
    let mut g = FS.lock();
    match g.as_mut() {
        Some(state) => f(state),
        None => Err(FsError::NotMounted),
    }
}

/// Persist the bitmap block containing `bit`.
fn push_bitmap_block(bitmap: &Bitmap, first_block: u64, bit: u64) -> Result<(), FsError> {
    let index = bit / BITS_PER_BLOCK;
    let start = (index as usize) * DISK_BLOCK_SIZE;
    let mut buf = Buf::zeroed(first_block + index);
    let bytes = bitmap.as_bytes();
    let end = (start + DISK_BLOCK_SIZE).min(bytes.len());
    buf.data[..end - start].copy_from_slice(&bytes[start..end]);
    cache::bwrite(buf)
}

/// Allocate a data block: first zero bit of the block bitmap.
pub(crate) fn balloc() -> Result<u64, FsError> {
    with_fs(|state| {
        if state.sb.free_blocks == 0 {
            return Err(FsError::NoSpace);
        }
        let bit = state.block_bitmap.first_zero().ok_or(FsError::NoSpace)? as u64;
        state.block_bitmap.set(bit as usize);
        push_bitmap_block(&state.block_bitmap, state.sb.block_bitmap_first, bit)?;
        state.sb.free_blocks -= 1;
        Ok(bit)
    })
}

/// Free a data block; already-free and out-of-range bits are ignored.
pub(crate) fn bfree(block: u64) {
    let _ = with_fs(|state| {
        if block <= state.sb.block_bitmap_last || block >= state.sb.disk_num_blocks {
            return Ok(());
        }
        if state.block_bitmap.get(block as usize) {
            state.block_bitmap.clear(block as usize);
            push_bitmap_block(&state.block_bitmap, state.sb.block_bitmap_first, block)?;
            state.sb.free_blocks += 1;
        }
        Ok(())
    });
}

/// Allocate an inode number.
pub(crate) fn ialloc() -> Result<u64, FsError> {
    with_fs(|state| {
        if state.sb.free_inodes == 0 {
            return Err(FsError::NoInodes);
        }
        let bit = state.inode_bitmap.first_zero().ok_or(FsError::NoInodes)? as u64;
        state.inode_bitmap.set(bit as usize);
        push_bitmap_block(&state.inode_bitmap, state.sb.inode_bitmap_first, bit)?;
        state.sb.free_inodes -= 1;
        Ok(bit)
    })
}

/// Free an inode number; already-free bits are ignored.
pub(crate) fn ifree(inum: u64) {
    let _ = with_fs(|state| {
        if inum == 0 || inum >= state.sb.total_inodes {
            return Ok(());
        }
        if state.inode_bitmap.get(inum as usize) {
            state.inode_bitmap.clear(inum as usize);
            push_bitmap_block(&state.inode_bitmap, state.sb.inode_bitmap_first, inum)?;
            state.sb.free_inodes += 1;
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_layout_arithmetic() {
        let sb = SuperBlock::format(1024);
        // 1024 inodes at 32 per block -> 32 inode blocks; one bitmap
        // block covers 32768 bits, so each bitmap is a single block.
        assert_eq!(sb.first_inode_block, 1);
        assert_eq!(sb.inode_bitmap_first, 33);
        assert_eq!(sb.inode_bitmap_last, 33);
        assert_eq!(sb.block_bitmap_first, 34);
        assert_eq!(sb.block_bitmap_last, 34);
        assert_eq!(sb.first_data_block, 35);
        assert_eq!(sb.total_data_blocks, 1024 - 35);
        assert!(sb.is_valid());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut sb = SuperBlock::format(4096);
        sb.free_blocks = 17;
        sb.free_inodes = 23;
        let mut block = vec![0u8; DISK_BLOCK_SIZE];
        sb.encode(&mut block);
        assert_eq!(SuperBlock::decode(&block), Some(sb));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut sb = SuperBlock::format(256);
        sb.magic = 0xdead_beef;
        assert!(!sb.is_valid());
    }
}
