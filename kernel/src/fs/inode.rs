//! Inodes: on-disk codec, in-memory form, and the block-map walk across
//! direct and indirect levels.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::FsError;
use crate::sync::{Mutex, MutexGuard};

use super::cache::{self, Buf};
use super::sblock;
use super::{
    inode_offset, inode_to_block, DIRECT_BLOCKS, DOUBLE_BLOCKS, ENTRIES_PER_BLOCK,
    INDIRECT_BLOCKS, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK,
};
use crate::drivers::disk::DISK_BLOCK_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeType {
    File,
    Directory,
    Empty,
}

impl InodeType {
    fn to_u8(self) -> u8 {
        match self {
            InodeType::File => 0,
            InodeType::Directory => 1,
            InodeType::Empty => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => InodeType::File,
            1 => InodeType::Directory,
            _ => InodeType::Empty,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeStatus {
    Unchanged,
    Modified,
    /// Freed (data blocks and bitmap bit) when the last reference drops.
    ToDelete,
}

/// In-memory inode. For files `size` is bytes; for directories it is the
/// entry count.
pub struct MemInode {
    pub itype: InodeType,
    pub size: u64,
    pub direct: [u64; DIRECT_BLOCKS as usize],
    pub indirect: u64,
    pub double_indirect: u64,
    pub triple_indirect: u64,

    pub num: u64,
    /// Number of data blocks mapped.
    pub size_blocks: u64,
    pub status: InodeStatus,
}

impl MemInode {
    pub(crate) fn empty(num: u64) -> Self {
        MemInode {
            itype: InodeType::Empty,
            size: 0,
            direct: [0; DIRECT_BLOCKS as usize],
            indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
            num,
            size_blocks: 0,
            status: InodeStatus::Unchanged,
        }
    }

    /// Blocks implied by `size` for this inode's type.
    pub(crate) fn blocks_for_size(itype: InodeType, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        match itype {
            InodeType::Directory => (size - 1) / ENTRIES_PER_BLOCK + 1,
            _ => (size - 1) / DISK_BLOCK_SIZE as u64 + 1,
        }
    }

    /// Decode the 128-byte slot for inode `num` out of its block.
    pub(crate) fn decode(num: u64, slot: &[u8]) -> Self {
        let mut ino = MemInode::empty(num);
        ino.itype = InodeType::from_u8(slot[0]);
        ino.size = LittleEndian::read_u64(&slot[8..16]);
        for (i, d) in ino.direct.iter_mut().enumerate() {
            *d = LittleEndian::read_u64(&slot[16 + i * 8..24 + i * 8]);
        }
        ino.indirect = LittleEndian::read_u64(&slot[104..112]);
        ino.double_indirect = LittleEndian::read_u64(&slot[112..120]);
        ino.triple_indirect = LittleEndian::read_u64(&slot[120..128]);
        ino.size_blocks = Self::blocks_for_size(ino.itype, ino.size);
        ino
    }

    /// Encode into the 128-byte slot.
    pub(crate) fn encode(&self, slot: &mut [u8]) {
        slot.fill(0);
        slot[0] = self.itype.to_u8();
        LittleEndian::write_u64(&mut slot[8..16], self.size);
        for (i, d) in self.direct.iter().enumerate() {
            LittleEndian::write_u64(&mut slot[16 + i * 8..24 + i * 8], *d);
        }
        LittleEndian::write_u64(&mut slot[104..112], self.indirect);
        LittleEndian::write_u64(&mut slot[112..120], self.double_indirect);
        LittleEndian::write_u64(&mut slot[120..128], self.triple_indirect);
    }
}

pub(crate) struct InodeCell {
    pub(crate) body: Mutex<MemInode>,
}

/// A counted reference to a cached inode. Obtained from `iget`, returned
/// with `iput`; dropping a handle without `iput` leaks the reference.
#[derive(Clone)]
pub struct InodeHandle {
    pub(crate) slot: usize,
    pub(crate) num: u64,
    pub(crate) cell: Arc<InodeCell>,
}

impl InodeHandle {
    pub(crate) fn lock(&self) -> MutexGuard<'_, MemInode> {
        self.cell.body.lock()
    }

    pub fn inum(&self) -> u64 {
        self.num
    }
}

fn read_ptr(block: u64, index: u64) -> Result<u64, FsError> {
    let buf = cache::bread(block)?;
    let v = LittleEndian::read_u64(&buf.data[(index as usize) * 8..][..8]);
    cache::brelse(buf);
    Ok(v)
}

fn write_ptr(block: u64, index: u64, value: u64) -> Result<(), FsError> {
    let mut buf = cache::bread(block)?;
    LittleEndian::write_u64(&mut buf.data[(index as usize) * 8..][..8], value);
    cache::bwrite(buf)
}

/// Allocate a zeroed pointer block.
fn alloc_pointer_block() -> Result<u64, FsError> {
    let b = sblock::balloc()?;
    cache::bwrite(Buf::zeroed(b))?;
    Ok(b)
}

/// Map a block offset inside the file to a disk block number, walking
/// whichever indirect levels the offset requires.
pub(crate) fn blockmap(ino: &MemInode, k: u64) -> Result<u64, FsError> {
    if k < DIRECT_BLOCKS {
        return Ok(ino.direct[k as usize]);
    }
    let k1 = k - DIRECT_BLOCKS;
    if k1 < INDIRECT_BLOCKS {
        return read_ptr(ino.indirect, k1);
    }
    let k2 = k1 - INDIRECT_BLOCKS;
    if k2 < DOUBLE_BLOCKS {
        let mid = read_ptr(ino.double_indirect, k2 / POINTERS_PER_BLOCK)?;
        return read_ptr(mid, k2 % POINTERS_PER_BLOCK);
    }
    let k3 = k2 - DOUBLE_BLOCKS;
    if k >= MAX_FILE_BLOCKS {
        return Err(FsError::FileTooLarge);
    }
    let mid = read_ptr(ino.triple_indirect, k3 / DOUBLE_BLOCKS)?;
    let leaf = read_ptr(mid, (k3 / POINTERS_PER_BLOCK) % POINTERS_PER_BLOCK)?;
    read_ptr(leaf, k3 % POINTERS_PER_BLOCK)
}

/// Append `block` as the inode's next data block, allocating whichever
/// pointer blocks the new position needs. The caller updates
/// `size_blocks` afterwards.
pub(crate) fn iadd_block(ino: &mut MemInode, block: u64) -> Result<(), FsError> {
    let n = ino.size_blocks;
    if n >= MAX_FILE_BLOCKS {
        return Err(FsError::FileTooLarge);
    }
    ino.status = InodeStatus::Modified;
    if n < DIRECT_BLOCKS {
        ino.direct[n as usize] = block;
        return Ok(());
    }
    let n1 = n - DIRECT_BLOCKS;
    if n1 < INDIRECT_BLOCKS {
        if n1 == 0 {
            ino.indirect = alloc_pointer_block()?;
        }
        return write_ptr(ino.indirect, n1, block);
    }
    let n2 = n1 - INDIRECT_BLOCKS;
    if n2 < DOUBLE_BLOCKS {
        if n2 == 0 {
            ino.double_indirect = alloc_pointer_block()?;
        }
        let (l1, l2) = (n2 / POINTERS_PER_BLOCK, n2 % POINTERS_PER_BLOCK);
        let mid = if l2 == 0 {
            let b = alloc_pointer_block()?;
            write_ptr(ino.double_indirect, l1, b)?;
            b
        } else {
            read_ptr(ino.double_indirect, l1)?
        };
        return write_ptr(mid, l2, block);
    }
    let n3 = n2 - DOUBLE_BLOCKS;
    if n3 == 0 {
        ino.triple_indirect = alloc_pointer_block()?;
    }
    let (t, rem) = (n3 / DOUBLE_BLOCKS, n3 % DOUBLE_BLOCKS);
    let (d, s) = (rem / POINTERS_PER_BLOCK, rem % POINTERS_PER_BLOCK);
    let mid = if rem == 0 {
        let b = alloc_pointer_block()?;
        write_ptr(ino.triple_indirect, t, b)?;
        b
    } else {
        read_ptr(ino.triple_indirect, t)?
    };
    let leaf = if s == 0 {
        let b = alloc_pointer_block()?;
        write_ptr(mid, d, b)?;
        b
    } else {
        read_ptr(mid, d)?
    };
    write_ptr(leaf, s, block)
}

/// Release every data and pointer block and reset the inode to empty
/// (type preserved). Used by truncation and deletion.
pub(crate) fn iclear(ino: &mut MemInode) -> Result<(), FsError> {
    let blocks = ino.size_blocks;
    for k in 0..blocks {
        if let Ok(b) = blockmap(ino, k) {
            sblock::bfree(b);
        }
    }
    if blocks > DIRECT_BLOCKS {
        sblock::bfree(ino.indirect);
    }
    if blocks > DIRECT_BLOCKS + INDIRECT_BLOCKS {
        let covered = (blocks - DIRECT_BLOCKS - INDIRECT_BLOCKS).min(DOUBLE_BLOCKS);
        let mids = (covered - 1) / POINTERS_PER_BLOCK + 1;
        for i in 0..mids {
            if let Ok(b) = read_ptr(ino.double_indirect, i) {
                sblock::bfree(b);
            }
        }
        sblock::bfree(ino.double_indirect);
    }
    if blocks > DIRECT_BLOCKS + INDIRECT_BLOCKS + DOUBLE_BLOCKS {
        let covered = blocks - DIRECT_BLOCKS - INDIRECT_BLOCKS - DOUBLE_BLOCKS;
        let tops = (covered - 1) / DOUBLE_BLOCKS + 1;
        for t in 0..tops {
            let Ok(mid) = read_ptr(ino.triple_indirect, t) else {
                continue;
            };
            let inner = (covered - t * DOUBLE_BLOCKS).min(DOUBLE_BLOCKS);
            let leaves = (inner - 1) / POINTERS_PER_BLOCK + 1;
            for d in 0..leaves {
                if let Ok(b) = read_ptr(mid, d) {
                    sblock::bfree(b);
                }
            }
            sblock::bfree(mid);
        }
        sblock::bfree(ino.triple_indirect);
    }
    ino.size = 0;
    ino.size_blocks = 0;
    ino.direct = [0; DIRECT_BLOCKS as usize];
    ino.indirect = 0;
    ino.double_indirect = 0;
    ino.triple_indirect = 0;
    ino.status = InodeStatus::Modified;
    Ok(())
}

/// Write the inode back to its slot on disk.
pub(crate) fn iupdate(ino: &MemInode) -> Result<(), FsError> {
    let mut buf = cache::bread(inode_to_block(ino.num))?;
    let off = inode_offset(ino.num);
    ino.encode(&mut buf.data[off..off + super::INODE_SIZE]);
    cache::bwrite(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip() {
        let mut ino = MemInode::empty(7);
        ino.itype = InodeType::File;
        ino.size = 123456;
        ino.direct[0] = 40;
        ino.direct[10] = 50;
        ino.indirect = 60;
        ino.double_indirect = 70;
        ino.triple_indirect = 80;
        let mut slot = [0u8; 128];
        ino.encode(&mut slot);
        let back = MemInode::decode(7, &slot);
        assert_eq!(back.itype, InodeType::File);
        assert_eq!(back.size, 123456);
        assert_eq!(back.direct, ino.direct);
        assert_eq!(back.indirect, 60);
        assert_eq!(back.double_indirect, 70);
        assert_eq!(back.triple_indirect, 80);
        assert_eq!(back.size_blocks, (123456 - 1) / 4096 + 1);
    }

    #[test]
    fn directory_size_counts_entries() {
        assert_eq!(MemInode::blocks_for_size(InodeType::Directory, 2), 1);
        assert_eq!(MemInode::blocks_for_size(InodeType::Directory, 16), 1);
        assert_eq!(MemInode::blocks_for_size(InodeType::Directory, 17), 2);
        assert_eq!(MemInode::blocks_for_size(InodeType::File, 4096), 1);
        assert_eq!(MemInode::blocks_for_size(InodeType::File, 4097), 2);
        assert_eq!(MemInode::blocks_for_size(InodeType::File, 0), 0);
    }
}
