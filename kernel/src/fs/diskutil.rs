//! Disk-image utilities: format and check, operating on the image file
//! directly (no running kernel required). The `mkfs` and `fsck` binaries
//! are thin wrappers around these.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::drivers::disk::DISK_BLOCK_SIZE;
use crate::errors::ImageError;

use super::bitmap::Bitmap;
use super::inode::{InodeType, MemInode};
use super::path::encode_entry;
use super::sblock::SuperBlock;
use super::{inode_offset, inode_to_block, DIR_ENTRY_SIZE, INODE_SIZE, ROOT_INUM};

/// Create and format an image of `blocks` blocks: superblock, bitmaps,
/// and a root directory holding "." and "..".
pub fn mkfs_image(path: &Path, blocks: u64) -> Result<SuperBlock, ImageError> {
    if blocks < 8 {
        return Err(ImageError::Corrupt(format!("{blocks} blocks is too small")));
    }
    let mut sb = SuperBlock::format(blocks);
    if sb.first_data_block + 1 > blocks {
        return Err(ImageError::Corrupt(format!(
            "{blocks} blocks leave no room for data (metadata needs {})",
            sb.first_data_block
        )));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(blocks * DISK_BLOCK_SIZE as u64)?;

    let bitmap_bytes = sb.bitmap_blocks() as usize * DISK_BLOCK_SIZE;
    let mut inode_bitmap =
        Bitmap::from_bytes(vec![0u8; bitmap_bytes], sb.total_inodes as usize);
    let mut block_bitmap = Bitmap::from_bytes(vec![0u8; bitmap_bytes], blocks as usize);

    // Metadata blocks and the reserved inode 0 are permanently in use.
    for b in 0..=sb.block_bitmap_last {
        block_bitmap.set(b as usize);
    }
    inode_bitmap.set(0);

    // Root directory: inode 1, one data block with "." and "..".
    let root_block = sb.first_data_block;
    block_bitmap.set(root_block as usize);
    inode_bitmap.set(ROOT_INUM as usize);

    let mut root = MemInode::empty(ROOT_INUM);
    root.itype = InodeType::Directory;
    root.size = 2;
    root.direct[0] = root_block;

    sb.free_inodes = inode_bitmap.count_zero() as u64;
    sb.free_blocks = block_bitmap.count_zero() as u64;

    // Block 0: superblock.
    let mut block0 = vec![0u8; DISK_BLOCK_SIZE];
    sb.encode(&mut block0);
    file.write_all_at(&block0, 0)?;

    // Root inode slot.
    let mut inode_block = vec![0u8; DISK_BLOCK_SIZE];
    let off = inode_offset(ROOT_INUM);
    root.encode(&mut inode_block[off..off + INODE_SIZE]);
    file.write_all_at(
        &inode_block,
        inode_to_block(ROOT_INUM) * DISK_BLOCK_SIZE as u64,
    )?;

    // Bitmaps.
    file.write_all_at(
        inode_bitmap.as_bytes(),
        sb.inode_bitmap_first * DISK_BLOCK_SIZE as u64,
    )?;
    file.write_all_at(
        block_bitmap.as_bytes(),
        sb.block_bitmap_first * DISK_BLOCK_SIZE as u64,
    )?;

    // Root directory data.
    let mut dir_block = vec![0u8; DISK_BLOCK_SIZE];
    encode_entry(".", ROOT_INUM, &mut dir_block[..DIR_ENTRY_SIZE]);
    encode_entry("..", ROOT_INUM, &mut dir_block[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);
    file.write_all_at(&dir_block, root_block * DISK_BLOCK_SIZE as u64)?;

    file.sync_all()?;
    Ok(sb)
}

/// What `fsck_image` found.
#[derive(Debug)]
pub struct FsckReport {
    pub sb: SuperBlock,
    pub counted_free_inodes: u64,
    pub counted_free_blocks: u64,
    /// Inodes reachable by walking the directory tree from the root.
    pub reachable_inodes: u64,
    /// Data and pointer blocks owned by reachable inodes.
    pub reachable_blocks: u64,
}

/// Read access to an unmounted image.
struct Image<'a> {
    file: &'a std::fs::File,
    sb: SuperBlock,
}

impl Image<'_> {
    fn read_block(&self, n: u64) -> Result<Vec<u8>, ImageError> {
        if n >= self.sb.disk_num_blocks {
            return Err(ImageError::Corrupt(format!("block pointer {n} out of range")));
        }
        let mut buf = vec![0u8; DISK_BLOCK_SIZE];
        self.file.read_exact_at(&mut buf, n * DISK_BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    fn read_ptr(&self, block: u64, index: u64) -> Result<u64, ImageError> {
        let buf = self.read_block(block)?;
        let off = index as usize * 8;
        Ok(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()))
    }

    fn read_inode(&self, num: u64) -> Result<MemInode, ImageError> {
        let buf = self.read_block(inode_to_block(num))?;
        let off = inode_offset(num);
        Ok(MemInode::decode(num, &buf[off..off + INODE_SIZE]))
    }

    /// Every block an inode owns: (data blocks in file order, pointer
    /// blocks). Only the first two indirect levels are walked; a tree
    /// deep enough for triple indirection exceeds any image this tool is
    /// pointed at.
    fn owned_blocks(&self, ino: &MemInode) -> Result<(Vec<u64>, Vec<u64>), ImageError> {
        let mut data = Vec::new();
        let mut pointers = Vec::new();
        let n = ino.size_blocks;
        for k in 0..n.min(super::DIRECT_BLOCKS) {
            data.push(ino.direct[k as usize]);
        }
        if n > super::DIRECT_BLOCKS {
            pointers.push(ino.indirect);
            let covered = (n - super::DIRECT_BLOCKS).min(super::INDIRECT_BLOCKS);
            for k in 0..covered {
                data.push(self.read_ptr(ino.indirect, k)?);
            }
        }
        let first_double = super::DIRECT_BLOCKS + super::INDIRECT_BLOCKS;
        if n > first_double {
            pointers.push(ino.double_indirect);
            let covered = (n - first_double).min(super::DOUBLE_BLOCKS);
            let mids = (covered - 1) / super::POINTERS_PER_BLOCK + 1;
            for m in 0..mids {
                let mid = self.read_ptr(ino.double_indirect, m)?;
                pointers.push(mid);
                let inner = (covered - m * super::POINTERS_PER_BLOCK)
                    .min(super::POINTERS_PER_BLOCK);
                for s in 0..inner {
                    data.push(self.read_ptr(mid, s)?);
                }
            }
        }
        if n > first_double + super::DOUBLE_BLOCKS {
            return Err(ImageError::Corrupt(format!(
                "inode {} claims {n} blocks; triple indirection unsupported by fsck",
                ino.num
            )));
        }
        Ok((data, pointers))
    }
}

/// Validate an image: superblock and layout, metadata-block bits, then a
/// full directory-tree walk proving that the bitmaps record exactly the
/// reachable inodes and blocks.
pub fn fsck_image(path: &Path) -> Result<FsckReport, ImageError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let file_blocks = file.metadata()?.len() / DISK_BLOCK_SIZE as u64;

    let mut block0 = vec![0u8; DISK_BLOCK_SIZE];
    file.read_exact_at(&mut block0, 0)?;
    let sb = SuperBlock::decode(&block0)
        .ok_or_else(|| ImageError::Corrupt("superblock truncated".into()))?;
    if !sb.is_valid() {
        return Err(ImageError::Corrupt(format!(
            "bad magic {:#010x}",
            sb.magic
        )));
    }
    if sb.disk_num_blocks > file_blocks {
        return Err(ImageError::Corrupt(format!(
            "superblock claims {} blocks, image holds {file_blocks}",
            sb.disk_num_blocks
        )));
    }

    let bitmap_bytes = sb.bitmap_blocks() as usize * DISK_BLOCK_SIZE;
    let mut raw = vec![0u8; bitmap_bytes];
    file.read_exact_at(&mut raw, sb.inode_bitmap_first * DISK_BLOCK_SIZE as u64)?;
    let inode_bitmap = Bitmap::from_bytes(raw, sb.total_inodes as usize);
    let mut raw = vec![0u8; bitmap_bytes];
    file.read_exact_at(&mut raw, sb.block_bitmap_first * DISK_BLOCK_SIZE as u64)?;
    let block_bitmap = Bitmap::from_bytes(raw, sb.disk_num_blocks as usize);

    for b in 0..=sb.block_bitmap_last {
        if !block_bitmap.get(b as usize) {
            return Err(ImageError::Corrupt(format!(
                "metadata block {b} marked free"
            )));
        }
    }
    if !inode_bitmap.get(0) || !inode_bitmap.get(ROOT_INUM as usize) {
        return Err(ImageError::Corrupt("reserved inode bits are clear".into()));
    }

    // Walk the tree from the root, recording every inode and block a
    // live file or directory owns.
    let img = Image { file: &file, sb };
    let mut used_inodes = std::collections::HashSet::from([0, ROOT_INUM]);
    let mut used_blocks: std::collections::HashSet<u64> =
        (0..=sb.block_bitmap_last).collect();
    let mut pending = vec![ROOT_INUM];
    while let Some(inum) = pending.pop() {
        let ino = img.read_inode(inum)?;
        let (data, pointers) = img.owned_blocks(&ino)?;
        used_blocks.extend(pointers);
        used_blocks.extend(data.iter().copied());
        match ino.itype {
            InodeType::File => {}
            InodeType::Directory => {
                if inum == ROOT_INUM && ino.size < 2 {
                    return Err(ImageError::Corrupt(
                        "root directory lacks its \".\" and \"..\" entries".into(),
                    ));
                }
                let mut index = 0u64;
                'blocks: for bnum in &data {
                    let block = img.read_block(*bnum)?;
                    for slot in 0..super::ENTRIES_PER_BLOCK as usize {
                        if index >= ino.size {
                            break 'blocks;
                        }
                        let entry =
                            super::path::decode_entry(&block[slot * DIR_ENTRY_SIZE..]);
                        index += 1;
                        if entry.name == "." || entry.name == ".." {
                            continue;
                        }
                        if entry.inum == 0 || entry.inum >= sb.total_inodes {
                            return Err(ImageError::Corrupt(format!(
                                "directory {inum} entry \"{}\" points at inode {}",
                                entry.name, entry.inum
                            )));
                        }
                        if !inode_bitmap.get(entry.inum as usize) {
                            return Err(ImageError::Corrupt(format!(
                                "reachable inode {} is marked free",
                                entry.inum
                            )));
                        }
                        if used_inodes.insert(entry.inum) {
                            pending.push(entry.inum);
                        }
                    }
                }
            }
            InodeType::Empty => {
                return Err(ImageError::Corrupt(format!(
                    "reachable inode {inum} has no type"
                )));
            }
        }
    }

    // The bitmaps must record exactly what the tree reaches.
    let marked_inodes = (sb.total_inodes - inode_bitmap.count_zero() as u64) as usize;
    if marked_inodes != used_inodes.len() {
        return Err(ImageError::Corrupt(format!(
            "{marked_inodes} inode bits set but {} inodes reachable",
            used_inodes.len()
        )));
    }
    let marked_blocks = (sb.disk_num_blocks - block_bitmap.count_zero() as u64) as usize;
    if marked_blocks != used_blocks.len() {
        return Err(ImageError::Corrupt(format!(
            "{marked_blocks} block bits set but {} blocks in use",
            used_blocks.len()
        )));
    }

    Ok(FsckReport {
        sb,
        counted_free_inodes: inode_bitmap.count_zero() as u64,
        counted_free_blocks: block_bitmap.count_zero() as u64,
        reachable_inodes: used_inodes.len() as u64 - 1,
        reachable_blocks: used_blocks.len() as u64 - (sb.block_bitmap_last + 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkfs_then_fsck() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.img");
        let sb = mkfs_image(&img, 512).unwrap();
        let report = fsck_image(&img).unwrap();
        assert_eq!(report.sb, sb);
        assert_eq!(report.counted_free_inodes, sb.free_inodes);
        assert_eq!(report.counted_free_blocks, sb.free_blocks);
    }

    #[test]
    fn mkfs_rejects_tiny_disks() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("tiny.img");
        assert!(mkfs_image(&img, 3).is_err());
    }

    #[test]
    fn fsck_detects_a_leaked_inode_bit() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("leak.img");
        let sb = mkfs_image(&img, 512).unwrap();

        // Set a spare inode bit with no directory entry pointing at it.
        let file = OpenOptions::new().read(true).write(true).open(&img).unwrap();
        let mut bits = vec![0u8; DISK_BLOCK_SIZE];
        let off = sb.inode_bitmap_first * DISK_BLOCK_SIZE as u64;
        file.read_exact_at(&mut bits, off).unwrap();
        bits[1] |= 1;
        file.write_all_at(&bits, off).unwrap();

        match fsck_image(&img) {
            Err(ImageError::Corrupt(msg)) => assert!(msg.contains("reachable"), "{msg}"),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn fsck_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("junk.img");
        std::fs::write(&img, vec![0xabu8; 64 * 1024]).unwrap();
        assert!(fsck_image(&img).is_err());
    }
}
