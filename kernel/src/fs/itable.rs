//! In-memory inode table: a fixed pool of cached inodes with reference
//! counting.
//!
//! `iget` returns a counted handle, reading the inode from disk on a
//! miss; `iput` drops a reference and, at zero, writes the inode back
//! (freeing its storage first if it was marked for deletion) and returns
//! the slot to the free list.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::errors::FsError;
use crate::sync::Mutex;

use super::cache;
use super::inode::{iclear, iupdate, InodeCell, InodeHandle, InodeStatus, MemInode};
use super::sblock;
use super::{inode_offset, inode_to_block, INODE_SIZE, MAX_MEM_INODES};

struct Itable {
    cells: Vec<Arc<InodeCell>>,
    refs: Vec<u32>,
    nums: Vec<u64>,
    /// inode number -> slot, for every slot with a live reference.
    map: HashMap<u64, usize>,
    free: VecDeque<usize>,
}

static ITABLE: Mutex<Option<Itable>> = Mutex::new(None);

/// Create the pool. Runs at mount.
pub(crate) fn init() {
    let mut g = ITABLE.lock();
    if g.is_some() {
        return;
    }
    let mut cells = Vec::with_capacity(MAX_MEM_INODES);
    for _ in 0..MAX_MEM_INODES {
        cells.push(Arc::new(InodeCell { body: Mutex::new(MemInode::empty(0)) }));
    }
    *g = Some(Itable {
        cells,
        refs: vec![0; MAX_MEM_INODES],
        nums: vec![0; MAX_MEM_INODES],
        map: HashMap::new(),
        free: (0..MAX_MEM_INODES).collect(),
    });
}

/// Fetch inode `n`, reading it from disk unless already cached.
pub fn iget(n: u64) -> Result<InodeHandle, FsError> {
    let mut g = ITABLE.lock();
    let t = g.as_mut().ok_or(FsError::NotMounted)?;

    if let Some(&slot) = t.map.get(&n) {
        t.refs[slot] += 1;
        return Ok(InodeHandle { slot, num: n, cell: t.cells[slot].clone() });
    }

    let slot = t.free.pop_front().ok_or(FsError::InodeTableFull)?;
    let buf = match cache::bread(inode_to_block(n)) {
        Ok(buf) => buf,
        Err(e) => {
            t.free.push_front(slot);
            return Err(e);
        }
    };
    let off = inode_offset(n);
    let ino = MemInode::decode(n, &buf.data[off..off + INODE_SIZE]);
    cache::brelse(buf);

    *t.cells[slot].body.lock() = ino;
    t.map.insert(n, slot);
    t.nums[slot] = n;
    t.refs[slot] = 1;
    Ok(InodeHandle { slot, num: n, cell: t.cells[slot].clone() })
}

/// Drop one reference. The last reference writes the inode back, after
/// releasing its blocks and bitmap bit if it was marked TO_DELETE.
pub fn iput(handle: InodeHandle) {
    let mut g = ITABLE.lock();
    let Some(t) = g.as_mut() else {
        return;
    };
    debug_assert_eq!(t.nums[handle.slot], handle.num, "stale inode handle");
    t.refs[handle.slot] -= 1;
    if t.refs[handle.slot] > 0 {
        return;
    }

    {
        let mut ino = handle.cell.body.lock();
        if ino.status == InodeStatus::ToDelete {
            if let Err(e) = iclear(&mut ino) {
                log::warn!("[fs] reclaiming inode {}: {e}", ino.num);
            }
            ino.itype = super::inode::InodeType::Empty;
            sblock::ifree(ino.num);
        }
        if ino.status != InodeStatus::Unchanged {
            if let Err(e) = iupdate(&ino) {
                log::warn!("[fs] writing back inode {}: {e}", ino.num);
            }
        }
    }

    t.map.remove(&handle.num);
    t.nums[handle.slot] = 0;
    t.free.push_back(handle.slot);
}
