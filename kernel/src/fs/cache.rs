//! Buffer layer between the filesystem and the disk device.
//!
//! One request is in flight at a time: `disk_lock` serialises the device,
//! `block_sig` is V'd by the completion handler. Buffers are per-request;
//! `bread` materialises a block, `bwrite` persists and releases it,
//! `brelse` releases an unmodified one.

use crate::drivers::disk::{self, DiskEvent, DiskReply, DiskRequestKind, DISK_BLOCK_SIZE};
use crate::errors::FsError;
use crate::machine::tas::TasLock;
use crate::sync::Semaphore;

/// An in-memory copy of one disk block.
pub struct Buf {
    pub num: u64,
    pub data: Vec<u8>,
}

impl Buf {
    /// A zeroed block, for freshly allocated storage that need not be
    /// read first.
    pub fn zeroed(num: u64) -> Self {
        Buf { num, data: vec![0u8; DISK_BLOCK_SIZE] }
    }
}

static DISK_LOCK: Semaphore = Semaphore::new(1);
static BLOCK_SIG: Semaphore = Semaphore::new(0);
static REPLY: TasLock<Option<DiskEvent>> = TasLock::new(None);

/// Install the disk completion handler. Runs once per mount process.
pub(crate) fn init() {
    disk::install_handler(|event| {
        *REPLY.lock() = Some(event);
        BLOCK_SIG.v();
    });
}

fn roundtrip(block: u64, kind: DiskRequestKind) -> Result<DiskEvent, FsError> {
    DISK_LOCK.p();
    disk::send_request(block, kind);
    BLOCK_SIG.p();
    let event = REPLY.lock().take();
    DISK_LOCK.v();
    let event = event.expect("disk completion lost");
    match event.reply {
        DiskReply::Ok => Ok(event),
        other => Err(FsError::Disk(other)),
    }
}

/// Read block `n` into a fresh buffer.
pub fn bread(n: u64) -> Result<Buf, FsError> {
    let event = roundtrip(n, DiskRequestKind::Read)?;
    Ok(Buf { num: n, data: event.data.expect("read completed without data") })
}

/// Write the buffer back and release it; blocks until the write lands.
pub fn bwrite(buf: Buf) -> Result<(), FsError> {
    roundtrip(buf.num, DiskRequestKind::Write(buf.data))?;
    Ok(())
}

/// Release without writing; the caller vouches the buffer is unmodified.
pub fn brelse(buf: Buf) {
    drop(buf);
}

/// Asynchronous write variant; currently synchronous.
pub fn bawrite(buf: Buf) -> Result<(), FsError> {
    bwrite(buf)
}

/// Delayed write variant; currently synchronous.
pub fn bdwrite(buf: Buf) -> Result<(), FsError> {
    bwrite(buf)
}
