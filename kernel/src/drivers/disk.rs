//! Simulated asynchronous block device.
//!
//! Requests queue up for a device thread that performs them against a
//! backing image file and delivers each completion through the installed
//! handler, which runs on the device thread like an interrupt handler
//! would (it must not block). Failure and crash injection make the upper
//! layers earn their error handling.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::OnceLock;

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::config::DiskConfig;
use crate::machine::tas::TasLock;

/// Size of one disk block in bytes.
pub const DISK_BLOCK_SIZE: usize = 4096;

/// Completion status of a disk request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskReply {
    /// Request completed.
    Ok,
    /// The disk failed this request for no apparent reason.
    Failed,
    /// The request itself was invalid (block out of range).
    Error,
    /// Device-wide failure; a RESET is required.
    Crashed,
}

/// A request posted to the device.
pub enum DiskRequestKind {
    Read,
    Write(Vec<u8>),
    Reset,
    Shutdown,
}

pub struct DiskRequest {
    pub block: u64,
    pub kind: DiskRequestKind,
}

/// A completion, handed to the installed handler.
pub struct DiskEvent {
    pub block: u64,
    pub reply: DiskReply,
    /// Block contents for a successful read.
    pub data: Option<Vec<u8>>,
}

type DiskHandler = Box<dyn Fn(DiskEvent) + Send + Sync>;

static HANDLER: TasLock<Option<DiskHandler>> = TasLock::new(None);

struct RequestQueue {
    queue: Mutex<Vec<DiskRequest>>,
    posted: Condvar,
}

static REQUESTS: OnceLock<RequestQueue> = OnceLock::new();
static LAYOUT: OnceLock<u64> = OnceLock::new();

/// Install the completion handler. Must precede the first request.
pub fn install_handler(handler: impl Fn(DiskEvent) + Send + Sync + 'static) {
    *HANDLER.lock() = Some(Box::new(handler));
}

/// Number of blocks on the device.
pub fn disk_size() -> u64 {
    *LAYOUT.get().expect("disk: not initialized")
}

/// Post a request; the completion arrives through the handler.
pub fn send_request(block: u64, kind: DiskRequestKind) {
    let rq = REQUESTS.get().expect("disk: not initialized");
    rq.queue.lock().push(DiskRequest { block, kind });
    rq.posted.notify_one();
}

/// Open or create the backing image and start the device thread.
pub(crate) fn init(cfg: &DiskConfig) -> std::io::Result<()> {
    let (file, blocks) = match cfg.create_blocks {
        Some(n) => {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&cfg.path)?;
            f.set_len(n * DISK_BLOCK_SIZE as u64)?;
            (f, n)
        }
        None => {
            let f = OpenOptions::new().read(true).write(true).open(&cfg.path)?;
            let len = f.metadata()?.len();
            (f, len / DISK_BLOCK_SIZE as u64)
        }
    };
    LAYOUT.set(blocks).expect("disk: already initialized");
    REQUESTS
        .set(RequestQueue { queue: Mutex::new(Vec::new()), posted: Condvar::new() })
        .ok()
        .expect("disk: already initialized");

    let failure_rate = cfg.failure_rate;
    let crash_rate = cfg.crash_rate;
    std::thread::Builder::new()
        .name("disk".into())
        .spawn(move || device_loop(file, blocks, failure_rate, crash_rate))
        .expect("disk: failed to start device thread");
    log::debug!("[disk] up: {blocks} blocks");
    Ok(())
}

fn deliver(event: DiskEvent) {
    let g = HANDLER.lock();
    match g.as_ref() {
        Some(h) => h(event),
        None => log::warn!("[disk] completion dropped: no handler installed"),
    }
}

fn device_loop(file: File, blocks: u64, failure_rate: f64, crash_rate: f64) {
    let rq = REQUESTS.get().expect("disk: not initialized");
    let mut crashed = false;
    loop {
        let req = {
            let mut q = rq.queue.lock();
            while q.is_empty() {
                rq.posted.wait(&mut q);
            }
            q.remove(0)
        };

        if let DiskRequestKind::Shutdown = req.kind {
            deliver(DiskEvent { block: req.block, reply: DiskReply::Ok, data: None });
            return;
        }
        if let DiskRequestKind::Reset = req.kind {
            crashed = false;
            deliver(DiskEvent { block: req.block, reply: DiskReply::Ok, data: None });
            continue;
        }
        if crashed {
            deliver(DiskEvent { block: req.block, reply: DiskReply::Crashed, data: None });
            continue;
        }
        if crash_rate > 0.0 && rand::thread_rng().gen::<f64>() < crash_rate {
            log::warn!("[disk] crashed on block {}", req.block);
            crashed = true;
            deliver(DiskEvent { block: req.block, reply: DiskReply::Crashed, data: None });
            continue;
        }
        if req.block >= blocks {
            deliver(DiskEvent { block: req.block, reply: DiskReply::Error, data: None });
            continue;
        }
        if failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < failure_rate {
            deliver(DiskEvent { block: req.block, reply: DiskReply::Failed, data: None });
            continue;
        }

        let offset = req.block * DISK_BLOCK_SIZE as u64;
        let event = match req.kind {
            DiskRequestKind::Read => {
                let mut data = vec![0u8; DISK_BLOCK_SIZE];
                match file.read_exact_at(&mut data, offset) {
                    Ok(()) => DiskEvent { block: req.block, reply: DiskReply::Ok, data: Some(data) },
                    Err(e) => {
                        log::warn!("[disk] read {} failed: {e}", req.block);
                        DiskEvent { block: req.block, reply: DiskReply::Failed, data: None }
                    }
                }
            }
            DiskRequestKind::Write(data) => {
                debug_assert_eq!(data.len(), DISK_BLOCK_SIZE);
                match file.write_all_at(&data, offset) {
                    Ok(()) => DiskEvent { block: req.block, reply: DiskReply::Ok, data: None },
                    Err(e) => {
                        log::warn!("[disk] write {} failed: {e}", req.block);
                        DiskEvent { block: req.block, reply: DiskReply::Failed, data: None }
                    }
                }
            }
            DiskRequestKind::Reset | DiskRequestKind::Shutdown => unreachable!(),
        };
        deliver(event);
    }
}
