//! Host-process configuration.
//!
//! UDP ports, synthetic loss rates, the disk image, and failure rates are
//! collected here and fixed at `kernel::init` time.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::path::PathBuf;

/// Default minithread stack size.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default clock period in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 10;

/// Default UDP port for the network bridge.
pub const DEFAULT_UDP_PORT: u16 = 8086;

#[derive(Clone, Debug)]
pub struct Config {
    pub tick_ms: u64,
    pub stack_size: usize,
    /// Bring up the network stack when set.
    pub net: Option<NetConfig>,
    /// Bring up the disk device when set (the filesystem is mounted
    /// separately, from a minithread).
    pub disk: Option<DiskConfig>,
    /// Bring up the keyboard line reader.
    pub term: bool,
}

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Local UDP port; also the low word of this node's network address.
    pub udp_port: u16,
    /// Hostname used for the local address; loopback is right for
    /// single-machine runs.
    pub host: String,
    /// Broadcast neighbours, as `host:port` strings.
    pub peers: Vec<String>,
    /// Synthetic loss/duplication applied on send.
    pub loss_rate: f64,
    pub duplication_rate: f64,
}

#[derive(Clone, Debug)]
pub struct DiskConfig {
    /// Backing image file.
    pub path: PathBuf,
    /// Create a fresh image with this many blocks; `None` opens an
    /// existing image and takes its size from the file length.
    pub create_blocks: Option<u64>,
    /// Probability that a request fails with `DiskReply::Failed`.
    pub failure_rate: f64,
    /// Probability that a request crashes the device until a reset.
    pub crash_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tick_ms: DEFAULT_TICK_MS,
            stack_size: DEFAULT_STACK_SIZE,
            net: None,
            disk: None,
            term: false,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            udp_port: DEFAULT_UDP_PORT,
            host: "127.0.0.1".into(),
            peers: Vec::new(),
            loss_rate: 0.0,
            duplication_rate: 0.0,
        }
    }
}

static STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);

pub(crate) fn install(config: &Config) {
    STACK_SIZE.store(config.stack_size, Ordering::Relaxed);
}

pub(crate) fn stack_size() -> usize {
    STACK_SIZE.load(Ordering::Relaxed)
}
