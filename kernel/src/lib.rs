//! A user-space operating-system kernel in a single host process.
//!
//! Cooperative-plus-preemptive minithreads over a multilevel-feedback
//! scheduler, counting semaphores built on test-and-set, tick-driven
//! alarms, an unreliable datagram layer with ports, a reliable stream
//! transport with handshake and retransmission, source-routed discovery
//! networking, a simulated asynchronous disk, and an inode-based
//! filesystem with hierarchical directories.
//!
//! Bring-up: call [`init`] once from the host `main`, then enter kernel
//! code by forking minithreads ([`task::fork`]) or via [`run`]. Filesystem
//! mounting ([`fs::mount`]) happens from a minithread, since it blocks on
//! kernel semaphores.

pub mod alarm;
pub mod config;
pub mod drivers;
pub mod errors;
pub mod fs;
pub mod machine;
pub mod multilevel;
pub mod net;
pub mod queue;
pub mod sync;
pub mod task;

use std::sync::Once;

pub use config::{Config, DiskConfig, NetConfig};

static INIT: Once = Once::new();

/// Turn this process into a multithreaded kernel: scheduler, idle and
/// cleanup threads, clock, and the configured devices. Idempotent; the
/// first caller's configuration wins.
pub fn init(config: Config) {
    INIT.call_once(|| {
        config::install(&config);
        machine::init();
        task::init(config.stack_size);
        machine::clock::start(config.tick_ms);
        if let Some(net) = &config.net {
            net::init(net);
        }
        if let Some(disk) = &config.disk {
            drivers::disk::init(disk).expect("disk bring-up failed");
        }
        if config.term {
            drivers::term::init();
        }
        log::debug!("[kernel] up: tick={}ms", config.tick_ms);
    });
}

/// Run `f` as a minithread and block the calling host thread until it
/// completes, returning its result. The usual entry point for binaries
/// and tests.
pub fn run<R, F>(f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    task::fork(move || {
        let _ = tx.send(f());
    })
    .expect("failed to fork root thread");
    rx.recv().expect("root thread died without a result")
}
