//! Network stack: addresses and wire formats, the host UDP bridge,
//! source routing with discovery, datagram ports, and reliable streams.

pub mod addr;
pub mod link;
pub mod msg;
pub mod route;
pub mod stream;
pub mod wire;

use crate::config::NetConfig;

/// Bring up the whole stack: link first (packets flow into the routing
/// buffer), then the routing control thread, then the stream threads.
pub(crate) fn init(cfg: &NetConfig) {
    link::init(cfg, route::buffer_interrupt);
    route::init();
    stream::init();
    log::debug!("[net] up at {}", link::my_address());
}
