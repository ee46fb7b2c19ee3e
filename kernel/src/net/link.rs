//! Host UDP bridge: the "network card".
//!
//! One socket carries all kernel traffic. A pump thread receives packets
//! and hands each to the routing layer's interrupt handler. Sends can be
//! subjected to synthetic loss and duplication, which is how the reliable
//! protocols are exercised without a lossy network.

use std::net::UdpSocket;
use std::sync::OnceLock;

use rand::Rng;

use super::addr::{translate_hostname, NetworkAddress};
use crate::config::NetConfig;

/// Largest packet the bridge will carry.
pub const MAX_PKT_SIZE: usize = 8192;

/// A received packet, straight off the wire.
pub struct Packet {
    pub sender: NetworkAddress,
    pub buf: Vec<u8>,
}

struct Link {
    socket: UdpSocket,
    local: NetworkAddress,
    peers: Vec<NetworkAddress>,
    loss_rate: f64,
    duplication_rate: f64,
}

static LINK: OnceLock<Link> = OnceLock::new();

/// Bind the socket and start the receive pump. `handler` runs on the pump
/// thread for every arriving packet.
pub(crate) fn init(cfg: &NetConfig, handler: fn(Packet)) {
    let socket = UdpSocket::bind(("0.0.0.0", cfg.udp_port))
        .unwrap_or_else(|e| panic!("net: cannot bind UDP port {}: {e}", cfg.udp_port));
    let local = translate_hostname(&cfg.host, cfg.udp_port)
        .unwrap_or_else(|| panic!("net: cannot resolve local host {}", cfg.host));
    let peers = cfg
        .peers
        .iter()
        .filter_map(|p| {
            let (host, port) = p.rsplit_once(':')?;
            translate_hostname(host, port.parse().ok()?)
        })
        .collect();

    let rx = socket.try_clone().expect("net: socket clone failed");
    LINK.set(Link {
        socket,
        local,
        peers,
        loss_rate: cfg.loss_rate,
        duplication_rate: cfg.duplication_rate,
    })
    .ok()
    .expect("net: link already initialized");

    std::thread::Builder::new()
        .name("net-rx".into())
        .spawn(move || {
            let mut buf = [0u8; MAX_PKT_SIZE];
            loop {
                match rx.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        let sender = match from {
                            std::net::SocketAddr::V4(v4) => NetworkAddress::from_socket_addr(v4),
                            _ => continue,
                        };
                        handler(Packet { sender, buf: buf[..n].to_vec() });
                    }
                    Err(e) => {
                        log::warn!("[net] recv error: {e}");
                    }
                }
            }
        })
        .expect("net: failed to start receive pump");
}

fn link() -> &'static Link {
    LINK.get().expect("net: not initialized")
}

pub fn is_up() -> bool {
    LINK.get().is_some()
}

/// This node's network address.
pub fn my_address() -> NetworkAddress {
    link().local
}

/// Send `[hdr|data]` to `dest`. Synthetic loss drops the packet after
/// reporting success, exactly like a wire would.
pub fn send_pkt(dest: NetworkAddress, hdr: &[u8], data: &[u8]) -> usize {
    let l = link();
    let len = hdr.len() + data.len();
    if len > MAX_PKT_SIZE {
        return 0;
    }
    if l.loss_rate > 0.0 || l.duplication_rate > 0.0 {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < l.loss_rate {
            return len;
        }
        if rng.gen::<f64>() < l.duplication_rate {
            transmit(l, dest, hdr, data);
        }
    }
    transmit(l, dest, hdr, data);
    len
}

/// Broadcast to every configured neighbour and to self (loopback is part
/// of the broadcast domain).
pub fn bcast_pkt(hdr: &[u8], data: &[u8]) {
    let l = link();
    for peer in &l.peers {
        transmit(l, *peer, hdr, data);
    }
    transmit(l, l.local, hdr, data);
}

fn transmit(l: &Link, dest: NetworkAddress, hdr: &[u8], data: &[u8]) {
    let mut pkt = Vec::with_capacity(hdr.len() + data.len());
    pkt.extend_from_slice(hdr);
    pkt.extend_from_slice(data);
    if let Err(e) = l.socket.send_to(&pkt, dest.to_socket_addr()) {
        log::warn!("[net] send to {dest} failed: {e}");
    }
}
