//! Route discovery scenarios, observed by a scripted neighbour node.
//!
//! The neighbour is a plain UDP socket on the loopback: it answers every
//! DISCOVERY probe the way a destination node would (append itself,
//! reverse the path, REPLY to the first hop of the reverse path) and
//! counts what it sees.

mod common;

use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use minios_kernel::net::addr::{translate_hostname, NetworkAddress};
use minios_kernel::net::route;
use minios_kernel::net::wire::{RouteHeader, RouteType, MAX_ROUTE_LEN, ROUTE_HDR_SIZE};
use minios_kernel::sync::Semaphore;
use minios_kernel::{task, Config, NetConfig};

const KERNEL_PORT: u16 = 9403;
const NEIGHBOUR_PORT: u16 = 9413;

struct Neighbour {
    addr: NetworkAddress,
    discoveries: Arc<AtomicUsize>,
    data: Arc<AtomicUsize>,
}

/// Start the scripted neighbour; it replies to discoveries forever.
fn start_neighbour() -> Neighbour {
    let socket = UdpSocket::bind(("127.0.0.1", NEIGHBOUR_PORT)).expect("neighbour bind");
    let addr = translate_hostname("127.0.0.1", NEIGHBOUR_PORT).unwrap();
    let discoveries = Arc::new(AtomicUsize::new(0));
    let data = Arc::new(AtomicUsize::new(0));
    let d2 = discoveries.clone();
    let p2 = data.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let Ok((n, _)) = socket.recv_from(&mut buf) else {
                return;
            };
            let Some(mut hdr) = RouteHeader::parse(&buf[..n]) else {
                continue;
            };
            match hdr.kind {
                RouteType::Discovery if hdr.destination == addr => {
                    d2.fetch_add(1, Ordering::SeqCst);
                    hdr.path.push(addr);
                    let mut reverse = hdr.path.clone();
                    reverse.reverse();
                    let next = reverse[1];
                    let reply = RouteHeader {
                        kind: RouteType::Reply,
                        destination: reverse[reverse.len() - 1],
                        id: hdr.id,
                        ttl: MAX_ROUTE_LEN as u32,
                        path: reverse,
                    };
                    let _ = socket.send_to(&reply.pack(), next.to_socket_addr());
                }
                RouteType::Data if hdr.destination == addr => {
                    p2.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    });
    Neighbour { addr, discoveries, data }
}

fn net_config() -> Config {
    Config {
        net: Some(NetConfig {
            udp_port: KERNEL_PORT,
            peers: vec![format!("127.0.0.1:{NEIGHBOUR_PORT}")],
            ..NetConfig::default()
        }),
        ..Config::default()
    }
}

#[test]
fn concurrent_sends_collapse_to_one_discovery_until_expiry() {
    let neighbour = start_neighbour();
    let dest = neighbour.addr;
    common::run_scenario(net_config(), move || {
        // Ten concurrent senders to a cold destination.
        let done = Arc::new(Semaphore::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = done.clone();
            let failed = failed.clone();
            task::fork(move || {
                if route::send_pkt(dest, &[1u8], b"probe").is_err() {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
                done.v();
            })
            .unwrap();
        }
        for _ in 0..10 {
            done.p();
        }
        assert_eq!(failed.load(Ordering::SeqCst), 0, "sends failed");
        task::sleep_ms(200); // let the last data packets land
        assert_eq!(
            neighbour.discoveries.load(Ordering::SeqCst),
            1,
            "concurrent sends must share one broadcast"
        );
        assert_eq!(neighbour.data.load(Ordering::SeqCst), 10);

        // Within the 3-second cache lifetime, still no new discovery.
        route::send_pkt(dest, &[1u8], b"warm").expect("warm send");
        task::sleep_ms(200);
        assert_eq!(neighbour.discoveries.load(Ordering::SeqCst), 1);

        // After expiry the next send runs discovery afresh.
        task::sleep_ms(3_500);
        route::send_pkt(dest, &[1u8], b"cold again").expect("cold send");
        task::sleep_ms(200);
        assert_eq!(
            neighbour.discoveries.load(Ordering::SeqCst),
            2,
            "expired route must be rediscovered"
        );
        assert_eq!(neighbour.data.load(Ordering::SeqCst), 12);
    });
}

#[test]
fn reply_headers_are_wire_compatible() {
    // The neighbour script builds replies with the same codec the kernel
    // parses; pin the size so the two cannot drift apart.
    let h = RouteHeader {
        kind: RouteType::Reply,
        destination: translate_hostname("127.0.0.1", 1).unwrap(),
        id: 9,
        ttl: MAX_ROUTE_LEN as u32,
        path: vec![translate_hostname("127.0.0.1", 1).unwrap()],
    };
    assert_eq!(h.pack().len(), ROUTE_HDR_SIZE);
}
