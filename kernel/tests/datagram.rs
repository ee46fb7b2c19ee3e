//! Datagram (minimsg) loopback scenarios.

mod common;

use std::sync::Arc;

use minios_kernel::net::link;
use minios_kernel::net::msg;
use minios_kernel::sync::Semaphore;
use minios_kernel::{task, Config, NetConfig};

fn net_config() -> Config {
    Config {
        net: Some(NetConfig { udp_port: 9401, ..NetConfig::default() }),
        ..Config::default()
    }
}

#[test]
fn loopback_roundtrip_and_reply_port() {
    common::run_scenario(net_config(), || {
        let payload = b"Hello, world!\n\0";
        let listen = msg::create_unbound(0).unwrap();
        let to_self = msg::create_bound(link::my_address(), 0).unwrap();
        assert!(to_self.0 >= msg::MIN_BOUND);

        let sent = msg::send(listen, to_self, payload).unwrap();
        assert_eq!(sent, payload.len());

        let mut buf = [0u8; 64];
        let (n, reply) = msg::receive(listen, &mut buf).unwrap();
        assert_eq!(&buf[..n], payload);

        // The synthesized port addresses the sender: sending through it
        // loops straight back to us.
        msg::send(listen, reply, b"pong").unwrap();
        let (n, _) = msg::receive(listen, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");

        msg::destroy_bound(to_self);
        msg::destroy_bound(reply);
        msg::destroy_unbound(listen);
    });
}

#[test]
fn hundred_datagrams_arrive_distinct() {
    let received = common::run_scenario(net_config(), || {
        let rx = msg::create_unbound(2).unwrap();
        let tx_port = msg::create_unbound(1).unwrap();
        let done = Arc::new(Semaphore::new(0));

        {
            let done = done.clone();
            task::fork(move || {
                let to_rx = msg::create_bound(link::my_address(), 2).unwrap();
                for k in 1..=100u32 {
                    let text = format!("Count is {k}.\n");
                    msg::send(tx_port, to_rx, text.as_bytes()).unwrap();
                }
                done.v();
            })
            .unwrap();
        }

        let mut out = Vec::new();
        let mut buf = [0u8; 128];
        for _ in 0..100 {
            let (n, reply) = msg::receive(rx, &mut buf).unwrap();
            out.push(String::from_utf8_lossy(&buf[..n]).into_owned());
            msg::destroy_bound(reply);
        }
        done.p();
        out
    });
    assert_eq!(received.len(), 100);
    for (i, text) in received.iter().enumerate() {
        assert_eq!(text, &format!("Count is {}.\n", i + 1));
    }
}

#[test]
fn oversized_payload_is_rejected() {
    common::run_scenario(net_config(), || {
        let listen = msg::create_unbound(3).unwrap();
        let bound = msg::create_bound(link::my_address(), 3).unwrap();
        let big = vec![0u8; msg::MAX_MSG_SIZE + 1];
        assert!(msg::send(listen, bound, &big).is_err());
        msg::destroy_bound(bound);
        msg::destroy_unbound(listen);
    });
}

#[test]
fn unbound_port_numbers_out_of_range_rejected() {
    common::run_scenario(net_config(), || {
        assert!(msg::create_unbound(32768).is_err());
        assert!(msg::create_unbound(32767).is_ok());
    });
}
