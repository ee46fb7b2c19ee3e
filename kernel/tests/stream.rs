//! Reliable stream (minisocket) scenarios over a lossy loopback.

mod common;

use std::sync::Arc;

use minios_kernel::errors::SocketError;
use minios_kernel::net::link;
use minios_kernel::net::stream;
use minios_kernel::sync::Semaphore;
use minios_kernel::{task, Config, NetConfig};

const TRANSFER: usize = 100_000;

fn lossy_config() -> Config {
    Config {
        net: Some(NetConfig {
            udp_port: 9402,
            loss_rate: 0.1,
            duplication_rate: 0.1,
            ..NetConfig::default()
        }),
        ..Config::default()
    }
}

fn pattern(i: usize) -> u8 {
    (i % 256) as u8
}

fn recv_exact(sock: &Arc<stream::sock::Socket>, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = vec![0u8; 8192];
    while out.len() < want {
        let n = stream::receive(sock, &mut buf).expect("receive failed");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn big_transfer_survives_loss_and_duplication() {
    common::run_scenario(lossy_config(), || {
        let done = Arc::new(Semaphore::new(0));
        let inbound_ok = Arc::new(minios_kernel::sync::Mutex::new(None));
        {
            let done = done.clone();
            let inbound_ok = inbound_ok.clone();
            task::fork(move || {
                let server = stream::server_create(100).expect("server_create");
                // Inbound: every byte i must equal i mod 256.
                let data = recv_exact(&server, TRANSFER);
                let mismatch = data.iter().enumerate().find(|(i, b)| **b != pattern(*i));
                *inbound_ok.lock() = Some(mismatch.map(|(i, _)| i));
                // Outbound: the complement pattern.
                let reply: Vec<u8> = (0..TRANSFER).map(|i| !pattern(i)).collect();
                stream::send(&server, &reply).expect("server send");
                done.v();
            })
            .unwrap();
        }

        let client = stream::client_create(link::my_address(), 100).expect("client_create");
        let data: Vec<u8> = (0..TRANSFER).map(pattern).collect();
        let sent = stream::send(&client, &data).expect("client send");
        assert_eq!(sent, TRANSFER);

        let back = recv_exact(&client, TRANSFER);
        for (i, b) in back.iter().enumerate() {
            assert_eq!(*b, !pattern(i), "reply byte {i} corrupted");
        }
        done.p();
        assert_eq!(*inbound_ok.lock(), Some(None), "server saw corrupted bytes");

        // Teardown: after close, both directions fail fast.
        stream::close(&client);
        assert_eq!(stream::send(&client, b"x"), Err(SocketError::SendError));
        let mut buf = [0u8; 8];
        assert_eq!(
            stream::receive(&client, &mut buf),
            Err(SocketError::ReceiveError)
        );
    });
}

#[test]
fn second_client_gets_busy_and_connection_survives() {
    common::run_scenario(lossy_config(), || {
        let done = Arc::new(Semaphore::new(0));
        let got = Arc::new(minios_kernel::sync::Mutex::new(Vec::new()));
        {
            let done = done.clone();
            let got = got.clone();
            task::fork(move || {
                let server = stream::server_create(101).expect("server_create");
                *got.lock() = recv_exact(&server, 5);
                done.v();
            })
            .unwrap();
        }

        let first = stream::client_create(link::my_address(), 101).expect("first connect");

        // The server is attached to `first`; a stranger's SYN is answered
        // with a synthetic FIN and surfaces as BUSY.
        match stream::client_create(link::my_address(), 101) {
            Err(SocketError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }

        // The established connection is unharmed.
        stream::send(&first, b"after").expect("send after busy");
        done.p();
        assert_eq!(got.lock().as_slice(), b"after".as_slice());
    });
}

#[test]
fn connecting_to_silence_reports_no_server() {
    common::run_scenario(lossy_config(), || {
        // Nothing listens on this port; the SYN retries time out.
        match stream::client_create(link::my_address(), 9_999) {
            Err(SocketError::NoServer) => {}
            other => panic!("expected NoServer, got {other:?}"),
        }
    });
}
