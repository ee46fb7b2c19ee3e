//! Stream control and cleanup threads.
//!
//! The control thread drains the packet buffer and drives every state
//! transition, so application threads never race the state machine. The
//! cleanup thread destroys closed sockets once no receive is in progress.

use std::sync::Arc;

use crate::alarm;
use crate::task;

use super::super::link::{self, Packet};
use super::super::route;
use super::super::wire::{MsgType, StreamHeader, STREAM_HDR_SIZE};
use super::sock::{Conn, RecvBuf, RetryAlarm, Socket, SocketState, FIN_TIMEOUT_MS};
use super::{
    enqueue_closing, pack_header, retry_cancel, unblock_receivers, CLEANUP_SEM, CLOSING,
    CONTROL_SEM, PACKET_BUFFER, SOCKETS,
};

pub(crate) fn control_loop() {
    loop {
        CONTROL_SEM.p();
        let Some(pkt) = PACKET_BUFFER.lock().pop_front() else {
            continue;
        };
        process_packet(pkt);
    }
}

fn process_packet(pkt: Packet) {
    let Some(hdr) = StreamHeader::parse(&pkt.buf) else {
        return;
    };
    let Some(socket) = SOCKETS.lock().get(hdr.dest_port) else {
        log::trace!("[stream] dropping packet for silent port {}", hdr.dest_port);
        return;
    };
    match hdr.msg_type {
        MsgType::Syn => process_syn(&socket, &hdr),
        MsgType::SynAck => {
            // A SYNACK is a SYN acknowledging ours: both halves apply.
            process_syn(&socket, &hdr);
            process_ack(&socket, &hdr, pkt);
        }
        MsgType::Ack => process_ack(&socket, &hdr, pkt),
        MsgType::Fin => process_fin(&socket, &hdr),
    }
}

fn source_matches(conn: &Conn, hdr: &StreamHeader) -> bool {
    conn.remote_addr == hdr.source && conn.remote_port == hdr.source_port
}

/// Send an empty acknowledgement for the current connection state.
fn acknowledge(socket: &Socket, conn: &Conn) {
    let header = pack_header(socket, conn, MsgType::Ack);
    let _ = route::send_pkt(conn.remote_addr, &header.pack(), &[]);
}

/// Reply to a stranger's SYN with a synthetic FIN: the server is busy.
fn signal_busy(hdr: &StreamHeader) {
    let reply = StreamHeader {
        source: link::my_address(),
        source_port: hdr.dest_port,
        dest: hdr.source,
        dest_port: hdr.source_port,
        msg_type: MsgType::Fin,
        seq: 1,
        ack: 1,
    };
    let _ = route::send_pkt(hdr.source, &reply.pack(), &[]);
}

fn process_syn(socket: &Arc<Socket>, hdr: &StreamHeader) {
    let mut c = socket.conn.lock();
    log::trace!("[stream] SYN for port {} in {:?}", socket.local_port, c.state);
    match c.state {
        SocketState::Listen => {
            c.state = SocketState::SynReceived;
            c.remote_addr = hdr.source;
            c.remote_port = hdr.source_port;
            c.ack = hdr.seq;
            socket.synchronize.v();
        }
        SocketState::SynSent => {
            if source_matches(&c, hdr) {
                c.ack = hdr.seq;
                acknowledge(socket, &c);
            }
        }
        _ => {
            if source_matches(&c, hdr) {
                // Duplicate SYN from our peer: re-acknowledge.
                acknowledge(socket, &c);
            } else {
                signal_busy(hdr);
            }
        }
    }
}

fn process_ack(socket: &Arc<Socket>, hdr: &StreamHeader, pkt: Packet) {
    let mut c = socket.conn.lock();
    if !source_matches(&c, hdr) {
        return;
    }

    // The packet acknowledges our most recent transmission.
    if c.seq == hdr.ack {
        retry_cancel(socket, RetryAlarm::Success);
        match c.state {
            SocketState::SynSent => {
                if c.ack == hdr.seq {
                    c.state = SocketState::Established;
                }
            }
            SocketState::SynReceived => c.state = SocketState::Established,
            SocketState::LastAck => c.state = SocketState::Closed,
            _ => {}
        }
    }

    let payload = pkt.buf.len().saturating_sub(STREAM_HDR_SIZE);
    if payload == 0 {
        return;
    }
    if c.ack == hdr.seq {
        // Already-consumed data: the peer missed our ACK, repeat it.
        acknowledge(socket, &c);
    } else if c.state == SocketState::Established && c.ack.wrapping_add(1) == hdr.seq {
        // The next in-order segment: buffer it and acknowledge.
        let became_nonempty = {
            let mut data = socket.data.lock();
            data.push_back(RecvBuf::new(pkt.buf));
            data.len() == 1
        };
        c.ack = c.ack.wrapping_add(1);
        acknowledge(socket, &c);
        if became_nonempty {
            socket.receive.v();
        }
    }
    // Anything further out of order is dropped; the peer retransmits.
}

fn process_fin(socket: &Arc<Socket>, hdr: &StreamHeader) {
    let mut c = socket.conn.lock();
    if !source_matches(&c, hdr) && c.state != SocketState::SynSent {
        return;
    }
    log::trace!("[stream] FIN for port {} in {:?}", socket.local_port, c.state);
    match c.state {
        SocketState::SynSent => {
            // The server is busy; stop retrying the SYN and surface it.
            if source_matches(&c, hdr) {
                c.state = SocketState::TimeWait;
                retry_cancel(socket, RetryAlarm::Canceled);
            }
        }
        SocketState::Established => {
            if c.ack.wrapping_add(1) == hdr.seq {
                c.state = SocketState::TimeWait;
                c.ack = c.ack.wrapping_add(1);
                acknowledge(socket, &c);
                drop(c);
                unblock_receivers(socket);
                alarm::register(FIN_TIMEOUT_MS, || CLEANUP_SEM.v());
                enqueue_closing(socket.clone());
            }
        }
        SocketState::LastAck => {
            // Simultaneous close: acknowledge the peer's FIN too.
            if c.ack.wrapping_add(1) == hdr.seq {
                c.ack = c.ack.wrapping_add(1);
                acknowledge(socket, &c);
            }
        }
        SocketState::TimeWait => {
            if c.ack == hdr.seq {
                acknowledge(socket, &c);
            }
        }
        _ => {}
    }
}

/// Destroy sockets queued for teardown, once their receivers are gone.
pub(crate) fn cleanup_loop() {
    loop {
        CLEANUP_SEM.p();
        let Some(socket) = CLOSING.lock().pop_front() else {
            continue;
        };
        let waiting = *socket.receivers.lock();
        if waiting > 0 {
            // Receivers still draining out; release them and retry.
            unblock_receivers(&socket);
            task::yield_now();
            enqueue_closing(socket);
            CLEANUP_SEM.v();
            continue;
        }
        socket.conn.lock().state = SocketState::Closed;
        SOCKETS.lock().remove(socket.local_port);
        log::debug!("[stream] port {} destroyed", socket.local_port);
    }
}
