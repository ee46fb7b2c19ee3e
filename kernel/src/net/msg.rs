//! Unreliable datagrams over numbered ports (minimsg).
//!
//! Unbounded ports (0..=32767) listen: each holds a queue of received
//! datagrams and a readiness semaphore. Bounded ports (32768..=65535)
//! name a remote listening endpoint; their numbers are handed out
//! incrementally and scanned for a free slot once the range has wrapped.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::MsgError;
use crate::machine::tas::TasLock;
use crate::sync::Semaphore;

use super::addr::NetworkAddress;
use super::link::{self, Packet};
use super::route;
use super::wire::{DatagramHeader, DATAGRAM_HDR_SIZE};

/// Largest datagram payload.
pub const MAX_MSG_SIZE: usize = 4096;

pub const MIN_UNBOUND: u16 = 0;
pub const MAX_UNBOUND: u16 = 32767;
pub const MIN_BOUND: u16 = 32768;

const BOUND_RANGE: usize = (u16::MAX - MIN_BOUND) as usize + 1;

/// Handle to a listening port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnboundPort(pub u16);

/// Handle to a sending port; knows where it points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundPort(pub u16);

enum Port {
    Unbound {
        data: VecDeque<Packet>,
        ready: Arc<Semaphore>,
    },
    Bound {
        remote_addr: NetworkAddress,
        remote_port: u16,
    },
}

struct PortTable {
    slots: Vec<Option<Port>>,
    bound_in_use: usize,
    bound_cursor: u16,
    bound_wrapped: bool,
}

impl PortTable {
    fn ensure(&mut self) {
        if self.slots.is_empty() {
            self.slots.resize_with(u16::MAX as usize + 1, || None);
        }
    }

    /// Next bounded number: incremental until the range is exhausted,
    /// first-free scan afterwards.
    fn next_bound_num(&mut self) -> Option<u16> {
        if self.bound_in_use >= BOUND_RANGE {
            return None;
        }
        if !self.bound_wrapped {
            let num = MIN_BOUND + self.bound_cursor;
            if num == u16::MAX {
                self.bound_wrapped = true;
            } else {
                self.bound_cursor += 1;
            }
            return Some(num);
        }
        (MIN_BOUND..=u16::MAX).find(|n| self.slots[*n as usize].is_none())
    }
}

static PORTS: TasLock<PortTable> = TasLock::new(PortTable {
    slots: Vec::new(),
    bound_in_use: 0,
    bound_cursor: 0,
    bound_wrapped: false,
});

/// Create (or return) the unbounded port numbered `n`.
pub fn create_unbound(n: u16) -> Result<UnboundPort, MsgError> {
    if n > MAX_UNBOUND {
        return Err(MsgError::PortOutOfRange);
    }
    let mut t = PORTS.lock();
    t.ensure();
    if t.slots[n as usize].is_none() {
        t.slots[n as usize] = Some(Port::Unbound {
            data: VecDeque::new(),
            ready: Arc::new(Semaphore::new(0)),
        });
    }
    Ok(UnboundPort(n))
}

/// Create a bounded port targeting `remote_addr`/`remote_port`.
pub fn create_bound(
    remote_addr: NetworkAddress,
    remote_port: u16,
) -> Result<BoundPort, MsgError> {
    let mut t = PORTS.lock();
    t.ensure();
    let num = t.next_bound_num().ok_or(MsgError::NoMorePorts)?;
    t.slots[num as usize] = Some(Port::Bound { remote_addr, remote_port });
    t.bound_in_use += 1;
    Ok(BoundPort(num))
}

/// Destroy an unbounded port, dropping any queued datagrams. Destruction
/// during concurrent use is undefined (receivers will error out).
pub fn destroy_unbound(port: UnboundPort) {
    let mut t = PORTS.lock();
    t.ensure();
    t.slots[port.0 as usize] = None;
}

/// Destroy a bounded port, freeing its number for reuse after wrap.
pub fn destroy_bound(port: BoundPort) {
    let mut t = PORTS.lock();
    t.ensure();
    if t.slots[port.0 as usize].take().is_some() {
        t.bound_in_use -= 1;
    }
}

/// Send `msg` through `local_bound`, stamping `local_unbound` as the
/// reply port. Returns the payload bytes sent.
pub fn send(
    local_unbound: UnboundPort,
    local_bound: BoundPort,
    msg: &[u8],
) -> Result<usize, MsgError> {
    if msg.len() > MAX_MSG_SIZE {
        return Err(MsgError::PayloadTooLarge);
    }
    let (remote_addr, remote_port) = {
        let mut t = PORTS.lock();
        t.ensure();
        match &t.slots[local_bound.0 as usize] {
            Some(Port::Bound { remote_addr, remote_port }) => (*remote_addr, *remote_port),
            _ => return Err(MsgError::NoSuchPort),
        }
    };
    let hdr = DatagramHeader {
        source: link::my_address(),
        source_port: local_unbound.0,
        dest: remote_addr,
        dest_port: remote_port,
    };
    route::send_pkt(remote_addr, &hdr.pack(), msg)?;
    Ok(msg.len())
}

/// Block until a datagram arrives on `port`; copy out the payload and
/// synthesize a bound port addressing the sender for replies.
pub fn receive(port: UnboundPort, buf: &mut [u8]) -> Result<(usize, BoundPort), MsgError> {
    let ready = {
        let mut t = PORTS.lock();
        t.ensure();
        match &t.slots[port.0 as usize] {
            Some(Port::Unbound { ready, .. }) => ready.clone(),
            _ => return Err(MsgError::NoSuchPort),
        }
    };
    ready.p();
    let pkt = {
        let mut t = PORTS.lock();
        match &mut t.slots[port.0 as usize] {
            Some(Port::Unbound { data, .. }) => data.pop_front(),
            _ => None,
        }
    }
    .ok_or(MsgError::NoSuchPort)?;

    let hdr = DatagramHeader::parse(&pkt.buf).ok_or(MsgError::NoSuchPort)?;
    let reply = create_bound(hdr.source, hdr.source_port)?;
    let payload = &pkt.buf[DATAGRAM_HDR_SIZE..];
    let n = buf.len().min(payload.len()).min(MAX_MSG_SIZE);
    buf[..n].copy_from_slice(&payload[..n]);
    Ok((n, reply))
}

/// Receive-path dispatch: queue the packet on its destination port, or
/// drop it when nobody listens.
pub(crate) fn process(pkt: Packet) {
    let Some(hdr) = DatagramHeader::parse(&pkt.buf) else {
        return;
    };
    if hdr.dest_port > MAX_UNBOUND {
        return;
    }
    let mut t = PORTS.lock();
    t.ensure();
    if let Some(Port::Unbound { data, ready }) = &mut t.slots[hdr.dest_port as usize] {
        data.push_back(pkt);
        ready.v();
    } else {
        log::trace!("[msg] dropping datagram for silent port {}", hdr.dest_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The port table is a process-wide singleton; only these tests touch
    // it within the library test binary.

    #[test]
    fn bound_numbers_are_incremental_and_not_reused_before_wrap() {
        let a = create_bound(NetworkAddress::new(1, 1), 10).unwrap();
        let b = create_bound(NetworkAddress::new(1, 1), 11).unwrap();
        let c = create_bound(NetworkAddress::new(1, 1), 12).unwrap();
        assert_eq!(b.0, a.0 + 1);
        assert_eq!(c.0, b.0 + 1);

        // A destroyed number is not handed out again until the range
        // wraps around.
        destroy_bound(b);
        let d = create_bound(NetworkAddress::new(1, 1), 13).unwrap();
        assert_eq!(d.0, c.0 + 1);

        // Exhaust the range; the next allocation wraps to first-free,
        // which is the hole left by `b`.
        let mut held = Vec::new();
        loop {
            if PORTS.lock().bound_wrapped {
                break;
            }
            held.push(create_bound(NetworkAddress::new(1, 1), 0).unwrap());
        }
        let wrapped = create_bound(NetworkAddress::new(1, 1), 0).unwrap();
        assert_eq!(wrapped.0, b.0);

        // And a full table refuses further allocations.
        assert_eq!(
            create_bound(NetworkAddress::new(1, 1), 0),
            Err(MsgError::NoMorePorts)
        );

        destroy_bound(a);
        assert!(create_bound(NetworkAddress::new(1, 1), 0).is_ok());
    }

    #[test]
    fn unbound_creation_is_idempotent_and_range_checked() {
        assert_eq!(create_unbound(40_000), Err(MsgError::PortOutOfRange));
        let p1 = create_unbound(7).unwrap();
        let p2 = create_unbound(7).unwrap();
        assert_eq!(p1, p2);
        destroy_unbound(p1);
    }
}
