//! Wire formats: datagram, reliable-stream, and routing headers.
//!
//! All fields are big-endian. An address packs into 8 bytes (IPv4 word +
//! port word). The transport headers both start with a protocol byte, so
//! the routing layer can dispatch on the first byte of the stripped
//! payload.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::addr::NetworkAddress;

pub const PROTOCOL_DATAGRAM: u8 = 1;
pub const PROTOCOL_STREAM: u8 = 2;

/// protocol + src addr + src port + dst addr + dst port.
pub const DATAGRAM_HDR_SIZE: usize = 1 + 8 + 2 + 8 + 2;
/// Datagram fields + message type + seq + ack.
pub const STREAM_HDR_SIZE: usize = DATAGRAM_HDR_SIZE + 1 + 4 + 4;

/// Longest route a packet may take, self and destination included.
pub const MAX_ROUTE_LEN: usize = 20;
/// type + destination + id + ttl + path length + path slots.
pub const ROUTE_HDR_SIZE: usize = 1 + 8 + 4 + 4 + 4 + MAX_ROUTE_LEN * 8;

fn write_address(out: &mut impl std::io::Write, a: NetworkAddress) {
    out.write_u32::<BigEndian>(a.ip).expect("header buffer sized wrong");
    out.write_u32::<BigEndian>(a.port).expect("header buffer sized wrong");
}

fn read_address(input: &mut &[u8]) -> Option<NetworkAddress> {
    let ip = input.read_u32::<BigEndian>().ok()?;
    let port = input.read_u32::<BigEndian>().ok()?;
    Some(NetworkAddress { ip, port })
}

/// Header of an unreliable datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
    pub source: NetworkAddress,
    pub source_port: u16,
    pub dest: NetworkAddress,
    pub dest_port: u16,
}

impl DatagramHeader {
    pub fn pack(&self) -> [u8; DATAGRAM_HDR_SIZE] {
        let mut buf = [0u8; DATAGRAM_HDR_SIZE];
        let mut w: &mut [u8] = &mut buf;
        w.write_u8(PROTOCOL_DATAGRAM).unwrap();
        write_address(&mut w, self.source);
        w.write_u16::<BigEndian>(self.source_port).unwrap();
        write_address(&mut w, self.dest);
        w.write_u16::<BigEndian>(self.dest_port).unwrap();
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut r = buf;
        if r.read_u8().ok()? != PROTOCOL_DATAGRAM {
            return None;
        }
        let source = read_address(&mut r)?;
        let source_port = r.read_u16::<BigEndian>().ok()?;
        let dest = read_address(&mut r)?;
        let dest_port = r.read_u16::<BigEndian>().ok()?;
        Some(DatagramHeader { source, source_port, dest, dest_port })
    }
}

/// Message types of the reliable stream protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Syn,
    SynAck,
    Ack,
    Fin,
}

impl MsgType {
    fn to_u8(self) -> u8 {
        match self {
            MsgType::Syn => 1,
            MsgType::SynAck => 2,
            MsgType::Ack => 3,
            MsgType::Fin => 4,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MsgType::Syn),
            2 => Some(MsgType::SynAck),
            3 => Some(MsgType::Ack),
            4 => Some(MsgType::Fin),
            _ => None,
        }
    }
}

/// Header of a reliable-stream packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub source: NetworkAddress,
    pub source_port: u16,
    pub dest: NetworkAddress,
    pub dest_port: u16,
    pub msg_type: MsgType,
    pub seq: u32,
    pub ack: u32,
}

impl StreamHeader {
    pub fn pack(&self) -> [u8; STREAM_HDR_SIZE] {
        let mut buf = [0u8; STREAM_HDR_SIZE];
        let mut w: &mut [u8] = &mut buf;
        w.write_u8(PROTOCOL_STREAM).unwrap();
        write_address(&mut w, self.source);
        w.write_u16::<BigEndian>(self.source_port).unwrap();
        write_address(&mut w, self.dest);
        w.write_u16::<BigEndian>(self.dest_port).unwrap();
        w.write_u8(self.msg_type.to_u8()).unwrap();
        w.write_u32::<BigEndian>(self.seq).unwrap();
        w.write_u32::<BigEndian>(self.ack).unwrap();
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut r = buf;
        if r.read_u8().ok()? != PROTOCOL_STREAM {
            return None;
        }
        let source = read_address(&mut r)?;
        let source_port = r.read_u16::<BigEndian>().ok()?;
        let dest = read_address(&mut r)?;
        let dest_port = r.read_u16::<BigEndian>().ok()?;
        let msg_type = MsgType::from_u8(r.read_u8().ok()?)?;
        let seq = r.read_u32::<BigEndian>().ok()?;
        let ack = r.read_u32::<BigEndian>().ok()?;
        Some(StreamHeader { source, source_port, dest, dest_port, msg_type, seq, ack })
    }
}

/// Routing packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    Data,
    Discovery,
    Reply,
}

impl RouteType {
    fn to_u8(self) -> u8 {
        match self {
            RouteType::Data => 0,
            RouteType::Discovery => 1,
            RouteType::Reply => 2,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RouteType::Data),
            1 => Some(RouteType::Discovery),
            2 => Some(RouteType::Reply),
            _ => None,
        }
    }
}

/// Source-routing header: the full path travels with the packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteHeader {
    pub kind: RouteType,
    pub destination: NetworkAddress,
    pub id: u32,
    pub ttl: u32,
    /// Hops, source first. At most [`MAX_ROUTE_LEN`] entries.
    pub path: Vec<NetworkAddress>,
}

impl RouteHeader {
    pub fn pack(&self) -> [u8; ROUTE_HDR_SIZE] {
        debug_assert!(self.path.len() <= MAX_ROUTE_LEN);
        let mut buf = [0u8; ROUTE_HDR_SIZE];
        let mut w: &mut [u8] = &mut buf;
        w.write_u8(self.kind.to_u8()).unwrap();
        write_address(&mut w, self.destination);
        w.write_u32::<BigEndian>(self.id).unwrap();
        w.write_u32::<BigEndian>(self.ttl).unwrap();
        w.write_u32::<BigEndian>(self.path.len() as u32).unwrap();
        for hop in &self.path {
            write_address(&mut w, *hop);
        }
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < ROUTE_HDR_SIZE {
            return None;
        }
        let mut r = buf;
        let kind = RouteType::from_u8(r.read_u8().ok()?)?;
        let destination = read_address(&mut r)?;
        let id = r.read_u32::<BigEndian>().ok()?;
        let ttl = r.read_u32::<BigEndian>().ok()?;
        let len = r.read_u32::<BigEndian>().ok()? as usize;
        if len > MAX_ROUTE_LEN {
            return None;
        }
        let mut path = Vec::with_capacity(len);
        for _ in 0..len {
            path.push(read_address(&mut r)?);
        }
        Some(RouteHeader { kind, destination, id, ttl, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> NetworkAddress {
        NetworkAddress::new(0x0a00_0000 | n, (8000 + n) as u16)
    }

    #[test]
    fn datagram_roundtrip() {
        let h = DatagramHeader {
            source: addr(1),
            source_port: 12,
            dest: addr(2),
            dest_port: 34,
        };
        let packed = h.pack();
        assert_eq!(packed[0], PROTOCOL_DATAGRAM);
        assert_eq!(DatagramHeader::parse(&packed), Some(h));
    }

    #[test]
    fn stream_roundtrip() {
        let h = StreamHeader {
            source: addr(1),
            source_port: 7,
            dest: addr(2),
            dest_port: 9,
            msg_type: MsgType::SynAck,
            seq: 0xdead_beef,
            ack: 42,
        };
        let packed = h.pack();
        assert_eq!(packed.len(), STREAM_HDR_SIZE);
        assert_eq!(StreamHeader::parse(&packed), Some(h));
    }

    #[test]
    fn route_roundtrip() {
        let h = RouteHeader {
            kind: RouteType::Discovery,
            destination: addr(9),
            id: 3,
            ttl: 20,
            path: vec![addr(1), addr(2), addr(3)],
        };
        let packed = h.pack();
        assert_eq!(packed.len(), ROUTE_HDR_SIZE);
        assert_eq!(RouteHeader::parse(&packed), Some(h));
    }

    #[test]
    fn stream_header_rejects_datagram() {
        let h = DatagramHeader {
            source: addr(1),
            source_port: 1,
            dest: addr(2),
            dest_port: 2,
        };
        assert!(StreamHeader::parse(&h.pack()).is_none());
    }

    #[test]
    fn truncated_route_header_rejected() {
        let h = RouteHeader {
            kind: RouteType::Data,
            destination: addr(1),
            id: 0,
            ttl: 20,
            path: vec![addr(1)],
        };
        let packed = h.pack();
        assert!(RouteHeader::parse(&packed[..ROUTE_HDR_SIZE - 1]).is_none());
    }
}
