//! Socket state: connection record, retry-alarm status, receive buffers.

use std::collections::VecDeque;
use std::fmt;

use crate::alarm::AlarmId;
use crate::machine::tas::TasLock;
use crate::sync::{Mutex, Semaphore};

use super::super::addr::NetworkAddress;
use super::super::wire::STREAM_HDR_SIZE;

/// Stream ports span 0..=32767; client sockets are allocated from the top
/// of the range downward.
pub const MAX_PORT: u16 = 32767;
pub const PORT_COUNT: usize = MAX_PORT as usize + 1;

/// Retransmission: 7 tries with exponential backoff from 100 ms.
pub(crate) const MAX_TRY: u32 = 7;
pub(crate) const INITIAL_TIMEOUT_MS: u64 = 100;
/// TIMEWAIT linger before a closed socket is reclaimed.
pub(crate) const FIN_TIMEOUT_MS: u64 = 15_000;

/// Largest payload of one stream segment.
pub const MAX_SEGMENT: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SocketState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    LastAck,
    TimeWait,
}

/// Why the retry semaphore was V'd.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RetryAlarm {
    /// An alarm is pending.
    Armed(AlarmId),
    /// The awaited acknowledgement arrived.
    Success,
    /// The timer fired; retransmit.
    Wakeup,
    /// The socket is closing; abort the transmission.
    Canceled,
}

/// Connection record, guarded by the state mutex.
pub(crate) struct Conn {
    pub state: SocketState,
    pub remote_addr: NetworkAddress,
    pub remote_port: u16,
    /// Sequence number of our most recent transmission.
    pub seq: u32,
    /// Last in-order sequence number consumed from the peer.
    pub ack: u32,
}

/// An in-order received segment; `off` tracks how much of the payload a
/// partial receive has already consumed.
pub(crate) struct RecvBuf {
    pub buf: Vec<u8>,
    pub off: usize,
}

impl RecvBuf {
    pub fn new(buf: Vec<u8>) -> Self {
        RecvBuf { buf, off: STREAM_HDR_SIZE }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }
}

pub struct Socket {
    pub(crate) local_port: u16,
    pub(crate) conn: Mutex<Conn>,
    /// In-order data awaiting receivers.
    pub(crate) data: Mutex<VecDeque<RecvBuf>>,
    /// One message in flight at a time.
    pub(crate) send_mutex: Semaphore,
    /// Wakes the listening server when a SYN arrives.
    pub(crate) synchronize: Semaphore,
    /// Retransmission rendezvous, V'd by the alarm or a cancellation.
    pub(crate) retry: Semaphore,
    /// Receive rendezvous, V'd when the data queue becomes non-empty.
    pub(crate) receive: Semaphore,
    /// Live receive waiters, so close can release them all.
    pub(crate) receivers: Mutex<u32>,
    pub(crate) alarm: TasLock<RetryAlarm>,
}

impl Socket {
    pub(crate) fn new(local_port: u16) -> Self {
        Socket {
            local_port,
            conn: Mutex::new(Conn {
                state: SocketState::Closed,
                remote_addr: NetworkAddress::default(),
                remote_port: 0,
                seq: 0,
                ack: 0,
            }),
            data: Mutex::new(VecDeque::new()),
            send_mutex: Semaphore::new(1),
            synchronize: Semaphore::new(0),
            retry: Semaphore::new(0),
            receive: Semaphore::new(0),
            receivers: Mutex::new(0),
            alarm: TasLock::new(RetryAlarm::Success),
        }
    }

    /// Port this socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub(crate) fn state(&self) -> SocketState {
        self.conn.lock().state
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("local_port", &self.local_port)
            .field("state", &self.state())
            .finish()
    }
}
