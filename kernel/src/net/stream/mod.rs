//! Reliable streams (minisocket): handshake, retransmission, teardown.
//!
//! Stop-and-wait with exponential backoff: every SYN, SYNACK, FIN, or
//! data segment is retransmitted until the matching acknowledgement
//! cancels the retry alarm or the tries are exhausted. A control thread
//! (see [`control`]) owns all state transitions; application threads only
//! transmit and wait.

pub(crate) mod control;
pub mod sock;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::alarm;
use crate::errors::SocketError;
use crate::machine::tas::TasLock;
use crate::sync::{Mutex, Semaphore};
use crate::task;

use super::addr::NetworkAddress;
use super::link::{self, Packet};
use super::route;
use super::wire::{MsgType, StreamHeader};
use sock::{Conn, RetryAlarm, Socket, SocketState, INITIAL_TIMEOUT_MS, MAX_SEGMENT, MAX_TRY, PORT_COUNT};

pub(crate) struct SocketTable {
    slots: Vec<Option<Arc<Socket>>>,
    count: usize,
}

impl SocketTable {
    fn ensure(&mut self) {
        if self.slots.is_empty() {
            self.slots.resize_with(PORT_COUNT, || None);
        }
    }

    pub(crate) fn get(&mut self, port: u16) -> Option<Arc<Socket>> {
        self.ensure();
        self.slots.get(port as usize)?.clone()
    }

    pub(crate) fn remove(&mut self, port: u16) {
        self.ensure();
        if self.slots[port as usize].take().is_some() {
            self.count -= 1;
        }
    }
}

pub(crate) static SOCKETS: Mutex<SocketTable> =
    Mutex::new(SocketTable { slots: Vec::new(), count: 0 });

/// Packets awaiting the control thread.
pub(crate) static PACKET_BUFFER: TasLock<VecDeque<Packet>> = TasLock::new(VecDeque::new());
pub(crate) static CONTROL_SEM: Semaphore = Semaphore::new(0);

/// Sockets awaiting destruction, and the semaphore pacing the cleanup
/// thread through them.
pub(crate) static CLOSING: Mutex<VecDeque<Arc<Socket>>> = Mutex::new(VecDeque::new());
pub(crate) static CLEANUP_SEM: Semaphore = Semaphore::new(0);

/// Start the control and cleanup threads.
pub(crate) fn init() {
    task::fork(control::control_loop).expect("failed to start minisocket control thread");
    task::fork(control::cleanup_loop).expect("failed to start minisocket cleanup thread");
}

/// Receive-path entry: buffer the packet for the control thread.
pub(crate) fn process(pkt: Packet) {
    PACKET_BUFFER.lock().push_back(pkt);
    CONTROL_SEM.v();
}

/// Listen on `port` and block until a client completes the handshake.
pub fn server_create(port: u16) -> Result<Arc<Socket>, SocketError> {
    if port > sock::MAX_PORT {
        return Err(SocketError::PortOutOfBound);
    }
    let socket = {
        let mut t = SOCKETS.lock();
        t.ensure();
        if t.slots[port as usize].is_some() {
            return Err(SocketError::PortInUse);
        }
        let s = Arc::new(Socket::new(port));
        t.slots[port as usize] = Some(s.clone());
        t.count += 1;
        s
    };

    loop {
        socket.conn.lock().state = SocketState::Listen;
        // Wait for a SYN; the control thread moves us to SYNRECEIVED.
        socket.synchronize.p();
        if socket.state() == SocketState::SynReceived {
            let _ = transmit(&socket, MsgType::SynAck, &[]);
        }
        // A successful SYNACK is acknowledged by the control thread,
        // which sets ESTABLISHED. Retry exhaustion re-enters listening.
        if socket.state() != SocketState::SynReceived {
            break;
        }
    }
    log::debug!("[stream] port {port}: connection established");
    Ok(socket)
}

/// Connect to a remote listening socket. The local port is allocated
/// from the top of the range.
pub fn client_create(
    addr: NetworkAddress,
    remote_port: u16,
) -> Result<Arc<Socket>, SocketError> {
    let socket = {
        let mut t = SOCKETS.lock();
        t.ensure();
        if t.count >= PORT_COUNT {
            return Err(SocketError::NoMorePorts);
        }
        let num = (0..PORT_COUNT)
            .rev()
            .find(|i| t.slots[*i].is_none())
            .ok_or(SocketError::NoMorePorts)? as u16;
        let s = Arc::new(Socket::new(num));
        t.slots[num as usize] = Some(s.clone());
        t.count += 1;
        s
    };
    {
        let mut c = socket.conn.lock();
        c.remote_addr = addr;
        c.remote_port = remote_port;
        c.state = SocketState::SynSent;
    }
    match transmit(&socket, MsgType::Syn, &[]) {
        Ok(_) => {
            log::debug!(
                "[stream] port {}: connected to {addr}:{remote_port}",
                socket.local_port
            );
            Ok(socket)
        }
        Err(_) => {
            // A busy server answers the SYN with a FIN, which parks the
            // socket in TIMEWAIT before the retries give up.
            let err = if socket.state() == SocketState::TimeWait {
                SocketError::Busy
            } else {
                SocketError::NoServer
            };
            enqueue_closing(socket);
            CLEANUP_SEM.v();
            Err(err)
        }
    }
}

/// Send `msg`, blocking until every segment is acknowledged. Returns the
/// number of bytes transferred.
pub fn send(socket: &Arc<Socket>, msg: &[u8]) -> Result<usize, SocketError> {
    socket.send_mutex.p();
    let mut total = 0;
    while total < msg.len() {
        if socket.state() != SocketState::Established {
            socket.send_mutex.v();
            return Err(SocketError::SendError);
        }
        let chunk = MAX_SEGMENT.min(msg.len() - total);
        match transmit(socket, MsgType::Ack, &msg[total..total + chunk]) {
            Ok(sent) => total += sent,
            Err(_) => {
                socket.send_mutex.v();
                return Err(SocketError::SendError);
            }
        }
    }
    socket.send_mutex.v();
    Ok(total)
}

/// Receive into `buf`, blocking until data is available. A segment larger
/// than the remaining buffer is left queued with its read offset advanced.
pub fn receive(socket: &Arc<Socket>, buf: &mut [u8]) -> Result<usize, SocketError> {
    {
        let mut waiters = socket.receivers.lock();
        if socket.state() != SocketState::Established {
            return Err(SocketError::ReceiveError);
        }
        *waiters += 1;
    }
    socket.receive.p();
    *socket.receivers.lock() -= 1;

    let mut stored = 0;
    loop {
        if socket.state() != SocketState::Established {
            return Err(SocketError::ReceiveError);
        }
        let Some(mut seg) = socket.data.lock().pop_front() else {
            break;
        };
        let avail = seg.remaining();
        let space = buf.len() - stored;
        if avail <= space {
            buf[stored..stored + avail].copy_from_slice(&seg.buf[seg.off..]);
            stored += avail;
        } else {
            buf[stored..].copy_from_slice(&seg.buf[seg.off..seg.off + space]);
            seg.off += space;
            stored = buf.len();
            socket.data.lock().push_front(seg);
            // Data remains; wake the next receiver.
            socket.receive.v();
            break;
        }
    }
    Ok(stored)
}

/// Close the connection: wake all receivers with an error, send FIN with
/// retries, and hand the socket to the cleanup thread.
pub fn close(socket: &Arc<Socket>) {
    {
        let mut c = socket.conn.lock();
        if c.state != SocketState::Established {
            return;
        }
        c.state = SocketState::LastAck;
    }
    unblock_receivers(socket);
    socket.send_mutex.p();
    let _ = transmit(socket, MsgType::Fin, &[]);
    socket.send_mutex.v();
    CLEANUP_SEM.v();
    enqueue_closing(socket.clone());
}

pub(crate) fn enqueue_closing(socket: Arc<Socket>) {
    CLOSING.lock().push_back(socket);
}

/// Release every thread blocked in `receive`; they observe the state
/// change and fail with RECEIVEERROR.
pub(crate) fn unblock_receivers(socket: &Socket) {
    let waiters = socket.receivers.lock();
    for _ in 0..*waiters {
        socket.receive.v();
    }
}

/// Build a header for the socket's current connection state.
pub(crate) fn pack_header(socket: &Socket, conn: &Conn, msg_type: MsgType) -> StreamHeader {
    StreamHeader {
        source: link::my_address(),
        source_port: socket.local_port,
        dest: conn.remote_addr,
        dest_port: conn.remote_port,
        msg_type,
        seq: conn.seq,
        ack: conn.ack,
    }
}

/// Transmit one packet reliably: send, arm the retry alarm, and repeat
/// with doubled delays until the acknowledgement cancels the alarm.
/// Consumes one sequence number.
pub(crate) fn transmit(
    socket: &Arc<Socket>,
    msg_type: MsgType,
    payload: &[u8],
) -> Result<usize, SocketError> {
    let (header, remote) = {
        let mut c = socket.conn.lock();
        c.seq = c.seq.wrapping_add(1);
        (pack_header(socket, &c, msg_type), c.remote_addr)
    };
    for attempt in 0..MAX_TRY {
        // A lost carrier looks the same as a lost packet: retry.
        let _ = route::send_pkt(remote, &header.pack(), payload);
        retry_wait(socket, INITIAL_TIMEOUT_MS << attempt);
        match *socket.alarm.lock() {
            RetryAlarm::Success => return Ok(payload.len()),
            RetryAlarm::Canceled => break,
            _ => {}
        }
    }
    *socket.alarm.lock() = RetryAlarm::Success;
    Err(SocketError::SendError)
}

/// Arm the retransmission alarm and wait for it or its cancellation.
fn retry_wait(socket: &Arc<Socket>, delay_ms: u64) {
    {
        // Hold the status lock across registration so the callback cannot
        // observe a stale status if the first tick lands immediately.
        let mut a = socket.alarm.lock();
        let s = socket.clone();
        let id = alarm::register(delay_ms, move || {
            *s.alarm.lock() = RetryAlarm::Wakeup;
            s.retry.v();
        });
        *a = RetryAlarm::Armed(id);
    }
    socket.retry.p();
}

/// Cancel a pending retransmission with the given resolution.
pub(crate) fn retry_cancel(socket: &Socket, resolution: RetryAlarm) {
    let mut a = socket.alarm.lock();
    if let RetryAlarm::Armed(id) = *a {
        alarm::deregister(id);
        *a = resolution;
        socket.retry.v();
    }
}
