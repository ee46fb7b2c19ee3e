//! Source-routed networking with on-demand route discovery.
//!
//! Outgoing packets carry their full path. Unknown destinations are
//! resolved by flooding a DISCOVERY packet; every node appends itself to
//! the path and re-broadcasts (suppressing duplicates via a history
//! cache), the destination reverses the path into a REPLY, and the reply
//! wakes the sender with the established route. A control thread drains
//! the receive buffer and drives all processing, so transitions never
//! race application threads.

pub mod cache;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::alarm::{self, AlarmId};
use crate::errors::RouteError;
use crate::machine::clock;
use crate::machine::tas::TasLock;
use crate::sync::Semaphore;
use crate::task;

use super::addr::NetworkAddress;
use super::link::{self, Packet};
use super::wire::{RouteHeader, RouteType, MAX_ROUTE_LEN, ROUTE_HDR_SIZE};
use cache::TtlCache;

/// Route cache capacity and lifetime.
const ROUTE_CACHE_CAP: usize = 20;
const ROUTE_LIFETIME_MS: u64 = 3_000;
/// Discovery-history lifetime (suppresses re-broadcast).
const DISCOVERY_HISTORY_MS: u64 = 30_000;
/// How long a sender waits for a REPLY before giving up.
const DISCOVERY_TIMEOUT_MS: u64 = 12_000;

/// Received packets awaiting the control thread.
static INTRPT_BUFFER: TasLock<VecDeque<Packet>> = TasLock::new(VecDeque::new());
static INTRPT_SIG: Semaphore = Semaphore::new(0);

/// Serialises route resolutions: concurrent sends to the same dead
/// destination collapse into a single broadcast.
static DISCOVERY_MUTEX: Semaphore = Semaphore::new(1);
static DISCOVERY_SIG: Semaphore = Semaphore::new(0);

struct DiscoveryState {
    alarm: Option<AlarmId>,
    path: Option<Vec<NetworkAddress>>,
}

static DISCOVERY: TasLock<DiscoveryState> =
    TasLock::new(DiscoveryState { alarm: None, path: None });

static ROUTES: TasLock<Option<TtlCache<Vec<NetworkAddress>>>> = TasLock::new(None);
static HISTORY: TasLock<Option<TtlCache<u32>>> = TasLock::new(None);

static DISCOVERY_ID: AtomicU32 = AtomicU32::new(0);

/// Set up the caches and start the control thread.
pub(crate) fn init() {
    *ROUTES.lock() = Some(TtlCache::new(
        ROUTE_CACHE_CAP,
        clock::ticks_for_ms(ROUTE_LIFETIME_MS),
    ));
    *HISTORY.lock() = Some(TtlCache::new(
        ROUTE_CACHE_CAP,
        clock::ticks_for_ms(DISCOVERY_HISTORY_MS),
    ));
    task::fork(control_loop).expect("failed to start miniroute control thread");
}

/// Receive-side entry point, called from the link pump for every packet.
pub(crate) fn buffer_interrupt(pkt: Packet) {
    INTRPT_BUFFER.lock().push_back(pkt);
    INTRPT_SIG.v();
}

/// Send `[hdr|data]` to `dest`, discovering a route if the cache has no
/// live entry. Blocks for up to the discovery timeout on a cold cache.
pub fn send_pkt(dest: NetworkAddress, hdr: &[u8], data: &[u8]) -> Result<usize, RouteError> {
    if !link::is_up() {
        return Err(RouteError::LinkDown);
    }
    let me = link::my_address();
    let path = if dest == me {
        vec![me]
    } else {
        DISCOVERY_MUTEX.p();
        let cached = ROUTES
            .lock()
            .as_mut()
            .and_then(|c| c.get(clock::ticks(), dest).cloned());
        let resolved = match cached {
            Some(p) => Ok(p),
            None => discover(dest),
        };
        DISCOVERY_MUTEX.v();
        resolved?
    };

    let route_hdr = RouteHeader {
        kind: RouteType::Data,
        destination: dest,
        id: 0,
        ttl: MAX_ROUTE_LEN as u32,
        path: path.clone(),
    };
    let next_hop = path.get(1).copied().unwrap_or(dest);
    let mut payload = Vec::with_capacity(hdr.len() + data.len());
    payload.extend_from_slice(hdr);
    payload.extend_from_slice(data);
    link::send_pkt(next_hop, &route_hdr.pack(), &payload);
    Ok(hdr.len() + data.len())
}

/// Broadcast a discovery probe and wait for the reply or the timeout.
/// Caller holds the discovery mutex.
fn discover(dest: NetworkAddress) -> Result<Vec<NetworkAddress>, RouteError> {
    let me = link::my_address();
    let id = DISCOVERY_ID.fetch_add(1, Ordering::Relaxed);
    let hdr = RouteHeader {
        kind: RouteType::Discovery,
        destination: dest,
        id,
        ttl: MAX_ROUTE_LEN as u32,
        path: vec![me],
    };
    if let Some(h) = HISTORY.lock().as_mut() {
        h.put(clock::ticks(), me, id);
    }
    log::debug!("[route] discovering {dest} (id {id})");
    link::bcast_pkt(&hdr.pack(), &[]);

    DISCOVERY.lock().alarm =
        Some(alarm::register(DISCOVERY_TIMEOUT_MS, || DISCOVERY_SIG.v()));
    DISCOVERY_SIG.p();

    let mut st = DISCOVERY.lock();
    match st.path.take() {
        Some(path) => Ok(path),
        None => {
            st.alarm = None;
            log::debug!("[route] discovery of {dest} timed out");
            Err(RouteError::DiscoveryTimeout)
        }
    }
}

fn control_loop() {
    let me = link::my_address();
    loop {
        INTRPT_SIG.p();
        let Some(pkt) = INTRPT_BUFFER.lock().pop_front() else {
            continue;
        };
        let Some(hdr) = RouteHeader::parse(&pkt.buf) else {
            continue;
        };
        if hdr.destination != me && hdr.ttl == 0 {
            continue;
        }
        match hdr.kind {
            RouteType::Data => process_data(me, hdr, pkt),
            RouteType::Discovery => process_discovery(me, hdr),
            RouteType::Reply => process_reply(me, hdr, pkt),
        }
    }
}

fn process_data(me: NetworkAddress, hdr: RouteHeader, mut pkt: Packet) {
    if hdr.destination != me {
        relay(me, hdr, &pkt);
        return;
    }
    pkt.buf.drain(..ROUTE_HDR_SIZE);
    match pkt.buf.first().copied() {
        Some(super::wire::PROTOCOL_DATAGRAM) => super::msg::process(pkt),
        Some(super::wire::PROTOCOL_STREAM) => super::stream::process(pkt),
        _ => log::trace!("[route] dropping packet with unknown protocol"),
    }
}

/// Forward a packet along its recorded path: find self, decrement TTL,
/// pass to the next hop.
fn relay(me: NetworkAddress, mut hdr: RouteHeader, pkt: &Packet) {
    let Some(i) = hdr.path.iter().position(|h| *h == me) else {
        return;
    };
    if i + 1 >= hdr.path.len() || hdr.ttl == 0 {
        return;
    }
    hdr.ttl -= 1;
    let next = hdr.path[i + 1];
    link::send_pkt(next, &hdr.pack(), &pkt.buf[ROUTE_HDR_SIZE..]);
}

fn process_discovery(me: NetworkAddress, mut hdr: RouteHeader) {
    if hdr.path.len() >= MAX_ROUTE_LEN {
        return;
    }
    hdr.path.push(me);
    let origin = hdr.path[0];
    let now = clock::ticks();

    if hdr.destination != me {
        // Re-broadcast unless this probe has been seen already.
        let seen = HISTORY
            .lock()
            .as_mut()
            .and_then(|c| c.get(now, origin).copied())
            == Some(hdr.id);
        if seen || hdr.ttl == 0 {
            return;
        }
        if let Some(h) = HISTORY.lock().as_mut() {
            h.put(now, origin, hdr.id);
        }
        hdr.ttl -= 1;
        link::bcast_pkt(&hdr.pack(), &[]);
        return;
    }

    // We are the destination: the reversed path routes the reply (and any
    // future traffic) back to the origin.
    let mut reverse: Vec<NetworkAddress> = hdr.path.clone();
    reverse.reverse();
    if let Some(c) = ROUTES.lock().as_mut() {
        c.put(now, origin, reverse.clone());
    }
    let next = reverse.get(1).copied().unwrap_or(origin);
    let reply = RouteHeader {
        kind: RouteType::Reply,
        destination: origin,
        id: hdr.id,
        ttl: MAX_ROUTE_LEN as u32,
        path: reverse,
    };
    link::send_pkt(next, &reply.pack(), &[]);
}

fn process_reply(me: NetworkAddress, hdr: RouteHeader, pkt: Packet) {
    if hdr.destination != me {
        relay(me, hdr, &pkt);
        return;
    }
    // The reply path runs replier -> ... -> us; reversed it is our
    // forward route.
    let mut forward = hdr.path.clone();
    forward.reverse();
    let Some(&dest) = forward.last() else {
        return;
    };
    if let Some(c) = ROUTES.lock().as_mut() {
        c.put(clock::ticks(), dest, forward.clone());
    }
    let mut st = DISCOVERY.lock();
    if let Some(a) = st.alarm.take() {
        alarm::deregister(a);
        st.path = Some(forward);
        DISCOVERY_SIG.v();
    }
}
