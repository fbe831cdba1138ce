//! ICMP probe correlation engine.
//!
//! A single process-wide [`IcmpManager`] owns the raw ICMPv4 and ICMPv6
//! listeners, matches inbound Echo Reply / Time Exceeded / Destination
//! Unreachable packets to their outstanding probes and enforces per-probe
//! deadlines. Probes go out on short-lived per-probe sockets; responses come
//! back on the long-lived listening chains and are correlated by a 16-bit
//! sequence key checked against the probe's random id and target address.

mod packet;
mod receiver;

pub use packet::{verify_checksum_v4, verify_checksum_v6};

use log::debug;
use once_cell::sync::OnceCell;
use receiver::{spawn_receiver, IpFamily, RECEIVER_WAIT};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result code: no response arrived within the probe deadline.
pub const CODE_TIMEOUT: u16 = 256;
/// Result code: the target answered with an Echo Reply.
pub const CODE_ECHO_REPLY: u16 = 257;
/// Result code: a transit hop answered with Time Exceeded.
pub const CODE_TIME_EXCEEDED: u16 = 258;

/// TTL used when the path itself is not under test: high enough that no
/// transit hop ever answers with Time Exceeded.
pub const DIRECT_TTL: u8 = 100;

const DISPATCH_TICK: Duration = Duration::from_millis(10);
const RESPONSE_BACKLOG: usize = 1024;

/// Outcome of a single probe. Exactly one is delivered per issued probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Address of the responder; `None` on timeout.
    pub source: Option<IpAddr>,
    /// Time from issue to receipt; zero on timeout.
    pub latency: Duration,
    /// [`CODE_ECHO_REPLY`], [`CODE_TIME_EXCEEDED`], [`CODE_TIMEOUT`] or an
    /// ICMP Destination Unreachable code (0..=15).
    pub code: u16,
}

impl ProbeResult {
    pub(crate) fn timeout() -> Self {
        ProbeResult {
            source: None,
            latency: Duration::ZERO,
            code: CODE_TIMEOUT,
        }
    }
}

/// Parsed inbound packet attributable to an Echo probe.
#[derive(Debug, Clone)]
pub(crate) struct IcmpResponse {
    pub seq: u16,
    pub id: u16,
    pub source: IpAddr,
    pub target: IpAddr,
    pub received: Instant,
    pub code: u16,
}

/// An ICMP error quoting a non-ICMP datagram, forwarded to whichever
/// external listener registered for that protocol number.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Address of the router that produced the error.
    pub source: IpAddr,
    /// Destination of the offending datagram.
    pub target: IpAddr,
    /// Arrival timestamp.
    pub received: Instant,
    /// [`CODE_TIME_EXCEEDED`] or a Destination Unreachable code.
    pub code: u16,
    /// IP protocol number of the offending datagram.
    pub protocol: u8,
    /// Leading bytes of the offending payload, as quoted by the router.
    pub fragment: Vec<u8>,
}

/// Reasons an [`IcmpManager::issue`] call fails before a probe is on the wire.
#[derive(Debug, Error)]
pub enum IssueError {
    /// The per-probe send socket could not be opened.
    #[error("failed to open probe socket: {0}")]
    Socket(#[source] std::io::Error),

    /// The TTL / hop limit could not be applied to the send socket.
    #[error("failed to set ttl {ttl}: {source}")]
    Ttl {
        ttl: u8,
        #[source]
        source: std::io::Error,
    },

    /// The 16-bit sequence space wrapped onto a probe still in flight.
    #[error("sequence slot {0} still in flight")]
    SeqCollision(u16),
}

struct PendingProbe {
    id: u16,
    target: IpAddr,
    issued: Instant,
    deadline: Instant,
    sink: oneshot::Sender<ProbeResult>,
}

impl PendingProbe {
    fn matches(&self, response: &IcmpResponse) -> bool {
        self.id == response.id && self.target == response.target
    }

    /// Consume the probe with a matched response. A packet that arrived
    /// after the deadline still counts as a timeout.
    fn deliver(self, response: &IcmpResponse) {
        let result = if response.received > self.deadline {
            ProbeResult::timeout()
        } else {
            ProbeResult {
                source: Some(response.source),
                latency: response.received.duration_since(self.issued),
                code: response.code,
            }
        };
        let _ = self.sink.send(result);
    }

    fn expire(self) {
        let _ = self.sink.send(ProbeResult::timeout());
    }
}

type ProbeTable = Arc<Mutex<HashMap<u16, PendingProbe>>>;
type RawListeners = Arc<Mutex<HashMap<u8, mpsc::Sender<RawResponse>>>>;

/// Process-wide ICMP engine. One per process: the host has a single raw
/// ICMP socket of each family to demultiplex.
pub struct IcmpManager {
    table: ProbeTable,
    raw_listeners: RawListeners,
    counter: Mutex<u16>,
    cancel: CancellationToken,
}

static MANAGER: OnceCell<IcmpManager> = OnceCell::new();

impl IcmpManager {
    /// The process-wide manager, started on first use. Must be called from
    /// within the Tokio runtime.
    pub fn global() -> &'static IcmpManager {
        MANAGER.get_or_init(IcmpManager::start)
    }

    fn start() -> Self {
        let cancel = CancellationToken::new();
        let table: ProbeTable = Arc::new(Mutex::new(HashMap::new()));
        let raw_listeners: RawListeners = Arc::new(Mutex::new(HashMap::new()));

        let (tx4, rx4) = mpsc::channel(RESPONSE_BACKLOG);
        let (tx6, rx6) = mpsc::channel(RESPONSE_BACKLOG);
        let (raw_tx4, raw_rx4) = mpsc::channel(RESPONSE_BACKLOG);
        let (raw_tx6, raw_rx6) = mpsc::channel(RESPONSE_BACKLOG);
        spawn_receiver(IpFamily::V4, RECEIVER_WAIT, tx4, raw_tx4, cancel.clone());
        spawn_receiver(IpFamily::V6, RECEIVER_WAIT, tx6, raw_tx6, cancel.clone());
        tokio::spawn(dispatch(Arc::clone(&table), rx4, rx6));
        tokio::spawn(dispatch_raw(Arc::clone(&raw_listeners), raw_rx4, raw_rx6));

        let manager = IcmpManager {
            table,
            raw_listeners,
            counter: Mutex::new(0),
            cancel,
        };
        // Warm-up: the first send of a process carries one-time socket setup
        // cost that must not leak into a measurement.
        let _ = manager.issue(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DIRECT_TTL,
            Duration::from_secs(1),
        );
        manager
    }

    /// Send one Echo Request toward `target` and register the probe for
    /// correlation. The returned receiver resolves to exactly one
    /// [`ProbeResult`] once a response is matched or the deadline passes.
    pub fn issue(
        &self,
        target: IpAddr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<ProbeResult>, IssueError> {
        let target = normalize(target);
        let socket = packet::open_probe_socket(&target).map_err(IssueError::Socket)?;
        let applied = match target {
            IpAddr::V4(_) => socket.set_ttl_v4(u32::from(ttl)),
            IpAddr::V6(_) => socket.set_unicast_hops_v6(u32::from(ttl)),
        };
        applied.map_err(|source| IssueError::Ttl { ttl, source })?;

        let seq = {
            let mut counter = self.counter.lock().expect("mutex poisoned");
            let seq = *counter;
            *counter = counter.wrapping_add(1);
            seq
        };
        let id = rand::random::<u16>();
        let issued = Instant::now();
        let (sink, delivery) = oneshot::channel();
        {
            let mut table = self.table.lock().expect("mutex poisoned");
            if table.contains_key(&seq) {
                return Err(IssueError::SeqCollision(seq));
            }
            table.insert(
                seq,
                PendingProbe {
                    id,
                    target,
                    issued,
                    deadline: issued + timeout,
                    sink,
                },
            );
        }
        // A failed send is not fatal: the entry times out like a lost packet.
        if let Err(err) = packet::send_echo(&socket, target, id, seq) {
            debug!("probe {seq} to {target}: send failed: {err}");
        }
        Ok(delivery)
    }

    /// Receive ICMP errors quoting datagrams of the given IP protocol
    /// number. Extension point for probing over non-ICMP protocols; nothing
    /// in this crate registers one.
    pub fn register_raw_listener(&self, protocol: u8, capacity: usize) -> mpsc::Receiver<RawResponse> {
        let (tx, rx) = mpsc::channel(capacity);
        self.raw_listeners
            .lock()
            .expect("mutex poisoned")
            .insert(protocol, tx);
        rx
    }

    /// Stop the receive chains at their next read-deadline boundary. The
    /// dispatcher keeps draining so in-flight probes still resolve; issuing
    /// new probes after this is invalid.
    pub fn finish(&self) {
        self.cancel.cancel();
    }
}

/// IPv4-mapped IPv6 targets probe as plain IPv4, so responses recovered
/// from v4 packets compare equal to the stored target.
fn normalize(target: IpAddr) -> IpAddr {
    match target {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => target,
        },
        v4 => v4,
    }
}

/// Single serialization point for match-vs-timeout decisions: merges both
/// families' response streams with a periodic sweep tick.
async fn dispatch(
    table: ProbeTable,
    mut rx4: mpsc::Receiver<IcmpResponse>,
    mut rx6: mpsc::Receiver<IcmpResponse>,
) {
    let mut tick = tokio::time::interval(DISPATCH_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let now = Instant::now();
        let response = tokio::select! {
            Some(response) = rx4.recv() => Some(response),
            Some(response) = rx6.recv() => Some(response),
            _ = tick.tick() => None,
        };

        if let Some(response) = response {
            let mut table = table.lock().expect("mutex poisoned");
            let matched = table
                .get(&response.seq)
                .is_some_and(|request| request.matches(&response));
            if matched {
                if let Some(request) = table.remove(&response.seq) {
                    request.deliver(&response);
                }
            }
        }

        let mut table = table.lock().expect("mutex poisoned");
        let expired: Vec<u16> = table
            .iter()
            .filter(|(_, request)| request.deadline < now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(request) = table.remove(&seq) {
                request.expire();
            }
        }
    }
}

/// Forward ICMP errors about non-ICMP datagrams to registered listeners;
/// drop when nobody asked for that protocol.
async fn dispatch_raw(listeners: RawListeners, mut rx4: mpsc::Receiver<RawResponse>, mut rx6: mpsc::Receiver<RawResponse>) {
    loop {
        let response = tokio::select! {
            Some(response) = rx4.recv() => response,
            Some(response) = rx6.recv() => response,
            else => return,
        };
        let listener = listeners
            .lock()
            .expect("mutex poisoned")
            .get(&response.protocol)
            .cloned();
        if let Some(listener) = listener {
            // the listener owns its backlog; overflow drops
            let _ = listener.try_send(response);
        }
    }
}
