//! Raw-socket receive chains.
//!
//! Each family runs a chain of short-lived tasks: open a listening socket,
//! read at most one packet under a one-second deadline, spawn the successor,
//! parse, push to the dispatcher. The bounded read means every link observes
//! cancellation within one deadline, and a wedged read can never stall the
//! pipeline for longer than that.

use super::packet::{self, Inbound};
use super::{IcmpResponse, RawResponse};
use log::warn;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read deadline of one listening socket; also the cancellation latency.
pub(crate) const RECEIVER_WAIT: Duration = Duration::from_secs(1);
/// Largest datagram we ever expect on the wire.
const MAX_PACKET: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn name(self) -> &'static str {
        match self {
            IpFamily::V4 => "ICMPv4",
            IpFamily::V6 => "ICMPv6",
        }
    }
}

pub(crate) fn spawn_receiver(
    family: IpFamily,
    wait: Duration,
    responses: mpsc::Sender<IcmpResponse>,
    raw: mpsc::Sender<RawResponse>,
    cancel: CancellationToken,
) {
    tokio::spawn(receive_one(family, wait, responses, raw, cancel));
}

async fn receive_one(
    family: IpFamily,
    wait: Duration,
    responses: mpsc::Sender<IcmpResponse>,
    raw: mpsc::Sender<RawResponse>,
    cancel: CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    let socket = match open_listener(family) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(
                "{} receiver: failed to open listening socket: {err}; \
                 probes of this family will time out",
                family.name()
            );
            return;
        }
    };
    if let Err(err) = socket.set_read_timeout(Some(wait)) {
        warn!("{} receiver: failed to set read deadline: {err}", family.name());
        return;
    }
    let read = tokio::task::spawn_blocking(move || read_packet(&socket)).await;
    let received = Instant::now();
    spawn_receiver(family, wait, responses.clone(), raw.clone(), cancel.clone());
    let Ok(Ok(Some((buf, source)))) = read else {
        // deadline elapsed, transient read error, or unusable source address
        return;
    };
    let inbound = match family {
        IpFamily::V4 => packet::parse_v4(&buf, source, received),
        IpFamily::V6 => packet::parse_v6(&buf, source, received),
    };
    match inbound {
        Some(Inbound::Echo(response)) => {
            let _ = responses.send(response).await;
        }
        Some(Inbound::Raw(response)) => {
            let _ = raw.send(response).await;
        }
        None => {}
    }
}

fn open_listener(family: IpFamily) -> io::Result<Socket> {
    match family {
        IpFamily::V4 => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)),
        IpFamily::V6 => Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)),
    }
}

/// Blocking single-packet read. The socket is dropped (closed) on return;
/// the successor task listens on its own socket.
fn read_packet(socket: &Socket) -> io::Result<Option<(Vec<u8>, IpAddr)>> {
    let mut buf = [MaybeUninit::<u8>::uninit(); MAX_PACKET];
    let (len, addr) = socket.recv_from(&mut buf)?;
    let source = match (addr.as_socket_ipv4(), addr.as_socket_ipv6()) {
        (Some(v4), _) => IpAddr::V4(*v4.ip()),
        (_, Some(v6)) => IpAddr::V6(*v6.ip()),
        _ => return Ok(None),
    };
    let initialized: &[MaybeUninit<u8>] = &buf[..len];
    let bytes: &[u8] = unsafe { &*(initialized as *const [MaybeUninit<u8>] as *const [u8]) };
    Ok(Some((bytes.to_vec(), source)))
}
