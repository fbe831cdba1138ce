//! ICMP packet construction and parsing.
//!
//! Outbound probes are Echo Requests with an empty payload; identification
//! travels in the 16-bit id and sequence fields. Inbound packets are either
//! direct Echo Replies, or Time Exceeded / Destination Unreachable errors
//! quoting the offending datagram, from which the original (id, seq, target)
//! are recovered.

use super::{IcmpResponse, RawResponse, CODE_ECHO_REPLY, CODE_TIME_EXCEEDED};
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::Packet;
use pnet::util::checksum as rfc1071_checksum;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};

/// ICMP error header: type, code, checksum, rest-of-header.
const ICMP_ERROR_HEADER_LEN: usize = 8;
/// Fixed IPv4 header length of our probes (no options are ever sent).
const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
/// Echo header: type, code, checksum, id, seq.
const ECHO_HEADER_LEN: usize = 8;

/// A parsed inbound packet worth dispatching.
#[derive(Debug)]
pub(crate) enum Inbound {
    Echo(IcmpResponse),
    Raw(RawResponse),
}

/// Open a short-lived raw socket toward `target` for a single probe send.
pub(crate) fn open_probe_socket(target: &IpAddr) -> io::Result<Socket> {
    match target {
        IpAddr::V4(_) => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)),
        IpAddr::V6(_) => Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)),
    }
}

/// Send one Echo Request on `socket` with the probe's identification tags.
pub(crate) fn send_echo(socket: &Socket, target: IpAddr, id: u16, seq: u16) -> io::Result<()> {
    let message = match target {
        IpAddr::V4(_) => build_echo_v4(id, seq),
        IpAddr::V6(_) => build_echo_v6(id, seq),
    };
    let destination = SocketAddr::new(target, 0);
    socket.send_to(&message, &destination.into())?;
    Ok(())
}

/// Echo Request (type 8, code 0) with empty payload and RFC 1071 checksum.
pub(crate) fn build_echo_v4(id: u16, seq: u16) -> Vec<u8> {
    let mut buf = vec![0u8; MutableEchoRequestPacket::minimum_packet_size()];
    let mut echo = MutableEchoRequestPacket::new(&mut buf)
        .expect("buffer sized to minimum_packet_size");
    echo.set_icmp_type(IcmpTypes::EchoRequest);
    echo.set_icmp_code(IcmpCode(0));
    echo.set_identifier(id);
    echo.set_sequence_number(seq);
    let checksum = rfc1071_checksum(echo.packet(), 1);
    echo.set_checksum(checksum);
    buf
}

/// Echo Request (type 128, code 0) with empty payload. The checksum field is
/// left zero: the kernel computes the pseudo-header checksum on raw ICMPv6
/// sockets.
pub(crate) fn build_echo_v6(id: u16, seq: u16) -> Vec<u8> {
    use pnet::packet::icmpv6::echo_request::MutableEchoRequestPacket as MutableEchoRequestV6;
    let mut buf = vec![0u8; MutableEchoRequestV6::minimum_packet_size()];
    let mut echo = MutableEchoRequestV6::new(&mut buf)
        .expect("buffer sized to minimum_packet_size");
    echo.set_icmpv6_type(Icmpv6Types::EchoRequest);
    echo.set_icmpv6_code(Icmpv6Code(0));
    echo.set_identifier(id);
    echo.set_sequence_number(seq);
    buf
}

/// Parse a packet read from the raw ICMPv4 listener. The buffer carries the
/// full IP datagram. Returns `None` for anything that cannot be a response
/// to one of our probes.
pub(crate) fn parse_v4(buf: &[u8], source: IpAddr, received: Instant) -> Option<Inbound> {
    let ip = Ipv4Packet::new(buf)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    if ip.get_version() != 4 || header_len < IPV4_HEADER_LEN || buf.len() <= header_len {
        return None;
    }
    let icmp_bytes = &buf[header_len..];
    let icmp = IcmpPacket::new(icmp_bytes)?;
    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let echo = EchoReplyPacket::new(icmp_bytes)?;
            Some(Inbound::Echo(IcmpResponse {
                seq: echo.get_sequence_number(),
                id: echo.get_identifier(),
                source,
                target: source,
                received,
                code: CODE_ECHO_REPLY,
            }))
        }
        IcmpTypes::TimeExceeded => {
            // Code 1 is fragment reassembly time exceeded, unrelated to TTL.
            if icmp.get_icmp_code().0 != 0 {
                return None;
            }
            parse_quoted_v4(icmp_bytes, source, received, CODE_TIME_EXCEEDED)
        }
        IcmpTypes::DestinationUnreachable => {
            parse_quoted_v4(icmp_bytes, source, received, u16::from(icmp.get_icmp_code().0))
        }
        _ => None,
    }
}

/// Recover (id, seq, target) from the datagram quoted inside an ICMPv4
/// error message: 8-byte error header, 20-byte quoted IP header, then the
/// first 8 bytes of the offending payload.
fn parse_quoted_v4(
    icmp_bytes: &[u8],
    source: IpAddr,
    received: Instant,
    code: u16,
) -> Option<Inbound> {
    let quoted = icmp_bytes.get(ICMP_ERROR_HEADER_LEN..)?;
    if quoted.len() < IPV4_HEADER_LEN + ECHO_HEADER_LEN {
        return None;
    }
    let inner = Ipv4Packet::new(quoted)?;
    let target = IpAddr::V4(inner.get_destination());
    if inner.get_next_level_protocol() == IpNextHeaderProtocols::Icmp {
        let echo = &quoted[IPV4_HEADER_LEN..IPV4_HEADER_LEN + ECHO_HEADER_LEN];
        // Only a quoted Echo Request can be one of ours.
        if echo[0] != IcmpTypes::EchoRequest.0 {
            return None;
        }
        Some(Inbound::Echo(IcmpResponse {
            seq: u16::from_be_bytes([echo[6], echo[7]]),
            id: u16::from_be_bytes([echo[4], echo[5]]),
            source,
            target,
            received,
            code,
        }))
    } else {
        Some(Inbound::Raw(RawResponse {
            source,
            target,
            received,
            code,
            protocol: inner.get_next_level_protocol().0,
            fragment: quoted[IPV4_HEADER_LEN..].to_vec(),
        }))
    }
}

/// Parse a packet read from the raw ICMPv6 listener. The buffer starts at
/// the ICMPv6 header; the kernel strips the IPv6 header.
pub(crate) fn parse_v6(buf: &[u8], source: IpAddr, received: Instant) -> Option<Inbound> {
    let icmp = Icmpv6Packet::new(buf)?;
    match icmp.get_icmpv6_type() {
        Icmpv6Types::EchoReply => {
            use pnet::packet::icmpv6::echo_reply::EchoReplyPacket as EchoReplyV6;
            let echo = EchoReplyV6::new(buf)?;
            Some(Inbound::Echo(IcmpResponse {
                seq: echo.get_sequence_number(),
                id: echo.get_identifier(),
                source,
                target: source,
                received,
                code: CODE_ECHO_REPLY,
            }))
        }
        Icmpv6Types::TimeExceeded => {
            if icmp.get_icmpv6_code().0 != 0 {
                return None;
            }
            parse_quoted_v6(buf, source, received, CODE_TIME_EXCEEDED)
        }
        Icmpv6Types::DestinationUnreachable => {
            parse_quoted_v6(buf, source, received, u16::from(icmp.get_icmpv6_code().0))
        }
        _ => None,
    }
}

/// ICMPv6 counterpart of [`parse_quoted_v4`]: 8-byte error header, 40-byte
/// quoted IPv6 header, then the first 8 bytes of the offending payload.
fn parse_quoted_v6(
    icmp_bytes: &[u8],
    source: IpAddr,
    received: Instant,
    code: u16,
) -> Option<Inbound> {
    let quoted = icmp_bytes.get(ICMP_ERROR_HEADER_LEN..)?;
    if quoted.len() < IPV6_HEADER_LEN + ECHO_HEADER_LEN {
        return None;
    }
    let inner = Ipv6Packet::new(quoted)?;
    let target = IpAddr::V6(inner.get_destination());
    if inner.get_next_header() == IpNextHeaderProtocols::Icmpv6 {
        let echo = &quoted[IPV6_HEADER_LEN..IPV6_HEADER_LEN + ECHO_HEADER_LEN];
        if echo[0] != Icmpv6Types::EchoRequest.0 {
            return None;
        }
        Some(Inbound::Echo(IcmpResponse {
            seq: u16::from_be_bytes([echo[6], echo[7]]),
            id: u16::from_be_bytes([echo[4], echo[5]]),
            source,
            target,
            received,
            code,
        }))
    } else {
        Some(Inbound::Raw(RawResponse {
            source,
            target,
            received,
            code,
            protocol: inner.get_next_header().0,
            fragment: quoted[IPV6_HEADER_LEN..].to_vec(),
        }))
    }
}

/// Verify the RFC 1071 checksum of an ICMPv4 message. A zero checksum field
/// is rejected: every message we care about carries one.
pub fn verify_checksum_v4(message: &[u8]) -> bool {
    if message.len() < ECHO_HEADER_LEN {
        return false;
    }
    let stored = u16::from_be_bytes([message[2], message[3]]);
    if stored == 0 {
        return false;
    }
    rfc1071_checksum(message, 1) == stored
}

/// Verify the RFC 2463 pseudo-header checksum of an ICMPv6 message given
/// the addresses it traveled between.
pub fn verify_checksum_v6(message: &[u8], source: &Ipv6Addr, destination: &Ipv6Addr) -> bool {
    if message.len() < ECHO_HEADER_LEN {
        return false;
    }
    let stored = u16::from_be_bytes([message[2], message[3]]);
    if stored == 0 {
        return false;
    }
    pnet::util::ipv6_checksum(
        message,
        1,
        &[],
        source,
        destination,
        IpNextHeaderProtocols::Icmpv6,
    ) == stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::ipv6::MutableIpv6Packet;
    use std::net::Ipv4Addr;

    fn wrap_ipv4(payload: &[u8], source: Ipv4Addr, destination: Ipv4Addr, protocol: u8) -> Vec<u8> {
        let mut buf = vec![0u8; IPV4_HEADER_LEN + payload.len()];
        let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_HEADER_LEN + payload.len()) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(pnet::packet::ip::IpNextHeaderProtocol(protocol));
        ip.set_source(source);
        ip.set_destination(destination);
        ip.set_payload(payload);
        buf
    }

    fn echo_reply_v4(id: u16, seq: u16) -> Vec<u8> {
        let mut echo = build_echo_v4(id, seq);
        echo[0] = IcmpTypes::EchoReply.0;
        // re-checksum after the type change
        echo[2] = 0;
        echo[3] = 0;
        let checksum = rfc1071_checksum(&echo, 1);
        echo[2..4].copy_from_slice(&checksum.to_be_bytes());
        echo
    }

    /// ICMPv4 error message (Time Exceeded or Destination Unreachable)
    /// quoting a datagram we sent toward `target` with `protocol`.
    fn error_v4(icmp_type: u8, icmp_code: u8, target: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let quoted = wrap_ipv4(payload, Ipv4Addr::new(192, 0, 2, 99), target, protocol);
        let mut message = vec![0u8; ICMP_ERROR_HEADER_LEN + quoted.len()];
        message[0] = icmp_type;
        message[1] = icmp_code;
        message[ICMP_ERROR_HEADER_LEN..].copy_from_slice(&quoted);
        message
    }

    #[test]
    fn echo_reply_parses_to_success() {
        let source = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        let packet = wrap_ipv4(
            &echo_reply_v4(0xbeef, 42),
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );
        match parse_v4(&packet, source, Instant::now()) {
            Some(Inbound::Echo(response)) => {
                assert_eq!(response.id, 0xbeef);
                assert_eq!(response.seq, 42);
                assert_eq!(response.code, CODE_ECHO_REPLY);
                assert_eq!(response.source, source);
                assert_eq!(response.target, source);
            }
            other => panic!("expected echo response, got {other:?}"),
        }
    }

    #[test]
    fn time_exceeded_recovers_quoted_identification() {
        let hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254));
        let target = Ipv4Addr::new(1, 1, 1, 1);
        let inner = build_echo_v4(7, 9);
        let packet = wrap_ipv4(
            &error_v4(11, 0, target, 1, &inner),
            Ipv4Addr::new(10, 0, 0, 254),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );
        match parse_v4(&packet, hop, Instant::now()) {
            Some(Inbound::Echo(response)) => {
                assert_eq!(response.id, 7);
                assert_eq!(response.seq, 9);
                assert_eq!(response.code, CODE_TIME_EXCEEDED);
                assert_eq!(response.source, hop);
                assert_eq!(response.target, IpAddr::V4(target));
            }
            other => panic!("expected recovered echo, got {other:?}"),
        }
    }

    #[test]
    fn fragment_reassembly_time_exceeded_is_dropped() {
        let hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254));
        let inner = build_echo_v4(7, 9);
        let packet = wrap_ipv4(
            &error_v4(11, 1, Ipv4Addr::new(1, 1, 1, 1), 1, &inner),
            Ipv4Addr::new(10, 0, 0, 254),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );
        assert!(parse_v4(&packet, hop, Instant::now()).is_none());
    }

    #[test]
    fn destination_unreachable_carries_its_code() {
        let router = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
        let target = Ipv4Addr::new(192, 0, 2, 1);
        let inner = build_echo_v4(3, 4);
        let packet = wrap_ipv4(
            &error_v4(3, 1, target, 1, &inner),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );
        match parse_v4(&packet, router, Instant::now()) {
            Some(Inbound::Echo(response)) => {
                assert_eq!(response.code, 1);
                assert_eq!(response.target, IpAddr::V4(target));
            }
            other => panic!("expected recovered echo, got {other:?}"),
        }
    }

    #[test]
    fn non_icmp_quoted_datagram_becomes_raw_response() {
        let router = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
        let target = Ipv4Addr::new(192, 0, 2, 1);
        // 8 bytes of a quoted UDP header
        let udp_head = [0x80u8, 0x01, 0x82, 0x9a, 0x00, 0x08, 0x12, 0x34];
        let packet = wrap_ipv4(
            &error_v4(3, 3, target, 17, &udp_head),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );
        match parse_v4(&packet, router, Instant::now()) {
            Some(Inbound::Raw(raw)) => {
                assert_eq!(raw.protocol, 17);
                assert_eq!(raw.code, 3);
                assert_eq!(raw.target, IpAddr::V4(target));
                assert_eq!(raw.fragment, udp_head);
            }
            other => panic!("expected raw response, got {other:?}"),
        }
    }

    #[test]
    fn truncated_and_unknown_packets_are_dropped() {
        let source = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(parse_v4(&[], source, Instant::now()).is_none());
        assert!(parse_v4(&[0u8; 12], source, Instant::now()).is_none());
        // a router advertisement is not a response to anything we sent
        let packet = wrap_ipv4(
            &[9u8, 0, 0, 0, 0, 0, 0, 0],
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
        );
        assert!(parse_v4(&packet, source, Instant::now()).is_none());
        // an error message whose quote is too short to identify
        let short = error_v4(11, 0, Ipv4Addr::new(1, 1, 1, 1), 1, &[8u8, 0]);
        let packet = wrap_ipv4(&short, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1);
        assert!(parse_v4(&packet, source, Instant::now()).is_none());
    }

    #[test]
    fn v6_echo_reply_parses_to_success() {
        let source: IpAddr = "2001:db8::1".parse().unwrap();
        let mut echo = build_echo_v6(0x1234, 77);
        echo[0] = Icmpv6Types::EchoReply.0;
        match parse_v6(&echo, source, Instant::now()) {
            Some(Inbound::Echo(response)) => {
                assert_eq!(response.id, 0x1234);
                assert_eq!(response.seq, 77);
                assert_eq!(response.code, CODE_ECHO_REPLY);
                assert_eq!(response.target, source);
            }
            other => panic!("expected echo response, got {other:?}"),
        }
    }

    #[test]
    fn v6_time_exceeded_recovers_quoted_identification() {
        let hop: IpAddr = "2001:db8::fe".parse().unwrap();
        let target: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        let inner = build_echo_v6(21, 22);
        let mut quoted = vec![0u8; IPV6_HEADER_LEN + inner.len()];
        {
            let mut ip = MutableIpv6Packet::new(&mut quoted).unwrap();
            ip.set_version(6);
            ip.set_payload_length(inner.len() as u16);
            ip.set_next_header(IpNextHeaderProtocols::Icmpv6);
            ip.set_hop_limit(1);
            ip.set_source("2001:db8::1".parse().unwrap());
            ip.set_destination(target);
            ip.set_payload(&inner);
        }
        let mut message = vec![0u8; ICMP_ERROR_HEADER_LEN + quoted.len()];
        message[0] = Icmpv6Types::TimeExceeded.0;
        message[ICMP_ERROR_HEADER_LEN..].copy_from_slice(&quoted);
        match parse_v6(&message, hop, Instant::now()) {
            Some(Inbound::Echo(response)) => {
                assert_eq!(response.id, 21);
                assert_eq!(response.seq, 22);
                assert_eq!(response.code, CODE_TIME_EXCEEDED);
                assert_eq!(response.target, IpAddr::V6(target));
            }
            other => panic!("expected recovered echo, got {other:?}"),
        }
    }

    #[test]
    fn checksum_round_trip_v4() {
        let echo = build_echo_v4(0xaaaa, 0x5555);
        assert!(verify_checksum_v4(&echo));
        let mut tampered = echo.clone();
        tampered[7] ^= 0x01;
        assert!(!verify_checksum_v4(&tampered));
        assert!(!verify_checksum_v4(&echo[..4]));
    }

    #[test]
    fn checksum_v6_pseudo_header() {
        let source: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let destination: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut echo = build_echo_v6(1, 2);
        let checksum = pnet::util::ipv6_checksum(
            &echo,
            1,
            &[],
            &source,
            &destination,
            IpNextHeaderProtocols::Icmpv6,
        );
        echo[2..4].copy_from_slice(&checksum.to_be_bytes());
        assert!(verify_checksum_v6(&echo, &source, &destination));
        let elsewhere: Ipv6Addr = "2001:db8::3".parse().unwrap();
        assert!(!verify_checksum_v6(&echo, &source, &elsewhere));
        let mut tampered = echo.clone();
        tampered[5] ^= 0x10;
        assert!(!verify_checksum_v6(&tampered, &source, &destination));
    }
}
