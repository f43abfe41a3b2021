//! Factory helpers for assembling frames: Ethernet headers for the forwarding
//! path and complete packets for tests.

use crate::{ETH_HLEN, IPV6_HLEN};
use etherparse::{
    EtherType, Ethernet2Header, Icmpv6Type, IpNumber, Ipv6FlowLabel, Ipv6Header, PacketBuilder,
};
use std::io::Cursor;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Serializes an Ethernet II header.
pub fn ethernet(destination: [u8; 6], source: [u8; 6], ether_type: EtherType) -> [u8; ETH_HLEN] {
    Ethernet2Header {
        destination,
        source,
        ether_type,
    }
    .to_bytes()
}

/// Serializes the outer IPv6 header of an encapsulated packet.
///
/// `payload_length` is the length of the inner IPv4 packet; the next header
/// is always IP-in-IP (4) and the hop limit 128.
pub fn outer_ipv6(source: Ipv6Addr, destination: Ipv6Addr, payload_length: u16) -> [u8; IPV6_HLEN] {
    let header = Ipv6Header {
        traffic_class: 0,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length,
        next_header: IpNumber::IPV4,
        hop_limit: 128,
        source: source.octets(),
        destination: destination.octets(),
    };

    let mut buf = [0u8; IPV6_HLEN];
    header
        .write(&mut Cursor::new(&mut buf[..]))
        .expect("a fixed-size IPv6 header always fits its own length");

    buf
}

/// Builds a UDP-in-IPv4 Ethernet frame.
pub fn udp4_frame(
    eth_dst: [u8; 6],
    eth_src: [u8; 6],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(eth_src, eth_dst)
        .ipv4(src.octets(), dst.octets(), 64)
        .udp(sport, dport);

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    buf
}

/// Builds a TCP-in-IPv4 Ethernet frame.
pub fn tcp4_frame(
    eth_dst: [u8; 6],
    eth_src: [u8; 6],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(eth_src, eth_dst)
        .ipv4(src.octets(), dst.octets(), 64)
        .tcp(sport, dport, 0, 8192);

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    buf
}

/// Builds a bare IPv4 packet (no Ethernet header) with an arbitrary protocol.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpNumber, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 64);

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, protocol, payload)
        .expect("writing to a Vec cannot fail");

    buf
}

/// Builds an ICMPv6 Packet-Too-Big message (no Ethernet header) whose payload
/// embeds a minimal original IPv6 header towards `original_destination`.
pub fn packet_too_big(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    original_destination: Ipv6Addr,
    mtu: u32,
) -> Vec<u8> {
    let embedded = Ipv6Header {
        traffic_class: 0,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: 0,
        next_header: IpNumber::IPV4,
        hop_limit: 64,
        source: src.octets(),
        destination: original_destination.octets(),
    };

    let mut embedded_buf = Vec::with_capacity(IPV6_HLEN);
    embedded
        .write(&mut embedded_buf)
        .expect("writing to a Vec cannot fail");

    let builder =
        PacketBuilder::ipv6(src.octets(), dst.octets(), 255).icmpv6(Icmpv6Type::PacketTooBig { mtu });

    let mut buf = Vec::with_capacity(builder.size(embedded_buf.len()));
    builder
        .write(&mut buf, &embedded_buf)
        .expect("writing to a Vec cannot fail");

    buf
}
