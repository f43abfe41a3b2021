//! Zero-copy views over Ethernet frames read from a TAP device.
//!
//! A TAP fd hands us raw L2 frames. Everything here is a validating window
//! over a `&[u8]`: constructing a view parses and length-checks the headers
//! once, after which field reads cannot go out of bounds. Multi-byte fields
//! are decoded from network byte order by `etherparse`.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod make;

pub use etherparse::{
    EtherType, Ethernet2Header, Ethernet2HeaderSlice, Icmpv4Header, Icmpv4Slice, Icmpv4Type,
    Icmpv6Slice, Icmpv6Type, IpFragOffset, IpNumber, Ipv4Header, Ipv4HeaderSlice, Ipv6Header,
    Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice, icmpv4,
};

use std::net::{Ipv4Addr, Ipv6Addr};

/// The maximum frame a TAP read can return.
pub const MAX_FRAME_LEN: usize = 65535;

/// Bytes of an Ethernet II header.
pub const ETH_HLEN: usize = Ethernet2Header::LEN;

/// Bytes of a (fixed) IPv6 header.
pub const IPV6_HLEN: usize = Ipv6Header::LEN;

/// The all-ones broadcast MAC.
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// A receive buffer sized for the largest possible TAP frame.
pub struct FrameBuf {
    inner: Box<[u8; MAX_FRAME_LEN]>,
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self {
            inner: Box::new([0u8; MAX_FRAME_LEN]),
        }
    }
}

impl FrameBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.inner[..]
    }

    pub fn filled(&self, len: usize) -> &[u8] {
        &self.inner[..len]
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated Ethernet header")]
    TruncatedEthernet,
    #[error("truncated or malformed IPv4 header")]
    BadIpv4,
    #[error("truncated or malformed IPv6 header")]
    BadIpv6,
    #[error("IPv4 total length exceeds frame")]
    Ipv4LengthMismatch,
    #[error("IPv6 payload length exceeds frame")]
    Ipv6LengthMismatch,
    #[error("truncated ICMPv6 message")]
    BadIcmpv6,
}

/// A parsed Ethernet frame: header view plus the L3 payload.
pub struct EthFrame<'a> {
    eth: Ethernet2HeaderSlice<'a>,
    payload: &'a [u8],
}

impl<'a> EthFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self, FrameError> {
        let eth =
            Ethernet2HeaderSlice::from_slice(frame).map_err(|_| FrameError::TruncatedEthernet)?;
        let payload = &frame[ETH_HLEN..];

        Ok(Self { eth, payload })
    }

    pub fn destination(&self) -> [u8; 6] {
        self.eth.destination()
    }

    pub fn source(&self) -> [u8; 6] {
        self.eth.source()
    }

    pub fn ether_type(&self) -> EtherType {
        self.eth.ether_type()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination() == BROADCAST_MAC
    }
}

/// A validated IPv4 packet: header view plus payload bounded by `total_len`.
#[derive(Debug)]
pub struct Ipv4View<'a> {
    header: Ipv4HeaderSlice<'a>,
    /// Header + payload, trimmed to `total_len`.
    packet: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<Self, FrameError> {
        let header = Ipv4HeaderSlice::from_slice(packet).map_err(|_| FrameError::BadIpv4)?;

        let total_len = usize::from(header.total_len());
        if total_len < usize::from(header.ihl()) * 4 || packet.len() < total_len {
            return Err(FrameError::Ipv4LengthMismatch);
        }

        Ok(Self {
            header,
            packet: &packet[..total_len],
        })
    }

    pub fn header(&self) -> &Ipv4HeaderSlice<'a> {
        &self.header
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.header.ihl()) * 4
    }

    pub fn total_len(&self) -> u16 {
        self.header.total_len()
    }

    pub fn source(&self) -> Ipv4Addr {
        self.header.source_addr()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.header.destination_addr()
    }

    pub fn protocol(&self) -> IpNumber {
        self.header.protocol()
    }

    pub fn ttl(&self) -> u8 {
        self.header.ttl()
    }

    pub fn dont_fragment(&self) -> bool {
        self.header.dont_fragment()
    }

    pub fn more_fragments(&self) -> bool {
        self.header.more_fragments()
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.header.to_header().fragment_offset.value()
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Header + payload, exactly `total_len` bytes.
    pub fn packet(&self) -> &'a [u8] {
        self.packet
    }

    /// The L4 payload.
    pub fn payload(&self) -> &'a [u8] {
        &self.packet[self.header_len()..]
    }

    /// An owned copy of the header, for rewriting.
    pub fn to_header(&self) -> Ipv4Header {
        self.header.to_header()
    }

    /// Source and destination port for TCP and UDP payloads.
    pub fn transport_ports(&self) -> Option<(u16, u16)> {
        match self.protocol() {
            IpNumber::TCP => {
                let tcp = TcpHeaderSlice::from_slice(self.payload()).ok()?;
                Some((tcp.source_port(), tcp.destination_port()))
            }
            IpNumber::UDP => {
                let udp = UdpHeaderSlice::from_slice(self.payload()).ok()?;
                Some((udp.source_port(), udp.destination_port()))
            }
            _ => None,
        }
    }

    /// The ICMP type byte, when the payload is ICMPv4.
    pub fn icmp_type(&self) -> Option<Icmpv4Type> {
        if self.protocol() != IpNumber::ICMP {
            return None;
        }

        let icmp = Icmpv4Slice::from_slice(self.payload()).ok()?;

        Some(icmp.icmp_type())
    }
}

/// A validated IPv6 packet: header view plus payload bounded by `payload_length`.
pub struct Ipv6View<'a> {
    header: Ipv6HeaderSlice<'a>,
    payload: &'a [u8],
}

impl<'a> Ipv6View<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<Self, FrameError> {
        let header = Ipv6HeaderSlice::from_slice(packet).map_err(|_| FrameError::BadIpv6)?;

        let payload_len = usize::from(header.payload_length());
        let rest = &packet[IPV6_HLEN..];
        if rest.len() < payload_len {
            return Err(FrameError::Ipv6LengthMismatch);
        }

        Ok(Self {
            header,
            payload: &rest[..payload_len],
        })
    }

    pub fn source(&self) -> Ipv6Addr {
        self.header.source_addr()
    }

    pub fn destination(&self) -> Ipv6Addr {
        self.header.destination_addr()
    }

    pub fn next_header(&self) -> IpNumber {
        self.header.next_header()
    }

    pub fn payload_length(&self) -> u16 {
        self.header.payload_length()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// An ICMPv6 Packet-Too-Big notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTooBig {
    /// Destination of the embedded original packet, i.e. the tunnel peer the
    /// advertised MTU applies to.
    pub original_destination: Ipv6Addr,
    pub mtu: u32,
}

/// Parses an ICMPv6 payload and extracts a Packet-Too-Big notification.
///
/// Returns `Ok(None)` for any other (valid) ICMPv6 type.
pub fn parse_packet_too_big(icmpv6: &[u8]) -> Result<Option<PacketTooBig>, FrameError> {
    let icmp = Icmpv6Slice::from_slice(icmpv6).map_err(|_| FrameError::BadIcmpv6)?;

    let Icmpv6Type::PacketTooBig { mtu } = icmp.icmp_type() else {
        return Ok(None);
    };

    let embedded = Ipv6HeaderSlice::from_slice(icmp.payload()).map_err(|_| FrameError::BadIcmpv6)?;

    Ok(Some(PacketTooBig {
        original_destination: embedded.destination_addr(),
        mtu,
    }))
}

/// Returns true when the address is IPv4 multicast (224.0.0.0/4).
pub fn is_ipv4_multicast(addr: Ipv4Addr) -> bool {
    addr.is_multicast()
}

/// Returns true for link-local IPv4 multicast (224.0.0.0/24), which is never
/// forwarded across the tunnel.
pub fn is_link_local_multicast(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();

    octets[0] == 224 && octets[1] == 0 && octets[2] == 0
}

/// The Ethernet destination for an IPv4 multicast group (RFC 1112 §6.4):
/// 01:00:5e followed by the low 23 bits of the group address.
pub fn ipv4_multicast_mac(group: Ipv4Addr) -> [u8; 6] {
    let o = group.octets();

    [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
}

/// The Ethernet destination for an IPv6 multicast group (RFC 2464 §7):
/// 33:33 followed by the low 32 bits of the group address.
pub fn ipv6_multicast_mac(group: Ipv6Addr) -> [u8; 6] {
    let o = group.octets();

    [0x33, 0x33, o[12], o[13], o[14], o[15]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::make;

    #[test]
    fn parses_ipv4_udp_frame() {
        let frame = make::udp4_frame(
            [0x02, 0, 0, 0, 0, 1],
            [0x02, 0, 0, 0, 0, 2],
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1234,
            53,
            b"hello",
        );

        let eth = EthFrame::parse(&frame).unwrap();
        assert_eq!(eth.ether_type(), EtherType::IPV4);
        assert!(!eth.is_broadcast());

        let ip = Ipv4View::parse(eth.payload()).unwrap();
        assert_eq!(ip.source(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.destination(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.protocol(), IpNumber::UDP);
        assert_eq!(ip.transport_ports(), Some((1234, 53)));
        assert_eq!(usize::from(ip.total_len()), 20 + 8 + 5);
    }

    #[test]
    fn rejects_short_ipv4_total_len() {
        let mut frame = make::udp4_frame(
            [0x02, 0, 0, 0, 0, 1],
            [0x02, 0, 0, 0, 0, 2],
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"payload",
        );

        // Claim more bytes than the frame holds.
        let truncated = frame.len() - 4;
        assert_eq!(
            Ipv4View::parse(&frame[ETH_HLEN..truncated]).unwrap_err(),
            FrameError::Ipv4LengthMismatch
        );

        // A frame with trailing padding is fine; the view trims to total_len.
        frame.extend_from_slice(&[0u8; 10]);
        let ip = Ipv4View::parse(&frame[ETH_HLEN..]).unwrap();
        assert_eq!(ip.packet().len(), usize::from(ip.total_len()));
    }

    #[test]
    fn extracts_packet_too_big() {
        let icmpv6 = make::packet_too_big(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            "2001:db8:1::a00:2".parse().unwrap(),
            1350,
        );

        let v6 = Ipv6View::parse(&icmpv6).unwrap();
        assert_eq!(v6.next_header(), IpNumber::IPV6_ICMP);

        let ptb = parse_packet_too_big(v6.payload()).unwrap().unwrap();
        assert_eq!(ptb.mtu, 1350);
        assert_eq!(
            ptb.original_destination,
            "2001:db8:1::a00:2".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn multicast_macs() {
        assert_eq!(
            ipv4_multicast_mac(Ipv4Addr::new(239, 1, 2, 3)),
            [0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]
        );
        assert_eq!(
            ipv4_multicast_mac(Ipv4Addr::new(224, 129, 1, 1)),
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01]
        );
        assert_eq!(
            ipv6_multicast_mac("ff0e:db8:1::ef01:203".parse().unwrap()),
            [0x33, 0x33, 0xef, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn link_local_multicast_detection() {
        assert!(is_link_local_multicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_link_local_multicast(Ipv4Addr::new(224, 0, 0, 255)));
        assert!(!is_link_local_multicast(Ipv4Addr::new(224, 0, 1, 1)));
        assert!(!is_link_local_multicast(Ipv4Addr::new(239, 1, 2, 3)));
    }
}
