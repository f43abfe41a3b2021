//! The data plane: encapsulation (stub -> backbone) and decapsulation
//! (backbone -> stub).
//!
//! The packet transforms are pure functions from an input frame to a
//! [`Verdict`]; the TAP worker threads wrap them with blocking reads and
//! writes. Nothing here holds a lock across I/O.

use crate::plane::{self, MapDrop, MapOutcome, PlanePrefixes};
use crate::pmtu::PmtuCache;
use crate::pr::PrTable;
use crate::stats::{Counters, Stats};
use control_proto::{ControlSocket, Mode, Request};
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tap_frame::{
    EthFrame, EtherType, FrameBuf, Icmpv4Header, Icmpv4Type, IpFragOffset, IpNumber, Ipv4View,
    Ipv6View, PacketTooBig, icmpv4, ipv4_multicast_mac, ipv6_multicast_mac, is_ipv4_multicast,
    is_link_local_multicast, make,
};

/// Shared tunnel state of one namespace's worker.
pub struct TunnelCtx {
    pub mode: Mode,
    pub prefixes: PlanePrefixes,
    pub pr_table: Arc<PrTable>,
    pub pmtu: Arc<PmtuCache>,
    pub force_fragment: Arc<AtomicBool>,
}

/// Every way a packet can leave the transform. Dispositions map 1:1 onto
/// statistics counters.
#[derive(Debug)]
pub enum Verdict {
    /// Write these frames to the peer TAP.
    Forward {
        frames: Vec<Vec<u8>>,
        multicast: bool,
        fragmented: bool,
    },
    /// Send an ICMPv4 Fragmentation-Needed back to the inner source via a
    /// raw socket in the stub namespace.
    FragNeeded { dst: Ipv4Addr, message: Vec<u8> },
    /// Hand the advertised MTU to the PMTU cache owner.
    MtuUpdate(PacketTooBig),
    Drop(DropKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Broadcast,
    EtherProto,
    Malformed,
    LinkLocalMulticast,
    AsFragment,
    AsUnsupportedProtocol,
    PrMulticast,
    PrLookupFailure,
    PrReverseCheck,
    TtlExceeded,
    NextHeader,
    FragmentOverflow,
    /// DF set, oversize, and the trigger packet may not be answered with an
    /// ICMP error. Not counted, matching the silent original behavior.
    IcmpSuppressed,
}

impl From<MapDrop> for DropKind {
    fn from(drop: MapDrop) -> Self {
        match drop {
            MapDrop::LinkLocalMulticast => DropKind::LinkLocalMulticast,
            MapDrop::PrMulticast => DropKind::PrMulticast,
            MapDrop::PrLookupFailure => DropKind::PrLookupFailure,
            MapDrop::AsFragment => DropKind::AsFragment,
            MapDrop::AsUnsupportedProtocol => DropKind::AsUnsupportedProtocol,
        }
    }
}

/// Encapsulates one frame read from the stub TAP.
///
/// `backbone_mac` is the backbone TAP's address; it becomes both the source
/// and (for unicast) the destination of the rewritten Ethernet header.
pub fn encapsulate(frame: &[u8], ctx: &TunnelCtx, backbone_mac: [u8; 6]) -> Verdict {
    let Ok(eth) = EthFrame::parse(frame) else {
        return Verdict::Drop(DropKind::Malformed);
    };

    if eth.is_broadcast() {
        return Verdict::Drop(DropKind::Broadcast);
    }
    if eth.ether_type() != EtherType::IPV4 {
        return Verdict::Drop(DropKind::EtherProto);
    }

    let Ok(inner) = Ipv4View::parse(eth.payload()) else {
        return Verdict::Drop(DropKind::Malformed);
    };

    let (outer_src, outer_dst, multicast) =
        match plane::map_outer(ctx.mode, &ctx.prefixes, &ctx.pr_table, &inner) {
            MapOutcome::Unicast { src, dst } => (src, dst, false),
            MapOutcome::Multicast { src, dst } => (src, dst, true),
            MapOutcome::Drop(reason) => return Verdict::Drop(reason.into()),
        };

    let eth_dst = if multicast {
        ipv6_multicast_mac(outer_dst)
    } else {
        backbone_mac
    };
    let eth_out = make::ethernet(eth_dst, backbone_mac, EtherType::IPV6);

    let pmtu = ctx.pmtu.lookup(outer_dst);
    let encapsulated_len = u32::from(inner.total_len()) + tap_frame::IPV6_HLEN as u32;

    if u32::from(pmtu) < encapsulated_len {
        let force = ctx.force_fragment.load(Ordering::Relaxed);

        if inner.dont_fragment() && !force {
            // The next hop sees only the inner packet, so advertise the path
            // MTU minus the encapsulation overhead.
            let next_hop_mtu = pmtu - tap_frame::IPV6_HLEN as u16;
            if !icmp_error_allowed(&inner) {
                return Verdict::Drop(DropKind::IcmpSuppressed);
            }

            return Verdict::FragNeeded {
                dst: inner.source(),
                message: frag_needed_message(&inner, next_hop_mtu),
            };
        }

        return match fragment(&inner, &eth_out, outer_src, outer_dst, pmtu) {
            Some(frames) => Verdict::Forward {
                frames,
                multicast,
                fragmented: true,
            },
            None => Verdict::Drop(DropKind::FragmentOverflow),
        };
    }

    let ipv6 = make::outer_ipv6(outer_src, outer_dst, inner.total_len());

    let mut out = Vec::with_capacity(eth_out.len() + ipv6.len() + inner.packet().len());
    out.extend_from_slice(&eth_out);
    out.extend_from_slice(&ipv6);
    out.extend_from_slice(inner.packet());

    Verdict::Forward {
        frames: vec![out],
        multicast,
        fragmented: false,
    }
}

/// Splits the inner packet into encapsulated fragments that each fit `pmtu`.
///
/// The first fragment keeps the packet's own fragment offset, the last keeps
/// its MF bit, and everything in between sets MF. Payload chunks are 8-byte
/// aligned per the IPv4 fragmentation rules.
fn fragment(
    inner: &Ipv4View<'_>,
    eth_out: &[u8; tap_frame::ETH_HLEN],
    outer_src: std::net::Ipv6Addr,
    outer_dst: std::net::Ipv6Addr,
    pmtu: u16,
) -> Option<Vec<Vec<u8>>> {
    let header_len = inner.header_len() as u16;
    let max_payload = usize::from((pmtu - tap_frame::IPV6_HLEN as u16 - header_len) & !7);
    if max_payload == 0 {
        return None;
    }

    let original_mf = inner.more_fragments();
    let original_offset = inner.fragment_offset();
    let payload = inner.payload();

    let mut template = inner.to_header();
    // Force-fragment clears DF before splitting.
    template.dont_fragment = false;

    let mut frames = Vec::with_capacity(payload.len().div_ceil(max_payload));
    let mut sent = 0usize;

    while sent < payload.len() {
        let chunk = &payload[sent..(sent + max_payload).min(payload.len())];
        let last = sent + chunk.len() == payload.len();

        let mut header = template.clone();
        header.total_len = header_len + chunk.len() as u16;
        header.more_fragments = if last { original_mf } else { true };
        header.fragment_offset =
            IpFragOffset::try_new(original_offset + (sent as u16 >> 3)).ok()?;
        // The template still carries the original packet's checksum.
        header.header_checksum = header.calc_header_checksum();

        let ipv6 = make::outer_ipv6(outer_src, outer_dst, header.total_len);

        let mut frame =
            Vec::with_capacity(eth_out.len() + ipv6.len() + usize::from(header.total_len));
        frame.extend_from_slice(eth_out);
        frame.extend_from_slice(&ipv6);
        header.write(&mut frame).ok()?;
        frame.extend_from_slice(chunk);

        frames.push(frame);
        sent += chunk.len();
    }

    Some(frames)
}

/// Whether an ICMP error may be generated in response to this packet:
/// never for non-first fragments, multicast or broadcast destinations, or
/// ICMP errors other than Redirect.
fn icmp_error_allowed(inner: &Ipv4View<'_>) -> bool {
    if inner.fragment_offset() != 0 {
        return false;
    }

    let dst = inner.destination();
    if is_ipv4_multicast(dst) || dst == Ipv4Addr::BROADCAST {
        return false;
    }

    if inner.protocol() == IpNumber::ICMP {
        let Some(icmp_type) = inner.icmp_type() else {
            return false;
        };

        return match icmp_type {
            Icmpv4Type::EchoRequest(_)
            | Icmpv4Type::EchoReply(_)
            | Icmpv4Type::Redirect(_)
            | Icmpv4Type::TimestampRequest(_)
            | Icmpv4Type::TimestampReply(_) => true,
            // Router advertisement/solicitation, info and mask queries.
            Icmpv4Type::Unknown {
                type_u8: 9 | 10 | 15 | 16 | 17 | 18,
                ..
            } => true,
            _ => false,
        };
    }

    true
}

/// Builds the ICMPv4 Fragmentation-Needed message (type 3, code 4): header
/// plus the inner IP header and the first 8 payload bytes.
fn frag_needed_message(inner: &Ipv4View<'_>, next_hop_mtu: u16) -> Vec<u8> {
    let quoted_len = (inner.header_len() + 8).min(inner.packet().len());
    let quoted = &inner.packet()[..quoted_len];

    let header = Icmpv4Header::with_checksum(
        Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FragmentationNeeded {
            next_hop_mtu,
        }),
        quoted,
    );

    let mut message = Vec::with_capacity(header.header_len() + quoted.len());
    header
        .write(&mut message)
        .expect("writing to a Vec cannot fail");
    message.extend_from_slice(quoted);

    message
}

/// Decapsulates one frame read from the backbone TAP.
///
/// `stub_mac` is the stub TAP's address; it becomes the source and (for
/// unicast) the destination of the rewritten Ethernet header.
pub fn decapsulate(frame: &[u8], ctx: &TunnelCtx, stub_mac: [u8; 6]) -> Verdict {
    let Ok(eth) = EthFrame::parse(frame) else {
        return Verdict::Drop(DropKind::Malformed);
    };

    if eth.is_broadcast() {
        return Verdict::Drop(DropKind::Broadcast);
    }
    if eth.ether_type() != EtherType::IPV6 {
        return Verdict::Drop(DropKind::EtherProto);
    }

    let Ok(outer) = Ipv6View::parse(eth.payload()) else {
        return Verdict::Drop(DropKind::Malformed);
    };

    match outer.next_header() {
        IpNumber::IPV4 => {
            let Ok(inner) = Ipv4View::parse(outer.payload()) else {
                return Verdict::Drop(DropKind::Malformed);
            };

            if ctx.mode == Mode::PrefixRes && !ctx.pr_table.reverse_check(outer.source()) {
                return Verdict::Drop(DropKind::PrReverseCheck);
            }

            let daddr = inner.destination();
            let multicast = is_ipv4_multicast(daddr);
            if multicast && is_link_local_multicast(daddr) {
                return Verdict::Drop(DropKind::LinkLocalMulticast);
            }
            if inner.ttl() == 1 {
                return Verdict::Drop(DropKind::TtlExceeded);
            }

            let eth_dst = if multicast {
                ipv4_multicast_mac(daddr)
            } else {
                stub_mac
            };
            let eth_out = make::ethernet(eth_dst, stub_mac, EtherType::IPV4);

            let mut out = Vec::with_capacity(eth_out.len() + inner.packet().len());
            out.extend_from_slice(&eth_out);
            out.extend_from_slice(inner.packet());

            Verdict::Forward {
                frames: vec![out],
                multicast,
                fragmented: false,
            }
        }

        IpNumber::IPV6_ICMP => match tap_frame::parse_packet_too_big(outer.payload()) {
            Ok(Some(ptb)) => Verdict::MtuUpdate(ptb),
            _ => Verdict::Drop(DropKind::NextHeader),
        },

        _ => Verdict::Drop(DropKind::NextHeader),
    }
}

#[derive(Clone, Copy)]
pub enum Direction {
    Encap,
    Decap,
}

fn count_drop(counters: &Counters, direction: Direction, kind: DropKind) {
    use Direction::*;
    use std::sync::atomic::Ordering::Relaxed;

    let counter = match (direction, kind) {
        (Encap, DropKind::Broadcast) => &counters.encap_drop_broadcast,
        (Encap, DropKind::EtherProto | DropKind::Malformed) => &counters.encap_drop_ether_proto,
        (Encap, DropKind::LinkLocalMulticast) => &counters.encap_drop_link_local_mcast,
        (Encap, DropKind::AsFragment) => &counters.encap_drop_as_fragment,
        (Encap, DropKind::AsUnsupportedProtocol) => &counters.encap_drop_as_proto,
        (Encap, DropKind::PrMulticast) => &counters.encap_drop_pr_multicast,
        (Encap, DropKind::PrLookupFailure) => &counters.encap_drop_pr_lookup,
        (Encap, DropKind::FragmentOverflow) => &counters.encap_frag_err,
        (Decap, DropKind::Broadcast) => &counters.decap_drop_broadcast,
        (Decap, DropKind::EtherProto | DropKind::Malformed) => &counters.decap_drop_ether_proto,
        (Decap, DropKind::LinkLocalMulticast) => &counters.decap_drop_link_local_mcast,
        (Decap, DropKind::TtlExceeded) => &counters.decap_drop_ttl,
        (Decap, DropKind::PrReverseCheck) => &counters.decap_drop_pr_reverse,
        (_, DropKind::NextHeader) => &counters.decap_drop_next_header,
        (_, DropKind::IcmpSuppressed) => return,
        // Remaining combinations cannot be produced by the paired transform.
        _ => return,
    };

    counter.fetch_add(1, Relaxed);
}

/// Everything one TAP worker thread needs.
pub struct Worker {
    pub direction: Direction,
    pub ctx: TunnelCtx,
    /// The TAP this worker reads from.
    pub read_fd: Arc<OwnedFd>,
    /// The peer TAP written to on forward.
    pub write_fd: Arc<OwnedFd>,
    /// MAC stamped onto rewritten Ethernet headers (the write-side TAP's).
    pub mac: [u8; 6],
    pub stats: Arc<Stats>,
    /// Decap side: where Packet-Too-Big events are forwarded.
    pub command_socket: Option<Arc<ControlSocket>>,
}

impl Worker {
    /// The blocking hot loop. Runs until the TAP fd dies.
    pub fn run(self) {
        let mut buf = FrameBuf::new();

        // A raw socket for Fragmentation-Needed errors, stub side only.
        let raw_icmp = match self.direction {
            Direction::Encap => match open_raw_icmp_socket() {
                Ok(fd) => Some(fd),
                Err(error) => {
                    tracing::warn!("No raw ICMP socket, PMTU errors disabled: {error}");
                    None
                }
            },
            Direction::Decap => None,
        };

        drain_pending(&self.read_fd, &mut buf);

        tracing::info!("tunnel worker loop start");

        loop {
            let len = match nix::unistd::read(self.read_fd.as_fd(), buf.buf()) {
                Ok(0) => break,
                Ok(len) => len,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(error) => {
                    tracing::error!("TAP read failed: {error}");
                    break;
                }
            };

            self.handle_frame(buf.filled(len), raw_icmp.as_ref());
        }

        tracing::info!("tunnel worker loop end");
    }

    fn handle_frame(&self, frame: &[u8], raw_icmp: Option<&OwnedFd>) {
        use std::sync::atomic::Ordering::Relaxed;

        let counters = self.stats.counters();
        match self.direction {
            Direction::Encap => counters.encap_recv_total.fetch_add(1, Relaxed),
            Direction::Decap => counters.decap_recv_total.fetch_add(1, Relaxed),
        };

        let verdict = match self.direction {
            Direction::Encap => encapsulate(frame, &self.ctx, self.mac),
            Direction::Decap => decapsulate(frame, &self.ctx, self.mac),
        };

        match verdict {
            Verdict::Forward {
                frames,
                multicast,
                fragmented,
            } => {
                match (self.direction, multicast) {
                    (Direction::Encap, false) => counters.encap_unicast.fetch_add(1, Relaxed),
                    (Direction::Encap, true) => counters.encap_multicast.fetch_add(1, Relaxed),
                    (Direction::Decap, false) => counters.decap_unicast.fetch_add(1, Relaxed),
                    (Direction::Decap, true) => counters.decap_multicast.fetch_add(1, Relaxed),
                };

                for out in frames {
                    let (ok, err) = match (self.direction, fragmented) {
                        (Direction::Encap, false) => {
                            (&counters.encap_send_ok, &counters.encap_send_err)
                        }
                        (Direction::Encap, true) => {
                            (&counters.encap_frag_ok, &counters.encap_frag_err)
                        }
                        (Direction::Decap, _) => {
                            (&counters.decap_send_ok, &counters.decap_send_err)
                        }
                    };

                    match nix::unistd::write(self.write_fd.as_fd(), &out) {
                        Ok(_) => ok.fetch_add(1, Relaxed),
                        Err(error) => {
                            tracing::debug!("TAP write failed: {error}");
                            err.fetch_add(1, Relaxed)
                        }
                    };
                }
            }

            Verdict::FragNeeded { dst, message } => {
                let Some(raw_icmp) = raw_icmp else {
                    counters.frag_needed_err.fetch_add(1, Relaxed);
                    return;
                };

                match send_raw_icmp(raw_icmp, dst, &message) {
                    Ok(()) => counters.frag_needed_sent.fetch_add(1, Relaxed),
                    Err(error) => {
                        tracing::debug!("Failed to send Fragmentation-Needed: {error}");
                        counters.frag_needed_err.fetch_add(1, Relaxed)
                    }
                };
            }

            Verdict::MtuUpdate(ptb) => {
                counters.ptb_received.fetch_add(1, Relaxed);
                // The outer packet itself is not forwarded.
                counters.decap_drop_next_header.fetch_add(1, Relaxed);

                if let Some(socket) = &self.command_socket {
                    let request = Request::PacketTooBig {
                        dst: ptb.original_destination,
                        mtu: ptb.mtu,
                    };
                    if let Err(error) = socket.send(&request, None) {
                        tracing::debug!("Failed to forward Packet-Too-Big: {error}");
                    }
                }
            }

            Verdict::Drop(kind) => count_drop(counters, self.direction, kind),
        }
    }
}

/// Discards whatever accumulated on the TAP before the loop starts.
fn drain_pending(fd: &OwnedFd, buf: &mut FrameBuf) {
    use nix::sys::select::{FdSet, select};
    use nix::sys::time::TimeVal;

    loop {
        let mut readfds = FdSet::new();
        readfds.insert(fd.as_fd());
        let mut timeout = TimeVal::new(0, 0);

        match select(None, &mut readfds, None, None, &mut timeout) {
            Ok(n) if n > 0 => {
                let _ = nix::unistd::read(fd.as_fd(), buf.buf());
            }
            _ => break,
        }
    }
}

fn open_raw_icmp_socket() -> std::io::Result<OwnedFd> {
    // Safety: plain socket(2); the fd is immediately wrapped.
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::IPPROTO_ICMP,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Safety: we own the fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn send_raw_icmp(fd: &OwnedFd, dst: Ipv4Addr, message: &[u8]) -> nix::Result<()> {
    use nix::sys::socket::{MsgFlags, SockaddrIn, sendto};

    let addr = SockaddrIn::from(std::net::SocketAddrV4::new(dst, 0));
    sendto(fd.as_raw_fd(), message, &addr, MsgFlags::empty())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::compose_plane_prefix;
    use control_proto::{PmtudMode, PrRuleSpec};
    use std::net::Ipv6Addr;
    use tap_frame::{ETH_HLEN, IPV6_HLEN, Ipv4HeaderSlice};

    const STUB_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const BACKBONE_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    fn ctx(mode: Mode, pmtud: PmtudMode) -> TunnelCtx {
        let prefixes = PlanePrefixes {
            unicast: compose_plane_prefix("2001:db8:1::".parse().unwrap(), 48, Some("0:0"))
                .unwrap(),
            pr_source: Some(
                compose_plane_prefix("2001:db8:2::".parse().unwrap(), 48, Some("0:0")).unwrap(),
            ),
            multicast: Some(
                compose_plane_prefix("ff0e:db8:1::".parse().unwrap(), 48, Some("0:0")).unwrap(),
            ),
        };

        TunnelCtx {
            mode,
            prefixes,
            pr_table: Arc::new(PrTable::new()),
            pmtu: Arc::new(PmtuCache::new(pmtud, 1500, 600)),
            force_fragment: Arc::new(AtomicBool::new(false)),
        }
    }

    fn single_frame(verdict: Verdict) -> Vec<u8> {
        match verdict {
            Verdict::Forward {
                mut frames,
                fragmented: false,
                ..
            } if frames.len() == 1 => frames.remove(0),
            other => panic!("expected one unfragmented frame, got {other:?}"),
        }
    }

    /// Normal-mode unicast: outer addresses embed the inner ones, plen
    /// equals the inner total length, next header is IPIP, hop limit 128.
    #[test]
    fn normal_unicast_encap() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);
        let frame = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            7,
            8,
            &[0u8; 72],
        );
        let inner_total_len = frame.len() - ETH_HLEN;
        assert_eq!(inner_total_len, 100);

        let out = single_frame(encapsulate(&frame, &ctx, BACKBONE_MAC));

        let eth = EthFrame::parse(&out).unwrap();
        assert_eq!(eth.ether_type(), EtherType::IPV6);
        assert_eq!(eth.destination(), BACKBONE_MAC);
        assert_eq!(eth.source(), BACKBONE_MAC);

        let outer = Ipv6View::parse(eth.payload()).unwrap();
        assert_eq!(outer.source(), "2001:db8:1::a00:1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            outer.destination(),
            "2001:db8:1::a00:2".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(outer.next_header(), IpNumber::IPV4);
        assert_eq!(usize::from(outer.payload_length()), inner_total_len);

        // Hop limit sits at byte 7 of the IPv6 header.
        assert_eq!(eth.payload()[7], 128);

        // The inner packet is carried verbatim.
        assert_eq!(outer.payload(), &frame[ETH_HLEN..]);
    }

    /// Multicast: outer destination under the multicast plane prefix and a
    /// 33:33 group MAC from its low 32 bits.
    #[test]
    fn normal_multicast_encap() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);
        let frame = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "239.1.2.3".parse().unwrap(),
            7,
            8,
            b"m",
        );

        let Verdict::Forward {
            frames, multicast, ..
        } = encapsulate(&frame, &ctx, BACKBONE_MAC)
        else {
            panic!("expected forward");
        };
        assert!(multicast);

        let eth = EthFrame::parse(&frames[0]).unwrap();
        assert_eq!(eth.destination(), [0x33, 0x33, 0xef, 0x01, 0x02, 0x03]);

        let outer = Ipv6View::parse(eth.payload()).unwrap();
        assert_eq!(
            outer.destination(),
            "ff0e:db8:1::ef01:203".parse::<Ipv6Addr>().unwrap()
        );
    }

    /// DF=1 over a 1300-byte path: no data forwarded, one Fragmentation-
    /// Needed towards the inner source advertising pmtu - 40.
    #[test]
    fn oversize_df_produces_frag_needed() {
        let ctx = ctx(Mode::Normal, PmtudMode::Host);
        ctx.pmtu.update("2001:db8:1::a00:2".parse().unwrap(), 1300);

        let mut frame = make::tcp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            80,
            81,
            &vec![0u8; 1400 - 20 - 20],
        );
        set_df(&mut frame);

        let Verdict::FragNeeded { dst, message } = encapsulate(&frame, &ctx, BACKBONE_MAC) else {
            panic!("expected FragNeeded");
        };
        assert_eq!(dst, "10.0.0.1".parse::<Ipv4Addr>().unwrap());

        // type 3, code 4, next-hop MTU 1260 at bytes 6..8.
        assert_eq!(message[0], 3);
        assert_eq!(message[1], 4);
        assert_eq!(u16::from_be_bytes([message[6], message[7]]), 1260);
        // Quoted original: header + 8 bytes.
        assert_eq!(message.len(), 8 + 20 + 8);
    }

    /// DF=0 oversize: two fragments whose payloads reassemble exactly, with
    /// correct MF bits, offsets and checksums.
    #[test]
    fn oversize_fragments_correctly() {
        let ctx = ctx(Mode::Normal, PmtudMode::Host);
        ctx.pmtu.update("2001:db8:1::a00:2".parse().unwrap(), 1300);

        let payload = vec![0xAA; 1380];
        let frame = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            7,
            8,
            &payload,
        );
        // total_len = 20 + 8 + 1380 = 1408 > 1300 - 40.

        let Verdict::Forward {
            frames,
            fragmented: true,
            ..
        } = encapsulate(&frame, &ctx, BACKBONE_MAC)
        else {
            panic!("expected fragments");
        };
        assert_eq!(frames.len(), 2);

        let mut reassembled = Vec::new();
        let mut expected_offset = 0u16;

        for (i, out) in frames.iter().enumerate() {
            let last = i == frames.len() - 1;

            let outer = Ipv6View::parse(&out[ETH_HLEN..]).unwrap();
            let inner = Ipv4HeaderSlice::from_slice(outer.payload()).unwrap();

            // Outer length tracks each fragment.
            assert_eq!(outer.payload_length(), inner.total_len());

            // First fragment carries ⌊(1300-40-20)/8⌋*8 = 1240 payload bytes.
            let chunk = &outer.payload()[20..];
            if !last {
                assert_eq!(chunk.len(), 1240);
                assert!(inner.more_fragments());
            } else {
                assert!(!inner.more_fragments());
            }

            assert_eq!(inner.to_header().fragment_offset.value(), expected_offset);
            expected_offset += (chunk.len() / 8) as u16;

            let header = inner.to_header();
            assert_eq!(header.header_checksum, header.calc_header_checksum());

            reassembled.extend_from_slice(chunk);
        }

        // 1240 + 148 = 1388 bytes of L3 payload (UDP header + data).
        assert_eq!(reassembled, frame[ETH_HLEN + 20..].to_vec());
        assert_eq!(frames[1].len() - ETH_HLEN - IPV6_HLEN - 20, 148);
    }

    /// A packet that exactly fits is forwarded unfragmented.
    #[test]
    fn exact_fit_is_not_fragmented() {
        let ctx = ctx(Mode::Normal, PmtudMode::Host);
        ctx.pmtu.update("2001:db8:1::a00:2".parse().unwrap(), 1300);

        // total_len = pmtu - 40 exactly.
        let payload_len = 1300 - 40 - 20 - 8;
        let frame = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            7,
            8,
            &vec![0u8; payload_len],
        );

        let Verdict::Forward {
            fragmented: false, ..
        } = encapsulate(&frame, &ctx, BACKBONE_MAC)
        else {
            panic!("expected unfragmented forward");
        };

        // One byte more fragments into exactly two pieces.
        let frame = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            7,
            8,
            &vec![0u8; payload_len + 1],
        );

        let Verdict::Forward {
            frames,
            fragmented: true,
            ..
        } = encapsulate(&frame, &ctx, BACKBONE_MAC)
        else {
            panic!("expected fragments");
        };
        assert_eq!(frames.len(), 2);
    }

    /// Force-fragment turns a DF=1 oversize packet into fragments with DF
    /// cleared.
    #[test]
    fn force_fragment_overrides_df() {
        let ctx = ctx(Mode::Normal, PmtudMode::Host);
        ctx.pmtu.update("2001:db8:1::a00:2".parse().unwrap(), 1300);
        ctx.force_fragment.store(true, Ordering::Relaxed);

        let mut frame = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            7,
            8,
            &vec![0u8; 1400],
        );
        set_df(&mut frame);

        let Verdict::Forward {
            frames,
            fragmented: true,
            ..
        } = encapsulate(&frame, &ctx, BACKBONE_MAC)
        else {
            panic!("expected fragments");
        };

        for out in &frames {
            let outer = Ipv6View::parse(&out[ETH_HLEN..]).unwrap();
            let inner = Ipv4HeaderSlice::from_slice(outer.payload()).unwrap();
            assert!(!inner.dont_fragment());
        }
    }

    #[test]
    fn broadcast_and_foreign_ethertype_are_dropped() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);

        let mut frame = make::udp4_frame(
            [0xff; 6],
            STUB_MAC,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1,
            2,
            b"x",
        );
        assert!(matches!(
            encapsulate(&frame, &ctx, BACKBONE_MAC),
            Verdict::Drop(DropKind::Broadcast)
        ));

        frame[..6].copy_from_slice(&STUB_MAC);
        // EtherType ARP.
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert!(matches!(
            encapsulate(&frame, &ctx, BACKBONE_MAC),
            Verdict::Drop(DropKind::EtherProto)
        ));
    }

    /// decap(encap(pkt)) == pkt for a well-formed unicast packet.
    #[test]
    fn decap_reverses_encap() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);
        let original = make::udp4_frame(
            STUB_MAC,
            [0x02, 0, 0, 0, 0, 9],
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1000,
            2000,
            b"roundtrip",
        );

        let encapsulated = single_frame(encapsulate(&original, &ctx, BACKBONE_MAC));
        let decapsulated = single_frame(decapsulate(&encapsulated, &ctx, STUB_MAC));

        // The inner IPv4 packet survives byte-for-byte.
        assert_eq!(&decapsulated[ETH_HLEN..], &original[ETH_HLEN..]);

        let eth = EthFrame::parse(&decapsulated).unwrap();
        assert_eq!(eth.ether_type(), EtherType::IPV4);
        assert_eq!(eth.destination(), STUB_MAC);
    }

    #[test]
    fn decap_drops_ttl_one_and_link_local_multicast() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);

        let inner = make::ipv4_packet(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            IpNumber::UDP,
            b"",
        );
        let mut header = Ipv4HeaderSlice::from_slice(&inner).unwrap().to_header();
        header.time_to_live = 1;
        let mut rebuilt = Vec::new();
        header.write(&mut rebuilt).unwrap();
        rebuilt.extend_from_slice(&inner[20..]);

        let frame = wrap_outer(&ctx, &rebuilt);
        assert!(matches!(
            decapsulate(&frame, &ctx, STUB_MAC),
            Verdict::Drop(DropKind::TtlExceeded)
        ));

        let inner = make::ipv4_packet(
            "10.0.0.1".parse().unwrap(),
            "224.0.0.1".parse().unwrap(),
            IpNumber::UDP,
            b"",
        );
        let frame = wrap_outer(&ctx, &inner);
        assert!(matches!(
            decapsulate(&frame, &ctx, STUB_MAC),
            Verdict::Drop(DropKind::LinkLocalMulticast)
        ));
    }

    /// An ICMPv6 Packet-Too-Big surfaces as an MTU update and nothing is
    /// forwarded.
    #[test]
    fn decap_extracts_packet_too_big() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);

        let ptb = make::packet_too_big(
            "2001:db8::9".parse().unwrap(),
            "2001:db8:1::a00:1".parse().unwrap(),
            "2001:db8:1::a00:2".parse().unwrap(),
            1350,
        );
        let mut frame = make::ethernet(BACKBONE_MAC, STUB_MAC, EtherType::IPV6).to_vec();
        frame.extend_from_slice(&ptb);

        let Verdict::MtuUpdate(update) = decapsulate(&frame, &ctx, STUB_MAC) else {
            panic!("expected MTU update");
        };
        assert_eq!(update.mtu, 1350);
        assert_eq!(
            update.original_destination,
            "2001:db8:1::a00:2".parse::<Ipv6Addr>().unwrap()
        );
    }

    /// PR mode drops inbound packets whose outer source is outside the
    /// plane.
    #[test]
    fn pr_reverse_check_guards_decap() {
        let mut ctx = ctx(Mode::PrefixRes, PmtudMode::None);
        ctx.pr_table = Arc::new(
            PrTable::from_specs(
                &[PrRuleSpec {
                    enable: true,
                    v4net: "10.1.2.0".parse().unwrap(),
                    v4cidr: 24,
                    pr_prefix: "2001:db8:bb::".parse().unwrap(),
                    v6cidr: 96,
                }],
                None,
            )
            .unwrap(),
        );

        let inner = make::ipv4_packet(
            "10.1.2.5".parse().unwrap(),
            "10.9.0.1".parse().unwrap(),
            IpNumber::UDP,
            b"",
        );

        // In-plane source passes.
        let frame = wrap_outer_from(&ctx, &inner, "2001:db8:bb::a01:205".parse().unwrap());
        assert!(matches!(
            decapsulate(&frame, &ctx, STUB_MAC),
            Verdict::Forward { .. }
        ));

        // Out-of-plane source is dropped.
        let frame = wrap_outer_from(&ctx, &inner, "2001:db8:cc::a01:205".parse().unwrap());
        assert!(matches!(
            decapsulate(&frame, &ctx, STUB_MAC),
            Verdict::Drop(DropKind::PrReverseCheck)
        ));
    }

    #[test]
    fn decap_drops_unknown_next_header() {
        let ctx = ctx(Mode::Normal, PmtudMode::None);

        // Hand-patch the next-header byte of a valid outer packet to UDP.
        let inner = make::ipv4_packet(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            IpNumber::UDP,
            b"",
        );
        let mut frame = wrap_outer(&ctx, &inner);
        frame[ETH_HLEN + 6] = 17;

        assert!(matches!(
            decapsulate(&frame, &ctx, STUB_MAC),
            Verdict::Drop(DropKind::NextHeader)
        ));
    }

    fn wrap_outer(ctx: &TunnelCtx, inner: &[u8]) -> Vec<u8> {
        wrap_outer_from(ctx, inner, ctx.prefixes.unicast)
    }

    fn wrap_outer_from(
        _ctx: &TunnelCtx,
        inner: &[u8],
        outer_src: Ipv6Addr,
    ) -> Vec<u8> {
        let mut frame = make::ethernet(BACKBONE_MAC, STUB_MAC, EtherType::IPV6).to_vec();
        frame.extend_from_slice(&make::outer_ipv6(
            outer_src,
            "2001:db8:1::1".parse().unwrap(),
            inner.len() as u16,
        ));
        frame.extend_from_slice(inner);
        frame
    }

    /// Flips DF on in a built frame and fixes the IPv4 checksum.
    fn set_df(frame: &mut [u8]) {
        let header_start = ETH_HLEN;
        let mut header = Ipv4HeaderSlice::from_slice(&frame[header_start..])
            .unwrap()
            .to_header();
        header.dont_fragment = true;

        let mut rebuilt = Vec::new();
        header.write(&mut rebuilt).unwrap();
        frame[header_start..header_start + rebuilt.len()].copy_from_slice(&rebuilt);
    }
}
