//! Plane prefixes and the mapping from inner IPv4 addresses to outer IPv6
//! tunnel addresses.
//!
//! A plane prefix is the configured IPv6 prefix overlaid onto a base address
//! carrying the plane id in hextets 5..=6 (`::<plane_id>:0:0`). The bits
//! below the prefix keep the plane id; the low 32 bits stay zero until a
//! packet's IPv4 address is embedded at encap time.

use crate::config::Config;
use crate::pr::PrTable;
use anyhow::{Context as _, Result, bail};
use control_proto::Mode;
use std::net::{Ipv4Addr, Ipv6Addr};
use tap_frame::{IpNumber, Ipv4View, is_link_local_multicast, is_ipv4_multicast};

/// Overlays the first `prefix_len` bits of `prefix` onto `::<plane_id>:0:0`.
pub fn compose_plane_prefix(
    prefix: Ipv6Addr,
    prefix_len: u8,
    plane_id: Option<&str>,
) -> Result<Ipv6Addr> {
    if prefix_len > 128 {
        bail!("prefix length {prefix_len} out of range");
    }

    let mut out = match plane_id {
        Some(id) => format!("::{id}:0:0")
            .parse::<Ipv6Addr>()
            .with_context(|| format!("plane id {id:?} does not form a valid address"))?
            .octets(),
        None => [0u8; 16],
    };

    let src = prefix.octets();
    let mut remaining = prefix_len;
    for i in 0..16 {
        if remaining == 0 {
            break;
        }
        if remaining >= 8 {
            out[i] = src[i];
            remaining -= 8;
        } else {
            let keep = 0xffu8 << (8 - remaining);
            out[i] = (src[i] & keep) | (out[i] & !keep);
            break;
        }
    }

    Ok(Ipv6Addr::from(out))
}

/// The three plane prefixes of one daemon instance, plane id applied.
#[derive(Debug, Clone, Copy)]
pub struct PlanePrefixes {
    pub unicast: Ipv6Addr,
    /// Source prefix for outer headers in PR mode.
    pub pr_source: Option<Ipv6Addr>,
    pub multicast: Option<Ipv6Addr>,
}

impl PlanePrefixes {
    pub fn from_config(config: &Config) -> Result<PlanePrefixes> {
        let plane_id = config.general.plane_id.as_deref();

        let unicast = compose_plane_prefix(
            config.general.unicast_prefix.network_address(),
            config.general.unicast_prefix.netmask(),
            plane_id,
        )
        .context("bad unicast_prefix")?;

        let pr_source = config
            .general
            .src_addr_unicast_prefix
            .map(|prefix| {
                compose_plane_prefix(prefix.network_address(), prefix.netmask(), plane_id)
            })
            .transpose()
            .context("bad src_addr_unicast_prefix")?;

        let multicast = config
            .general
            .multicast_prefix
            .map(|prefix| {
                compose_plane_prefix(prefix.network_address(), prefix.netmask(), plane_id)
            })
            .transpose()
            .context("bad multicast_prefix")?;

        Ok(PlanePrefixes {
            unicast,
            pr_source,
            multicast,
        })
    }
}

/// Embeds an IPv4 address in the low 32 bits of a prefix.
pub fn embed_v4(prefix: Ipv6Addr, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[12..16].copy_from_slice(&v4.octets());

    Ipv6Addr::from(octets)
}

/// Address-sharing layout: prefix in bits 0..80, IPv4 in 80..112, L4 port in
/// 112..128.
pub fn embed_v4_port(prefix: Ipv6Addr, v4: Ipv4Addr, port: u16) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[10..14].copy_from_slice(&v4.octets());
    octets[14..16].copy_from_slice(&port.to_be_bytes());

    Ipv6Addr::from(octets)
}

/// Why the mapper refused a packet. Each reason has its own counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDrop {
    LinkLocalMulticast,
    PrMulticast,
    PrLookupFailure,
    AsFragment,
    AsUnsupportedProtocol,
}

/// The outer addresses for one inner packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    Unicast { src: Ipv6Addr, dst: Ipv6Addr },
    Multicast { src: Ipv6Addr, dst: Ipv6Addr },
    Drop(MapDrop),
}

/// Computes the outer IPv6 source and destination for an inner IPv4 packet.
pub fn map_outer(
    mode: Mode,
    prefixes: &PlanePrefixes,
    pr_table: &PrTable,
    inner: &Ipv4View<'_>,
) -> MapOutcome {
    let saddr = inner.source();
    let daddr = inner.destination();
    let multicast = is_ipv4_multicast(daddr);

    if multicast {
        if mode == Mode::PrefixRes {
            return MapOutcome::Drop(MapDrop::PrMulticast);
        }
        if is_link_local_multicast(daddr) {
            return MapOutcome::Drop(MapDrop::LinkLocalMulticast);
        }
    }

    match mode {
        Mode::Normal => {
            let src = embed_v4(prefixes.unicast, saddr);
            match (multicast, prefixes.multicast) {
                (true, Some(mcast)) => MapOutcome::Multicast {
                    src,
                    dst: embed_v4(mcast, daddr),
                },
                // Validated at startup; a missing multicast prefix cannot
                // forward multicast.
                (true, None) => MapOutcome::Drop(MapDrop::LinkLocalMulticast),
                (false, _) => MapOutcome::Unicast {
                    src,
                    dst: embed_v4(prefixes.unicast, daddr),
                },
            }
        }

        Mode::AddrSharing => {
            if inner.is_fragment() {
                return MapOutcome::Drop(MapDrop::AsFragment);
            }
            let protocol = inner.protocol();
            if protocol != IpNumber::TCP && protocol != IpNumber::UDP {
                return MapOutcome::Drop(MapDrop::AsUnsupportedProtocol);
            }
            let Some((sport, dport)) = inner.transport_ports() else {
                return MapOutcome::Drop(MapDrop::AsUnsupportedProtocol);
            };

            let src = embed_v4_port(prefixes.unicast, saddr, sport);
            match (multicast, prefixes.multicast) {
                (true, Some(mcast)) => MapOutcome::Multicast {
                    src,
                    dst: embed_v4_port(mcast, daddr, dport),
                },
                (true, None) => MapOutcome::Drop(MapDrop::LinkLocalMulticast),
                (false, _) => MapOutcome::Unicast {
                    src,
                    dst: embed_v4_port(prefixes.unicast, daddr, dport),
                },
            }
        }

        Mode::PrefixRes => {
            let Some(entry) = pr_table.lookup_by_dst(daddr) else {
                return MapOutcome::Drop(MapDrop::PrLookupFailure);
            };
            let source_prefix = prefixes.pr_source.unwrap_or(prefixes.unicast);

            MapOutcome::Unicast {
                src: embed_v4(source_prefix, saddr),
                dst: embed_v4(entry.prefix_with_plane, daddr),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_proto::PrRuleSpec;
    use tap_frame::make;

    fn prefixes() -> PlanePrefixes {
        PlanePrefixes {
            unicast: compose_plane_prefix("2001:db8:1::".parse().unwrap(), 48, Some("0:0"))
                .unwrap(),
            pr_source: None,
            multicast: Some(
                compose_plane_prefix("ff0e:db8:1::".parse().unwrap(), 48, Some("0:0")).unwrap(),
            ),
        }
    }

    fn udp_packet(src: &str, dst: &str) -> Vec<u8> {
        let frame = make::udp4_frame(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
            src.parse().unwrap(),
            dst.parse().unwrap(),
            1111,
            2222,
            b"x",
        );
        frame[tap_frame::ETH_HLEN..].to_vec()
    }

    #[test]
    fn plane_id_sits_above_the_low_two_hextets() {
        let composed =
            compose_plane_prefix("2001:db8:1::".parse().unwrap(), 48, Some("12:34")).unwrap();
        assert_eq!(composed, "2001:db8:1:0:12:34:0:0".parse::<Ipv6Addr>().unwrap());

        let single = compose_plane_prefix("2001:db8:1::".parse().unwrap(), 48, Some("a")).unwrap();
        assert_eq!(single, "2001:db8:1::a:0:0".parse::<Ipv6Addr>().unwrap());

        let no_id = compose_plane_prefix("2001:db8:1::".parse().unwrap(), 48, None).unwrap();
        assert_eq!(no_id, "2001:db8:1::".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn partial_byte_prefix_overlay() {
        // A /44 keeps the low nibble of byte 5 from the plane-id base.
        let composed =
            compose_plane_prefix("2001:db8:fff0::".parse().unwrap(), 44, Some("ffff:ffff"))
                .unwrap();
        let octets = composed.octets();
        assert_eq!(&octets[..5], &[0x20, 0x01, 0x0d, 0xb8, 0xff]);
        assert_eq!(octets[5], 0xf0);
        // Plane id survives below the prefix.
        assert_eq!(&octets[8..12], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn normal_unicast_mapping() {
        // Scenario: inner 10.0.0.1 -> 10.0.0.2 under 2001:db8:1::/48.
        let packet = udp_packet("10.0.0.1", "10.0.0.2");
        let view = Ipv4View::parse(&packet).unwrap();

        let outcome = map_outer(Mode::Normal, &prefixes(), &PrTable::new(), &view);
        assert_eq!(
            outcome,
            MapOutcome::Unicast {
                src: "2001:db8:1::a00:1".parse().unwrap(),
                dst: "2001:db8:1::a00:2".parse().unwrap(),
            }
        );
    }

    #[test]
    fn normal_multicast_mapping() {
        let packet = udp_packet("10.0.0.1", "239.1.2.3");
        let view = Ipv4View::parse(&packet).unwrap();

        let outcome = map_outer(Mode::Normal, &prefixes(), &PrTable::new(), &view);
        assert_eq!(
            outcome,
            MapOutcome::Multicast {
                src: "2001:db8:1::a00:1".parse().unwrap(),
                dst: "ff0e:db8:1::ef01:203".parse().unwrap(),
            }
        );
    }

    #[test]
    fn link_local_multicast_dropped_everywhere() {
        let packet = udp_packet("10.0.0.1", "224.0.0.1");
        let view = Ipv4View::parse(&packet).unwrap();

        for mode in [Mode::Normal, Mode::AddrSharing, Mode::PrefixRes] {
            let outcome = map_outer(mode, &prefixes(), &PrTable::new(), &view);
            let expected = if mode == Mode::PrefixRes {
                MapDrop::PrMulticast
            } else {
                MapDrop::LinkLocalMulticast
            };
            assert_eq!(outcome, MapOutcome::Drop(expected), "mode {mode}");
        }
    }

    #[test]
    fn as_mode_embeds_ports() {
        let packet = udp_packet("10.0.0.1", "10.0.0.2");
        let view = Ipv4View::parse(&packet).unwrap();

        let outcome = map_outer(Mode::AddrSharing, &prefixes(), &PrTable::new(), &view);
        let MapOutcome::Unicast { src, dst } = outcome else {
            panic!("expected unicast, got {outcome:?}");
        };

        let src_octets = src.octets();
        assert_eq!(&src_octets[10..14], &[10, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([src_octets[14], src_octets[15]]), 1111);

        let dst_octets = dst.octets();
        assert_eq!(&dst_octets[10..14], &[10, 0, 0, 2]);
        assert_eq!(u16::from_be_bytes([dst_octets[14], dst_octets[15]]), 2222);
    }

    #[test]
    fn as_mode_drops_non_tcp_udp() {
        let packet = make::ipv4_packet(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            IpNumber::IPV6_ICMP,
            b"",
        );
        let view = Ipv4View::parse(&packet).unwrap();

        assert_eq!(
            map_outer(Mode::AddrSharing, &prefixes(), &PrTable::new(), &view),
            MapOutcome::Drop(MapDrop::AsUnsupportedProtocol)
        );
    }

    #[test]
    fn pr_mode_longest_match_and_miss() {
        // Scenario: two enabled entries, 10.1.0.0/16 -> aa and the more
        // specific 10.1.2.0/24 -> bb.
        let table = PrTable::from_specs(
            &[
                PrRuleSpec {
                    enable: true,
                    v4net: "10.1.0.0".parse().unwrap(),
                    v4cidr: 16,
                    pr_prefix: "2001:db8:aa::".parse().unwrap(),
                    v6cidr: 96,
                },
                PrRuleSpec {
                    enable: true,
                    v4net: "10.1.2.0".parse().unwrap(),
                    v4cidr: 24,
                    pr_prefix: "2001:db8:bb::".parse().unwrap(),
                    v6cidr: 96,
                },
            ],
            None,
        )
        .unwrap();

        let mut planes = prefixes();
        planes.pr_source =
            Some(compose_plane_prefix("2001:db8:2::".parse().unwrap(), 48, None).unwrap());

        let packet = udp_packet("10.9.9.9", "10.1.2.5");
        let view = Ipv4View::parse(&packet).unwrap();

        let outcome = map_outer(Mode::PrefixRes, &planes, &table, &view);
        assert_eq!(
            outcome,
            MapOutcome::Unicast {
                src: "2001:db8:2::a09:909".parse().unwrap(),
                dst: "2001:db8:bb::a01:205".parse().unwrap(),
            }
        );

        let packet = udp_packet("10.9.9.9", "192.168.1.1");
        let view = Ipv4View::parse(&packet).unwrap();
        assert_eq!(
            map_outer(Mode::PrefixRes, &planes, &table, &view),
            MapOutcome::Drop(MapDrop::PrLookupFailure)
        );
    }
}
