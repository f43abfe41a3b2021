//! Tunnel and stub-side device records and their lifecycle.
//!
//! The parent creates everything in the host namespace before the clone:
//! both TAPs, plus one macvlan per configured stub device (under a unique
//! scratch name, so host-side names can never collide). After the clone the
//! stub-side devices migrate into the child's namespace, where they are
//! renamed to their operator-chosen names and configured. The kernel reaps
//! all virtual devices when the owning namespace dies.

use crate::config::{Config, ENCAP_OVERHEAD, StubDevice, StubDeviceKind};
use crate::netlink::Netlink;
use crate::tap;
use anyhow::{Context as _, Result};
use control_proto::DeviceSpec;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Locally-administered MAC temporarily given to macvlan parents so the
/// macvlan inherits a deterministic address (driver quirk workaround).
pub const SCRATCH_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0];

static SCRATCH_NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn scratch_name() -> String {
    let n = SCRATCH_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("p46tmp{n}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    TapV4,
    TapV6,
    Macvlan,
    Physical,
}

#[derive(Debug)]
pub struct Device {
    pub kind: DeviceKind,
    /// Operator-chosen name inside the owning namespace.
    pub name: String,
    /// Name the device currently carries (scratch name until the child
    /// renames it).
    pub current_name: String,
    pub ifindex: u32,
    pub mtu: u32,
    pub mac: [u8; 6],
    pub ipv4: Option<(Ipv4Addr, u8)>,
    pub ipv4_gateway: Option<Ipv4Addr>,
    pub default_gw: bool,
    /// TAPs carry the packet fd; shared with the worker thread.
    pub fd: Option<Arc<OwnedFd>>,
}

/// Creates the stub-side and backbone-side TAP pair in the host namespace.
pub fn create_tunnel_taps(config: &Config, netlink: &Netlink) -> Result<(Device, Device)> {
    let tunnel_mtu = u32::from(config.tunnel.mtu);
    let stub_mtu = tunnel_mtu - u32::from(ENCAP_OVERHEAD);

    // The stub TAP starts under a kernel-assigned name; the child renames it
    // once it arrives in the stub namespace.
    let (v4_fd, v4_name) = tap::create_tap("p46v4_%d").context("Failed to create stub TAP")?;
    let v4_index = netlink.link_index(&v4_name)?;
    netlink.set_noarp(v4_index)?;
    netlink.set_mtu(v4_index, stub_mtu)?;
    let v4_mac = netlink.get_mac(v4_index)?;

    let (v6_fd, v6_name) =
        tap::create_tap(&config.tunnel.name).context("Failed to create backbone TAP")?;
    let v6_index = netlink.link_index(&v6_name)?;
    netlink.set_noarp(v6_index)?;
    netlink.set_mtu(v6_index, tunnel_mtu)?;
    let v6_mac = netlink.get_mac(v6_index)?;

    let stub_tap = Device {
        kind: DeviceKind::TapV4,
        name: config.tunnel.v4_name.clone(),
        current_name: v4_name,
        ifindex: v4_index,
        mtu: stub_mtu,
        mac: v4_mac,
        ipv4: config
            .tunnel
            .ipv4_address
            .map(|addr| (addr.address, addr.prefix_len)),
        ipv4_gateway: None,
        default_gw: config.tunnel.ipv4_default_gw,
        fd: Some(Arc::new(v4_fd)),
    };

    let backbone_tap = Device {
        kind: DeviceKind::TapV6,
        name: v6_name.clone(),
        current_name: v6_name,
        ifindex: v6_index,
        mtu: tunnel_mtu,
        mac: v6_mac,
        ipv4: None,
        ipv4_gateway: None,
        default_gw: false,
        fd: Some(Arc::new(v6_fd)),
    };

    Ok((stub_tap, backbone_tap))
}

/// Creates one stub-side device (macvlan or physical adoption) in the host
/// namespace.
pub fn create_stub_device(device: &StubDevice, netlink: &Netlink) -> Result<Device> {
    match device.kind {
        StubDeviceKind::Macvlan => {
            let parent_index = netlink.link_index(&device.physical_name)?;
            let name = scratch_name();

            netlink.create_macvlan(&name, parent_index)?;
            let ifindex = netlink.link_index(&name)?;

            if let Some(hwaddr) = &device.hwaddr {
                let mac = crate::config::parse_mac(hwaddr)?;
                netlink.set_mac(ifindex, mac)?;
            }
            if let Some(mtu) = device.mtu {
                netlink.set_mtu(ifindex, mtu)?;
            }

            Ok(Device {
                kind: DeviceKind::Macvlan,
                name: device.name.clone(),
                current_name: name,
                ifindex,
                mtu: device.mtu.unwrap_or_else(|| {
                    netlink.get_mtu(parent_index).unwrap_or(1500)
                }),
                mac: netlink.get_mac(ifindex)?,
                ipv4: device
                    .ipv4_address
                    .map(|addr| (addr.address, addr.prefix_len)),
                ipv4_gateway: device.ipv4_gateway,
                default_gw: device.default_gw,
                fd: None,
            })
        }

        StubDeviceKind::Physical => {
            let ifindex = netlink.link_index(&device.physical_name)?;

            Ok(Device {
                kind: DeviceKind::Physical,
                name: device.name.clone(),
                current_name: device.physical_name.clone(),
                ifindex,
                mtu: device.mtu.unwrap_or_else(|| netlink.get_mtu(ifindex).unwrap_or(1500)),
                mac: netlink.get_mac(ifindex)?,
                ipv4: device
                    .ipv4_address
                    .map(|addr| (addr.address, addr.prefix_len)),
                ipv4_gateway: device.ipv4_gateway,
                default_gw: device.default_gw,
                fd: None,
            })
        }
    }
}

/// Builds a hot-added device's config record from a `device add` request.
pub fn stub_device_from_spec(spec: &DeviceSpec) -> Result<StubDevice> {
    let physical_name = spec
        .physical_name
        .clone()
        .context("device add requires a physical device name")?;
    let name = spec
        .virtual_name
        .clone()
        .context("device add requires a virtual device name")?;

    Ok(StubDevice {
        kind: StubDeviceKind::Macvlan,
        name,
        physical_name,
        ipv4_address: match (spec.ipv4_address, spec.ipv4_prefixlen) {
            (Some(address), Some(prefix_len)) => {
                anyhow::ensure!(prefix_len <= 32, "bad IPv4 prefix length");
                Some(crate::config::Ipv4WithPrefix {
                    address,
                    prefix_len,
                })
            }
            _ => None,
        },
        ipv4_gateway: spec.ipv4_gateway,
        default_gw: false,
        hwaddr: spec.hwaddr.map(|mac| {
            mac.iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":")
        }),
        mtu: spec.mtu,
    })
}

/// Moves every stub-side device (the v4 TAP, macvlans, physicals) into the
/// child's network namespace.
pub fn move_to_child(netlink: &Netlink, devices: &[&Device], child_pid: u32) -> Result<()> {
    for device in devices {
        netlink
            .move_to_netns(device.ifindex, child_pid)
            .with_context(|| format!("Failed to move {} to the stub namespace", device.current_name))?;
    }

    Ok(())
}

/// Child-side configuration of one migrated device: operator name, address,
/// MTU, up, and routes. Interface indexes survive the namespace move, but a
/// fresh netlink socket inside the child is required to reach them.
pub fn configure_in_stub(netlink: &Netlink, device: &Device) -> Result<()> {
    if device.current_name != device.name {
        netlink.rename(device.ifindex, &device.name)?;
    }

    if let Some((addr, prefix_len)) = device.ipv4 {
        netlink.add_addr(device.ifindex, addr.into(), prefix_len)?;
    }

    netlink.set_mtu(device.ifindex, device.mtu)?;
    netlink.set_up(device.ifindex)?;

    if let Some(gateway) = device.ipv4_gateway {
        netlink.add_route_v4(device.ifindex, None, Some(gateway))?;
    }
    if device.default_gw {
        netlink.add_route_v4(device.ifindex, None, None)?;
    }

    Ok(())
}

/// Applies the temporary locally-administered MAC to each macvlan parent,
/// returning the original addresses for later restoration.
pub fn scratch_parent_macs(
    config: &Config,
    netlink: &Netlink,
) -> Result<Vec<(u32, [u8; 6])>> {
    let mut saved = Vec::new();

    if !config.general.macvlan_mac_workaround {
        return Ok(saved);
    }

    for device in &config.devices {
        if device.kind != StubDeviceKind::Macvlan {
            continue;
        }

        let parent_index = netlink.link_index(&device.physical_name)?;
        if saved.iter().any(|(index, _)| *index == parent_index) {
            continue;
        }

        let original = netlink.get_mac(parent_index)?;
        netlink.set_mac(parent_index, SCRATCH_MAC)?;
        saved.push((parent_index, original));
    }

    Ok(saved)
}

/// Restores the addresses saved by [`scratch_parent_macs`].
pub fn restore_parent_macs(netlink: &Netlink, saved: &[(u32, [u8; 6])]) -> Result<()> {
    for (index, mac) in saved {
        netlink.set_mac(*index, *mac)?;
    }

    Ok(())
}
