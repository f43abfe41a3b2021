//! Blocking facade over rtnetlink.
//!
//! Each process owns one netlink connection driven by a private tokio
//! runtime; every operation is a `block_on` of the async request. A netlink
//! socket is bound to the network namespace it was created in, so the child
//! opens its own facade after the clone.
//!
//! `EEXIST` on add and `ESRCH`/`ENOENT` on delete are logged at info level
//! and treated as success; any other error fails the operation.

use anyhow::{Context as _, Result};
use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::RouteScope;
use rtnetlink::{Error::NetlinkError, Handle};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `MACVLAN_MODE_PRIVATE` from linux/if_link.h.
const MACVLAN_MODE_PRIVATE: u32 = 1;

pub struct Netlink {
    rt: tokio::runtime::Runtime,
    handle: Handle,
}

impl Netlink {
    pub fn new() -> Result<Netlink> {
        // Current-thread on purpose: the parent must not carry OS threads
        // across the namespace clone. The connection task advances inside
        // every block_on.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create netlink runtime")?;

        let handle = rt.block_on(async {
            let (conn, handle, _) =
                rtnetlink::new_connection().context("Failed to open netlink socket")?;
            tokio::spawn(conn);

            anyhow::Ok(handle)
        })?;

        Ok(Netlink { rt, handle })
    }

    pub fn link_index(&self, name: &str) -> Result<u32> {
        let link = self
            .rt
            .block_on(
                self.handle
                    .link()
                    .get()
                    .match_name(name.to_owned())
                    .execute()
                    .try_next(),
            )
            .with_context(|| format!("No such device: {name}"))?
            .with_context(|| format!("No such device: {name}"))?;

        Ok(link.header.index)
    }

    pub fn get_mac(&self, index: u32) -> Result<[u8; 6]> {
        let link = self
            .rt
            .block_on(
                self.handle
                    .link()
                    .get()
                    .match_index(index)
                    .execute()
                    .try_next(),
            )?
            .with_context(|| format!("No device with index {index}"))?;

        let address = link
            .attributes
            .iter()
            .find_map(|attr| match attr {
                LinkAttribute::Address(address) => Some(address.clone()),
                _ => None,
            })
            .with_context(|| format!("Device {index} has no hardware address"))?;

        <[u8; 6]>::try_from(address.as_slice())
            .map_err(|_| anyhow::anyhow!("Device {index} has a non-Ethernet address"))
    }

    pub fn get_mtu(&self, index: u32) -> Result<u32> {
        let link = self
            .rt
            .block_on(
                self.handle
                    .link()
                    .get()
                    .match_index(index)
                    .execute()
                    .try_next(),
            )?
            .with_context(|| format!("No device with index {index}"))?;

        link.attributes
            .iter()
            .find_map(|attr| match attr {
                LinkAttribute::Mtu(mtu) => Some(*mtu),
                _ => None,
            })
            .with_context(|| format!("Device {index} reports no MTU"))
    }

    pub fn create_macvlan(&self, name: &str, parent_index: u32) -> Result<()> {
        self.rt
            .block_on(
                self.handle
                    .link()
                    .add()
                    .macvlan(name.to_owned(), parent_index, MACVLAN_MODE_PRIVATE)
                    .execute(),
            )
            .or_else(|error| tolerate_exist(error, || format!("macvlan {name} already exists")))
            .with_context(|| format!("Failed to create macvlan {name}"))
    }

    pub fn delete(&self, index: u32) -> Result<()> {
        self.rt
            .block_on(self.handle.link().del(index).execute())
            .or_else(|error| tolerate_missing(error, || format!("device {index} already gone")))
            .with_context(|| format!("Failed to delete device {index}"))
    }

    pub fn move_to_netns(&self, index: u32, pid: u32) -> Result<()> {
        self.rt
            .block_on(
                self.handle
                    .link()
                    .set(index)
                    .setns_by_pid(pid)
                    .execute(),
            )
            .with_context(|| format!("Failed to move device {index} to pid {pid}'s namespace"))
    }

    pub fn rename(&self, index: u32, name: &str) -> Result<()> {
        self.rt
            .block_on(
                self.handle
                    .link()
                    .set(index)
                    .name(name.to_owned())
                    .execute(),
            )
            .with_context(|| format!("Failed to rename device {index} to {name}"))
    }

    pub fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.rt
            .block_on(self.handle.link().set(index).mtu(mtu).execute())
            .with_context(|| format!("Failed to set MTU {mtu} on device {index}"))
    }

    pub fn set_mac(&self, index: u32, mac: [u8; 6]) -> Result<()> {
        self.rt
            .block_on(
                self.handle
                    .link()
                    .set(index)
                    .address(mac.to_vec())
                    .execute(),
            )
            .with_context(|| format!("Failed to set hardware address on device {index}"))
    }

    pub fn set_up(&self, index: u32) -> Result<()> {
        self.rt
            .block_on(self.handle.link().set(index).up().execute())
            .with_context(|| format!("Failed to bring device {index} up"))
    }

    /// Tunnel TAPs never participate in neighbor discovery.
    pub fn set_noarp(&self, index: u32) -> Result<()> {
        self.rt
            .block_on(self.handle.link().set(index).arp(false).execute())
            .with_context(|| format!("Failed to set NOARP on device {index}"))
    }

    pub fn add_addr(&self, index: u32, addr: IpAddr, prefix_len: u8) -> Result<()> {
        self.rt
            .block_on(self.handle.address().add(index, addr, prefix_len).execute())
            .or_else(|error| {
                tolerate_exist(error, || format!("address {addr}/{prefix_len} already set"))
            })
            .with_context(|| format!("Failed to add address {addr}/{prefix_len}"))
    }

    /// Adds a unicast route in the main table. `dst = None` is the default
    /// route.
    pub fn add_route_v4(
        &self,
        index: u32,
        dst: Option<(Ipv4Addr, u8)>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<()> {
        let (dst_addr, dst_len) = dst.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));

        let mut add = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst_addr, dst_len)
            .output_interface(index)
            .scope(RouteScope::Universe);
        if let Some(gateway) = gateway {
            add = add.gateway(gateway);
        }

        self.rt
            .block_on(add.execute())
            .or_else(|error| {
                tolerate_exist(error, || format!("route {dst_addr}/{dst_len} already present"))
            })
            .with_context(|| format!("Failed to add route {dst_addr}/{dst_len}"))
    }

    pub fn del_route_v4(
        &self,
        index: u32,
        dst: Option<(Ipv4Addr, u8)>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<()> {
        let (dst_addr, dst_len) = dst.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));

        let mut add = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst_addr, dst_len)
            .output_interface(index)
            .scope(RouteScope::Universe);
        if let Some(gateway) = gateway {
            add = add.gateway(gateway);
        }

        let message = add.message_mut().clone();
        self.rt
            .block_on(self.handle.route().del(message).execute())
            .or_else(|error| {
                tolerate_missing(error, || format!("route {dst_addr}/{dst_len} already gone"))
            })
            .with_context(|| format!("Failed to delete route {dst_addr}/{dst_len}"))
    }

    pub fn add_route_v6(
        &self,
        index: u32,
        dst: (Ipv6Addr, u8),
        gateway: Option<Ipv6Addr>,
    ) -> Result<()> {
        let mut add = self
            .handle
            .route()
            .add()
            .v6()
            .destination_prefix(dst.0, dst.1)
            .output_interface(index)
            .scope(RouteScope::Universe);
        if let Some(gateway) = gateway {
            add = add.gateway(gateway);
        }

        self.rt
            .block_on(add.execute())
            .or_else(|error| {
                tolerate_exist(error, || format!("route {}/{} already present", dst.0, dst.1))
            })
            .with_context(|| format!("Failed to add route {}/{}", dst.0, dst.1))
    }

    pub fn del_route_v6(
        &self,
        index: u32,
        dst: (Ipv6Addr, u8),
        gateway: Option<Ipv6Addr>,
    ) -> Result<()> {
        let mut add = self
            .handle
            .route()
            .add()
            .v6()
            .destination_prefix(dst.0, dst.1)
            .output_interface(index)
            .scope(RouteScope::Universe);
        if let Some(gateway) = gateway {
            add = add.gateway(gateway);
        }

        let message = add.message_mut().clone();
        self.rt
            .block_on(self.handle.route().del(message).execute())
            .or_else(|error| {
                tolerate_missing(error, || format!("route {}/{} already gone", dst.0, dst.1))
            })
            .with_context(|| format!("Failed to delete route {}/{}", dst.0, dst.1))
    }
}

fn tolerate_exist(
    error: rtnetlink::Error,
    what: impl FnOnce() -> String,
) -> Result<(), rtnetlink::Error> {
    if matches!(&error, NetlinkError(e) if e.raw_code() == -libc::EEXIST) {
        tracing::info!("{}", what());
        return Ok(());
    }

    Err(error)
}

fn tolerate_missing(
    error: rtnetlink::Error,
    what: impl FnOnce() -> String,
) -> Result<(), rtnetlink::Error> {
    if matches!(&error, NetlinkError(e) if matches!(-e.raw_code(), libc::ESRCH | libc::ENOENT)) {
        tracing::info!("{}", what());
        return Ok(());
    }

    Err(error)
}
