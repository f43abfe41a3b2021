//! Route synchronization across the namespace boundary.
//!
//! Each namespace watches its own kernel routing table through a netlink
//! subscription and forwards every change over the dedicated socketpair.
//! The peer keeps the received routes in a bounded mirror table, which is
//! what `show route` prints. Writing mirrored routes back into the peer
//! kernel is the route-sync collaborator's job, not ours; the interface is
//! the socketpair and the frame format below.

use control_proto::ControlSocket;
use futures::StreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOp {
    Add,
    Del,
}

/// One mirrored route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub dst: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub ifindex: u32,
}

/// The frame exchanged over the route-sync socketpair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSyncMsg {
    pub op: RouteOp,
    pub route: RouteRecord,
}

/// The peer namespace's routing table as far as we have been told.
pub struct RouteMirror {
    entries: Mutex<Vec<RouteRecord>>,
    capacity: usize,
}

impl RouteMirror {
    pub fn new(capacity: usize) -> RouteMirror {
        RouteMirror {
            entries: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn apply(&self, msg: RouteSyncMsg) {
        let mut entries = self.entries.lock();

        match msg.op {
            RouteOp::Add => {
                if entries.iter().any(|route| *route == msg.route) {
                    return;
                }
                if entries.len() >= self.capacity {
                    tracing::info!("Route mirror full, ignoring new route");
                    return;
                }
                entries.push(msg.route);
            }
            RouteOp::Del => {
                entries.retain(|route| *route != msg.route);
            }
        }
    }

    pub fn render(&self, out: &mut impl Write) -> std::io::Result<()> {
        let entries = self.entries.lock();

        writeln!(out, "[peer routes] ({} entries)", entries.len())?;
        for route in entries.iter() {
            match route.gateway {
                Some(gateway) => writeln!(
                    out,
                    "  {}/{} via {} ifindex {}",
                    route.dst, route.prefix_len, gateway, route.ifindex
                )?,
                None => writeln!(
                    out,
                    "  {}/{} ifindex {}",
                    route.dst, route.prefix_len, route.ifindex
                )?,
            }
        }

        Ok(())
    }
}

fn record_from_message(message: &RouteMessage) -> Option<RouteRecord> {
    let mut dst = None;
    let mut gateway = None;
    let mut ifindex = 0;

    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => dst = Some(IpAddr::V4(*addr)),
            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                dst = Some(IpAddr::V6(*addr))
            }
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => {
                gateway = Some(IpAddr::V4(*addr))
            }
            RouteAttribute::Gateway(RouteAddress::Inet6(addr)) => {
                gateway = Some(IpAddr::V6(*addr))
            }
            RouteAttribute::Oif(index) => ifindex = *index,
            _ => {}
        }
    }

    Some(RouteRecord {
        dst: dst?,
        prefix_len: message.header.destination_prefix_length,
        gateway,
        ifindex,
    })
}

/// Watches this namespace's routing table and forwards every change to the
/// peer. Runs until the netlink subscription or the socketpair dies.
pub fn watch_kernel_routes(sync_socket: Arc<ControlSocket>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("Failed to create route-sync runtime: {error}");
            return;
        }
    };

    runtime.block_on(async move {
        use netlink_sys::AsyncSocket;

        let Ok((mut conn, _handle, mut messages)) = rtnetlink::new_connection() else {
            tracing::error!("Failed to open route-sync netlink socket");
            return;
        };

        let groups = (libc::RTMGRP_IPV4_ROUTE | libc::RTMGRP_IPV6_ROUTE) as u32;
        if let Err(error) = conn
            .socket_mut()
            .socket_mut()
            .bind(&netlink_sys::SocketAddr::new(0, groups))
        {
            tracing::error!("Failed to subscribe to route changes: {error}");
            return;
        }

        tokio::spawn(conn);
        tracing::info!("route sync watcher started");

        while let Some((message, _addr)) = messages.next().await {
            let NetlinkPayload::InnerMessage(inner) = message.payload else {
                continue;
            };

            let (op, route) = match &inner {
                RouteNetlinkMessage::NewRoute(route) => (RouteOp::Add, route),
                RouteNetlinkMessage::DelRoute(route) => (RouteOp::Del, route),
                _ => continue,
            };

            let Some(record) = record_from_message(route) else {
                continue;
            };

            let msg = RouteSyncMsg { op, route: record };
            if let Err(error) = sync_socket.send(&msg, None) {
                tracing::debug!("Failed to forward route change: {error}");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dst: &str, prefix_len: u8) -> RouteRecord {
        RouteRecord {
            dst: dst.parse().unwrap(),
            prefix_len,
            gateway: None,
            ifindex: 3,
        }
    }

    #[test]
    fn mirror_add_del_roundtrip() {
        let mirror = RouteMirror::new(16);

        mirror.apply(RouteSyncMsg {
            op: RouteOp::Add,
            route: route("10.1.0.0", 16),
        });
        mirror.apply(RouteSyncMsg {
            op: RouteOp::Add,
            route: route("10.1.0.0", 16),
        });

        let mut out = Vec::new();
        mirror.render(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("(1 entries)"));

        mirror.apply(RouteSyncMsg {
            op: RouteOp::Del,
            route: route("10.1.0.0", 16),
        });

        let mut out = Vec::new();
        mirror.render(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("(0 entries)"));
    }

    #[test]
    fn mirror_is_bounded() {
        let mirror = RouteMirror::new(2);

        for i in 0..4u8 {
            mirror.apply(RouteSyncMsg {
                op: RouteOp::Add,
                route: route(&format!("10.{i}.0.0"), 16),
            });
        }

        let mut out = Vec::new();
        mirror.render(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("(2 entries)"));
    }
}
