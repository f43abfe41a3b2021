//! The backbone-side (parent) main loop.
//!
//! One select over the external CLI listener, the route-sync socket and the
//! signalfd. Mutations are two-phase: the parent validates and applies its
//! backbone-local half, forwards the request over the internal socketpair,
//! and completes the CLI response with the child's `OpEnd` result. Show
//! commands stream either from here or from the child directly into the
//! CLI connection fd.

use crate::config::{Config, TUNNEL_MTU_MAX, TUNNEL_MTU_MIN};
use crate::devices;
use crate::netlink::Netlink;
use crate::plane::PlanePrefixes;
use crate::pr::{PrEntry, PrTable, PrTableError};
use crate::routesync::{RouteMirror, RouteSyncMsg};
use crate::stats::Stats;
use crate::logging;
use crate::supervisor::{self, SignalDisposition};
use anyhow::{Context as _, Result};
use control_proto::{
    ControlSocket, DeviceSpec, Mode, PrRuleSpec, Request, Response, control_socket_name,
};
use nix::sys::select::{FdSet, select};
use nix::sys::signal::Signal;
use nix::sys::signalfd::SignalFd;
use nix::unistd::Pid;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Backbone {
    pub config: Arc<Config>,
    pub netlink: Netlink,
    pub prefixes: PlanePrefixes,
    pub pr_table: Arc<PrTable>,
    pub force_fragment: Arc<AtomicBool>,
    pub stats: Arc<Stats>,
    pub command: Arc<ControlSocket>,
    pub route_sync: Arc<ControlSocket>,
    pub route_mirror: Arc<RouteMirror>,
    pub signalfd: SignalFd,
    pub child: Pid,
    pub backbone_tap_index: u32,
}

impl Backbone {
    /// Runs until the child exits.
    pub fn run(&mut self) -> Result<()> {
        let listener = ControlSocket::listen_abstract(&control_socket_name(
            &self.config.general.plane_name,
        ))
        .context("Failed to bind the control socket")?;

        tracing::info!("backbone mainloop start");

        loop {
            let mut readfds = FdSet::new();
            readfds.insert(listener.as_fd());
            readfds.insert(self.route_sync.as_fd());
            readfds.insert(self.signalfd.as_fd());

            match select(None, &mut readfds, None, None, None) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(error) => {
                    tracing::error!("backbone mainloop select failed: {error}");
                    break;
                }
            }

            let listener_ready = readfds.contains(listener.as_fd());
            let route_sync_ready = readfds.contains(self.route_sync.as_fd());
            let signalfd_ready = readfds.contains(self.signalfd.as_fd());

            if listener_ready {
                match listener.accept() {
                    Ok(conn) => {
                        if let Err(error) = self.handle_cli(conn) {
                            tracing::warn!("CLI request failed: {error:#}");
                        }
                    }
                    Err(error) => tracing::warn!("accept failed: {error}"),
                }
            }

            if route_sync_ready {
                match self.route_sync.recv::<RouteSyncMsg>() {
                    Ok(frame) => self.route_mirror.apply(frame.msg),
                    Err(error) => tracing::debug!("route sync receive failed: {error}"),
                }
            }

            if signalfd_ready {
                if let SignalDisposition::ChildExited =
                    supervisor::handle_parent_signal(&mut self.signalfd, self.child)
                {
                    break;
                }
            }
        }

        tracing::info!("backbone mainloop end");

        Ok(())
    }

    fn handle_cli(&mut self, conn: ControlSocket) -> Result<()> {
        let frame = conn.recv::<Request>()?;

        // Refuse peers that did not convey credentials.
        let Some(creds) = frame.creds else {
            conn.send(&Response::errno(libc::EACCES), None)?;
            return Ok(());
        };
        tracing::debug!(
            code = frame.msg.code(),
            uid = creds.uid(),
            pid = creds.pid(),
            "control request"
        );

        match frame.msg {
            Request::ShowStatistic => {
                conn.send(&Response::OK, None)?;
                let mut out = Vec::new();
                self.stats.counters().render(&mut out)?;
                write_all(conn.as_fd(), &out);
            }

            Request::ShowConf => {
                conn.send(&Response::OK, None)?;
                let mut out = Vec::new();
                render_conf(&self.config, &mut out)?;
                write_all(conn.as_fd(), &out);

                if self.config.general.mode == Mode::PrefixRes {
                    self.command.send(&Request::ShowPrTable, Some(conn.as_fd()))?;
                }
            }

            Request::ShowPmtu => {
                conn.send(&Response::OK, None)?;
                self.command.send(&Request::ShowPmtu, Some(conn.as_fd()))?;
            }

            Request::ShowPrTable => {
                if self.config.general.mode != Mode::PrefixRes {
                    conn.send(&Response::errno(libc::EOPNOTSUPP), None)?;
                    return Ok(());
                }
                conn.send(&Response::OK, None)?;
                self.command.send(&Request::ShowPrTable, Some(conn.as_fd()))?;
            }

            Request::ShowRoute => {
                conn.send(&Response::OK, None)?;
                let mut out = Vec::new();
                out.extend_from_slice(b"[backbone]\n");
                self.route_mirror.render(&mut out)?;
                write_all(conn.as_fd(), &out);
                self.command.send(&Request::ShowRoute, Some(conn.as_fd()))?;
            }

            Request::AddPrEntry(ref spec) => self.pr_mutation(&conn, &frame.msg, |this| {
                this.pr_add(spec)
            })?,
            Request::DelPrEntry { v4net, v4cidr } => {
                self.pr_mutation(&conn, &frame.msg, |this| this.pr_del(v4net, v4cidr))?
            }
            Request::DelallPrEntry => {
                self.pr_mutation(&conn, &frame.msg, |this| {
                    this.pr_delall();
                    Ok(())
                })?
            }
            Request::EnablePrEntry { v4net, v4cidr } => {
                self.pr_mutation(&conn, &frame.msg, |this| {
                    this.pr_set_enable(v4net, v4cidr, true)
                })?
            }
            Request::DisablePrEntry { v4net, v4cidr } => {
                self.pr_mutation(&conn, &frame.msg, |this| {
                    this.pr_set_enable(v4net, v4cidr, false)
                })?
            }

            Request::DeviceAdd(spec) => {
                let result = self.device_add(spec, &conn);
                if let Err(errno) = result {
                    conn.send(&Response::errno(errno), None)?;
                }
            }

            Request::DeviceDel { .. } => {
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetDebugLog(on) => {
                logging::set_debug(on);
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetForceFrag(on) => {
                self.force_fragment.store(on, Ordering::Relaxed);
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetPmtudMode(_) => {
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetPmtudExptime(secs) => {
                if secs < crate::config::PMTU_EXPIRE_MIN {
                    conn.send(&Response::errno(libc::EINVAL), None)?;
                    return Ok(());
                }
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetDefaultGw(_) => {
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetTunnelMtu(mtu) => {
                if !(TUNNEL_MTU_MIN..=TUNNEL_MTU_MAX).contains(&mtu) {
                    conn.send(&Response::errno(libc::EINVAL), None)?;
                    return Ok(());
                }
                if let Err(error) = self.netlink.set_mtu(self.backbone_tap_index, u32::from(mtu))
                {
                    tracing::warn!("Failed to set tunnel MTU: {error:#}");
                    conn.send(&Response::errno(libc::EIO), None)?;
                    return Ok(());
                }
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::SetDeviceMtu { .. } => {
                self.forward_and_finish(&conn, &frame.msg)?;
            }

            Request::ExecShell => {
                self.command.send(&Request::ExecShell, None)?;
                let (result, fd) = self.wait_op_end()?;
                conn.send(&Response::errno(result), fd.as_ref().map(|fd| fd.as_fd()))?;
            }

            Request::ExecInetCmd { .. } => {
                self.command.send(&frame.msg, Some(conn.as_fd()))?;
                let (result, _) = self.wait_op_end()?;
                conn.send(&Response::errno(result), None)?;
            }

            Request::Shutdown => {
                conn.send(&Response::OK, None)?;
                tracing::info!("Shutdown requested");
                let _ = nix::sys::signal::kill(self.child, Signal::SIGTERM);
            }

            Request::Restart => {
                conn.send(&Response::OK, None)?;
                tracing::info!("Restart requested");
                supervisor::request_restart();
                let _ = nix::sys::signal::kill(self.child, Signal::SIGHUP);
            }

            // Internal-only codes arriving from outside.
            _ => {
                conn.send(&Response::errno(libc::EINVAL), None)?;
            }
        }

        Ok(())
    }

    /// Applies the backbone half of a PR mutation, forwards it, and answers
    /// the CLI. PR commands are only meaningful in PR mode.
    fn pr_mutation(
        &mut self,
        conn: &ControlSocket,
        request: &Request,
        apply: impl FnOnce(&mut Self) -> Result<(), PrTableError>,
    ) -> Result<()> {
        if self.config.general.mode != Mode::PrefixRes {
            conn.send(&Response::errno(libc::EOPNOTSUPP), None)?;
            return Ok(());
        }

        if let Err(error) = apply(self) {
            tracing::info!("PR command refused: {error}");
            conn.send(&Response::errno(error.errno()), None)?;
            return Ok(());
        }

        self.command.send(request, None)?;
        let (result, _) = self.wait_op_end()?;
        conn.send(&Response::errno(result), None)?;

        Ok(())
    }

    fn pr_route(entry: &PrEntry) -> (std::net::Ipv6Addr, u8) {
        (entry.prefix_with_plane, 96 + entry.v4cidr)
    }

    fn pr_add(&mut self, spec: &PrRuleSpec) -> Result<(), PrTableError> {
        let entry = PrEntry::from_spec(spec, self.config.general.plane_id.as_deref())?;

        self.pr_table.add(entry.clone())?;

        if entry.enable
            && let Err(error) =
                self.netlink
                    .add_route_v6(self.backbone_tap_index, Self::pr_route(&entry), None)
        {
            tracing::warn!("Failed to install PR route: {error:#}");
        }

        Ok(())
    }

    fn pr_del(&mut self, v4net: Ipv4Addr, v4cidr: u8) -> Result<(), PrTableError> {
        let removed = self.pr_table.delete(v4net, v4cidr)?;

        if removed.enable
            && let Err(error) =
                self.netlink
                    .del_route_v6(self.backbone_tap_index, Self::pr_route(&removed), None)
        {
            tracing::warn!("Failed to remove PR route: {error:#}");
        }

        Ok(())
    }

    /// Empties the table. Route deletions that fail are logged and skipped;
    /// the table still ends up empty.
    fn pr_delall(&mut self) {
        for entry in self.pr_table.delete_all() {
            if !entry.enable {
                continue;
            }
            if let Err(error) =
                self.netlink
                    .del_route_v6(self.backbone_tap_index, Self::pr_route(&entry), None)
            {
                tracing::warn!("Failed to remove PR route: {error:#}");
            }
        }
    }

    fn pr_set_enable(
        &mut self,
        v4net: Ipv4Addr,
        v4cidr: u8,
        enable: bool,
    ) -> Result<(), PrTableError> {
        let (entry, changed) = self.pr_table.set_enable(v4net, v4cidr, enable)?;
        if !changed {
            return Ok(());
        }

        let route = Self::pr_route(&entry);
        let result = if enable {
            self.netlink
                .add_route_v6(self.backbone_tap_index, route, None)
        } else {
            self.netlink
                .del_route_v6(self.backbone_tap_index, route, None)
        };
        if let Err(error) = result {
            tracing::warn!("Failed to update PR route: {error:#}");
        }

        Ok(())
    }

    /// Backbone half of `device add`: create the macvlan next to its parent
    /// and push it into the stub namespace; the stub half renames and
    /// configures it.
    fn device_add(&mut self, mut spec: DeviceSpec, conn: &ControlSocket) -> Result<(), i32> {
        let stub_config = devices::stub_device_from_spec(&spec).map_err(|error| {
            tracing::info!("device add refused: {error:#}");
            libc::EINVAL
        })?;

        let device = devices::create_stub_device(&stub_config, &self.netlink).map_err(|error| {
            tracing::warn!("device add failed: {error:#}");
            libc::EIO
        })?;

        if let Err(error) =
            devices::move_to_child(&self.netlink, &[&device], self.child.as_raw() as u32)
        {
            tracing::warn!("device add failed: {error:#}");
            let _ = self.netlink.delete(device.ifindex);
            return Err(libc::EIO);
        }

        spec.scratch_name = Some(device.current_name.clone());

        let finish = (|| -> Result<i32> {
            self.command.send(&Request::DeviceAdd(spec), None)?;
            let (result, _) = self.wait_op_end()?;
            Ok(result)
        })();

        match finish {
            Ok(result) => {
                let _ = conn.send(&Response::errno(result), None);
                Ok(())
            }
            Err(error) => {
                tracing::warn!("device add failed: {error:#}");
                Err(libc::EIO)
            }
        }
    }

    /// Forwards a request to the child verbatim, passing the CLI fd along
    /// for any streamed output, and relays the child's result.
    fn forward_and_finish(&mut self, conn: &ControlSocket, request: &Request) -> Result<()> {
        self.command.send(request, Some(conn.as_fd()))?;
        let (result, _) = self.wait_op_end()?;
        conn.send(&Response::errno(result), None)?;

        Ok(())
    }

    /// Synchronously waits for the child's `OpEnd` acknowledgement. A child
    /// that fails to answer is a broken pipe; the error propagates to the
    /// CLI caller and the namespaces may diverge (the operator reconciles).
    fn wait_op_end(&mut self) -> Result<(i32, Option<std::os::fd::OwnedFd>)> {
        let frame = self.command.recv::<Request>()?;

        match frame.msg {
            Request::OpEnd { result } => Ok((result, frame.fd)),
            other => {
                anyhow::bail!("expected OpEnd from the stub process, got code {}", other.code())
            }
        }
    }
}

/// Writes the whole buffer, logging rather than failing: the CLI may have
/// gone away mid-stream.
pub fn write_all(fd: BorrowedFd<'_>, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        match nix::unistd::write(fd, bytes) {
            Ok(0) => break,
            Ok(n) => bytes = &bytes[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(error) => {
                tracing::debug!("write to CLI failed: {error}");
                break;
            }
        }
    }
}

/// Renders the running configuration.
pub fn render_conf(config: &Config, out: &mut impl std::io::Write) -> std::io::Result<()> {
    let general = &config.general;

    writeln!(out, "[general]")?;
    writeln!(out, "  mode:            {}", general.mode)?;
    writeln!(out, "  plane_name:      {}", general.plane_name)?;
    writeln!(
        out,
        "  plane_id:        {}",
        general.plane_id.as_deref().unwrap_or("(none)")
    )?;
    writeln!(out, "  unicast_prefix:  {}", general.unicast_prefix)?;
    if let Some(prefix) = &general.src_addr_unicast_prefix {
        writeln!(out, "  src_addr_prefix: {prefix}")?;
    }
    if let Some(prefix) = &general.multicast_prefix {
        writeln!(out, "  multicast:       {prefix}")?;
    }
    writeln!(out, "  debug_log:       {}", general.debug_log)?;
    writeln!(out, "  force_fragment:  {}", general.force_fragment)?;
    writeln!(out, "  route_sync:      {}", general.route_sync)?;

    writeln!(out, "[tunnel]")?;
    writeln!(out, "  backbone device: {}", config.tunnel.name)?;
    writeln!(out, "  stub device:     {}", config.tunnel.v4_name)?;
    writeln!(out, "  mtu:             {}", config.tunnel.mtu)?;

    writeln!(out, "[pmtud]")?;
    writeln!(out, "  mode:            {}", config.pmtud_mode())?;
    writeln!(out, "  expire_time:     {}s", config.pmtud_expire_time())?;

    for device in &config.devices {
        writeln!(out, "[device {}]", device.name)?;
        writeln!(out, "  physical:        {}", device.physical_name)?;
        if let Some(address) = device.ipv4_address {
            writeln!(out, "  ipv4:            {address}")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conf_rendering_covers_the_snapshot() {
        let mut config: Config = toml::from_str(
            r#"
            [general]
            mode = "prefix_res"
            plane_name = "plane0"
            plane_id = "12:34"
            unicast_prefix = "2001:db8:1::/48"
            src_addr_unicast_prefix = "2001:db8:2::/48"

            [tunnel]
            name = "p46bb0"
            v4_name = "p46stub0"

            [[device]]
            kind = "macvlan"
            name = "site0"
            physical_name = "eth1"
            ipv4_address = "10.1.2.1/24"

            [[pr_rule]]
            v4_network = "10.1.0.0/16"
            pr_prefix = "2001:db8:aa::/64"
            "#,
        )
        .unwrap();
        config.path = "/etc/plane46/plane0.toml".into();

        let mut out = Vec::new();
        render_conf(&config, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("mode:            pr"));
        assert!(text.contains("plane_id:        12:34"));
        assert!(text.contains("2001:db8:1::/48"));
        assert!(text.contains("backbone device: p46bb0"));
        assert!(text.contains("[device site0]"));
        assert!(text.contains("10.1.2.1/24"));
    }
}
