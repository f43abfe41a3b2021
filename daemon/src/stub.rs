//! The stub-side (child) process.
//!
//! Born from a `clone` into fresh network/UTS/PID/mount namespaces, the
//! child walks the startup handshake with the parent, configures the
//! migrated devices, and then serves its select loop: internal commands,
//! route-sync frames, and signals. The encapsulation hot loop runs on its
//! own worker thread.

use crate::config::{Config, ENCAP_OVERHEAD, TUNNEL_MTU_MAX, TUNNEL_MTU_MIN};
use crate::devices::{self, Device};
use crate::netlink::Netlink;
use crate::pmtu::PmtuCache;
use crate::pr::{PrEntry, PrTable};
use crate::routesync::{self, RouteMirror, RouteSyncMsg};
use crate::stats::Stats;
use crate::tunnel::{Direction, TunnelCtx, Worker};
use crate::{logging, shell, supervisor};
use anyhow::{Context as _, Result, bail};
use control_proto::{ControlSocket, Request};
use nix::sys::select::{FdSet, select};
use nix::sys::signalfd::{SigSet, SignalFd};
use nix::sys::time::TimeVal;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How often the select loop wakes to sweep the PMTU cache.
const REAPER_TICK_SECS: i64 = 60;

/// Everything the child inherits across the clone. The address space is
/// copied, so from here on each side owns an independent replica of all of
/// it except the shared-memory statistics and the socketpair fds.
pub struct StubEnv {
    pub config: Arc<Config>,
    pub prefixes: crate::plane::PlanePrefixes,
    pub pr_table: Arc<PrTable>,
    pub pmtu: Arc<PmtuCache>,
    pub force_fragment: Arc<AtomicBool>,
    pub stats: Arc<Stats>,
    /// Child end of the command socketpair.
    pub command: Arc<ControlSocket>,
    /// Child end of the route-sync socketpair.
    pub route_sync: Arc<ControlSocket>,
    pub route_mirror: Arc<RouteMirror>,
    /// Parent's socket ends, closed immediately after the clone.
    pub parent_fds: Vec<RawFd>,
    pub old_sigmask: SigSet,
    pub stub_tap: Device,
    pub stub_devices: Vec<Device>,
    pub backbone_tap_fd: Arc<OwnedFd>,
    pub backbone_mac: [u8; 6],
}

/// Child entry point; the return value is the process exit code.
pub fn child_main(env: &mut StubEnv) -> isize {
    match run(env) {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!("stub process failed: {error:#}");
            1
        }
    }
}

fn run(env: &mut StubEnv) -> Result<()> {
    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).context("setpgid failed")?;

    let mut signalfd = supervisor::init_child_signals(&env.old_sigmask)?;

    for fd in &env.parent_fds {
        // Safety: these are the parent's socket ends in our copied fd table;
        // the parent's Rust owners live in the parent process.
        unsafe { libc::close(*fd) };
    }

    nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
        .context("prctl(PR_SET_PDEATHSIG) failed")?;

    remount_procfs_if_needed();

    if let Err(error) = nix::unistd::sethostname(&env.config.general.plane_name) {
        tracing::warn!("Failed to set hostname: {error}");
    }

    tracing::debug!("[stub] sending child init end");
    env.command.send(&Request::ChildInitEnd, None)?;

    wait_for(&env.command, &Request::NetdevMoved)?;
    tracing::debug!("[stub] devices arrived");

    // Netlink sockets are namespace-bound; this one sees the stub side.
    let netlink = Netlink::new()?;

    if let Err(error) = configure_stub_network(env, &netlink) {
        env.command.send(&Request::SetupFailure, None)?;
        return Err(error.context("stub network setup failed"));
    }

    tracing::debug!("[stub] network configured");
    env.command.send(&Request::NetworkConfigure, None)?;

    wait_for(&env.command, &Request::StartOperation)?;

    if let Some(script) = &env.config.general.startup_script {
        shell::run_startup_script(script, "stub", &env.config.tunnel.v4_name);
    }

    let worker = Worker {
        direction: Direction::Encap,
        ctx: TunnelCtx {
            mode: env.config.general.mode,
            prefixes: env.prefixes,
            pr_table: env.pr_table.clone(),
            pmtu: env.pmtu.clone(),
            force_fragment: env.force_fragment.clone(),
        },
        read_fd: env
            .stub_tap
            .fd
            .clone()
            .context("stub TAP has no descriptor")?,
        write_fd: env.backbone_tap_fd.clone(),
        mac: env.backbone_mac,
        stats: env.stats.clone(),
        command_socket: None,
    };
    std::thread::Builder::new()
        .name("encap".to_owned())
        .spawn(move || worker.run())
        .context("Failed to spawn the encap worker")?;

    if env.config.general.route_sync {
        let sync_socket = env.route_sync.clone();
        std::thread::Builder::new()
            .name("route-sync".to_owned())
            .spawn(move || routesync::watch_kernel_routes(sync_socket))
            .context("Failed to spawn the route-sync watcher")?;
    }

    let result = mainloop(env, &netlink, &mut signalfd);

    restore_physical_names(env, &netlink);

    result
}

/// Adopted physical devices fall back to the host namespace when this one
/// dies; give them their original names back first so they cannot collide
/// with host-side interfaces.
fn restore_physical_names(env: &StubEnv, netlink: &Netlink) {
    for device in &env.stub_devices {
        if device.kind != devices::DeviceKind::Physical {
            continue;
        }

        let original = env
            .config
            .devices
            .iter()
            .find(|config| config.name == device.name)
            .map(|config| config.physical_name.clone());

        if let Some(original) = original
            && let Err(error) = netlink.rename(device.ifindex, &original)
        {
            tracing::warn!("Failed to restore name of {}: {error:#}", device.name);
        }
    }
}

/// On pre-3.x kernels the inherited /proc still shows the old PID
/// namespace; remount it. Newer kernels handle this through the child's
/// private mount view.
fn remount_procfs_if_needed() {
    let release = nix::sys::utsname::uname()
        .map(|u| u.release().to_string_lossy().into_owned())
        .unwrap_or_default();

    let old_kernel = release
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
        .is_some_and(|major| major < 3);
    if !old_kernel {
        return;
    }

    if let Err(error) = nix::mount::mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        nix::mount::MsFlags::empty(),
        None::<&str>,
    ) {
        tracing::warn!("Failed to remount /proc: {error}");
    }
}

fn wait_for(command: &ControlSocket, expected: &Request) -> Result<()> {
    let frame = command.recv::<Request>()?;

    if frame.msg == Request::SetupFailure {
        bail!("parent reported a setup failure");
    }
    if frame.msg != *expected {
        bail!(
            "handshake out of order: expected code {}, got {}",
            expected.code(),
            frame.msg.code()
        );
    }

    Ok(())
}

/// Renames, addresses and raises every migrated device, the loopback, and
/// the stub TAP.
fn configure_stub_network(env: &mut StubEnv, netlink: &Netlink) -> Result<()> {
    let lo = netlink.link_index("lo")?;
    netlink.set_up(lo)?;

    devices::configure_in_stub(netlink, &env.stub_tap)?;
    env.stub_tap.current_name = env.stub_tap.name.clone();

    for device in &mut env.stub_devices {
        devices::configure_in_stub(netlink, device)
            .with_context(|| format!("Failed to configure {}", device.name))?;
        device.current_name = device.name.clone();
    }

    Ok(())
}

fn mainloop(env: &mut StubEnv, netlink: &Netlink, signalfd: &mut SignalFd) -> Result<()> {
    tracing::info!("stub mainloop start");

    loop {
        let mut readfds = FdSet::new();
        readfds.insert(env.command.as_fd());
        readfds.insert(env.route_sync.as_fd());
        readfds.insert(signalfd.as_fd());
        let mut timeout = TimeVal::new(REAPER_TICK_SECS, 0);

        let ready = match select(None, &mut readfds, None, None, &mut timeout) {
            Ok(ready) => ready,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(error) => {
                tracing::error!("stub mainloop select failed: {error}");
                break;
            }
        };

        if ready == 0 {
            env.pmtu.reap();
            continue;
        }

        let command_ready = readfds.contains(env.command.as_fd());
        let route_sync_ready = readfds.contains(env.route_sync.as_fd());
        let signalfd_ready = readfds.contains(signalfd.as_fd());

        if command_ready {
            match env.command.recv::<Request>() {
                Ok(frame) => handle_command(env, netlink, frame.msg, frame.fd),
                Err(error) => {
                    tracing::error!("command channel failed: {error}");
                    break;
                }
            }
        }

        if route_sync_ready {
            match env.route_sync.recv::<RouteSyncMsg>() {
                Ok(frame) => env.route_mirror.apply(frame.msg),
                Err(error) => tracing::debug!("route sync receive failed: {error}"),
            }
        }

        if signalfd_ready {
            if handle_signal(signalfd) {
                break;
            }
        }
    }

    tracing::info!("stub mainloop end");

    Ok(())
}

/// Returns true when the child should exit.
fn handle_signal(signalfd: &mut SignalFd) -> bool {
    let info = match signalfd.read_signal() {
        Ok(Some(info)) => info,
        _ => return false,
    };

    match info.ssi_signo as i32 {
        libc::SIGINT | libc::SIGTERM | libc::SIGQUIT | libc::SIGHUP => {
            tracing::info!(signo = info.ssi_signo, "stub process exiting on signal");
            true
        }
        libc::SIGCHLD => {
            // Reap finished shells and inet commands.
            while let Ok(status) = waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                match status {
                    nix::sys::wait::WaitStatus::StillAlive => break,
                    status => tracing::debug!(?status, "reaped child"),
                }
            }
            false
        }
        _ => false,
    }
}

fn handle_command(env: &mut StubEnv, netlink: &Netlink, request: Request, fd: Option<OwnedFd>) {
    match request {
        Request::PacketTooBig { dst, mtu } => {
            env.pmtu.update(dst, mtu);
        }

        Request::ShowPmtu => {
            if let Some(fd) = fd {
                let mut out = Vec::new();
                let _ = env.pmtu.render(&mut out);
                write_to(fd.as_fd(), &out);
            }
        }

        Request::ShowPrTable => {
            if let Some(fd) = fd {
                let mut out = Vec::new();
                render_pr_table(&env.pr_table, &mut out);
                write_to(fd.as_fd(), &out);
            }
        }

        Request::ShowRoute => {
            if let Some(fd) = fd {
                let mut out = Vec::new();
                out.extend_from_slice(b"[stub]\n");
                let _ = env.route_mirror.render(&mut out);
                write_to(fd.as_fd(), &out);
            }
        }

        // The stub half of PR mutations: the table only; routes live on the
        // backbone side.
        Request::AddPrEntry(ref spec) => {
            let result = PrEntry::from_spec(spec, env.config.general.plane_id.as_deref())
                .and_then(|entry| env.pr_table.add(entry))
                .map_or_else(|error| error.errno(), |()| 0);
            ack(env, result, None);
        }
        Request::DelPrEntry { v4net, v4cidr } => {
            let result = env
                .pr_table
                .delete(v4net, v4cidr)
                .map_or_else(|error| error.errno(), |_| 0);
            ack(env, result, None);
        }
        Request::DelallPrEntry => {
            env.pr_table.delete_all();
            ack(env, 0, None);
        }
        Request::EnablePrEntry { v4net, v4cidr } => {
            let result = env
                .pr_table
                .set_enable(v4net, v4cidr, true)
                .map_or_else(|error| error.errno(), |_| 0);
            ack(env, result, None);
        }
        Request::DisablePrEntry { v4net, v4cidr } => {
            let result = env
                .pr_table
                .set_enable(v4net, v4cidr, false)
                .map_or_else(|error| error.errno(), |_| 0);
            ack(env, result, None);
        }

        Request::DeviceAdd(spec) => {
            let result = device_add(env, netlink, &spec);
            ack(env, result, None);
        }

        Request::DeviceDel { name } => {
            let target = env
                .stub_devices
                .iter()
                .find(|device| device.name == name)
                .map(|device| (device.kind, device.ifindex));

            let result = match target {
                None => {
                    tracing::info!(%name, "device del: no such stub device");
                    libc::ENODEV
                }
                // Adopted physical interfaces are never destroyed; they fall
                // back to the host namespace at shutdown with their original
                // name.
                Some((devices::DeviceKind::Physical, _)) => {
                    tracing::info!(%name, "device del refused for a physical device");
                    libc::EOPNOTSUPP
                }
                Some((_, ifindex)) => match netlink.delete(ifindex) {
                    Ok(()) => {
                        env.stub_devices.retain(|device| device.name != name);
                        0
                    }
                    Err(error) => {
                        tracing::warn!("device del failed: {error:#}");
                        libc::ENODEV
                    }
                },
            };
            ack(env, result, None);
        }

        Request::SetDebugLog(on) => {
            logging::set_debug(on);
            ack(env, 0, None);
        }

        Request::SetForceFrag(on) => {
            env.force_fragment.store(on, Ordering::Relaxed);
            ack(env, 0, None);
        }

        Request::SetPmtudMode(mode) => {
            env.pmtu.set_mode(mode);
            ack(env, 0, None);
        }

        Request::SetPmtudExptime(secs) => {
            env.pmtu.set_expire_time(secs);
            ack(env, 0, None);
        }

        Request::SetDefaultGw(on) => {
            let result = if on {
                netlink.add_route_v4(env.stub_tap.ifindex, None, None)
            } else {
                netlink.del_route_v4(env.stub_tap.ifindex, None, None)
            };
            let result = match result {
                Ok(()) => 0,
                Err(error) => {
                    tracing::warn!("default gateway change failed: {error:#}");
                    libc::EIO
                }
            };
            ack(env, result, None);
        }

        Request::SetTunnelMtu(mtu) => {
            let result = if (TUNNEL_MTU_MIN..=TUNNEL_MTU_MAX).contains(&mtu) {
                let stub_mtu = u32::from(mtu - ENCAP_OVERHEAD);
                match netlink.set_mtu(env.stub_tap.ifindex, stub_mtu) {
                    Ok(()) => {
                        env.stub_tap.mtu = stub_mtu;
                        env.pmtu.set_default_mtu(mtu);
                        0
                    }
                    Err(error) => {
                        tracing::warn!("tunnel MTU change failed: {error:#}");
                        libc::EIO
                    }
                }
            } else {
                libc::EINVAL
            };
            ack(env, result, None);
        }

        Request::SetDeviceMtu { name, mtu } => {
            let result = match netlink
                .link_index(&name)
                .and_then(|index| netlink.set_mtu(index, mtu))
            {
                Ok(()) => 0,
                Err(error) => {
                    tracing::warn!("device MTU change failed: {error:#}");
                    libc::ENODEV
                }
            };
            ack(env, result, None);
        }

        Request::ExecShell => match shell::spawn_shell() {
            Ok(master) => ack(env, 0, Some(master)),
            Err(error) => {
                tracing::warn!("Failed to spawn shell: {error:#}");
                ack(env, libc::EIO, None);
            }
        },

        Request::ExecInetCmd { argv } => {
            let result = match fd {
                Some(fd) => shell::run_inet_command(&argv, fd),
                None => libc::EINVAL,
            };
            ack(env, result, None);
        }

        // Lifecycle and handshake codes are the parent's business.
        other => {
            tracing::debug!(code = other.code(), "ignoring unexpected command");
        }
    }
}

/// Stub half of `device add`: the macvlan already arrived under its scratch
/// name; give it its operator name and configuration.
fn device_add(env: &mut StubEnv, netlink: &Netlink, spec: &control_proto::DeviceSpec) -> i32 {
    let Some(scratch_name) = &spec.scratch_name else {
        return libc::EINVAL;
    };

    let stub_config = match devices::stub_device_from_spec(spec) {
        Ok(config) => config,
        Err(error) => {
            tracing::info!("device add refused: {error:#}");
            return libc::EINVAL;
        }
    };

    let ifindex = match netlink.link_index(scratch_name) {
        Ok(index) => index,
        Err(error) => {
            tracing::warn!("hot-added device never arrived: {error:#}");
            return libc::ENODEV;
        }
    };

    let mut device = Device {
        kind: devices::DeviceKind::Macvlan,
        name: stub_config.name.clone(),
        current_name: scratch_name.clone(),
        ifindex,
        mtu: stub_config
            .mtu
            .or_else(|| netlink.get_mtu(ifindex).ok())
            .unwrap_or(1500),
        mac: netlink.get_mac(ifindex).unwrap_or([0; 6]),
        ipv4: stub_config
            .ipv4_address
            .map(|addr| (addr.address, addr.prefix_len)),
        ipv4_gateway: stub_config.ipv4_gateway,
        default_gw: false,
        fd: None,
    };

    match devices::configure_in_stub(netlink, &device) {
        Ok(()) => {
            device.current_name = device.name.clone();
            env.stub_devices.push(device);
            0
        }
        Err(error) => {
            tracing::warn!("device add failed: {error:#}");
            libc::EIO
        }
    }
}

fn ack(env: &StubEnv, result: i32, fd: Option<OwnedFd>) {
    let response = Request::OpEnd { result };
    if let Err(error) = env
        .command
        .send(&response, fd.as_ref().map(|fd| fd.as_fd()))
    {
        tracing::error!("Failed to acknowledge command: {error}");
    }
}

fn write_to(fd: BorrowedFd<'_>, bytes: &[u8]) {
    crate::backbone::write_all(fd, bytes);
}

fn render_pr_table(table: &PrTable, out: &mut Vec<u8>) {
    use std::io::Write as _;

    let entries = table.snapshot();
    let _ = writeln!(out, "[prefix resolution] ({} entries)", entries.len());
    for entry in entries {
        let _ = writeln!(out, "  {entry}");
    }
}
