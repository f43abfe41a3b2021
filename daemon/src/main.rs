#![cfg_attr(test, allow(clippy::unwrap_used))]

//! plane46d: carries IPv4 traffic of isolated stub sites across an IPv6
//! backbone by IP-in-IPv6 encapsulation, one daemon per plane.
//!
//! The process splits in two right after device creation: the parent keeps
//! the backbone side of the tunnel in the host namespaces, the clone child
//! owns the stub side in fresh network/UTS/PID/mount namespaces. The two
//! halves share only the statistics segment and two socketpairs.

use crate::backbone::Backbone;
use crate::config::Config;
use crate::devices::Device;
use crate::netlink::Netlink;
use crate::plane::PlanePrefixes;
use crate::pmtu::PmtuCache;
use crate::pr::PrTable;
use crate::routesync::RouteMirror;
use crate::stats::Stats;
use crate::tunnel::{Direction, TunnelCtx, Worker};
use anyhow::{Context as _, Result, bail};
use clap::Parser;
use control_proto::{ControlSocket, Request};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

mod backbone;
mod config;
mod devices;
mod logging;
mod netlink;
mod plane;
mod pmtu;
mod pr;
mod routesync;
mod shell;
mod stats;
mod stub;
mod supervisor;
mod tap;
mod tunnel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    #[expect(clippy::print_stderr, reason = "No logger has been set up yet")]
    if let Err(error) = logging::init(false) {
        eprintln!("failed to initialize logging: {error:#}");
        return ExitCode::FAILURE;
    }

    if !nix::unistd::Uid::current().is_root() {
        tracing::error!("plane46d must run as root to manage namespaces and devices");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => {
            tracing::info!("Goodbye!");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        arch = std::env::consts::ARCH,
        "plane46d starting"
    );

    let config = Arc::new(Config::load(&cli.file)?);
    logging::set_debug(config.general.debug_log);

    if config.general.daemon {
        nix::unistd::daemon(true, false).context("Failed to daemonize")?;
    }

    let (signalfd, old_sigmask) = supervisor::init_parent_signals()?;

    let stats = Arc::new(Stats::attach(&config.path)?);
    let prefixes = PlanePrefixes::from_config(&config)?;
    let pr_table = Arc::new(
        PrTable::from_specs(
            &config.pr_rule_specs(),
            config.general.plane_id.as_deref(),
        )
        .map_err(|error| anyhow::anyhow!("bad pr_rule: {error}"))?,
    );
    let pmtu = Arc::new(PmtuCache::new(
        config.pmtud_mode(),
        config.tunnel.mtu,
        config.pmtud_expire_time(),
    ));
    let force_fragment = Arc::new(AtomicBool::new(config.general.force_fragment));
    let route_mirror = Arc::new(RouteMirror::new(config.general.route_entry_max as usize));

    let netlink = Netlink::new()?;

    let saved_macs = devices::scratch_parent_macs(&config, &netlink)?;
    let (stub_tap, backbone_tap) = devices::create_tunnel_taps(&config, &netlink)?;
    let stub_devices = config
        .devices
        .iter()
        .map(|device| devices::create_stub_device(device, &netlink))
        .collect::<Result<Vec<Device>>>()?;

    let (parent_cmd, child_cmd) = ControlSocket::dgram_pair()?;
    let (parent_sync, child_sync) = ControlSocket::dgram_pair()?;

    // The parent-side tunnel endpoints, taken before the records move into
    // the child's environment.
    let stub_tap_fd = stub_tap.fd.clone().context("stub TAP lost its fd")?;
    let stub_mac = stub_tap.mac;
    let backbone_tap_fd = backbone_tap.fd.clone().context("backbone TAP lost its fd")?;
    let backbone_tap_index = backbone_tap.ifindex;

    let mut child_env = stub::StubEnv {
        config: config.clone(),
        prefixes,
        pr_table: pr_table.clone(),
        pmtu,
        force_fragment: force_fragment.clone(),
        stats: stats.clone(),
        command: Arc::new(child_cmd),
        route_sync: Arc::new(child_sync),
        route_mirror: Arc::new(RouteMirror::new(config.general.route_entry_max as usize)),
        parent_fds: vec![parent_cmd.as_raw_fd(), parent_sync.as_raw_fd()],
        old_sigmask,
        stub_tap,
        stub_devices,
        backbone_tap_fd: backbone_tap_fd.clone(),
        backbone_mac: backbone_tap.mac,
    };

    let child = supervisor::clone_stub_process(|| stub::child_main(&mut child_env))?;
    tracing::info!(pid = %child, "stub namespace process created");

    let setup = parent_setup(
        &parent_cmd,
        &netlink,
        &config,
        &prefixes,
        &pr_table,
        &child_env,
        child,
        backbone_tap_index,
        &saved_macs,
    );
    if let Err(error) = setup {
        let _ = parent_cmd.send(&Request::SetupFailure, None);
        let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGTERM);
        reap_child(child);
        return Err(error);
    }

    // Operation starts now; the child owns its copies of the tables, the
    // parent closes the child's socket ends.
    parent_cmd.send(&Request::StartOperation, None)?;
    drop(child_env);

    let parent_cmd = Arc::new(parent_cmd);
    let parent_sync = Arc::new(parent_sync);

    let worker = Worker {
        direction: Direction::Decap,
        ctx: TunnelCtx {
            mode: config.general.mode,
            prefixes,
            pr_table: pr_table.clone(),
            // The decap path never sizes packets; a disabled cache keeps the
            // type whole.
            pmtu: Arc::new(PmtuCache::new(
                control_proto::PmtudMode::None,
                config.tunnel.mtu,
                config.pmtud_expire_time(),
            )),
            force_fragment: force_fragment.clone(),
        },
        read_fd: backbone_tap_fd,
        write_fd: stub_tap_fd,
        mac: stub_mac,
        stats: stats.clone(),
        command_socket: Some(parent_cmd.clone()),
    };
    std::thread::Builder::new()
        .name("decap".to_owned())
        .spawn(move || worker.run())
        .context("Failed to spawn the decap worker")?;

    if config.general.route_sync {
        let sync_socket = parent_sync.clone();
        std::thread::Builder::new()
            .name("route-sync".to_owned())
            .spawn(move || routesync::watch_kernel_routes(sync_socket))
            .context("Failed to spawn the route-sync watcher")?;
    }

    let mut mainloop = Backbone {
        config: config.clone(),
        netlink,
        prefixes,
        pr_table,
        force_fragment,
        stats: stats.clone(),
        command: parent_cmd,
        route_sync: parent_sync,
        route_mirror,
        signalfd,
        child,
        backbone_tap_index,
    };
    mainloop.run()?;

    reap_child(child);
    stats.mark_for_removal();

    tracing::info!("plane46d finished");

    if supervisor::restart_requested() {
        supervisor::exec_restart()?;
    }

    Ok(())
}

/// The parent's half of the startup handshake: wait for the child, migrate
/// the stub devices, configure the backbone network.
fn parent_setup(
    parent_cmd: &ControlSocket,
    netlink: &Netlink,
    config: &Config,
    prefixes: &PlanePrefixes,
    pr_table: &PrTable,
    child_env: &stub::StubEnv,
    child: Pid,
    backbone_tap_index: u32,
    saved_macs: &[(u32, [u8; 6])],
) -> Result<()> {
    parent_wait(parent_cmd, &Request::ChildInitEnd)?;
    tracing::debug!("[backbone] child initialized");

    let move_list: Vec<&Device> = std::iter::once(&child_env.stub_tap)
        .chain(child_env.stub_devices.iter())
        .collect();
    devices::move_to_child(netlink, &move_list, child.as_raw() as u32)?;

    parent_cmd.send(&Request::NetdevMoved, None)?;
    parent_wait(parent_cmd, &Request::NetworkConfigure)?;
    tracing::debug!("[backbone] stub network configured");

    devices::restore_parent_macs(netlink, saved_macs)?;

    if let Some(script) = &config.general.startup_script {
        shell::run_startup_script(script, "backbone", &config.tunnel.name);
    }

    setup_backbone_network(netlink, config, prefixes, pr_table, backbone_tap_index)?;

    Ok(())
}

/// Raises the backbone TAP and routes this plane's prefixes into it.
fn setup_backbone_network(
    netlink: &Netlink,
    config: &Config,
    prefixes: &PlanePrefixes,
    pr_table: &PrTable,
    tap_index: u32,
) -> Result<()> {
    netlink.set_up(tap_index)?;

    if let Some(address) = config.tunnel.ipv6_address {
        netlink.add_addr(tap_index, address.address.into(), address.prefix_len)?;
    }

    match config.general.mode {
        control_proto::Mode::Normal => {
            netlink.add_route_v6(tap_index, (prefixes.unicast, 96), None)?;
            if let Some(multicast) = prefixes.multicast {
                netlink.add_route_v6(tap_index, (multicast, 96), None)?;
            }
        }
        // Address sharing embeds the IPv4 from bit 80 on.
        control_proto::Mode::AddrSharing => {
            netlink.add_route_v6(tap_index, (prefixes.unicast, 80), None)?;
            if let Some(multicast) = prefixes.multicast {
                netlink.add_route_v6(tap_index, (multicast, 80), None)?;
            }
        }
        control_proto::Mode::PrefixRes => {
            for entry in pr_table.snapshot() {
                if !entry.enable {
                    continue;
                }
                netlink.add_route_v6(
                    tap_index,
                    (entry.prefix_with_plane, 96 + entry.v4cidr),
                    None,
                )?;
            }
        }
    }

    Ok(())
}

fn parent_wait(parent_cmd: &ControlSocket, expected: &Request) -> Result<()> {
    let frame = parent_cmd.recv::<Request>()?;

    if frame.msg == Request::SetupFailure {
        bail!("stub process reported a setup failure");
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

fn reap_child(child: Pid) {
    tracing::debug!("waiting for the stub process");

    loop {
        match waitpid(child, None) {
            Ok(status) => {
                tracing::info!(?status, "stub process reaped");
                break;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(error) => {
                tracing::warn!("waitpid failed: {error}");
                break;
            }
        }
    }
}
