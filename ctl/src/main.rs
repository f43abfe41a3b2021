#![cfg_attr(test, allow(clippy::unwrap_used))]
#![expect(
    clippy::print_stdout,
    clippy::print_stderr,
    reason = "A CLI talks on stdio"
)]

//! plane46ctl: control CLI for a running plane46d instance.
//!
//! Connects to the daemon's abstract-namespace control socket, sends one
//! request, prints whatever the daemon streams back, and exits with the
//! daemon's errno-style result code.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use control_proto::{
    ControlSocket, DeviceSpec, PmtudMode, PrRuleSpec, Request, Response, control_socket_name,
};
use ip_network::{Ipv4Network, Ipv6Network};
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, OwnedFd};
use std::process::ExitCode;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Plane name the daemon was started with.
    #[arg(short = 'n', long = "name")]
    plane: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show traffic statistics.
    Stat,
    /// Show the running configuration.
    Conf,
    /// Show the path-MTU cache.
    Pmtu,
    /// Show the synchronized routing tables of both namespaces.
    Route,
    /// Manage the prefix-resolution table.
    Pr {
        #[command(subcommand)]
        action: PrAction,
    },
    /// Manage stub-side devices.
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Change a runtime setting.
    Set {
        #[command(subcommand)]
        action: SetAction,
    },
    /// Run a command inside the stub namespace.
    Exec {
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Open an interactive shell inside the stub namespace.
    Shell,
    /// Stop the daemon.
    Shutdown,
    /// Restart the daemon in place.
    Restart,
}

#[derive(Subcommand, Debug)]
enum PrAction {
    /// List the table.
    Show,
    /// Add a rule mapping an IPv4 network to an IPv6 prefix.
    Add {
        v4_network: Ipv4Network,
        pr_prefix: Ipv6Network,
        /// Install the rule disabled.
        #[arg(long)]
        disable: bool,
    },
    /// Delete one rule.
    Del { v4_network: Ipv4Network },
    /// Delete every rule.
    Delall,
    Enable { v4_network: Ipv4Network },
    Disable { v4_network: Ipv4Network },
}

#[derive(Subcommand, Debug)]
enum DeviceAction {
    /// Attach a new macvlan to the stub namespace.
    Add {
        /// Host-side parent interface.
        physical: String,
        /// Name inside the stub namespace.
        name: String,
        /// Interface address, e.g. 10.1.2.1/24.
        #[arg(long)]
        ipv4: Option<AddrArg>,
        #[arg(long)]
        gateway: Option<Ipv4Addr>,
        #[arg(long)]
        mtu: Option<u32>,
    },
    /// Remove a stub-side device.
    Del { name: String },
}

#[derive(Subcommand, Debug)]
enum SetAction {
    DebugLog { state: Toggle },
    ForceFrag { state: Toggle },
    PmtudMode { mode: PmtudModeArg },
    PmtudExptime { seconds: u16 },
    DefaultGw { state: Toggle },
    TunnelMtu { mtu: u16 },
    DeviceMtu { name: String, mtu: u32 },
}

/// An interface address with prefix length; host bits are allowed.
#[derive(Clone, Copy, Debug)]
struct AddrArg {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl FromStr for AddrArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix_len) = s
            .split_once('/')
            .with_context(|| format!("{s:?} is missing a prefix length"))?;
        let prefix_len: u8 = prefix_len.parse().context("bad prefix length")?;
        anyhow::ensure!(prefix_len <= 32, "prefix length out of range");

        Ok(AddrArg {
            address: address.parse().context("bad address")?,
            prefix_len,
        })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> bool {
        matches!(toggle, Toggle::On)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PmtudModeArg {
    None,
    Tunnel,
    Host,
}

impl From<PmtudModeArg> for PmtudMode {
    fn from(mode: PmtudModeArg) -> PmtudMode {
        match mode {
            PmtudModeArg::None => PmtudMode::None,
            PmtudModeArg::Tunnel => PmtudMode::Tunnel,
            PmtudModeArg::Host => PmtudMode::Host,
        }
    }
}

fn main() -> ExitCode {
    // Usage errors exit with EINVAL, matching the daemon's convention.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(libc::EINVAL as u8);
        }
    };

    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(errno) => {
            eprintln!(
                "error: {}",
                std::io::Error::from_raw_os_error(errno)
            );
            ExitCode::from(errno.clamp(0, 255) as u8)
        }
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let request = build_request(&cli.command);
    let interactive = matches!(cli.command, Command::Shell);

    let conn = ControlSocket::connect_abstract(&control_socket_name(&cli.plane))
        .with_context(|| format!("Is plane46d running for plane {:?}?", cli.plane))?;

    conn.send(&request, None)?;

    let frame = conn.recv::<Response>()?;
    if !frame.msg.is_ok() {
        return Ok(frame.msg.result);
    }

    if interactive {
        let master = frame.fd.context("daemon sent no terminal descriptor")?;
        attach_terminal(master)?;
        return Ok(0);
    }

    stream_output(&conn)?;

    Ok(0)
}

fn build_request(command: &Command) -> Request {
    match command {
        Command::Stat => Request::ShowStatistic,
        Command::Conf => Request::ShowConf,
        Command::Pmtu => Request::ShowPmtu,
        Command::Route => Request::ShowRoute,
        Command::Pr { action } => match action {
            PrAction::Show => Request::ShowPrTable,
            PrAction::Add {
                v4_network,
                pr_prefix,
                disable,
            } => Request::AddPrEntry(PrRuleSpec {
                enable: !disable,
                v4net: v4_network.network_address(),
                v4cidr: v4_network.netmask(),
                pr_prefix: pr_prefix.network_address(),
                v6cidr: pr_prefix.netmask(),
            }),
            PrAction::Del { v4_network } => Request::DelPrEntry {
                v4net: v4_network.network_address(),
                v4cidr: v4_network.netmask(),
            },
            PrAction::Delall => Request::DelallPrEntry,
            PrAction::Enable { v4_network } => Request::EnablePrEntry {
                v4net: v4_network.network_address(),
                v4cidr: v4_network.netmask(),
            },
            PrAction::Disable { v4_network } => Request::DisablePrEntry {
                v4net: v4_network.network_address(),
                v4cidr: v4_network.netmask(),
            },
        },
        Command::Device { action } => match action {
            DeviceAction::Add {
                physical,
                name,
                ipv4,
                gateway,
                mtu,
            } => Request::DeviceAdd(DeviceSpec {
                physical_name: Some(physical.clone()),
                virtual_name: Some(name.clone()),
                ipv4_address: ipv4.map(|addr| addr.address),
                ipv4_prefixlen: ipv4.map(|addr| addr.prefix_len),
                ipv4_gateway: *gateway,
                hwaddr: None,
                mtu: *mtu,
                scratch_name: None,
            }),
            DeviceAction::Del { name } => Request::DeviceDel { name: name.clone() },
        },
        Command::Set { action } => match action {
            SetAction::DebugLog { state } => Request::SetDebugLog((*state).into()),
            SetAction::ForceFrag { state } => Request::SetForceFrag((*state).into()),
            SetAction::PmtudMode { mode } => Request::SetPmtudMode((*mode).into()),
            SetAction::PmtudExptime { seconds } => Request::SetPmtudExptime(*seconds),
            SetAction::DefaultGw { state } => Request::SetDefaultGw((*state).into()),
            SetAction::TunnelMtu { mtu } => Request::SetTunnelMtu(*mtu),
            SetAction::DeviceMtu { name, mtu } => Request::SetDeviceMtu {
                name: name.clone(),
                mtu: *mtu,
            },
        },
        Command::Exec { argv } => Request::ExecInetCmd { argv: argv.clone() },
        Command::Shell => Request::ExecShell,
        Command::Shutdown => Request::Shutdown,
        Command::Restart => Request::Restart,
    }
}

/// Prints whatever the daemon streams over the connection until it closes.
fn stream_output(conn: &ControlSocket) -> Result<()> {
    use std::io::Write as _;

    let mut buf = [0u8; 4096];
    let stdout = std::io::stdout();

    loop {
        match nix::unistd::read(conn.as_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let mut lock = stdout.lock();
                lock.write_all(&buf[..n])?;
                lock.flush()?;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(error) => return Err(error).context("read from daemon failed"),
        }
    }

    Ok(())
}

/// Wires the local terminal to the shell pty the daemon handed back:
/// raw mode, a thread pumping stdin into the pty, the main thread pumping
/// pty output to stdout until the shell exits.
fn attach_terminal(master: OwnedFd) -> Result<()> {
    use nix::sys::termios::{self, SetArg};
    use std::io::{Read as _, Write as _};

    let stdin = std::io::stdin();
    let saved = termios::tcgetattr(&stdin).ok();

    if let Some(saved) = &saved {
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw);
    }

    let writer = master.try_clone().context("failed to clone pty fd")?;
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if nix::unistd::write(writer.as_fd(), &buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        match nix::unistd::read(master.as_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = stdout.flush();
            }
            Err(nix::errno::Errno::EINTR) => continue,
            // EIO is the pty's way of saying the shell is gone.
            Err(_) => break,
        }
    }

    if let Some(saved) = &saved {
        let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, saved);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_arguments_map_onto_request_fields() {
        let request = build_request(&Command::Pr {
            action: PrAction::Add {
                v4_network: "10.1.2.0/24".parse().unwrap(),
                pr_prefix: "2001:db8:bb::/64".parse().unwrap(),
                disable: false,
            },
        });

        assert_eq!(
            request,
            Request::AddPrEntry(PrRuleSpec {
                enable: true,
                v4net: "10.1.2.0".parse().unwrap(),
                v4cidr: 24,
                pr_prefix: "2001:db8:bb::".parse().unwrap(),
                v6cidr: 64,
            })
        );
    }

    #[test]
    fn toggles_and_modes_translate() {
        assert_eq!(
            build_request(&Command::Set {
                action: SetAction::ForceFrag { state: Toggle::On },
            }),
            Request::SetForceFrag(true)
        );
        assert_eq!(
            build_request(&Command::Set {
                action: SetAction::PmtudMode {
                    mode: PmtudModeArg::Tunnel,
                },
            }),
            Request::SetPmtudMode(PmtudMode::Tunnel)
        );
        assert_eq!(
            build_request(&Command::Shutdown).code(),
            Request::Shutdown.code()
        );
    }
}
