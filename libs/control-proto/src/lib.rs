//! Control protocol shared between `plane46d` and `plane46ctl`.
//!
//! Two transports speak the same frames:
//!
//! - the internal parent<->child `SOCK_DGRAM` socketpair spanning the
//!   namespace boundary,
//! - the external `SOCK_SEQPACKET` socket in the abstract namespace that the
//!   CLI connects to.
//!
//! A frame is one datagram: a JSON-encoded [`Request`] or [`Response`],
//! bounded by [`MAX_FRAME_LEN`]. File descriptors ride along via
//! `SCM_RIGHTS`; the external listener additionally demands `SCM_CREDENTIALS`
//! (`SO_PASSCRED`).

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod wire;

pub use wire::{ControlSocket, RecvdFrame, WireError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Upper bound for one encoded control frame.
pub const MAX_FRAME_LEN: usize = 8192;

/// The abstract-namespace socket the daemon listens on for CLI connections.
///
/// The leading NUL of abstract addresses is added by the socket layer; this
/// returns the name without it.
pub fn control_socket_name(plane_name: &str) -> String {
    format!("/plane46/{plane_name}/command")
}

/// Tunnel operating mode. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    AddrSharing,
    PrefixRes,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::AddrSharing => write!(f, "as"),
            Mode::PrefixRes => write!(f, "pr"),
        }
    }
}

/// PMTU cache operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PmtudMode {
    None,
    Tunnel,
    Host,
}

impl fmt::Display for PmtudMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmtudMode::None => write!(f, "none"),
            PmtudMode::Tunnel => write!(f, "tunnel"),
            PmtudMode::Host => write!(f, "host"),
        }
    }
}

/// Operator form of one prefix-resolution rule, as it appears in the config
/// file and in `pr add` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRuleSpec {
    pub enable: bool,
    pub v4net: Ipv4Addr,
    pub v4cidr: u8,
    pub pr_prefix: Ipv6Addr,
    pub v6cidr: u8,
}

/// Operator form of a stub-side device for `device add`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Physical parent interface (macvlan parent, or the device itself).
    pub physical_name: Option<String>,
    /// Name the device gets inside the stub namespace.
    pub virtual_name: Option<String>,
    pub ipv4_address: Option<Ipv4Addr>,
    pub ipv4_prefixlen: Option<u8>,
    pub ipv4_gateway: Option<Ipv4Addr>,
    pub hwaddr: Option<[u8; 6]>,
    pub mtu: Option<u32>,
    /// Name the parent created the device under before migrating it; the
    /// stub side renames it to `virtual_name`. Never set by the CLI.
    #[serde(default)]
    pub scratch_name: Option<String>,
}

/// A control request. One request per frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    // Startup handshake between parent and child; never sent by the CLI.
    SetupFailure,
    ChildInitEnd,
    NetdevMoved,
    NetworkConfigure,
    StartOperation,

    // Data-plane event: parent saw an ICMPv6 Packet-Too-Big on the backbone.
    PacketTooBig { dst: Ipv6Addr, mtu: u32 },

    // Show commands; output streams into the connection (or forwarded fd).
    ShowStatistic,
    ShowConf,
    ShowPmtu,
    ShowPrTable,
    ShowRoute,

    // PR table mutations.
    AddPrEntry(PrRuleSpec),
    DelPrEntry { v4net: Ipv4Addr, v4cidr: u8 },
    DelallPrEntry,
    EnablePrEntry { v4net: Ipv4Addr, v4cidr: u8 },
    DisablePrEntry { v4net: Ipv4Addr, v4cidr: u8 },

    // Stub-side device hotplug.
    DeviceAdd(DeviceSpec),
    DeviceDel { name: String },

    // Runtime settings.
    SetDebugLog(bool),
    SetForceFrag(bool),
    SetPmtudMode(PmtudMode),
    SetPmtudExptime(u16),
    SetDefaultGw(bool),
    SetTunnelMtu(u16),
    SetDeviceMtu { name: String, mtu: u32 },

    // Execute in the stub namespace.
    ExecShell,
    ExecInetCmd { argv: Vec<String> },

    // Lifecycle.
    Shutdown,
    Restart,

    // Child acknowledgement for two-phase mutations; `result` follows errno.
    OpEnd { result: i32 },
}

impl Request {
    /// Stable numeric identifier of the command, shared with the CLI.
    pub fn code(&self) -> u32 {
        match self {
            Request::SetupFailure => 1,
            Request::ChildInitEnd => 2,
            Request::NetdevMoved => 3,
            Request::NetworkConfigure => 4,
            Request::StartOperation => 5,
            Request::PacketTooBig { .. } => 6,
            Request::ShowConf => 7,
            Request::ShowStatistic => 8,
            Request::ShowPmtu => 9,
            Request::ExecShell => 10,
            Request::Shutdown => 11,
            Request::Restart => 12,
            Request::DeviceAdd(_) => 13,
            Request::DeviceDel { .. } => 14,
            Request::AddPrEntry(_) => 16,
            Request::DelPrEntry { .. } => 17,
            Request::DelallPrEntry => 18,
            Request::EnablePrEntry { .. } => 19,
            Request::DisablePrEntry { .. } => 20,
            Request::ShowPrTable => 21,
            Request::SetDebugLog(_) => 23,
            Request::SetPmtudExptime(_) => 25,
            Request::SetPmtudMode(_) => 26,
            Request::SetForceFrag(_) => 27,
            Request::SetDefaultGw(_) => 28,
            Request::SetTunnelMtu(_) => 30,
            Request::SetDeviceMtu { .. } => 32,
            Request::ExecInetCmd { .. } => 34,
            Request::ShowRoute => 37,
            Request::OpEnd { .. } => 38,
        }
    }
}

/// The first frame sent back on every external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// 0 on success, otherwise an errno value.
    pub result: i32,
}

impl Response {
    pub const OK: Response = Response { result: 0 };

    pub fn errno(result: i32) -> Self {
        Self { result }
    }

    pub fn is_ok(&self) -> bool {
        self.result == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_through_json() {
        let requests = vec![
            Request::PacketTooBig {
                dst: "2001:db8::1".parse().unwrap(),
                mtu: 1350,
            },
            Request::AddPrEntry(PrRuleSpec {
                enable: true,
                v4net: Ipv4Addr::new(10, 1, 2, 0),
                v4cidr: 24,
                pr_prefix: "2001:db8:bb::".parse().unwrap(),
                v6cidr: 64,
            }),
            Request::SetPmtudMode(PmtudMode::Host),
            Request::OpEnd { result: 17 },
        ];

        for request in requests {
            let bytes = serde_json::to_vec(&request).unwrap();
            assert!(bytes.len() <= MAX_FRAME_LEN);
            let back: Request = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(back, request);
        }
    }

    #[test]
    fn codes_are_unique() {
        let all = [
            Request::SetupFailure,
            Request::ChildInitEnd,
            Request::NetdevMoved,
            Request::NetworkConfigure,
            Request::StartOperation,
            Request::PacketTooBig {
                dst: Ipv6Addr::LOCALHOST,
                mtu: 0,
            },
            Request::ShowStatistic,
            Request::ShowConf,
            Request::ShowPmtu,
            Request::ShowPrTable,
            Request::ShowRoute,
            Request::DelallPrEntry,
            Request::ExecShell,
            Request::Shutdown,
            Request::Restart,
            Request::OpEnd { result: 0 },
        ];

        let mut codes: Vec<u32> = all.iter().map(Request::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}
