//! Configuration snapshot.
//!
//! The daemon consumes a flat TOML file named with `-f`. Everything is
//! validated here, once, at startup; invalid configuration is fatal.

use anyhow::{Context as _, Result, bail, ensure};
use control_proto::{Mode, PmtudMode, PrRuleSpec};
use ip_network::{Ipv4Network, Ipv6Network};
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Lower bound for the PMTU cache expiry, so short-lived probes don't thrash.
pub const PMTU_EXPIRE_MIN: u16 = 301;
pub const PMTU_EXPIRE_DEFAULT: u16 = 600;

pub const TUNNEL_MTU_MIN: u16 = 1280;
pub const TUNNEL_MTU_MAX: u16 = 65521;
pub const TUNNEL_MTU_DEFAULT: u16 = 1500;

/// Size of the outer IPv6 header added by encapsulation.
pub const ENCAP_OVERHEAD: u16 = 40;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub general: General,
    pub tunnel: Tunnel,
    #[serde(default)]
    pub pmtud: Pmtud,
    #[serde(default, rename = "device")]
    pub devices: Vec<StubDevice>,
    #[serde(default, rename = "pr_rule")]
    pub pr_rules: Vec<PrRule>,

    /// Path the config was loaded from; keys the statistics segment.
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    pub mode: Mode,
    pub plane_name: String,
    /// Up to 32 bits of plane id, written as one or two hextets ("a" or
    /// "12:34"). Absent means all-zero.
    pub plane_id: Option<String>,
    pub unicast_prefix: Ipv6Network,
    /// Source prefix for outer headers in PR mode.
    pub src_addr_unicast_prefix: Option<Ipv6Network>,
    pub multicast_prefix: Option<Ipv6Network>,
    #[serde(default)]
    pub debug_log: bool,
    #[serde(default)]
    pub daemon: bool,
    #[serde(default)]
    pub force_fragment: bool,
    #[serde(default)]
    pub route_sync: bool,
    pub startup_script: Option<PathBuf>,
    #[serde(default = "default_route_entry_max")]
    pub route_entry_max: u32,
    /// Temporarily re-MAC physical parents while creating macvlans on
    /// kernels whose macvlan driver inherits a stale address.
    #[serde(default)]
    pub macvlan_mac_workaround: bool,
}

fn default_route_entry_max() -> u32 {
    256
}

/// An interface address with its prefix length ("198.51.100.7/24"). Unlike
/// a network, the host bits are the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Ipv4WithPrefix {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl FromStr for Ipv4WithPrefix {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix_len) = s
            .split_once('/')
            .with_context(|| format!("{s:?} is missing a prefix length"))?;
        let address = address.parse().with_context(|| format!("bad address in {s:?}"))?;
        let prefix_len: u8 = prefix_len
            .parse()
            .with_context(|| format!("bad prefix length in {s:?}"))?;
        ensure!(prefix_len <= 32, "prefix length in {s:?} out of range");

        Ok(Ipv4WithPrefix {
            address,
            prefix_len,
        })
    }
}

impl TryFrom<String> for Ipv4WithPrefix {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Ipv4WithPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// An IPv6 interface address with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Ipv6WithPrefix {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
}

impl FromStr for Ipv6WithPrefix {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix_len) = s
            .split_once('/')
            .with_context(|| format!("{s:?} is missing a prefix length"))?;
        let address = address.parse().with_context(|| format!("bad address in {s:?}"))?;
        let prefix_len: u8 = prefix_len
            .parse()
            .with_context(|| format!("bad prefix length in {s:?}"))?;
        ensure!(prefix_len <= 128, "prefix length in {s:?} out of range");

        Ok(Ipv6WithPrefix {
            address,
            prefix_len,
        })
    }
}

impl TryFrom<String> for Ipv6WithPrefix {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Ipv6WithPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tunnel {
    /// Backbone-side TAP name.
    pub name: String,
    /// Stub-side TAP name; the device is created under a generated name and
    /// renamed to this inside the stub namespace.
    pub v4_name: String,
    #[serde(default = "default_tunnel_mtu")]
    pub mtu: u16,
    pub ipv4_address: Option<Ipv4WithPrefix>,
    #[serde(default)]
    pub ipv4_default_gw: bool,
    pub ipv6_address: Option<Ipv6WithPrefix>,
}

fn default_tunnel_mtu() -> u16 {
    TUNNEL_MTU_DEFAULT
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Pmtud {
    pub mode: PmtudModeConfig,
    pub expire_time: Option<u16>,
}

/// Local default so an absent `[pmtud]` section means "disabled".
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PmtudModeConfig {
    #[default]
    None,
    Tunnel,
    Host,
}

impl From<PmtudModeConfig> for PmtudMode {
    fn from(mode: PmtudModeConfig) -> Self {
        match mode {
            PmtudModeConfig::None => PmtudMode::None,
            PmtudModeConfig::Tunnel => PmtudMode::Tunnel,
            PmtudModeConfig::Host => PmtudMode::Host,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubDeviceKind {
    Macvlan,
    Physical,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDevice {
    pub kind: StubDeviceKind,
    /// Name inside the stub namespace.
    pub name: String,
    /// Host-side device: the macvlan parent, or the physical device itself.
    pub physical_name: String,
    pub ipv4_address: Option<Ipv4WithPrefix>,
    pub ipv4_gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub default_gw: bool,
    pub hwaddr: Option<String>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrRule {
    #[serde(default = "default_true")]
    pub enable: bool,
    pub v4_network: Ipv4Network,
    pub pr_prefix: Ipv6Network,
}

fn default_true() -> bool {
    true
}

impl PrRule {
    pub fn to_spec(&self) -> PrRuleSpec {
        PrRuleSpec {
            enable: self.enable,
            v4net: self.v4_network.network_address(),
            v4cidr: self.v4_network.netmask(),
            pr_prefix: self.pr_prefix.network_address(),
            v6cidr: self.pr_prefix.netmask(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.path = path.to_path_buf();

        config.validate()?;

        Ok(config)
    }

    pub fn pmtud_mode(&self) -> PmtudMode {
        self.pmtud.mode.into()
    }

    pub fn pmtud_expire_time(&self) -> u16 {
        self.pmtud.expire_time.unwrap_or(PMTU_EXPIRE_DEFAULT)
    }

    pub fn pr_rule_specs(&self) -> Vec<PrRuleSpec> {
        self.pr_rules.iter().map(PrRule::to_spec).collect()
    }

    fn validate(&self) -> Result<()> {
        let general = &self.general;

        ensure!(!general.plane_name.is_empty(), "plane_name must not be empty");
        ensure!(
            general
                .plane_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "plane_name may only contain alphanumerics, '-' and '_'"
        );

        if let Some(plane_id) = &general.plane_id {
            validate_plane_id(plane_id)?;
        }

        // The embedded IPv4 starts at bit 96 (bit 80 with address sharing,
        // which also needs room for the port); the prefix must stay above it.
        let max_prefix_len = match general.mode {
            Mode::AddrSharing => 80,
            Mode::Normal | Mode::PrefixRes => 96,
        };
        for prefix in [
            Some(general.unicast_prefix),
            general.src_addr_unicast_prefix,
            general.multicast_prefix,
        ]
        .into_iter()
        .flatten()
        {
            ensure!(
                prefix.netmask() <= max_prefix_len,
                "prefix {prefix} too long for {} mode (max /{max_prefix_len})",
                general.mode
            );
        }

        match general.mode {
            Mode::Normal | Mode::AddrSharing => {
                ensure!(
                    general.multicast_prefix.is_some(),
                    "multicast_prefix is required in {} mode",
                    general.mode
                );
            }
            Mode::PrefixRes => {
                ensure!(
                    general.src_addr_unicast_prefix.is_some(),
                    "src_addr_unicast_prefix is required in pr mode"
                );
                ensure!(
                    !self.pr_rules.is_empty(),
                    "at least one pr_rule is required in pr mode"
                );
            }
        }

        let mtu = self.tunnel.mtu;
        ensure!(
            (TUNNEL_MTU_MIN..=TUNNEL_MTU_MAX).contains(&mtu),
            "tunnel mtu {mtu} out of range {TUNNEL_MTU_MIN}..={TUNNEL_MTU_MAX}"
        );

        if let Some(expire) = self.pmtud.expire_time {
            ensure!(
                expire >= PMTU_EXPIRE_MIN,
                "pmtud expire_time {expire} below minimum {PMTU_EXPIRE_MIN}"
            );
        }

        ensure!(
            self.tunnel.name != self.tunnel.v4_name,
            "tunnel device names must differ"
        );

        for device in &self.devices {
            ensure!(
                !device.name.is_empty() && !device.physical_name.is_empty(),
                "stub devices need both name and physical_name"
            );
            if let Some(hwaddr) = &device.hwaddr {
                parse_mac(hwaddr)
                    .with_context(|| format!("bad hwaddr for device {}", device.name))?;
            }
        }

        Ok(())
    }
}

/// Validates a plane id of the form "a", "12:34" (one or two hextets).
pub fn validate_plane_id(plane_id: &str) -> Result<()> {
    let parts: Vec<&str> = plane_id.split(':').collect();
    if parts.is_empty() || parts.len() > 2 {
        bail!("plane_id {plane_id:?} must be one or two hextets");
    }

    for part in parts {
        ensure!(
            !part.is_empty() && part.len() <= 4 && part.chars().all(|c| c.is_ascii_hexdigit()),
            "plane_id {plane_id:?} contains an invalid hextet"
        );
    }

    Ok(())
}

pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');

    for byte in &mut mac {
        let part = parts.next().context("MAC address has fewer than 6 octets")?;
        *byte = u8::from_str_radix(part, 16)
            .with_context(|| format!("invalid MAC octet {part:?}"))?;
    }
    ensure!(parts.next().is_none(), "MAC address has more than 6 octets");

    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plane46.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    const MINIMAL_NORMAL: &str = r#"
        [general]
        mode = "normal"
        plane_name = "plane0"
        unicast_prefix = "2001:db8:1::/48"
        multicast_prefix = "ff0e:db8:1::/48"

        [tunnel]
        name = "p46bb0"
        v4_name = "p46stub0"
    "#;

    #[test]
    fn loads_minimal_normal_mode_config() {
        let (_dir, path) = write_config(MINIMAL_NORMAL);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.general.mode, Mode::Normal);
        assert_eq!(config.tunnel.mtu, TUNNEL_MTU_DEFAULT);
        assert_eq!(config.pmtud_mode(), PmtudMode::None);
        assert_eq!(config.pmtud_expire_time(), PMTU_EXPIRE_DEFAULT);
        assert_eq!(config.path, path);
    }

    #[test]
    fn pr_mode_requires_rules_and_src_prefix() {
        let (_dir, path) = write_config(
            r#"
            [general]
            mode = "prefix_res"
            plane_name = "plane0"
            unicast_prefix = "2001:db8:1::/48"

            [tunnel]
            name = "p46bb0"
            v4_name = "p46stub0"
            "#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("src_addr_unicast_prefix"));
    }

    #[test]
    fn rejects_non_network_pr_rule() {
        let (_dir, path) = write_config(
            r#"
            [general]
            mode = "prefix_res"
            plane_name = "plane0"
            unicast_prefix = "2001:db8:1::/48"
            src_addr_unicast_prefix = "2001:db8:2::/48"

            [tunnel]
            name = "p46bb0"
            v4_name = "p46stub0"

            [[pr_rule]]
            v4_network = "10.1.2.3/16"
            pr_prefix = "2001:db8:aa::/64"
            "#,
        );

        // 10.1.2.3/16 has host bits set; ip_network refuses it at parse time.
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_small_tunnel_mtu() {
        let (_dir, path) = write_config(
            r#"
            [general]
            mode = "normal"
            plane_name = "plane0"
            unicast_prefix = "2001:db8:1::/48"
            multicast_prefix = "ff0e:db8:1::/48"

            [tunnel]
            name = "p46bb0"
            v4_name = "p46stub0"
            mtu = 1000
            "#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"));
    }

    #[test]
    fn rejects_short_pmtu_expiry() {
        let (_dir, path) = write_config(
            r#"
            [general]
            mode = "normal"
            plane_name = "plane0"
            unicast_prefix = "2001:db8:1::/48"
            multicast_prefix = "ff0e:db8:1::/48"

            [tunnel]
            name = "p46bb0"
            v4_name = "p46stub0"

            [pmtud]
            mode = "host"
            expire_time = 120
            "#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("below minimum"));
    }

    #[test]
    fn plane_id_validation() {
        assert!(validate_plane_id("0").is_ok());
        assert!(validate_plane_id("12:34").is_ok());
        assert!(validate_plane_id("ffff:ffff").is_ok());
        assert!(validate_plane_id("12345").is_err());
        assert!(validate_plane_id("1:2:3").is_err());
        assert!(validate_plane_id("xyz").is_err());
    }

    #[test]
    fn interface_addresses_keep_host_bits() {
        let addr: Ipv4WithPrefix = "198.51.100.7/24".parse().unwrap();
        assert_eq!(addr.address, Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(addr.prefix_len, 24);
        assert_eq!(addr.to_string(), "198.51.100.7/24");

        assert!("198.51.100.7".parse::<Ipv4WithPrefix>().is_err());
        assert!("198.51.100.7/33".parse::<Ipv4WithPrefix>().is_err());

        let addr: Ipv6WithPrefix = "2001:db8::1/64".parse().unwrap();
        assert_eq!(addr.prefix_len, 64);
        assert!("2001:db8::1/129".parse::<Ipv6WithPrefix>().is_err());
    }

    #[test]
    fn address_sharing_caps_prefix_at_80_bits() {
        let (_dir, path) = write_config(
            r#"
            [general]
            mode = "addr_sharing"
            plane_name = "plane0"
            unicast_prefix = "2001:db8:1:2:3::/96"
            multicast_prefix = "ff0e:db8:1::/48"

            [tunnel]
            name = "p46bb0"
            v4_name = "p46stub0"
            "#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("too long"));
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("02:00:00:aa:bb:cc").unwrap(),
            [0x02, 0, 0, 0xaa, 0xbb, 0xcc]
        );
        assert!(parse_mac("02:00:00:aa:bb").is_err());
        assert!(parse_mac("02:00:00:aa:bb:cc:dd").is_err());
        assert!(parse_mac("zz:00:00:aa:bb:cc").is_err());
    }
}
