//! The prefix-resolution table: longest-prefix mapping from destination IPv4
//! networks to IPv6 tunnel prefixes.
//!
//! Entries are kept sorted by v4 prefix length, longest first, so the hot
//! path takes the first enabled match. Writers and readers share one mutex;
//! lookups clone the small matched entry out so no lock is ever held across
//! a `writev`.

use crate::plane;
use control_proto::PrRuleSpec;
use parking_lot::Mutex;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const PR_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PrTableError {
    #[error("entry already exists")]
    AlreadyExists,
    #[error("entry not found")]
    NotFound,
    #[error("cannot delete the last entry")]
    LastEntry,
    #[error("table is full")]
    Full,
    #[error("address is not a network address")]
    InvalidAddress,
}

impl PrTableError {
    /// The errno reported to the CLI.
    pub fn errno(&self) -> i32 {
        match self {
            PrTableError::AlreadyExists => libc::EEXIST,
            PrTableError::NotFound => libc::ENOENT,
            PrTableError::LastEntry => libc::EBUSY,
            PrTableError::Full => libc::ENOSPC,
            PrTableError::InvalidAddress => libc::EINVAL,
        }
    }
}

/// Runtime form of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrEntry {
    pub enable: bool,
    /// Network address; host bits are zero under `v4mask`.
    pub v4net: Ipv4Addr,
    pub v4mask: u32,
    pub v4cidr: u8,
    /// Tunnel prefix with the plane id overlaid; low 32 bits zero, filled
    /// with the packet's IPv4 destination at encap time.
    pub prefix_with_plane: Ipv6Addr,
    /// Operator-configured prefix, for display.
    pub display_prefix: Ipv6Addr,
    /// 96 + v4cidr, for display.
    pub display_cidr: u8,
}

impl PrEntry {
    pub fn from_spec(spec: &PrRuleSpec, plane_id: Option<&str>) -> Result<PrEntry, PrTableError> {
        if spec.v4cidr > 32 || spec.v6cidr > 128 {
            return Err(PrTableError::InvalidAddress);
        }
        if !is_network_addr(spec.v4net, spec.v4cidr) {
            return Err(PrTableError::InvalidAddress);
        }

        let prefix_with_plane =
            plane::compose_plane_prefix(spec.pr_prefix, spec.v6cidr, plane_id)
                .map_err(|_| PrTableError::InvalidAddress)?;

        let display_cidr = if spec.v4net == Ipv4Addr::UNSPECIFIED && spec.v4cidr == 0 {
            0
        } else {
            96 + spec.v4cidr
        };

        Ok(PrEntry {
            enable: spec.enable,
            v4net: spec.v4net,
            v4mask: mask_from_cidr(spec.v4cidr),
            v4cidr: spec.v4cidr,
            prefix_with_plane,
            display_prefix: spec.pr_prefix,
            display_cidr,
        })
    }

    fn matches_dst(&self, dst: Ipv4Addr) -> bool {
        u32::from(dst) & self.v4mask == u32::from(self.v4net)
    }
}

impl fmt::Display for PrEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} {:>18} {}/{}",
            if self.enable { "enable" } else { "disable" },
            format!("{}/{}", self.v4net, self.v4cidr),
            self.display_prefix,
            self.display_cidr,
        )
    }
}

pub fn mask_from_cidr(cidr: u8) -> u32 {
    if cidr == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(cidr))
    }
}

pub fn is_network_addr(addr: Ipv4Addr, cidr: u8) -> bool {
    cidr <= 32 && u32::from(addr) & !mask_from_cidr(cidr) == 0
}

#[derive(Default)]
pub struct PrTable {
    entries: Mutex<Vec<PrEntry>>,
}

impl PrTable {
    pub fn new() -> PrTable {
        PrTable::default()
    }

    /// Builds the startup table from config rules.
    pub fn from_specs(
        specs: &[PrRuleSpec],
        plane_id: Option<&str>,
    ) -> Result<PrTable, PrTableError> {
        let table = PrTable::new();
        for spec in specs {
            table.add(PrEntry::from_spec(spec, plane_id)?)?;
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Longest-prefix match over enabled entries.
    pub fn lookup_by_dst(&self, dst: Ipv4Addr) -> Option<PrEntry> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.enable && entry.matches_dst(dst))
            .cloned()
    }

    /// Checks a decapsulated packet's outer IPv6 source against the plane:
    /// the top 96 bits must equal some enabled entry's prefix and the
    /// embedded IPv4, masked, must equal that entry's network.
    pub fn reverse_check(&self, v6src: Ipv6Addr) -> bool {
        let octets = v6src.octets();
        let embedded = u32::from_be_bytes([octets[12], octets[13], octets[14], octets[15]]);

        self.entries.lock().iter().any(|entry| {
            entry.enable
                && octets[..12] == entry.prefix_with_plane.octets()[..12]
                && embedded & entry.v4mask == u32::from(entry.v4net)
        })
    }

    /// Inserts preserving descending-v4cidr order.
    pub fn add(&self, entry: PrEntry) -> Result<(), PrTableError> {
        if !is_network_addr(entry.v4net, entry.v4cidr) {
            return Err(PrTableError::InvalidAddress);
        }

        let mut entries = self.entries.lock();

        if entries
            .iter()
            .any(|e| e.v4net == entry.v4net && e.v4cidr == entry.v4cidr)
        {
            return Err(PrTableError::AlreadyExists);
        }
        if entries.len() >= PR_MAX_ENTRIES {
            return Err(PrTableError::Full);
        }

        let position = entries
            .iter()
            .position(|e| entry.v4cidr >= e.v4cidr)
            .unwrap_or(entries.len());
        entries.insert(position, entry);

        Ok(())
    }

    /// Removes the exact (network, cidr) entry. The last entry can only go
    /// via [`PrTable::delete_all`].
    pub fn delete(&self, v4net: Ipv4Addr, v4cidr: u8) -> Result<PrEntry, PrTableError> {
        if !is_network_addr(v4net, v4cidr) {
            return Err(PrTableError::InvalidAddress);
        }

        let mut entries = self.entries.lock();

        let position = entries
            .iter()
            .position(|e| e.v4net == v4net && e.v4cidr == v4cidr)
            .ok_or(PrTableError::NotFound)?;

        if entries.len() == 1 {
            return Err(PrTableError::LastEntry);
        }

        Ok(entries.remove(position))
    }

    /// Unconditionally drops every entry, returning them so the caller can
    /// tear down kernel routes.
    pub fn delete_all(&self) -> Vec<PrEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Flips the enable flag; reports whether the flag actually changed so
    /// the caller knows whether to touch kernel routes.
    pub fn set_enable(
        &self,
        v4net: Ipv4Addr,
        v4cidr: u8,
        enable: bool,
    ) -> Result<(PrEntry, bool), PrTableError> {
        if !is_network_addr(v4net, v4cidr) {
            return Err(PrTableError::InvalidAddress);
        }

        let mut entries = self.entries.lock();

        let entry = entries
            .iter_mut()
            .find(|e| e.v4net == v4net && e.v4cidr == v4cidr)
            .ok_or(PrTableError::NotFound)?;

        let changed = entry.enable != enable;
        entry.enable = enable;

        Ok((entry.clone(), changed))
    }

    /// A consistent snapshot for display.
    pub fn snapshot(&self) -> Vec<PrEntry> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(v4net: &str, v4cidr: u8, prefix: &str, v6cidr: u8) -> PrRuleSpec {
        PrRuleSpec {
            enable: true,
            v4net: v4net.parse().unwrap(),
            v4cidr,
            pr_prefix: prefix.parse().unwrap(),
            v6cidr,
        }
    }

    fn entry(v4net: &str, v4cidr: u8, prefix: &str) -> PrEntry {
        PrEntry::from_spec(&spec(v4net, v4cidr, prefix, 64), Some("0:0")).unwrap()
    }

    #[test]
    fn mask_and_network_checks() {
        assert_eq!(mask_from_cidr(0), 0);
        assert_eq!(mask_from_cidr(16), 0xffff_0000);
        assert_eq!(mask_from_cidr(32), 0xffff_ffff);

        assert!(is_network_addr("10.1.0.0".parse().unwrap(), 16));
        assert!(!is_network_addr("10.1.0.1".parse().unwrap(), 16));
        assert!(is_network_addr("0.0.0.0".parse().unwrap(), 0));
    }

    #[test]
    fn keeps_entries_sorted_longest_prefix_first() {
        let table = PrTable::new();
        table.add(entry("10.0.0.0", 8, "2001:db8:aa::")).unwrap();
        table.add(entry("10.1.2.0", 24, "2001:db8:bb::")).unwrap();
        table.add(entry("10.1.0.0", 16, "2001:db8:cc::")).unwrap();

        let cidrs: Vec<u8> = table.snapshot().iter().map(|e| e.v4cidr).collect();
        assert_eq!(cidrs, vec![24, 16, 8]);
    }

    #[test]
    fn longest_prefix_match_wins() {
        let table = PrTable::new();
        table.add(entry("10.1.0.0", 16, "2001:db8:aa::")).unwrap();
        table.add(entry("10.1.2.0", 24, "2001:db8:bb::")).unwrap();

        let matched = table.lookup_by_dst("10.1.2.5".parse().unwrap()).unwrap();
        assert_eq!(matched.v4cidr, 24);
        assert_eq!(
            matched.prefix_with_plane.octets()[..12],
            "2001:db8:bb::".parse::<Ipv6Addr>().unwrap().octets()[..12]
        );

        let matched = table.lookup_by_dst("10.1.3.5".parse().unwrap()).unwrap();
        assert_eq!(matched.v4cidr, 16);

        assert!(table.lookup_by_dst("192.168.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn disabled_entries_are_skipped() {
        let table = PrTable::new();
        table.add(entry("10.1.0.0", 16, "2001:db8:aa::")).unwrap();

        table
            .set_enable("10.1.0.0".parse().unwrap(), 16, false)
            .unwrap();
        assert!(table.lookup_by_dst("10.1.0.1".parse().unwrap()).is_none());

        let (_, changed) = table
            .set_enable("10.1.0.0".parse().unwrap(), 16, true)
            .unwrap();
        assert!(changed);

        // Enabling twice is idempotent.
        let (_, changed) = table
            .set_enable("10.1.0.0".parse().unwrap(), 16, true)
            .unwrap();
        assert!(!changed);
        assert!(table.lookup_by_dst("10.1.0.1".parse().unwrap()).is_some());
    }

    #[test]
    fn duplicate_and_missing_entries() {
        let table = PrTable::new();
        table.add(entry("10.1.0.0", 16, "2001:db8:aa::")).unwrap();

        assert_eq!(
            table.add(entry("10.1.0.0", 16, "2001:db8:bb::")),
            Err(PrTableError::AlreadyExists)
        );
        assert_eq!(
            table.delete("10.9.0.0".parse().unwrap(), 16).unwrap_err(),
            PrTableError::NotFound
        );
        assert_eq!(
            table.add(entry("10.1.0.1", 16, "2001:db8:bb::")).unwrap_err(),
            PrTableError::InvalidAddress
        );
    }

    #[test]
    fn last_entry_rule() {
        let table = PrTable::new();
        table.add(entry("10.1.0.0", 16, "2001:db8:aa::")).unwrap();

        assert_eq!(
            table.delete("10.1.0.0".parse().unwrap(), 16).unwrap_err(),
            PrTableError::LastEntry
        );

        // delete_all ignores the last-entry rule.
        let removed = table.delete_all();
        assert_eq!(removed.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn add_then_delete_restores_state() {
        let table = PrTable::new();
        table.add(entry("10.0.0.0", 8, "2001:db8:aa::")).unwrap();
        let before = table.snapshot();

        table.add(entry("172.16.0.0", 12, "2001:db8:bb::")).unwrap();
        table.delete("172.16.0.0".parse().unwrap(), 12).unwrap();

        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn reverse_check_matches_plane_and_network() {
        let table = PrTable::new();
        table.add(entry("10.1.2.0", 24, "2001:db8:bb::")).unwrap();

        // Prefix + embedded 10.1.2.5: inside the plane.
        assert!(table.reverse_check("2001:db8:bb::a01:205".parse().unwrap()));
        // Wrong embedded network.
        assert!(!table.reverse_check("2001:db8:bb::a01:305".parse().unwrap()));
        // Wrong prefix.
        assert!(!table.reverse_check("2001:db8:cc::a01:205".parse().unwrap()));

        table
            .set_enable("10.1.2.0".parse().unwrap(), 24, false)
            .unwrap();
        assert!(!table.reverse_check("2001:db8:bb::a01:205".parse().unwrap()));
    }

    #[test]
    fn capacity_is_enforced() {
        let table = PrTable::new();
        for i in 0..PR_MAX_ENTRIES {
            let v4net = Ipv4Addr::from((i as u32) << 8);
            table
                .add(PrEntry {
                    enable: true,
                    v4net,
                    v4mask: mask_from_cidr(24),
                    v4cidr: 24,
                    prefix_with_plane: Ipv6Addr::UNSPECIFIED,
                    display_prefix: Ipv6Addr::UNSPECIFIED,
                    display_cidr: 120,
                })
                .unwrap();
        }

        assert_eq!(
            table.add(entry("192.168.0.0", 16, "2001:db8:aa::")),
            Err(PrTableError::Full)
        );
    }
}
