//! Path-MTU cache fed by ICMPv6 Packet-Too-Big events.
//!
//! Three operating modes: disabled (always the tunnel default), one slot per
//! tunnel (smallest observed value), or one entry per destination. Entries
//! expire after a configurable hold time; eviction is lazy at lookup with a
//! periodic sweep from the main loop.

use control_proto::PmtudMode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

/// Outer packets never shrink below the IPv6 minimum link MTU.
pub const IPV6_MIN_MTU: u16 = 1280;

struct Slot {
    mtu: u16,
    stamped: Instant,
}

struct Inner {
    mode: PmtudMode,
    default_mtu: u16,
    expire: Duration,
    /// Tunnel mode: smallest MTU seen on the whole tunnel.
    tunnel: Option<Slot>,
    /// Host mode: per-destination MTU.
    hosts: HashMap<Ipv6Addr, Slot>,
}

impl Inner {
    fn clamp(&self, mtu: u32) -> u16 {
        u16::try_from(mtu)
            .unwrap_or(u16::MAX)
            .clamp(IPV6_MIN_MTU, self.default_mtu)
    }

    fn fresh(&self, slot: &Slot, now: Instant) -> bool {
        now.duration_since(slot.stamped) < self.expire
    }
}

pub struct PmtuCache {
    inner: Mutex<Inner>,
}

impl PmtuCache {
    pub fn new(mode: PmtudMode, default_mtu: u16, expire_secs: u16) -> PmtuCache {
        PmtuCache {
            inner: Mutex::new(Inner {
                mode,
                default_mtu,
                expire: Duration::from_secs(u64::from(expire_secs)),
                tunnel: None,
                hosts: HashMap::new(),
            }),
        }
    }

    /// The MTU to size encapsulation for `dst`, always within
    /// `[IPV6_MIN_MTU, default]`.
    pub fn lookup(&self, dst: Ipv6Addr) -> u16 {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.mode {
            PmtudMode::None => inner.default_mtu,
            PmtudMode::Tunnel => {
                let fresh = inner
                    .tunnel
                    .as_ref()
                    .filter(|slot| inner.fresh(slot, now))
                    .map(|slot| slot.mtu);

                fresh.unwrap_or_else(|| {
                    inner.tunnel = None;
                    inner.default_mtu
                })
            }
            PmtudMode::Host => {
                let fresh = inner
                    .hosts
                    .get(&dst)
                    .filter(|slot| inner.fresh(slot, now))
                    .map(|slot| slot.mtu);

                fresh.unwrap_or_else(|| {
                    inner.hosts.remove(&dst);
                    inner.default_mtu
                })
            }
        }
    }

    /// Records an advertised MTU for `dst`.
    pub fn update(&self, dst: Ipv6Addr, mtu: u32) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let clamped = inner.clamp(mtu);

        match inner.mode {
            PmtudMode::None => {}
            PmtudMode::Tunnel => {
                let mtu = match &inner.tunnel {
                    Some(slot) if inner.fresh(slot, now) => slot.mtu.min(clamped),
                    _ => clamped,
                };
                inner.tunnel = Some(Slot { mtu, stamped: now });
            }
            PmtudMode::Host => {
                inner.hosts.insert(
                    dst,
                    Slot {
                        mtu: clamped,
                        stamped: now,
                    },
                );
            }
        }
    }

    /// Periodic sweep of expired entries.
    pub fn reap(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expire = inner.expire;

        if inner
            .tunnel
            .as_ref()
            .is_some_and(|slot| now.duration_since(slot.stamped) >= expire)
        {
            inner.tunnel = None;
        }
        inner
            .hosts
            .retain(|_, slot| now.duration_since(slot.stamped) < expire);
    }

    pub fn mode(&self) -> PmtudMode {
        self.inner.lock().mode
    }

    /// Switches the operating mode, discarding all learned state.
    pub fn set_mode(&self, mode: PmtudMode) {
        let mut inner = self.inner.lock();
        inner.mode = mode;
        inner.tunnel = None;
        inner.hosts.clear();
    }

    pub fn set_expire_time(&self, expire_secs: u16) {
        self.inner.lock().expire = Duration::from_secs(u64::from(expire_secs));
    }

    /// Follows a tunnel-MTU change; cached values above the new ceiling are
    /// cut down to it on the next lookup via clamping of updates, so the
    /// learned state is simply dropped.
    pub fn set_default_mtu(&self, default_mtu: u16) {
        let mut inner = self.inner.lock();
        inner.default_mtu = default_mtu;
        inner.tunnel = None;
        inner.hosts.clear();
    }

    /// Renders the cache contents for `show pmtu`.
    pub fn render(&self, out: &mut impl Write) -> std::io::Result<()> {
        let now = Instant::now();
        let inner = self.inner.lock();

        writeln!(out, "[path mtu discovery]")?;
        writeln!(out, "  mode:        {}", inner.mode)?;
        writeln!(out, "  default mtu: {}", inner.default_mtu)?;
        writeln!(out, "  hold time:   {}s", inner.expire.as_secs())?;

        match inner.mode {
            PmtudMode::None => {}
            PmtudMode::Tunnel => {
                if let Some(slot) = inner.tunnel.as_ref().filter(|s| inner.fresh(s, now)) {
                    writeln!(
                        out,
                        "  tunnel: mtu {} (age {}s)",
                        slot.mtu,
                        now.duration_since(slot.stamped).as_secs()
                    )?;
                }
            }
            PmtudMode::Host => {
                for (dst, slot) in inner.hosts.iter().filter(|(_, s)| inner.fresh(s, now)) {
                    writeln!(
                        out,
                        "  {:<40} mtu {} (age {}s)",
                        dst,
                        slot.mtu,
                        now.duration_since(slot.stamped).as_secs()
                    )?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DST: &str = "2001:db8:1::a00:2";

    fn dst() -> Ipv6Addr {
        DST.parse().unwrap()
    }

    #[test]
    fn disabled_cache_always_returns_default() {
        let cache = PmtuCache::new(PmtudMode::None, 1500, 600);

        cache.update(dst(), 1300);
        assert_eq!(cache.lookup(dst()), 1500);
    }

    #[test]
    fn host_mode_is_per_destination() {
        let cache = PmtuCache::new(PmtudMode::Host, 1500, 600);

        cache.update(dst(), 1350);
        assert_eq!(cache.lookup(dst()), 1350);
        assert_eq!(cache.lookup("2001:db8:1::a00:3".parse().unwrap()), 1500);
    }

    #[test]
    fn tunnel_mode_keeps_the_minimum() {
        let cache = PmtuCache::new(PmtudMode::Tunnel, 1500, 600);

        cache.update(dst(), 1400);
        cache.update("2001:db8:1::a00:9".parse().unwrap(), 1340);
        cache.update(dst(), 1450);

        assert_eq!(cache.lookup(dst()), 1340);
    }

    #[test]
    fn values_are_clamped_into_range() {
        let cache = PmtuCache::new(PmtudMode::Host, 1500, 600);

        cache.update(dst(), 100);
        assert_eq!(cache.lookup(dst()), IPV6_MIN_MTU);

        cache.update(dst(), 9000);
        assert_eq!(cache.lookup(dst()), 1500);
    }

    #[test]
    fn mode_roundtrip_resets_learned_state() {
        let cache = PmtuCache::new(PmtudMode::Host, 1500, 600);

        cache.update(dst(), 1300);
        cache.set_mode(PmtudMode::None);
        assert_eq!(cache.lookup(dst()), 1500);

        cache.set_mode(PmtudMode::Host);
        assert_eq!(cache.lookup(dst()), 1500);
    }

    #[test]
    fn expired_entries_fall_back_to_default() {
        let cache = PmtuCache::new(PmtudMode::Host, 1500, 600);
        cache.update(dst(), 1300);

        // Shrink the hold time to zero: the entry is now expired.
        cache.set_expire_time(0);
        assert_eq!(cache.lookup(dst()), 1500);

        cache.reap();
        assert_eq!(cache.lookup(dst()), 1500);
    }

    #[test]
    fn default_mtu_change_discards_cache() {
        let cache = PmtuCache::new(PmtudMode::Host, 1500, 600);
        cache.update(dst(), 1400);

        cache.set_default_mtu(1380);
        assert_eq!(cache.lookup(dst()), 1380);

        cache.update(dst(), 1400);
        assert_eq!(cache.lookup(dst()), 1380);
    }
}
