//! Traffic counters in a SysV shared memory segment.
//!
//! The segment is keyed by `ftok(config_path, 'a')` and mapped by both
//! namespaces, so either side can bump a counter. Counters are advisory:
//! plain relaxed atomics, lost races tolerated.

use anyhow::{Context as _, Result, bail};
use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)+) => {
        /// The fixed counter block living in shared memory.
        #[repr(C)]
        #[derive(Default)]
        pub struct Counters {
            $($(#[$doc])* pub $name: AtomicU32,)+
        }

        impl Counters {
            /// Renders every counter as `name: value` lines.
            pub fn render(&self, out: &mut impl Write) -> std::io::Result<()> {
                writeln!(out, "[statistics]")?;
                $(writeln!(
                    out,
                    "  {:<28} {}",
                    stringify!($name),
                    self.$name.load(Ordering::Relaxed),
                )?;)+
                Ok(())
            }
        }
    };
}

counters! {
    /// Frames read from the stub TAP.
    encap_recv_total,
    encap_drop_broadcast,
    /// EtherType other than IPv4 on the stub side.
    encap_drop_ether_proto,
    encap_drop_link_local_mcast,
    /// AS mode: fragmented packet at ingress.
    encap_drop_as_fragment,
    /// AS mode: L4 other than TCP/UDP.
    encap_drop_as_proto,
    /// PR mode: multicast is never forwarded.
    encap_drop_pr_multicast,
    /// PR mode: destination matched no enabled entry.
    encap_drop_pr_lookup,
    encap_unicast,
    encap_multicast,
    encap_send_ok,
    encap_send_err,
    /// Encapsulated fragments emitted.
    encap_frag_ok,
    encap_frag_err,
    frag_needed_sent,
    frag_needed_err,

    /// Frames read from the backbone TAP.
    decap_recv_total,
    decap_drop_broadcast,
    /// EtherType other than IPv6 on the backbone side.
    decap_drop_ether_proto,
    /// Outer next header neither IPIP nor ICMPv6 PTB.
    decap_drop_next_header,
    decap_drop_link_local_mcast,
    /// Inner TTL exhausted.
    decap_drop_ttl,
    /// PR mode: outer source failed the reverse prefix check.
    decap_drop_pr_reverse,
    decap_unicast,
    decap_multicast,
    decap_send_ok,
    decap_send_err,
    /// ICMPv6 Packet-Too-Big seen on the backbone.
    ptb_received,
}

/// Owner handle for the shared segment. The parent creates it; the child
/// inherits the mapping across `clone`.
pub struct Stats {
    ptr: NonNull<Counters>,
    shmid: libc::c_int,
}

// The pointed-to block is all atomics.
unsafe impl Send for Stats {}
unsafe impl Sync for Stats {}

impl Stats {
    /// Creates (or attaches to) the segment keyed by the config file.
    pub fn attach(config_path: &Path) -> Result<Stats> {
        let c_path = CString::new(config_path.as_os_str().as_bytes())
            .context("config path contains a NUL byte")?;

        // Safety: c_path is a valid NUL-terminated string.
        let key = unsafe { libc::ftok(c_path.as_ptr(), 'a' as libc::c_int) };
        if key == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("ftok({}) failed", config_path.display()));
        }

        // Safety: plain shmget syscall; a fresh segment is zero-filled, which
        // is a valid Counters value.
        let shmid = unsafe {
            libc::shmget(
                key,
                std::mem::size_of::<Counters>(),
                libc::IPC_CREAT | 0o600,
            )
        };
        if shmid == -1 {
            return Err(std::io::Error::last_os_error()).context("shmget failed");
        }

        // Safety: shmid is valid; shmat returns a mapping at least
        // size_of::<Counters>() long, page-aligned.
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr == usize::MAX as *mut libc::c_void {
            return Err(std::io::Error::last_os_error()).context("shmat failed");
        }

        let Some(ptr) = NonNull::new(addr.cast::<Counters>()) else {
            bail!("shmat returned a NULL mapping");
        };

        Ok(Stats { ptr, shmid })
    }

    pub fn counters(&self) -> &Counters {
        // Safety: the mapping lives until drop; Counters is repr(C) atomics
        // and any bit pattern is valid.
        unsafe { self.ptr.as_ref() }
    }

    /// Marks the segment for removal once every attachment is gone. Called
    /// by the parent at shutdown.
    pub fn mark_for_removal(&self) {
        // Safety: shmid is the id we created.
        let ret = unsafe { libc::shmctl(self.shmid, libc::IPC_RMID, std::ptr::null_mut()) };
        if ret == -1 {
            tracing::info!(
                "Failed to mark statistics segment for removal: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl Drop for Stats {
    fn drop(&mut self) {
        // Safety: detaching the mapping we attached; the pointer is not used
        // afterwards.
        unsafe {
            libc::shmdt(self.ptr.as_ptr().cast());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_twice_sees_same_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        std::fs::write(&path, "x").unwrap();

        let a = Stats::attach(&path).unwrap();
        let b = Stats::attach(&path).unwrap();

        a.counters().encap_recv_total.fetch_add(3, Ordering::Relaxed);
        assert_eq!(b.counters().encap_recv_total.load(Ordering::Relaxed), 3);

        a.mark_for_removal();
    }

    #[test]
    fn render_lists_every_counter() {
        let counters = Counters::default();
        counters.decap_send_ok.fetch_add(7, Ordering::Relaxed);

        let mut out = Vec::new();
        counters.render(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("decap_send_ok"));
        assert!(text.contains('7'));
        assert!(text.contains("frag_needed_sent"));
    }
}
