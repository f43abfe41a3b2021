//! TAP device creation.
//!
//! Opens `/dev/net/tun` and binds an L2 TAP interface to the fd with
//! `TUNSETIFF`. Passing a name containing `%d` lets the kernel pick a free
//! suffix; the name actually assigned is read back from the request.

use anyhow::{Context as _, Result, ensure};
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_FILE: &CStr = c"/dev/net/tun";

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_uchar; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    // TUNSETIFF only touches the flags; pad out the ifreq union.
    _pad: [u8; 22],
}

/// Creates a TAP (L2, no packet-info prefix) device and returns its fd and
/// final name.
pub fn create_tap(name_template: &str) -> Result<(OwnedFd, String)> {
    ensure!(
        name_template.len() < libc::IFNAMSIZ,
        "device name {name_template:?} too long"
    );

    // Safety: plain open(2) of a constant path.
    let fd = unsafe { libc::open(TUN_FILE.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to open /dev/net/tun");
    }
    // Safety: we own the fresh descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut request = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
        _pad: [0; 22],
    };
    request.ifr_name[..name_template.len()].copy_from_slice(name_template.as_bytes());

    // Safety: request is a properly sized ifreq and fd is open.
    if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut request) } < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("TUNSETIFF failed for {name_template:?}"));
    }

    // Safety: the kernel NUL-terminates the name it assigned.
    let name = unsafe { CStr::from_ptr(request.ifr_name.as_ptr().cast()) }
        .to_str()
        .context("Kernel returned a non-UTF-8 device name")?
        .to_owned();

    Ok((fd, name))
}
