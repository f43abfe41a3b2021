//! Datagram framing over Unix sockets, with fd and credential passing.

use crate::MAX_FRAME_LEN;

use nix::cmsg_space;
use nix::sys::socket::{
    AddressFamily, Backlog, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr, UnixCredentials, accept4, bind, connect, listen, recvmsg, sendmsg, setsockopt,
    socket, socketpair, sockopt,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the frame limit")]
    Oversize(usize),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("peer closed the connection")]
    Closed,
}

impl From<nix::errno::Errno> for WireError {
    fn from(errno: nix::errno::Errno) -> Self {
        WireError::Io(std::io::Error::from(errno))
    }
}

/// One received frame with its out-of-band attachments.
pub struct RecvdFrame<T> {
    pub msg: T,
    pub fd: Option<OwnedFd>,
    pub creds: Option<UnixCredentials>,
}

/// One end of a control channel (dgram socketpair end, seqpacket listener, or
/// seqpacket connection).
#[derive(Debug)]
pub struct ControlSocket {
    fd: OwnedFd,
}

impl AsFd for ControlSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl ControlSocket {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// The internal parent<->child channel: a connected datagram pair,
    /// close-on-exec on both ends.
    pub fn dgram_pair() -> Result<(ControlSocket, ControlSocket), WireError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        Ok((ControlSocket::from_fd(a), ControlSocket::from_fd(b)))
    }

    /// Binds the external CLI listener in the abstract namespace.
    pub fn listen_abstract(name: &str) -> Result<ControlSocket, WireError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new_abstract(name.as_bytes())?;
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(100)?)?;

        Ok(ControlSocket::from_fd(fd))
    }

    /// Connects to a daemon's external listener.
    pub fn connect_abstract(name: &str) -> Result<ControlSocket, WireError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new_abstract(name.as_bytes())?;
        connect(fd.as_raw_fd(), &addr)?;

        Ok(ControlSocket::from_fd(fd))
    }

    /// Accepts one CLI connection and arms it for credential passing.
    pub fn accept(&self) -> Result<ControlSocket, WireError> {
        let fd = accept4(self.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC)?;
        // Safety: accept4 returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        setsockopt(&fd, sockopt::PassCred, &true)?;

        Ok(ControlSocket::from_fd(fd))
    }

    /// Sends one frame, optionally attaching a file descriptor.
    pub fn send<T: Serialize>(&self, msg: &T, fd: Option<BorrowedFd>) -> Result<(), WireError> {
        let bytes = serde_json::to_vec(msg)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(WireError::Oversize(bytes.len()));
        }

        let iov = [IoSlice::new(&bytes)];
        let raw_fds;
        let cmsgs: &[ControlMessage] = match fd {
            Some(fd) => {
                raw_fds = [fd.as_raw_fd()];
                &[ControlMessage::ScmRights(&raw_fds)]
            }
            None => &[],
        };

        sendmsg::<()>(self.fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)?;

        Ok(())
    }

    /// Receives one frame together with any passed fd and the sender's
    /// credentials (when `SO_PASSCRED` is armed).
    pub fn recv<T: DeserializeOwned>(&self) -> Result<RecvdFrame<T>, WireError> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut cmsg_buffer = cmsg_space!([RawFd; 1], UnixCredentials);
        let mut iov = [IoSliceMut::new(&mut buf)];

        let (bytes, fd, creds) = {
            let msg = recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )?;

            let mut fd = None;
            let mut creds = None;
            for cmsg in msg.cmsgs()? {
                match cmsg {
                    ControlMessageOwned::ScmRights(fds) => {
                        // Safety: the kernel installed these descriptors for us;
                        // we are their sole owner.
                        fd = fds
                            .first()
                            .map(|&raw| unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                    ControlMessageOwned::ScmCredentials(c) => creds = Some(c),
                    _ => {}
                }
            }

            (msg.bytes, fd, creds)
        };

        if bytes == 0 {
            return Err(WireError::Closed);
        }

        let msg = serde_json::from_slice(&buf[..bytes])?;

        Ok(RecvdFrame { msg, fd, creds })
    }
}
