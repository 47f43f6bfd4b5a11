// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Framed, fd-carrying transport over a connected `AF_UNIX` stream socket.
//!
//! Frames are written under a per-channel send lock so concurrent senders
//! never interleave bytes. Descriptors ride as `SCM_RIGHTS` ancillary data on
//! the first chunk of the frame.

use crate::message::{FrameError, Header, Message, HEADER_SIZE, MAX_FDS};
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::{size_of, size_of_val};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("frame truncated after {0} bytes")]
    Truncated(usize),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

pub struct Channel {
    socket: UnixStream,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

impl Channel {
    pub fn new(socket: UnixStream) -> Self {
        Self {
            socket,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    /// Connected pair, one end per process.
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Channel::new(a), Channel::new(b)))
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self::new(UnixStream::from(fd))
    }

    /// Closes both directions. A blocked receiver on either end observes
    /// [`ChannelError::Closed`].
    pub fn shutdown(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Sends one frame and its descriptors as an atomic unit with respect to
    /// other senders on this channel.
    pub fn send(&self, msg: &Message) -> ChannelResult<()> {
        let frame = msg.encode()?;
        let fds: Vec<BorrowedFd<'_>> = msg.fds.iter().map(|fd| fd.as_fd()).collect();

        let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut sent = 0;
        while sent < frame.len() {
            let attach = if sent == 0 { fds.as_slice() } else { &[] };
            match try_send(&self.socket, &frame[sent..], attach) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => return Err(ChannelError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Blocks until a complete frame arrives. Returns [`ChannelError::Closed`]
    /// when the peer closes at a frame boundary.
    pub fn recv(&self) -> ChannelResult<Message> {
        let _guard = self.recv_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut fds = Vec::new();

        let mut head = [0u8; HEADER_SIZE];
        let got = self.read_full(&mut head, &mut fds)?;
        if got == 0 {
            return Err(ChannelError::Closed);
        }
        if got < HEADER_SIZE {
            return Err(ChannelError::Truncated(got));
        }
        let header = Header::parse(&head)?;

        let mut body = Vec::new();
        body.try_reserve_exact(header.body_len())
            .map_err(FrameError::from)?;
        body.resize(header.body_len(), 0);
        let got = self.read_full(&mut body, &mut fds)?;
        if got < body.len() {
            return Err(ChannelError::Truncated(HEADER_SIZE + got));
        }

        Ok(Message::decode(&header, &body, fds)?)
    }

    /// Reads until `buf` is full or the peer closes; returns bytes read.
    fn read_full(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> ChannelResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match try_recv(&self.socket, &mut buf[filled..], fds) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => break,
                Err(e) => return Err(e.into()),
            }
            if fds.len() > MAX_FDS {
                return Err(io::Error::from_raw_os_error(libc::EMSGSIZE).into());
            }
        }
        Ok(filled)
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

#[repr(C)]
struct CmsgScmRights {
    hdr: libc::cmsghdr,
    fds: [RawFd; MAX_FDS],
}

// x86_64-unknown-linux-musl targets have a different type defn for
// `libc::cmsghdr`, hence why these lints are being suppressed.
#[allow(clippy::needless_update, clippy::useless_conversion)]
fn try_send(socket: &UnixStream, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    if fds.len() > MAX_FDS {
        return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
    }
    let mut cmsg = CmsgScmRights {
        hdr: libc::cmsghdr {
            cmsg_level: libc::SOL_SOCKET,
            cmsg_type: libc::SCM_RIGHTS,
            cmsg_len: (size_of::<libc::cmsghdr>() + size_of_val(fds)) as _,
            ..{
                // SAFETY: type has no invariants
                unsafe { std::mem::zeroed() }
            }
        },
        fds: [0; MAX_FDS],
    };
    for (fdi, fdo) in fds.iter().zip(cmsg.fds.iter_mut()) {
        *fdo = fdi.as_raw_fd();
    }

    let iov = [IoSlice::new(buf)];
    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = iov.as_ptr() as *mut libc::iovec;
    hdr.msg_iovlen = 1;
    if !fds.is_empty() {
        hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
        hdr.msg_controllen = cmsg.hdr.cmsg_len;
    }
    // SAFETY: calling with appropriately initialized buffers.
    let n = unsafe { libc::sendmsg(socket.as_raw_fd(), &hdr, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receives into `buf`, appending any descriptors delivered with the chunk.
// Ignore libc misuse of deprecated warning on the MSG_* flags.
#[allow(deprecated)]
fn try_recv(socket: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    // SAFETY: type has no invariants
    let mut cmsg: CmsgScmRights = unsafe { std::mem::zeroed() };
    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = iov.as_mut_ptr().cast::<libc::iovec>();
    hdr.msg_iovlen = 1;
    hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
    hdr.msg_controllen = size_of_val(&cmsg) as _;

    // SAFETY: calling with properly initialized buffers.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut hdr, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if hdr.msg_controllen > 0 {
        if cmsg.hdr.cmsg_level != libc::SOL_SOCKET || cmsg.hdr.cmsg_type != libc::SCM_RIGHTS {
            return Err(io::ErrorKind::InvalidData.into());
        }
        #[allow(clippy::unnecessary_cast)] // cmsg_len is u32 on musl and usize on gnu.
        let count = (cmsg.hdr.cmsg_len as usize - size_of_val(&cmsg.hdr)) / size_of::<RawFd>();
        fds.extend(cmsg.fds[..count.min(MAX_FDS)].iter().map(|fd| {
            // SAFETY: the kernel installed this descriptor for us.
            unsafe { OwnedFd::from_raw_fd(*fd) }
        }));
    }

    // Truncation is checked after taking ownership so nothing leaks.
    if hdr.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
    }
    Ok(n as usize)
}
