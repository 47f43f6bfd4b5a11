// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::io;
use std::mem::size_of_val;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Runs f() until it stops failing with EINTR.
fn while_eintr<F, R>(mut f: F) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
{
    loop {
        match f() {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            r => break r,
        }
    }
}

fn syscall_result<T: PartialOrd + Default>(result: T) -> io::Result<T> {
    if result >= T::default() {
        Ok(result)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Non-blocking eventfd used as an interrupt or resample signal.
#[derive(Debug)]
pub struct EventNotifier(OwnedFd);

impl EventNotifier {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no preconditions; the result is validated
        // before being wrapped.
        let fd = unsafe {
            let fd = syscall_result(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
            OwnedFd::from_raw_fd(fd)
        };
        Ok(Self(fd))
    }

    /// Wraps a descriptor received from a peer.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self(fd)
    }

    /// Duplicate of the descriptor for handing to another process.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.0.try_clone()
    }

    pub fn signal(&self) -> io::Result<()> {
        let c: u64 = 1;
        // SAFETY: fd is valid and the buffer is a live u64.
        while_eintr(|| unsafe {
            syscall_result(libc::write(
                self.0.as_raw_fd(),
                std::ptr::from_ref(&c).cast::<libc::c_void>(),
                size_of_val(&c),
            ))
        })?;
        Ok(())
    }

    /// Consumes a pending signal. Returns false when none was pending.
    pub fn try_consume(&self) -> io::Result<bool> {
        let mut c: u64 = 0;
        // SAFETY: fd is valid and the buffer is a live u64.
        let n = while_eintr(|| unsafe {
            syscall_result(libc::read(
                self.0.as_raw_fd(),
                std::ptr::from_mut(&mut c).cast::<libc::c_void>(),
                size_of_val(&c),
            ))
        });
        match n {
            Ok(_) => Ok(true),
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl AsFd for EventNotifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for EventNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_then_consume() {
        let ev = EventNotifier::new().unwrap();
        assert!(!ev.try_consume().unwrap());
        ev.signal().unwrap();
        ev.signal().unwrap();
        assert!(ev.try_consume().unwrap());
        // eventfd counters collapse into a single read.
        assert!(!ev.try_consume().unwrap());
    }

    #[test]
    fn test_clone_shares_counter() {
        let ev = EventNotifier::new().unwrap();
        let other = EventNotifier::from_owned_fd(ev.try_clone_fd().unwrap());
        other.signal().unwrap();
        assert!(ev.try_consume().unwrap());
    }
}
