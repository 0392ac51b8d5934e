//! Owned, droppable file descriptors.

use derive_more::{From, Into};
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd::{close, dup},
};
use std::{
    fs::File,
    io, mem,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
#[derive(Debug, From, Into)]
pub struct Fd(RawFd);

impl Fd {
    /// Duplicate the file descriptor into an independent `Fd`.
    pub fn duplicate(&self) -> io::Result<Self> {
        dup(self.0).map(Self::from).map_err(io::Error::from)
    }

    /// Check if the file descriptor is valid.
    pub fn is_open(&self) -> io::Result<()> {
        fcntl(self.0, FcntlArg::F_GETFD)
            .map(|_| ())
            .map_err(|err| io::Error::new(io::ErrorKind::NotConnected, err))
    }

    /// Switch the descriptor's non-blocking flag.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut flags = OFlag::from_bits_truncate(fcntl(self.0, FcntlArg::F_GETFL)?);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(self.0, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    /// Consume the descriptor into a `std` file handle.
    pub fn into_file(self) -> File {
        unsafe { File::from_raw_fd(self.into_raw_fd()) }
    }

    /// Consume the descriptor into an [`OwnedFd`].
    pub fn into_owned(self) -> OwnedFd {
        unsafe { OwnedFd::from_raw_fd(self.into_raw_fd()) }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}
