//! `UnixStream` extensions to support file descriptor passing.

use crate::net::Fd;
use async_trait::async_trait;
use nix::{
    cmsg_space,
    sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
};
use std::{
    io::{self, IoSlice, IoSliceMut, Result},
    os::unix::{
        io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
        net as std_net,
    },
};
use tokio::{io::Interest, net as tokio_net};

pub use tokio_net::UnixStream;

#[async_trait]
pub trait UnixStreamExt {
    /// Send the buffers, attaching at most one file descriptor as a
    /// `SCM_RIGHTS` control message.
    async fn send_with_fd(&self, bufs: &[IoSlice<'_>], fd: Option<RawFd>) -> Result<usize>;

    /// Receive into the buffers, collecting every passed descriptor.
    ///
    /// Callers decide how many descriptors are acceptable; unwanted ones are
    /// closed when the returned `Fd`s are dropped.
    async fn recv_with_fd(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<(usize, Vec<Fd>)>;

    #[allow(clippy::missing_safety_doc)]
    unsafe fn from_raw_fd(fd: RawFd) -> Result<UnixStream>;
}

#[async_trait]
impl UnixStreamExt for UnixStream {
    async fn send_with_fd(&self, bufs: &[IoSlice<'_>], fd: Option<RawFd>) -> Result<usize> {
        let fds = [fd.unwrap_or(-1)];

        loop {
            self.writable().await?;

            let result = self.try_io(Interest::WRITABLE, || {
                let cmsgs = if fd.is_some() {
                    vec![ControlMessage::ScmRights(&fds)]
                } else {
                    vec![]
                };

                sendmsg::<()>(self.as_raw_fd(), bufs, &cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            });

            match result {
                Ok(count) => break Ok(count),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(err),
            }
        }
    }

    async fn recv_with_fd(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<(usize, Vec<Fd>)> {
        loop {
            self.readable().await?;

            let result = self.try_io(Interest::READABLE, || {
                let mut cmsg_buffer = cmsg_space!([RawFd; 4]);

                let message = recvmsg::<()>(
                    self.as_raw_fd(),
                    bufs,
                    Some(&mut cmsg_buffer),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                let mut fds = Vec::new();
                for cmsg in message.cmsgs() {
                    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                        fds.extend(raw_fds.into_iter().map(Fd::from));
                    }
                }

                Ok((message.bytes, fds))
            });

            match result {
                Ok(received) => break Ok(received),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(err),
            }
        }
    }

    unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        let stream = std_net::UnixStream::from_raw_fd(fd);
        stream.set_nonblocking(true)?;
        Self::from_std(stream)
    }
}

/// Pair of connected, non-blocking stream sockets as bare descriptors.
///
/// Used by the supervisor, which creates the sockets but hands both ends to
/// its children.
pub fn socketpair() -> io::Result<(Fd, Fd)> {
    let (a, b) = std_net::UnixStream::pair()?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;

    Ok((Fd::from(a.into_raw_fd()), Fd::from(b.into_raw_fd())))
}
