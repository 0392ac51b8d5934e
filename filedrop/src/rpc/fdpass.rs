//! The descriptor channel: nothing but `SCM_RIGHTS` transfers.
//!
//! Each message carries exactly one file descriptor.  A single marker byte
//! rides along because Unix stream sockets refuse to deliver ancillary data
//! without any payload.  Anything else on this channel is a protocol
//! violation that tears it down.

use crate::net::{Fd, UnixStream, UnixStreamExt};
use derive_more::{From, Into};
use std::{
    io::{self, IoSlice, IoSliceMut, Result},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

const MARKER: u8 = 0xfd;

/// One half of the descriptor-passing socketpair.
#[derive(Debug, From, Into)]
pub struct FdChannel {
    socket: UnixStream,
}

impl FdChannel {
    /// Create a new connected channel pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Create half of a channel pair from an inherited file descriptor.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<FdChannel> {
        unsafe { <UnixStream as UnixStreamExt>::from_raw_fd(fd.into_raw_fd()).map(Into::into) }
    }

    /// Pass one descriptor to the remote end.
    pub async fn send(&self, fd: &Fd) -> Result<()> {
        let marker = [MARKER];
        let sent = self
            .socket
            .send_with_fd(&[IoSlice::new(&marker)], Some(fd.as_raw_fd()))
            .await?;

        if sent != marker.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short fd message"));
        }

        Ok(())
    }

    /// Receive one descriptor from the remote end.
    pub async fn recv(&self) -> Result<Fd> {
        let mut marker = [0u8; 1];
        let (received, mut fds) = {
            let mut bufs = [IoSliceMut::new(&mut marker)];
            self.socket.recv_with_fd(&mut bufs).await?
        };

        if received == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "fd channel closed",
            ));
        }
        if marker[0] != MARKER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stray payload on fd channel",
            ));
        }
        if fds.len() != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected exactly one descriptor, got {}", fds.len()),
            ));
        }

        Ok(fds.remove(0))
    }
}

impl AsRawFd for FdChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write as _, os::unix::io::IntoRawFd};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn pass_a_descriptor() {
        let (a, b) = FdChannel::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"carried across").unwrap();

        a.send(&Fd::from(file.into_raw_fd())).await.unwrap();

        let passed = b.recv().await.unwrap();
        let mut passed = tokio::fs::File::from_std(passed.into_file());

        use tokio::io::AsyncSeekExt;
        passed.seek(std::io::SeekFrom::Start(0)).await.unwrap();

        let mut contents = String::new();
        passed.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "carried across");
    }

    #[tokio::test]
    async fn hangup_is_an_error() {
        let (a, b) = FdChannel::pair().unwrap();
        drop(a);

        let err = b.recv().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
