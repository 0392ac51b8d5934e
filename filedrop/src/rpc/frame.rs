//! Framed message handling between the privilege-separated processes.
//!
//! Every record is a fixed header followed by a bincode-encoded payload.
//! The header carries the method id, the total record length and the
//! sender's PID; one file descriptor may ride along as ancillary data.

use crate::net::{Fd, UnixStream, UnixStreamExt};
use derive_more::{From, Into};
use nix::unistd::getpid;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    convert::TryFrom,
    io::{self, IoSlice, IoSliceMut, Result},
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};
use zerocopy::{AsBytes, FromBytes};

/// Marks a record as the answer to the request with the same method id.
pub const FLAG_REPLY: u16 = 0x0001;

/// Fixed frame header.
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct FrameHeader {
    /// Request type.
    pub method: u32,
    /// Total record length (header + payload).
    pub length: u16,
    /// Record flags, see `FLAG_REPLY`.
    pub flags: u16,
    /// Sender PID.
    pub pid: i32,
}

impl FrameHeader {
    pub const SIZE: usize = mem::size_of::<FrameHeader>();

    fn new(method: u32, flags: u16) -> Self {
        Self {
            method,
            flags,
            length: Self::SIZE as u16,
            pid: getpid().as_raw(),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }
}

/// One received record.
#[derive(Debug)]
pub struct Envelope {
    pub header: FrameHeader,
    pub fd: Option<Fd>,
    payload: Vec<u8>,
}

impl Envelope {
    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Frame handler over one half of a Unix socketpair.
#[derive(Debug, From, Into)]
pub struct Handler {
    socket: UnixStream,
}

impl Handler {
    /// Create a new connected handler pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Create half of a handler pair from an inherited file descriptor.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<Handler> {
        unsafe { <UnixStream as UnixStreamExt>::from_raw_fd(fd.into_raw_fd()).map(Into::into) }
    }

    /// Send one record to the remote end.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        method: u32,
        flags: u16,
        fd: Option<&Fd>,
        data: &T,
    ) -> Result<()> {
        let payload = bincode::serialize(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut header = FrameHeader::new(method, flags);
        header.length = u16::try_from(FrameHeader::SIZE + payload.len())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let record_length = header.length as usize;

        let iovs = [
            IoSlice::new(header.as_bytes()),
            IoSlice::new(&payload),
        ];
        let bufs = if payload.is_empty() {
            &iovs[..1]
        } else {
            &iovs[..]
        };

        let sent = self
            .socket
            .send_with_fd(bufs, fd.map(AsRawFd::as_raw_fd))
            .await?;

        if sent != record_length {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short record"));
        }

        Ok(())
    }

    /// Receive one record from the remote end.
    ///
    /// Returns `None` once the peer has hung up.  Records split across
    /// multiple reads by the kernel are reassembled.
    pub async fn recv(&self) -> Result<Option<Envelope>> {
        let mut header = FrameHeader::default();
        let mut payload = vec![0u8; u16::MAX as usize];

        let (first, fds) = {
            let mut bufs = [
                IoSliceMut::new(header.as_bytes_mut()),
                IoSliceMut::new(&mut payload),
            ];
            self.socket.recv_with_fd(&mut bufs).await?
        };
        let mut fd = fds.into_iter().next();

        if first == 0 {
            return Ok(None);
        }
        if first < FrameHeader::SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated header"));
        }

        let record_length = header.length as usize;
        if record_length < FrameHeader::SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bogus record length"));
        }

        let mut received = first;
        while received < record_length {
            let offset = received - FrameHeader::SIZE;
            let (more, stray) = {
                let mut bufs = [IoSliceMut::new(&mut payload[offset..])];
                self.socket.recv_with_fd(&mut bufs).await?
            };

            if more == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "record cut short by hangup",
                ));
            }
            if fd.is_none() {
                fd = stray.into_iter().next();
            }

            received += more;
        }

        if received != record_length {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "overlong record"));
        }

        payload.truncate(record_length - FrameHeader::SIZE);

        Ok(Some(Envelope {
            header,
            fd,
            payload,
        }))
    }
}

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_serializes_to_nothing() {
        let data = bincode::serialize(&()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn header_is_twelve_bytes() {
        assert_eq!(FrameHeader::SIZE, 12);
    }

    #[tokio::test]
    async fn round_trip() {
        let (a, b) = Handler::pair().unwrap();

        a.send(7, 0, None, "hello").await.unwrap();
        let envelope = b.recv().await.unwrap().unwrap();

        assert_eq!(envelope.header.method, 7);
        assert!(!envelope.header.is_reply());
        assert!(envelope.fd.is_none());
        assert_eq!(envelope.decode::<String>().unwrap(), "hello");
    }

    #[tokio::test]
    async fn round_trip_with_fd() {
        let (a, b) = Handler::pair().unwrap();

        let file = tempfile::tempfile().unwrap();
        let fd = Fd::from(std::os::unix::io::IntoRawFd::into_raw_fd(file));

        a.send(3, FLAG_REPLY, Some(&fd), &()).await.unwrap();
        let envelope = b.recv().await.unwrap().unwrap();

        assert!(envelope.header.is_reply());
        let passed = envelope.fd.expect("descriptor crossed the socket");
        passed.is_open().unwrap();
    }

    #[tokio::test]
    async fn hangup_yields_none() {
        let (a, b) = Handler::pair().unwrap();
        drop(a);

        assert!(b.recv().await.unwrap().is_none());
    }
}
