//! The listening socket, created while the process still may bind.
//!
//! Both TCP and Unix-domain listeners are supported.  A Unix socket file is
//! created under a restrictive umask and afterwards chowned and chmoded to
//! its configured owner, group and mode; a stale socket file from a
//! previous run is removed first.

use crate::{
    config::{ListenProtocol, WebserverConfig},
    error::{Error, Result},
    sandbox,
};
use nix::{sys::stat::{umask, Mode}, unistd::chown};
use std::{
    fs, io,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bound but not yet accepting socket.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

/// Create the webserver's listening socket.
pub fn create(config: &WebserverConfig, user: &str, group: &str) -> Result<BoundListener> {
    match config.listen.protocol {
        ListenProtocol::Tcp => {
            let listener = std::net::TcpListener::bind(&config.listen.bound)?;
            listener.set_nonblocking(true)?;

            Ok(BoundListener::Tcp(listener))
        }
        ListenProtocol::Unix => {
            let path = Path::new(&config.listen.bound);
            if path.exists() {
                fs::remove_file(path).map_err(|err| {
                    Error::Config(format!(
                        "cannot remove stale socket {}: {}",
                        path.display(),
                        err
                    ))
                })?;
            }

            // Nobody gets to touch the socket before ownership and mode are
            // in place.
            let old_umask = umask(Mode::from_bits_truncate(0o117));
            let listener = std::os::unix::net::UnixListener::bind(path);
            umask(old_umask);

            let listener = listener?;
            listener.set_nonblocking(true)?;

            let owner = config.unix_socket.owner.as_deref().unwrap_or(user);
            let owner_group = config.unix_socket.group.as_deref().unwrap_or(group);
            let (uid, gid) = sandbox::lookup_user_group(owner, owner_group)?;
            chown(path, Some(uid), Some(gid))?;

            let mode = u32::from_str_radix(&config.unix_socket.chmod, 8)
                .map_err(|_| Error::Config(format!("bad chmod {:?}", config.unix_socket.chmod)))?;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

            Ok(BoundListener::Unix(listener))
        }
    }
}

impl BoundListener {
    /// Register the socket with the runtime once setup is done.
    pub fn into_async(self) -> io::Result<Acceptor> {
        match self {
            BoundListener::Tcp(listener) => {
                tokio::net::TcpListener::from_std(listener).map(Acceptor::Tcp)
            }
            BoundListener::Unix(listener) => {
                tokio::net::UnixListener::from_std(listener).map(Acceptor::Unix)
            }
        }
    }
}

/// The accept half, either flavor.
#[derive(Debug)]
pub enum Acceptor {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl Acceptor {
    /// Accept one connection; TCP peers come with their IP address.
    pub async fn accept(&self) -> io::Result<(Connection, Option<IpAddr>)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Tcp(stream), Some(peer.ip())))
            }
            Acceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Connection::Unix(stream), None))
            }
        }
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
