//! Cross-process store access.
//!
//! The webserver reaches the store over two Unix-domain socketpairs: one
//! carrying framed request/reply records, the other carrying nothing but
//! `SCM_RIGHTS` file descriptor transfers.  Upload payloads travel through a
//! pipe whose read end crosses the descriptor channel, so the frames stay
//! small and the body bytes never touch the RPC socket.

pub mod client;
pub mod fdpass;
pub mod frame;
pub mod server;

pub use client::StoreClient;
pub use fdpass::FdChannel;
pub use frame::Handler;
pub use server::StoreServer;

use derive_more::Display;
use serde_derive::{Deserialize, Serialize};
use std::io;

/// Store operations understood across the process boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Method {
    Get = 1,
    GetFile = 2,
    Put = 3,
    Delete = 4,
}

impl From<Method> for u32 {
    fn from(method: Method) -> u32 {
        method as u32
    }
}

impl TryFrom<u32> for Method {
    type Error = io::Error;

    fn try_from(id: u32) -> io::Result<Self> {
        match id {
            1 => Ok(Method::Get),
            2 => Ok(Method::GetFile),
            3 => Ok(Method::Put),
            4 => Ok(Method::Delete),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown RPC method {}", id),
            )),
        }
    }
}

/// Failure category; survives the wire so the HTTP layer can tell a missing
/// item apart from an internal error.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultKind {
    #[display(fmt = "not found")]
    NotFound,
    #[display(fmt = "id space exhausted")]
    IdExhaustion,
    #[display(fmt = "index error")]
    Index,
    #[display(fmt = "I/O error")]
    Io,
    #[display(fmt = "timeout")]
    Timeout,
    #[display(fmt = "protocol error")]
    Protocol,
}

/// A store operation failure, as seen by the caller.
#[derive(Clone, Debug, Display, Deserialize, Serialize)]
#[display(fmt = "{}: {}", kind, message)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(FaultKind::NotFound, "no item found for this ID")
    }

    pub fn id_exhaustion() -> Self {
        Self::new(FaultKind::IdExhaustion, "failed to find a free ID")
    }

    pub fn index(err: impl std::fmt::Display) -> Self {
        Self::new(FaultKind::Index, err.to_string())
    }

    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::new(FaultKind::Io, err.to_string())
    }

    pub fn timeout() -> Self {
        Self::new(FaultKind::Timeout, "store call exceeded its deadline")
    }

    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::new(FaultKind::Protocol, err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == FaultKind::NotFound
    }
}

impl std::error::Error for Fault {}

impl From<io::Error> for Fault {
    fn from(err: io::Error) -> Self {
        Self::io(err)
    }
}
