use crate::rpc::Fault;
use derive_more::{Display, From};
use std::{borrow::Cow, io};

/// Common errors of the filedrop processes.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    Io(io::Error),
    #[display(fmt = "{}", "_0")]
    Unix(nix::Error),
    #[display(fmt = "{}", "_0")]
    Join(tokio::task::JoinError),
    #[display(fmt = "{}", "_0")]
    Log(filedrop_log::Error),
    #[display(fmt = "configuration error: {}", "_0")]
    Config(String),
    #[display(fmt = "{}", "_0")]
    Fault(Fault),
    #[display(fmt = "protocol violation: {}", "_0")]
    Protocol(&'static str),
    #[display(fmt = "store error: {}", "_0")]
    #[from(ignore)]
    Store(String),
    #[display(fmt = "user or group {:?} not found", "_0")]
    #[from(ignore)]
    UnknownUser(Cow<'static, str>),
    #[display(fmt = "failed to drop privileges ({}): {}", "_0", "_1")]
    #[from(ignore)]
    Privdrop(&'static str, nix::Error),
    #[display(fmt = "sandbox setup failed: {}", "_0")]
    #[from(ignore)]
    Sandbox(Cow<'static, str>),
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
