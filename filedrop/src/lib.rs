//! filedrop, a privilege-separated anonymous file-drop service.
//!
//! Privilege separation[1] splits a program into multiple isolated
//! processes that communicate only over a strict internal IPC.  filedrop
//! runs as three of them:
//!
//! * the privileged **supervisor** forks the children, relays their log
//!   records and coordinates shutdown,
//! * the **store** owns the on-disk index and blob tree, nothing else ever
//!   touches them,
//! * the **webserver** terminates HTTP and reaches the store exclusively
//!   through a framed RPC socketpair plus a second socketpair that carries
//!   `SCM_RIGHTS` file descriptor transfers.
//!
//! Upload bodies stream through a pipe whose read end is passed to the
//! store, so blob bytes never travel through the RPC channel in either
//! direction.  After setup each process chroots, drops to an unprivileged
//! user and installs a syscall filter (seccomp-bpf on Linux, pledge on
//! OpenBSD).
//!
//! The best-known implementations of this model are OpenSSH and OpenBSD's
//! relayd; filedrop applies it to something much smaller.
//!
//! [1]: https://en.wikipedia.org/wiki/Privilege_separation

pub mod config;
mod error;
pub mod human;
pub mod item;
pub mod net;
pub mod process;
pub mod rpc;
pub mod sandbox;
pub mod store;
pub mod supervisor;
pub mod web;

pub use error::{Error, Result};
