//! Unix-domain plumbing for message framing and file descriptor passing.

mod fd;
mod stream;

pub use fd::Fd;
pub use stream::{socketpair, UnixStream, UnixStreamExt};
