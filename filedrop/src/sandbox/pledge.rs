//! pledge(2) promises, the OpenBSD flavor of the syscall filter.

use crate::error::{Error, Result};
use std::ffi::CString;

/// Restrict the process to the given promise string.  No execpromises: the
/// children never execute anything.
pub fn pledge(promises: &str) -> Result<()> {
    let promises = CString::new(promises)
        .map_err(|_| Error::Sandbox("pledge promises contain a NUL".into()))?;

    let res = unsafe { libc::pledge(promises.as_ptr(), std::ptr::null()) };
    if res != 0 {
        return Err(Error::Sandbox("pledge".into()));
    }

    Ok(())
}
