//! Process plumbing: pipes, privilege dropping and the fork/exec of the
//! child processes.
//!
//! The supervisor re-executes its own binary for each child, with the role
//! appended as `--fork-child <name>`.  A child starts with a fixed
//! descriptor layout: stdin is /dev/null, stdout and stderr lead into the
//! supervisor's log pipe, fd 3 is the RPC socket and fd 4 the descriptor
//! channel.

use crate::{
    error::{Error, Result},
    net::Fd,
    sandbox,
};
use cfg_if::cfg_if;
use close_fds::close_open_fds;
use nix::{
    fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag},
    sys::stat::Mode,
    unistd::{self, chdir, chroot, dup2, execve, fork, ForkResult, Pid},
};
use std::{env, ffi::CString, os::unix::io::AsRawFd, path::Path};

/// The RPC socket, as inherited by both children.
pub const RPC_FD: i32 = 3;

/// The descriptor-passing socket, as inherited by both children.
pub const FDPASS_FD: i32 = 4;

/// Command line flag selecting the child role.
pub const FORK_CHILD_FLAG: &str = "--fork-child";

/// A forked child, from the supervisor's point of view.
#[derive(Debug)]
pub struct ChildProc {
    pub name: &'static str,
    pub pid: Pid,
    /// Read end of the child's log pipe, taken by the log relay task.
    pub log: Option<Fd>,
}

/// Wrapper around pipe2(2); the write end blocks, the read end does not.
///
/// The read end is meant to be driven by tokio, the write end may become a
/// child's stdio.
pub fn log_pipe() -> Result<(Fd, Fd)> {
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let read = Fd::from(read);
    read.set_nonblocking(true)?;

    Ok((read, Fd::from(write)))
}

/// Wrapper around pipe2(2) with both ends non-blocking, for the upload
/// body transfer.
pub fn pipe() -> Result<(Fd, Fd)> {
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;

    Ok((Fd::from(read), Fd::from(write)))
}

/// Fork and execute a child process for the given role.
///
/// `sockets` are the child's ends of the RPC and descriptor channels; they
/// land on fds 3 and 4.  The caller keeps the returned log pipe.
pub fn fork_child(name: &'static str, sockets: [&Fd; 2]) -> Result<ChildProc> {
    let (log_read, log_write) = log_pipe()?;

    // Prepared before fork: only async-signal-safe calls may follow it, and
    // in particular nothing that allocates.
    let program = path_to_cstr(&env::current_exe()?);
    let mut args: Vec<CString> = env::args()
        .map(|arg| CString::new(arg).expect("argv without NUL"))
        .collect();
    args.push(CString::new(FORK_CHILD_FLAG).unwrap());
    args.push(CString::new(name).unwrap());
    let environment = [CString::new(format!(
        "RUST_LOG={}",
        env::var("RUST_LOG").unwrap_or_default()
    ))
    .unwrap()];
    let arg_refs: Vec<&CString> = args.iter().collect();
    let env_refs: Vec<&CString> = environment.iter().collect();

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(log_write);

            Ok(ChildProc {
                name,
                pid: child,
                log: Some(log_read),
            })
        }
        ForkResult::Child => {
            let devnull = open("/dev/null", OFlag::O_RDONLY, Mode::empty())?;
            dup2(devnull, 0)?;
            dup2(log_write.as_raw_fd(), 1)?;
            dup2(log_write.as_raw_fd(), 2)?;
            dup2(sockets[0].as_raw_fd(), RPC_FD)?;
            dup2(sockets[1].as_raw_fd(), FDPASS_FD)?;
            set_cloexec(RPC_FD, false)?;
            set_cloexec(FDPASS_FD, false)?;

            // Rust marks most of its descriptors close-on-exec, but
            // anything else inherited beyond the fixed layout is closed
            // explicitly.
            unsafe {
                close_open_fds(FDPASS_FD + 1, &[]);
            }

            execve(&program, &arg_refs, &env_refs)?;

            unreachable!("execve returned without an error");
        }
    }
}

/// Drop into the chroot and shed root, in that order: groups first, then
/// the group ids, then the user ids.
pub fn drop_privileges(root: &Path, user: &str, group: &str) -> Result<()> {
    let (uid, gid) = sandbox::lookup_user_group(user, group)?;

    chroot(root).map_err(|err| Error::Privdrop("chroot", err))?;
    chdir("/").map_err(|err| Error::Privdrop("chdir", err))?;

    #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
    unistd::setgroups(&[gid]).map_err(|err| Error::Privdrop("setgroups", err))?;

    cfg_if! {
        if #[cfg(any(target_os = "android", target_os = "freebsd",
                     target_os = "linux", target_os = "openbsd"))] {
            unistd::setresgid(gid, gid, gid).map_err(|err| Error::Privdrop("setresgid", err))?;
            unistd::setresuid(uid, uid, uid).map_err(|err| Error::Privdrop("setresuid", err))?;
        } else {
            unistd::setegid(gid).map_err(|err| Error::Privdrop("setegid", err))?;
            unistd::setgid(gid).map_err(|err| Error::Privdrop("setgid", err))?;
            unistd::seteuid(uid).map_err(|err| Error::Privdrop("seteuid", err))?;
            unistd::setuid(uid).map_err(|err| Error::Privdrop("setuid", err))?;
        }
    }

    Ok(())
}

fn set_cloexec(fd: i32, add: bool) -> Result<()> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;

    Ok(())
}

fn path_to_cstr(path: &Path) -> CString {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes()).expect("path without NUL")
}
