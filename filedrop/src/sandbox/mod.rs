//! Post-setup hardening: chroot, privilege drop and a per-role syscall
//! filter.
//!
//! Every process calls [`apply`] exactly once, after its setup work (socket
//! creation, file preloading) and before entering its service loop.  A
//! failure in any step is fatal; the process must not serve a single request
//! half-sandboxed.

mod seccomp;

#[cfg(target_os = "openbsd")]
mod pledge;

use crate::{
    error::{Error, Result},
    process,
};
use cfg_if::cfg_if;
use filedrop_log::debug;
use nix::unistd::{chown, Group, User};
use std::{
    fs,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::Path,
};

/// The three processes, each with its own hardening recipe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Supervisor,
    Store,
    Webserver,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Supervisor => "supervisor",
            Role::Store => "store",
            Role::Webserver => "webserver",
        }
    }

    /// The seccomp filter expression for this role.
    ///
    /// The shared base allows the usual service syscalls while cutting
    /// everything a file-drop daemon has no business doing; each role denies
    /// a little more on top.
    fn filter(&self) -> Vec<&'static str> {
        let mut filter = vec![
            "@system-service",
            "~@chown",
            "~@clock",
            "~@cpu-emulation",
            "~@debug",
            "~@keyring",
            "~@memlock",
            "~@module",
            "~@mount",
            "~@privileged",
            "~@reboot",
            "~@sandbox",
            "~@setuid",
            "~@swap",
        ];

        match self {
            Role::Supervisor => {
                filter.extend(["~@network-io", "~execve", "~execveat", "~fork"]);
            }
            Role::Store | Role::Webserver => {
                filter.extend([
                    "~bind", "~connect", "~listen", "~execve", "~execveat", "~fork", "~kill",
                ]);
            }
        }

        filter
    }

    /// The pledge promises for this role.
    #[cfg_attr(not(target_os = "openbsd"), allow(dead_code))]
    fn promises(&self) -> &'static str {
        match self {
            Role::Supervisor => "stdio tty proc error",
            Role::Store => "stdio rpath wpath cpath flock unix sendfd recvfd error",
            Role::Webserver => "stdio unix sendfd recvfd error",
        }
    }
}

/// A chroot target together with the unprivileged identity to drop to.
#[derive(Debug)]
pub struct Jail<'a> {
    pub root: &'a Path,
    pub user: &'a str,
    pub group: &'a str,
}

/// Lock the process down: chroot into the jail, become the unprivileged
/// user, then install the role's syscall filter.
pub fn apply(role: Role, jail: &Jail<'_>) -> Result<()> {
    debug!(
        "Applying sandbox";
        "role" => role.name(),
        "root" => jail.root.display().to_string()
    );

    process::drop_privileges(jail.root, jail.user, jail.group)?;

    cfg_if! {
        if #[cfg(target_os = "linux")] {
            seccomp::install(&role.filter())?;
        } else if #[cfg(target_os = "openbsd")] {
            let _ = role.filter();
            pledge::pledge(role.promises())?;
        } else {
            let _ = role.filter();
            debug!("No syscall filter on this platform"; "role" => role.name());
        }
    }

    Ok(())
}

/// Make sure a jail directory exists with mode 0700, owned by the target
/// user and group.
pub fn ensure_jail_dir(path: &Path, user: &str, group: &str) -> Result<()> {
    if !path.is_dir() {
        fs::DirBuilder::new().mode(0o700).create(path)?;
    }

    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;

    let (uid, gid) = lookup_user_group(user, group)?;
    chown(path, Some(uid), Some(gid)).map_err(|err| Error::Privdrop("chown", err))?;

    Ok(())
}

/// Resolve the unprivileged identity from the password and group databases.
pub fn lookup_user_group(
    user: &str,
    group: &str,
) -> Result<(nix::unistd::Uid, nix::unistd::Gid)> {
    let user_entry = User::from_name(user)?
        .ok_or_else(|| Error::UnknownUser(user.to_string().into()))?;
    let group_entry = Group::from_name(group)?
        .ok_or_else(|| Error::UnknownUser(group.to_string().into()))?;

    Ok((user_entry.uid, group_entry.gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_deny_their_extras() {
        for role in [Role::Supervisor, Role::Store, Role::Webserver] {
            let filter = role.filter();

            assert_eq!(filter[0], "@system-service");
            assert!(filter.contains(&"~execve"));
            assert!(filter.contains(&"~@privileged"));
        }

        assert!(Role::Supervisor.filter().contains(&"~@network-io"));
        assert!(Role::Store.filter().contains(&"~bind"));
        assert!(Role::Webserver.filter().contains(&"~kill"));
        assert!(!Role::Supervisor.filter().contains(&"~kill"));
    }

    #[test]
    fn promises_per_role() {
        assert!(Role::Store.promises().contains("wpath"));
        assert!(!Role::Webserver.promises().contains("rpath"));
        assert!(Role::Supervisor.promises().contains("proc"));
    }
}
