//! seccomp-bpf syscall filtering from a set expression.
//!
//! An expression is a list of tokens: `@group` includes a named set,
//! `~@group` removes it again, `~name` removes a single syscall and `name`
//! adds one.  The resulting allowlist becomes a BPF program that answers
//! every other syscall with `EPERM`; records from a foreign architecture
//! kill the process outright.

#![cfg(target_os = "linux")]

use crate::error::{Error, Result};

pub fn install(expression: &[&str]) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            filter::install(expression)
        } else {
            filedrop_log::warn!(
                "seccomp filtering is not supported on this architecture, running unfiltered";
                "expression" => expression.join(" ")
            );
            Ok(())
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod filter {
    use super::*;
    use libc::{c_long, sock_filter, sock_fprog};
    use std::collections::BTreeSet;

    // BPF opcodes.
    const BPF_LD: u16 = 0x00;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    // seccomp return actions.
    const RET_ALLOW: u32 = 0x7fff_0000;
    const RET_ERRNO_EPERM: u32 = 0x0005_0000 | libc::EPERM as u32;
    const RET_KILL_PROCESS: u32 = 0x8000_0000;

    const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

    // Offsets into `struct seccomp_data`.
    const DATA_OFF_NR: u32 = 0;
    const DATA_OFF_ARCH: u32 = 4;

    const fn stmt(code: u16, k: u32) -> sock_filter {
        sock_filter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
        sock_filter { code, jt, jf, k }
    }

    /// Resolve the expression and load the resulting program.
    pub fn install(expression: &[&str]) -> Result<()> {
        let allowed = resolve(expression)?;
        let program = build(&allowed);

        let prog = sock_fprog {
            len: program.len() as u16,
            filter: program.as_ptr() as *mut sock_filter,
        };

        // The filter must not grant what the process could not do before.
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            return Err(Error::Sandbox("prctl(PR_SET_NO_NEW_PRIVS)".into()));
        }

        if unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &prog as *const sock_fprog,
            )
        } != 0
        {
            return Err(Error::Sandbox("prctl(PR_SET_SECCOMP)".into()));
        }

        Ok(())
    }

    /// Turn a set expression into the flat allowlist of syscall numbers.
    fn resolve(expression: &[&str]) -> Result<BTreeSet<c_long>> {
        let mut allowed = BTreeSet::new();

        for token in expression {
            match (token.strip_prefix("~@"), token.strip_prefix('~'), token.strip_prefix('@')) {
                (Some(group), _, _) => {
                    for nr in group_syscalls(group)? {
                        allowed.remove(nr);
                    }
                }
                (None, Some(name), _) => {
                    allowed.remove(&syscall_number(name)?);
                }
                (None, None, Some(group)) => {
                    allowed.extend(group_syscalls(group)?);
                }
                (None, None, None) => {
                    allowed.insert(syscall_number(token)?);
                }
            }
        }

        Ok(allowed)
    }

    /// Assemble the allowlist program.
    fn build(allowed: &BTreeSet<c_long>) -> Vec<sock_filter> {
        let mut program = Vec::with_capacity(allowed.len() * 2 + 5);

        program.push(stmt(BPF_LD | BPF_W | BPF_ABS, DATA_OFF_ARCH));
        program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0));
        program.push(stmt(BPF_RET | BPF_K, RET_KILL_PROCESS));

        program.push(stmt(BPF_LD | BPF_W | BPF_ABS, DATA_OFF_NR));
        for nr in allowed {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr as u32, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, RET_ALLOW));
        }

        program.push(stmt(BPF_RET | BPF_K, RET_ERRNO_EPERM));
        program
    }

    fn group_syscalls(name: &str) -> Result<&'static [c_long]> {
        let set: &[c_long] = match name {
            "system-service" => SYSTEM_SERVICE,
            "chown" => CHOWN,
            "clock" => CLOCK,
            "cpu-emulation" => CPU_EMULATION,
            "debug" => DEBUG,
            "keyring" => KEYRING,
            "memlock" => MEMLOCK,
            "module" => MODULE,
            "mount" => MOUNT,
            "network-io" => NETWORK_IO,
            "privileged" => PRIVILEGED,
            "reboot" => REBOOT,
            "sandbox" => SANDBOX,
            "setuid" => SETUID,
            "swap" => SWAP,
            _ => {
                return Err(Error::Sandbox(
                    format!("unknown syscall set @{}", name).into(),
                ))
            }
        };

        Ok(set)
    }

    fn syscall_number(name: &str) -> Result<c_long> {
        let nr = match name {
            "accept" => libc::SYS_accept,
            "accept4" => libc::SYS_accept4,
            "bind" => libc::SYS_bind,
            "connect" => libc::SYS_connect,
            "execve" => libc::SYS_execve,
            "execveat" => libc::SYS_execveat,
            "fork" => libc::SYS_fork,
            "kill" => libc::SYS_kill,
            "listen" => libc::SYS_listen,
            "ptrace" => libc::SYS_ptrace,
            "socket" => libc::SYS_socket,
            "vfork" => libc::SYS_vfork,
            _ => {
                return Err(Error::Sandbox(
                    format!("unknown syscall {}", name).into(),
                ))
            }
        };

        Ok(nr)
    }

    /// What a well-behaved network service gets to do, roughly.
    const SYSTEM_SERVICE: &[c_long] = &[
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_access,
        libc::SYS_alarm,
        libc::SYS_arch_prctl,
        libc::SYS_bind,
        libc::SYS_brk,
        libc::SYS_capget,
        libc::SYS_chdir,
        libc::SYS_chmod,
        libc::SYS_clock_getres,
        libc::SYS_clock_gettime,
        libc::SYS_clock_nanosleep,
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_close,
        libc::SYS_connect,
        libc::SYS_copy_file_range,
        libc::SYS_creat,
        libc::SYS_dup,
        libc::SYS_dup2,
        libc::SYS_dup3,
        libc::SYS_epoll_create,
        libc::SYS_epoll_create1,
        libc::SYS_epoll_ctl,
        libc::SYS_epoll_pwait,
        libc::SYS_epoll_wait,
        libc::SYS_eventfd,
        libc::SYS_eventfd2,
        libc::SYS_execve,
        libc::SYS_execveat,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_faccessat,
        libc::SYS_faccessat2,
        libc::SYS_fallocate,
        libc::SYS_fchdir,
        libc::SYS_fchmod,
        libc::SYS_fchmodat,
        libc::SYS_fcntl,
        libc::SYS_fdatasync,
        libc::SYS_flock,
        libc::SYS_fork,
        libc::SYS_fstat,
        libc::SYS_fstatfs,
        libc::SYS_fsync,
        libc::SYS_ftruncate,
        libc::SYS_futex,
        libc::SYS_getcwd,
        libc::SYS_getdents,
        libc::SYS_getdents64,
        libc::SYS_getegid,
        libc::SYS_geteuid,
        libc::SYS_getgid,
        libc::SYS_getgroups,
        libc::SYS_getitimer,
        libc::SYS_getpeername,
        libc::SYS_getpgid,
        libc::SYS_getpgrp,
        libc::SYS_getpid,
        libc::SYS_getppid,
        libc::SYS_getpriority,
        libc::SYS_getrandom,
        libc::SYS_getresgid,
        libc::SYS_getresuid,
        libc::SYS_getrlimit,
        libc::SYS_getrusage,
        libc::SYS_getsid,
        libc::SYS_getsockname,
        libc::SYS_getsockopt,
        libc::SYS_gettid,
        libc::SYS_gettimeofday,
        libc::SYS_getuid,
        libc::SYS_inotify_add_watch,
        libc::SYS_inotify_init,
        libc::SYS_inotify_init1,
        libc::SYS_inotify_rm_watch,
        libc::SYS_ioctl,
        libc::SYS_ioprio_get,
        libc::SYS_ioprio_set,
        libc::SYS_kill,
        libc::SYS_link,
        libc::SYS_linkat,
        libc::SYS_lseek,
        libc::SYS_lstat,
        libc::SYS_madvise,
        libc::SYS_membarrier,
        libc::SYS_memfd_create,
        libc::SYS_mkdir,
        libc::SYS_mkdirat,
        libc::SYS_mmap,
        libc::SYS_mprotect,
        libc::SYS_mremap,
        libc::SYS_msync,
        libc::SYS_munmap,
        libc::SYS_nanosleep,
        libc::SYS_newfstatat,
        libc::SYS_open,
        libc::SYS_openat,
        libc::SYS_pidfd_open,
        libc::SYS_pipe,
        libc::SYS_pipe2,
        libc::SYS_poll,
        libc::SYS_ppoll,
        libc::SYS_prctl,
        libc::SYS_pread64,
        libc::SYS_preadv,
        libc::SYS_preadv2,
        libc::SYS_prlimit64,
        libc::SYS_pselect6,
        libc::SYS_pwrite64,
        libc::SYS_pwritev,
        libc::SYS_pwritev2,
        libc::SYS_read,
        libc::SYS_readlink,
        libc::SYS_readlinkat,
        libc::SYS_readv,
        libc::SYS_recvfrom,
        libc::SYS_recvmmsg,
        libc::SYS_recvmsg,
        libc::SYS_rename,
        libc::SYS_renameat,
        libc::SYS_renameat2,
        libc::SYS_restart_syscall,
        libc::SYS_rmdir,
        libc::SYS_rseq,
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigpending,
        libc::SYS_rt_sigprocmask,
        libc::SYS_rt_sigqueueinfo,
        libc::SYS_rt_sigreturn,
        libc::SYS_rt_sigsuspend,
        libc::SYS_rt_sigtimedwait,
        libc::SYS_sched_getaffinity,
        libc::SYS_sched_yield,
        libc::SYS_select,
        libc::SYS_sendfile,
        libc::SYS_sendmmsg,
        libc::SYS_sendmsg,
        libc::SYS_sendto,
        libc::SYS_set_robust_list,
        libc::SYS_set_tid_address,
        libc::SYS_setitimer,
        libc::SYS_setpriority,
        libc::SYS_setrlimit,
        libc::SYS_setsid,
        libc::SYS_setsockopt,
        libc::SYS_shutdown,
        libc::SYS_sigaltstack,
        libc::SYS_signalfd,
        libc::SYS_signalfd4,
        libc::SYS_socket,
        libc::SYS_socketpair,
        libc::SYS_splice,
        libc::SYS_stat,
        libc::SYS_statfs,
        libc::SYS_statx,
        libc::SYS_symlink,
        libc::SYS_symlinkat,
        libc::SYS_sysinfo,
        libc::SYS_tee,
        libc::SYS_tgkill,
        libc::SYS_time,
        libc::SYS_timerfd_create,
        libc::SYS_timerfd_gettime,
        libc::SYS_timerfd_settime,
        libc::SYS_times,
        libc::SYS_tkill,
        libc::SYS_truncate,
        libc::SYS_umask,
        libc::SYS_uname,
        libc::SYS_unlink,
        libc::SYS_unlinkat,
        libc::SYS_utime,
        libc::SYS_utimensat,
        libc::SYS_utimes,
        libc::SYS_vfork,
        libc::SYS_vmsplice,
        libc::SYS_wait4,
        libc::SYS_waitid,
        libc::SYS_write,
        libc::SYS_writev,
    ];

    const CHOWN: &[c_long] = &[
        libc::SYS_chown,
        libc::SYS_fchown,
        libc::SYS_fchownat,
        libc::SYS_lchown,
    ];

    const CLOCK: &[c_long] = &[
        libc::SYS_adjtimex,
        libc::SYS_clock_adjtime,
        libc::SYS_clock_settime,
        libc::SYS_settimeofday,
    ];

    const CPU_EMULATION: &[c_long] = &[libc::SYS_modify_ldt];

    const DEBUG: &[c_long] = &[
        libc::SYS_kcmp,
        libc::SYS_perf_event_open,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_ptrace,
    ];

    const KEYRING: &[c_long] = &[libc::SYS_add_key, libc::SYS_keyctl, libc::SYS_request_key];

    const MEMLOCK: &[c_long] = &[
        libc::SYS_mlock,
        libc::SYS_mlock2,
        libc::SYS_mlockall,
        libc::SYS_munlock,
        libc::SYS_munlockall,
    ];

    const MODULE: &[c_long] = &[
        libc::SYS_delete_module,
        libc::SYS_finit_module,
        libc::SYS_init_module,
    ];

    const MOUNT: &[c_long] = &[
        libc::SYS_chroot,
        libc::SYS_fsconfig,
        libc::SYS_fsmount,
        libc::SYS_fsopen,
        libc::SYS_fspick,
        libc::SYS_mount,
        libc::SYS_mount_setattr,
        libc::SYS_move_mount,
        libc::SYS_open_tree,
        libc::SYS_pivot_root,
        libc::SYS_umount2,
    ];

    const NETWORK_IO: &[c_long] = &[
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_bind,
        libc::SYS_connect,
        libc::SYS_getpeername,
        libc::SYS_getsockname,
        libc::SYS_getsockopt,
        libc::SYS_listen,
        libc::SYS_recvfrom,
        libc::SYS_recvmmsg,
        libc::SYS_recvmsg,
        libc::SYS_sendmmsg,
        libc::SYS_sendmsg,
        libc::SYS_sendto,
        libc::SYS_setsockopt,
        libc::SYS_shutdown,
        libc::SYS_socket,
        libc::SYS_socketpair,
    ];

    const PRIVILEGED: &[c_long] = &[
        libc::SYS_acct,
        libc::SYS_bpf,
        libc::SYS_capset,
        libc::SYS_fanotify_init,
        libc::SYS_ioperm,
        libc::SYS_iopl,
        libc::SYS_nfsservctl,
        libc::SYS_open_by_handle_at,
        libc::SYS_personality,
        libc::SYS_quotactl,
        libc::SYS_setdomainname,
        libc::SYS_sethostname,
        libc::SYS_vhangup,
    ];

    const REBOOT: &[c_long] = &[
        libc::SYS_kexec_file_load,
        libc::SYS_kexec_load,
        libc::SYS_reboot,
    ];

    const SANDBOX: &[c_long] = &[
        libc::SYS_landlock_add_rule,
        libc::SYS_landlock_create_ruleset,
        libc::SYS_landlock_restrict_self,
        libc::SYS_seccomp,
    ];

    const SETUID: &[c_long] = &[
        libc::SYS_setfsgid,
        libc::SYS_setfsuid,
        libc::SYS_setgid,
        libc::SYS_setgroups,
        libc::SYS_setregid,
        libc::SYS_setresgid,
        libc::SYS_setresuid,
        libc::SYS_setreuid,
        libc::SYS_setuid,
    ];

    const SWAP: &[c_long] = &[libc::SYS_swapoff, libc::SYS_swapon];

    #[cfg(test)]
    mod tests {
        use super::*;

        fn store_expression() -> Vec<&'static str> {
            crate::sandbox::Role::Store.filter()
        }

        #[test]
        fn resolve_store_filter() {
            let allowed = resolve(&store_expression()).unwrap();

            // plumbing the store needs
            assert!(allowed.contains(&libc::SYS_read));
            assert!(allowed.contains(&libc::SYS_openat));
            assert!(allowed.contains(&libc::SYS_recvmsg));
            assert!(allowed.contains(&libc::SYS_unlink));

            // denied on top of the base
            assert!(!allowed.contains(&libc::SYS_bind));
            assert!(!allowed.contains(&libc::SYS_listen));
            assert!(!allowed.contains(&libc::SYS_execve));
            assert!(!allowed.contains(&libc::SYS_kill));

            // denied by the base itself
            assert!(!allowed.contains(&libc::SYS_chroot));
            assert!(!allowed.contains(&libc::SYS_setuid));
            assert!(!allowed.contains(&libc::SYS_ptrace));
        }

        #[test]
        fn supervisor_loses_the_network() {
            let allowed = resolve(&crate::sandbox::Role::Supervisor.filter()).unwrap();

            assert!(!allowed.contains(&libc::SYS_socket));
            assert!(!allowed.contains(&libc::SYS_sendmsg));
            assert!(allowed.contains(&libc::SYS_wait4));
            assert!(allowed.contains(&libc::SYS_kill));
        }

        #[test]
        fn webserver_keeps_accepting() {
            let allowed = resolve(&crate::sandbox::Role::Webserver.filter()).unwrap();

            assert!(allowed.contains(&libc::SYS_accept4));
            assert!(!allowed.contains(&libc::SYS_bind));
        }

        #[test]
        fn unknown_tokens_are_fatal() {
            assert!(resolve(&["@no-such-set"]).is_err());
            assert!(resolve(&["~no_such_call"]).is_err());
        }

        #[test]
        fn program_shape() {
            let allowed = resolve(&store_expression()).unwrap();
            let program = build(&allowed);

            assert_eq!(program.len(), allowed.len() * 2 + 5);
            assert_eq!(program.last().unwrap().k, RET_ERRNO_EPERM);
        }
    }
}
