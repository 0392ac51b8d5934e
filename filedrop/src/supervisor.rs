//! The privileged parent: forks the children, relays their logs and
//! orchestrates shutdown.
//!
//! The parent owns nothing else.  Once the children run it chroots into a
//! throwaway directory, drops privileges and waits for either a SIGINT or a
//! child exit; both trigger the same shutdown: SIGINT to both children, one
//! second of grace, SIGKILL for stragglers.

use crate::{
    config::Config,
    error::Result,
    net::{socketpair, Fd},
    process::{self, ChildProc},
    sandbox::{self, Jail, Role},
};
use arrayvec::ArrayVec;
use filedrop_log::{debug, error, info, warn};
use nix::{
    sys::signal::{kill, Signal},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
};
use filedrop_log::Level;
use serde_json::Value;
use std::{str::FromStr, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::unix::pipe,
    signal::unix::{signal, SignalKind},
    time::{sleep, timeout},
};

/// Both children, in spawn order.
type Children = ArrayVec<ChildProc, 2>;

/// Entry point of the parent process.
pub async fn run(config: &Config) -> Result<()> {
    let (rpc_store, rpc_web) = socketpair()?;
    let (fd_store, fd_web) = socketpair()?;

    let mut children = Children::new();
    children.push(process::fork_child("store", [&rpc_store, &fd_store])?);
    children.push(process::fork_child("webserver", [&rpc_web, &fd_web])?);

    // The parent's copies: the children hold their own duplicates.
    drop(rpc_store);
    drop(rpc_web);
    drop(fd_store);
    drop(fd_web);

    for child in &mut children {
        let name = child.name;
        let log = child.log.take().expect("log pipe of a fresh child");
        tokio::spawn(async move {
            if let Err(err) = relay_child_logs(name, log).await {
                warn!("Log relay failed"; "child" => name, "error" => err.to_string());
            }
        });
    }

    info!(
        "Children are running";
        "store" => children[0].pid.as_raw(),
        "webserver" => children[1].pid.as_raw()
    );

    // Nothing to keep in the filesystem: jail the parent into an empty
    // throwaway directory.
    let jail_root = tempfile::Builder::new()
        .prefix("filedrop-supervisor-")
        .tempdir()?
        .into_path();
    sandbox::apply(
        Role::Supervisor,
        &Jail {
            root: &jail_root,
            user: &config.user,
            group: &config.group,
        },
    )?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigchld = signal(SignalKind::child())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Caught interrupt, shutting down");
        }
        _ = sigchld.recv() => {
            warn!("A child exited, shutting down the rest");
        }
    }

    shutdown(&children).await;

    Ok(())
}

/// Read one child's log pipe and re-emit every record under our logger.
///
/// Children write newline-delimited JSON objects with at least `level` and
/// `msg`; all other members are carried over as fields.
async fn relay_child_logs(name: &'static str, log: Fd) -> std::io::Result<()> {
    let receiver = pipe::Receiver::from_owned_fd(log.into_owned())?;
    let mut lines = BufReader::new(receiver).lines();

    while let Some(line) = lines.next_line().await? {
        let record: Value = match serde_json::from_str(&line) {
            Ok(Value::Object(record)) => Value::Object(record),
            _ => {
                warn!("Unparsable child message"; "child" => name, "msg" => &line);
                continue;
            }
        };

        let level = record["level"]
            .as_str()
            .and_then(|level| Level::from_str(level).ok());
        let level = match level {
            Some(level) => level,
            None => {
                warn!("Child message misses a level"; "child" => name, "msg" => &line);
                continue;
            }
        };

        let msg = record["msg"].as_str().unwrap_or_default().to_string();
        let mut msg_with_fields = msg;
        if let Value::Object(members) = &record {
            for (key, value) in members {
                if matches!(key.as_str(), "level" | "msg" | "time") {
                    continue;
                }

                msg_with_fields.push_str(&format!(", {}: {}", key, display(value)));
            }
        }

        match level {
            Level::Critical | Level::Error => {
                error!("{}", msg_with_fields; "child" => name)
            }
            Level::Warning => warn!("{}", msg_with_fields; "child" => name),
            Level::Info => info!("{}", msg_with_fields; "child" => name),
            Level::Debug | Level::Trace => {
                debug!("{}", msg_with_fields; "child" => name)
            }
        }
    }

    debug!("Log pipe closed"; "child" => name);

    Ok(())
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interrupt both children, grant one second of grace each, then kill.
async fn shutdown(children: &Children) {
    for child in children {
        if let Err(err) = kill(child.pid, Signal::SIGINT) {
            debug!("Child is already gone"; "child" => child.name, "error" => err.to_string());
        }
    }

    for child in children {
        if timeout(Duration::from_secs(1), reap(child.pid))
            .await
            .is_ok()
        {
            info!("Child exited"; "child" => child.name);
            continue;
        }

        warn!("Child ignored the interrupt, killing it"; "child" => child.name);
        let _ = kill(child.pid, Signal::SIGKILL);
        let _ = reap(child.pid).await;
    }
}

/// Poll-wait until the process is gone.
async fn reap(pid: nix::unistd::Pid) {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => sleep(Duration::from_millis(50)).await,
            Ok(_) | Err(_) => break,
        }
    }
}
