//! Process inspection: liveness, pid reuse guard, server discovery.

use std::process::Stdio;
use sysinfo::{Pid, ProcessRefreshKind, System, UpdateKind};

use crate::error::ProxyError;

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission check.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Start time of a process (Unix seconds), if it exists.
pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sysinfo_pid, ProcessRefreshKind::new());
    sys.process(sysinfo_pid).map(|process| process.start_time())
}

pub fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: getppid has no preconditions and cannot fail.
        unsafe { libc::getppid() as u32 }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Parent of `pid` as the process table reports it. Init is never returned.
pub fn parent_of(pid: u32) -> Option<u32> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sysinfo_pid, ProcessRefreshKind::new());
    sys.process(sysinfo_pid)
        .and_then(|process| process.parent())
        .map(|parent| parent.as_u32())
        .filter(|parent| *parent > 1)
}

/// Owner for a server started without an explicit one.
///
/// A client's parent is usually a build tool invocation that lives no longer
/// than one build, so the server watches the host one level above it and
/// only falls back to the parent at the top of the tree.
pub fn default_owner_pid() -> u32 {
    let parent = parent_pid();
    parent_of(parent).unwrap_or(parent)
}

/// The process whose death ends this proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerWatch {
    /// An explicit owner, pinned by its start time so a reused pid is not
    /// mistaken for it.
    Owner { pid: u32, started: Option<u64> },
    /// Our parent at startup. Being reparented means it died.
    Parent { pid: u32 },
}

impl OwnerWatch {
    pub fn owner(pid: u32) -> Self {
        OwnerWatch::Owner {
            pid,
            started: get_process_start_time(pid),
        }
    }

    pub fn parent() -> Self {
        OwnerWatch::Parent { pid: parent_pid() }
    }

    pub fn pid(&self) -> u32 {
        match self {
            OwnerWatch::Owner { pid, .. } | OwnerWatch::Parent { pid } => *pid,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            OwnerWatch::Owner { pid, started } => {
                if !is_pid_alive(*pid) {
                    return false;
                }
                match (started, get_process_start_time(*pid)) {
                    // Allow small drift between samples.
                    (Some(expected), Some(actual)) => expected.abs_diff(actual) <= 2,
                    (Some(_), None) => false,
                    (None, _) => true,
                }
            }
            OwnerWatch::Parent { pid } => {
                *pid > 1 && parent_pid() == *pid && is_pid_alive(*pid)
            }
        }
    }
}

/// Finds a running server process for `session_id` by its command line.
pub fn find_session_server(session_id: &str) -> Option<u32> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));
    let own_pid = std::process::id();

    sys.processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .find(|(_, process)| is_server_command(process.cmd(), session_id))
        .map(|(pid, _)| pid.as_u32())
}

fn is_server_command(cmd: &[String], session_id: &str) -> bool {
    let flag_value = |flag: &str| {
        cmd.windows(2)
            .find(|pair| pair[0] == flag)
            .map(|pair| pair[1].as_str())
    };
    flag_value("--proxy-role") == Some("server") && flag_value("--proxy-session") == Some(session_id)
}

/// Starts a detached server for `session_id` running this same executable.
/// The server gets its own process group so the IDE's signals to the
/// client's group do not reach it.
pub fn spawn_detached_server(
    session_id: &str,
    owner_pid: Option<u32>,
    daemon_args: &[String],
) -> Result<u32, ProxyError> {
    let exe = std::env::current_exe()
        .map_err(|err| ProxyError::Process(format!("cannot locate own executable: {}", err)))?;

    let mut command = std::process::Command::new(&exe);
    command
        .arg("--proxy-role")
        .arg("server")
        .arg("--proxy-session")
        .arg(session_id);
    if let Some(pid) = owner_pid {
        command.arg("--proxy-owner-pid").arg(pid.to_string());
    }
    if !daemon_args.is_empty() {
        command.arg("--").args(daemon_args);
    }
    command
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn().map_err(|source| ProxyError::DaemonSpawn {
        path: exe.clone(),
        source,
    })?;
    Ok(child.id())
}
