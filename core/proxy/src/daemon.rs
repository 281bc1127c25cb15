//! Locating, starting and stopping the real build service daemon.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use crate::config::{ProxyConfig, SWB_SERVICE};
use crate::error::ProxyError;

/// Finds the daemon executable: an explicit override, or the renamed
/// original next to where the proxy was installed in the active toolchain.
pub fn resolve_daemon_path(config: &ProxyConfig) -> Result<PathBuf, ProxyError> {
    if let Some(path) = config.daemon_path.as_ref() {
        return Ok(path.clone());
    }

    let output = std::process::Command::new("xcode-select")
        .arg("-p")
        .output()
        .map_err(|err| ProxyError::Process(format!("xcode-select failed: {}", err)))?;
    if !output.status.success() {
        return Err(ProxyError::Process(format!(
            "xcode-select -p exited with {}",
            output.status
        )));
    }
    let developer_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(daemon_path_in(Path::new(&developer_dir), &config.service_name))
}

pub fn daemon_path_in(developer_dir: &Path, service_name: &str) -> PathBuf {
    let contents_dir = if developer_dir.ends_with("Developer") {
        developer_dir.parent().unwrap_or(developer_dir)
    } else {
        developer_dir
    };
    let framework = if service_name == SWB_SERVICE {
        "SwiftBuild.framework"
    } else {
        "XCBuild.framework"
    };
    contents_dir
        .join("SharedFrameworks")
        .join(framework)
        .join("Versions/A/PlugIns")
        .join(format!("{}.bundle", service_name))
        .join("Contents/MacOS")
        .join(format!("{}-origin", service_name))
}

pub struct DaemonPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub struct Daemon {
    child: Child,
    path: PathBuf,
}

impl Daemon {
    pub fn spawn(path: &Path, args: &[String]) -> Result<(Self, DaemonPipes), ProxyError> {
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProxyError::DaemonSpawn {
                path: path.to_path_buf(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ProxyError::Process("daemon pipes unavailable".to_string()));
        };
        info!(pid = child.id(), path = %path.display(), "Daemon started");

        Ok((
            Self {
                child,
                path: path.to_path_buf(),
            },
            DaemonPipes { stdin, stdout },
        ))
    }

    /// Exit code if the daemon has already exited.
    pub fn try_exit_code(&mut self) -> Result<Option<i32>, ProxyError> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    pub async fn wait(&mut self) -> Result<i32, ProxyError> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    /// SIGTERM, then SIGKILL once `grace` runs out. Always reaps the child.
    pub async fn terminate(mut self, grace: Duration) -> i32 {
        if let Ok(Some(code)) = self.try_exit_code() {
            return code;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: pid belongs to our own unreaped child.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                let code = exit_code(status);
                info!(code, path = %self.path.display(), "Daemon stopped");
                return code;
            }
            Ok(Err(err)) => warn!(error = %err, "Waiting for daemon failed"),
            Err(_) => warn!(grace = ?grace, "Daemon ignored SIGTERM, killing"),
        }

        if let Err(err) = self.child.kill().await {
            warn!(error = %err, "Killing daemon failed");
        }
        match self.child.wait().await {
            Ok(status) => exit_code(status),
            Err(_) => 1,
        }
    }
}

/// Exit code, with death by signal `n` reported shell-style as `128 + n`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
