//! Sharing one daemon between many short-lived proxy invocations.
//!
//! Each IDE invocation runs as a client: it writes a handshake naming two
//! pipe files and relays its stdio through them. A single detached server
//! per session owns the daemon and attaches it to whichever client's files
//! the handshake currently names, but never while a build is running.

pub mod client;
pub mod handshake;
pub mod lock;
pub mod server;

use buildservice_proxy_protocol::{HandshakeMessage, SessionStatus};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::process;
use handshake::HandshakeQueue;

/// How often handshakes and liveness are checked.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

pub const PIPES_DIR: &str = "pipes";
pub const SERVER_LOCK_FILE: &str = "server.lock";

/// How long `stop` waits for the server to acknowledge.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Asks the session server to shut its daemon down and waits for the answer.
pub async fn stop(config: &ProxyConfig, session_id: &str) -> Result<i32, ProxyError> {
    let Some(pid) = process::find_session_server(session_id) else {
        info!(session = session_id, "No session server running");
        return Ok(0);
    };

    let queue = HandshakeQueue::open(&config.session_dir(session_id))?;
    let build_id = new_build_id();
    queue.publish(&HandshakeMessage::stop(build_id)).await?;
    info!(pid, session = session_id, "Stop requested");

    let started = Instant::now();
    while started.elapsed() < STOP_ACK_TIMEOUT {
        tokio::time::sleep(POLL_INTERVAL).await;
        match queue.current().await {
            Ok(Some(current)) if current.build_id != build_id => {
                info!(newer = current.build_id, "Stop superseded by a new build");
                return Ok(0);
            }
            Ok(Some(current)) if current.status == Some(SessionStatus::Stopped) => {
                info!("Session server stopped");
                return Ok(0);
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "Handshake unreadable, retrying"),
        }
        if !process::is_pid_alive(pid) {
            return Ok(0);
        }
    }
    warn!(pid, "Session server did not acknowledge stop");
    Ok(1)
}

/// Microseconds since the epoch; later invocations get larger ids.
pub(crate) fn new_build_id() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// Removes the pipe files a build handshake names. Best effort.
pub(crate) fn remove_build_files(message: &HandshakeMessage) {
    for path in [&message.stdin_file, &message.stdout_file] {
        remove_file_quietly(path);
    }
}

fn remove_file_quietly(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    if let Err(err) = fs_err::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(error = %err, "Failed to remove pipe file");
        }
    }
}
