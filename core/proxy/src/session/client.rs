//! Client role: hand this invocation's stdio to the session server.

use buildservice_proxy_protocol::{HandshakeCommand, HandshakeMessage, SessionStatus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handshake::HandshakeQueue;
use super::{new_build_id, remove_build_files, PIPES_DIR, POLL_INTERVAL};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::process::{self, OwnerWatch};
use crate::relay::{Direction, Pump, Source, TailFile};

/// After our stdin closes, keep relaying until the daemon has been quiet
/// this long.
pub const DRAIN_IDLE: Duration = Duration::from_secs(2);

/// Output still in flight after the daemon exits gets this long to arrive.
const EXIT_DRAIN_IDLE: Duration = Duration::from_millis(500);

pub async fn run(config: &ProxyConfig, session_id: &str) -> Result<i32, ProxyError> {
    let queue = HandshakeQueue::open(&config.session_dir(session_id))?;
    let build_id = new_build_id();

    let pipes_dir = queue.dir().join(PIPES_DIR);
    fs_err::create_dir_all(&pipes_dir)?;
    let stdin_file = keep_temp_file(&pipes_dir, "stdin-")?;
    let stdout_file = keep_temp_file(&pipes_dir, "stdout-")?;

    let mut handshake = HandshakeMessage::build(build_id, stdin_file, stdout_file);
    handshake.status_file = config.status_file.as_deref().map(absolute).transpose()?;
    handshake.continue_building_after_errors = config.flags.continue_building_after_errors;
    handshake.single_file_path = config.flags.single_file_path.clone();

    if let Err(err) = queue.publish(&handshake).await {
        remove_build_files(&handshake);
        return Err(err);
    }
    info!(build_id, session = session_id, "Build handshake published");

    if let Some(pid) = process::find_session_server(session_id) {
        debug!(pid, "Session server already running");
    } else {
        let owner = config.owner_pid.unwrap_or_else(process::default_owner_pid);
        let pid = process::spawn_detached_server(session_id, Some(owner), &config.daemon_args)?;
        info!(pid, owner, "Started session server");
    }

    let cancel = CancellationToken::new();
    let frames = Arc::new(AtomicU64::new(0));

    let upstream_sink = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&handshake.stdin_file)
        .await?;
    let mut upstream = spawn_pump(
        Pump::new(Direction::ClientToServer)
            .source(Source::stream(tokio::io::stdin()))
            .sink(upstream_sink),
        &cancel,
    );
    let downstream = spawn_pump(
        Pump::new(Direction::ServerToClient)
            .source(Source::Tail(TailFile::open(&handshake.stdout_file).await?))
            .sink(tokio::io::stdout())
            .count_frames(frames.clone()),
        &cancel,
    );

    let outcome = monitor(&queue, &handshake, &mut upstream, &frames).await;

    cancel.cancel();
    let _ = downstream.await;
    if !upstream.is_finished() {
        upstream.abort();
    }

    match &outcome {
        Ok(Outcome::Superseded { attached: false }) | Err(_) => remove_build_files(&handshake),
        _ => {}
    }
    match outcome {
        Ok(outcome) => {
            debug!(build_id, ?outcome, "Client finished");
            Ok(outcome.exit_code())
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Drained,
    Superseded { attached: bool },
    Stopped,
    DaemonExited(i32),
    ParentGone,
}

impl Outcome {
    fn exit_code(&self) -> i32 {
        match self {
            Outcome::DaemonExited(code) => *code,
            _ => 0,
        }
    }
}

async fn monitor(
    queue: &HandshakeQueue,
    handshake: &HandshakeMessage,
    upstream: &mut JoinHandle<Result<u64, ProxyError>>,
    frames: &AtomicU64,
) -> Result<Outcome, ProxyError> {
    let parent = OwnerWatch::parent();
    let mut attached = false;
    let mut stdin_closed = false;
    let mut daemon_exit = None;
    let mut last_count = frames.load(Ordering::Relaxed);
    let mut last_activity = Instant::now();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            joined = &mut *upstream, if !stdin_closed => {
                stdin_closed = true;
                last_activity = Instant::now();
                match joined {
                    Ok(Ok(forwarded)) => debug!(forwarded, "Client stdin closed"),
                    Ok(Err(err)) => return Err(err),
                    Err(err) => return Err(ProxyError::Process(format!("stdin relay failed: {}", err))),
                }
            }
            _ = ticker.tick() => {}
        }

        if !parent.is_alive() {
            info!(pid = parent.pid(), "Parent process gone");
            return Ok(Outcome::ParentGone);
        }

        match queue.current().await {
            Ok(current) => match next_step(handshake.build_id, attached, current.as_ref()) {
                Step::Wait => {}
                Step::Attached => {
                    if !attached {
                        debug!("Attached to daemon");
                    }
                    attached = true;
                }
                Step::DaemonExited(code) => {
                    if daemon_exit.is_none() {
                        info!(code, "Daemon exited");
                        daemon_exit = Some(code);
                    }
                }
                Step::Finish(outcome) => {
                    info!(?outcome, "Handshake moved on");
                    return Ok(outcome);
                }
            },
            Err(ProxyError::LockTimeout { .. }) => {
                debug!("Handshake busy, checking again");
            }
            Err(err) => warn!(error = %err, "Failed to read handshake"),
        }

        let count = frames.load(Ordering::Relaxed);
        if count != last_count {
            last_count = count;
            last_activity = Instant::now();
        }
        if let Some(code) = daemon_exit {
            if last_activity.elapsed() >= EXIT_DRAIN_IDLE {
                return Ok(Outcome::DaemonExited(code));
            }
        } else if stdin_closed && last_activity.elapsed() >= DRAIN_IDLE {
            return Ok(Outcome::Drained);
        }
    }
}

/// What the handshake currently says about this client's build.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Wait,
    Attached,
    DaemonExited(i32),
    Finish(Outcome),
}

fn next_step(build_id: u64, attached: bool, current: Option<&HandshakeMessage>) -> Step {
    let Some(current) = current else {
        return Step::Finish(Outcome::Superseded { attached });
    };
    if current.build_id == build_id {
        return match current.status {
            Some(SessionStatus::Attached) => Step::Attached,
            Some(SessionStatus::Stopped) => Step::Finish(Outcome::Stopped),
            Some(SessionStatus::DaemonExited(code)) => Step::DaemonExited(code),
            None => Step::Wait,
        };
    }
    if !attached {
        return Step::Finish(Outcome::Superseded { attached: false });
    }

    // The daemon keeps writing to our pipes until the server moves them.
    match (current.command, current.status) {
        (_, Some(SessionStatus::DaemonExited(code))) => Step::DaemonExited(code),
        (HandshakeCommand::Stop, Some(SessionStatus::Stopped)) => Step::Finish(Outcome::Stopped),
        (HandshakeCommand::Build, Some(SessionStatus::Attached)) => {
            Step::Finish(Outcome::Superseded { attached: true })
        }
        _ => Step::Wait,
    }
}

fn spawn_pump(pump: Pump, cancel: &CancellationToken) -> JoinHandle<Result<u64, ProxyError>> {
    tokio::spawn(pump.run(cancel.clone()))
}

fn keep_temp_file(dir: &Path, prefix: &str) -> Result<PathBuf, ProxyError> {
    let file = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    let (_, path) = file.keep().map_err(|err| err.error)?;
    Ok(path)
}

fn absolute(path: &Path) -> Result<PathBuf, ProxyError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
