//! Server role: one persistent daemon, handed from client to client.

use buildservice_proxy_protocol::{HandshakeCommand, HandshakeMessage, SessionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handshake::HandshakeQueue;
use super::lock::FileLock;
use super::{remove_build_files, POLL_INTERVAL, SERVER_LOCK_FILE};
use crate::config::{ProxyConfig, RequestFlags};
use crate::daemon::{resolve_daemon_path, Daemon};
use crate::error::ProxyError;
use crate::modifier::RequestModifier;
use crate::process::OwnerWatch;
use crate::relay::{Direction, Pump, Reattach, Source, TailFile};
use crate::state::SharedState;
use crate::tracker::open_status_sink;

const DAEMON_STOP_GRACE: Duration = Duration::from_secs(2);
const FINAL_FLUSH_WAIT: Duration = Duration::from_secs(1);

type PumpTask = JoinHandle<Result<u64, ProxyError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    OwnerGone,
    DaemonExited(i32),
    RelayEnded,
}

pub async fn run(config: &ProxyConfig, session_id: &str) -> Result<i32, ProxyError> {
    let session_dir = config.session_dir(session_id);
    let queue = HandshakeQueue::open(&session_dir)?;
    let Some(instance) = FileLock::try_acquire(&session_dir.join(SERVER_LOCK_FILE))? else {
        info!(session = session_id, "Another server already owns this session");
        return Ok(0);
    };
    debug!(lock = %instance.path().display(), "Server lock held");

    let owner = config.owner_pid.map(OwnerWatch::owner);
    match &owner {
        Some(owner) => info!(session = session_id, owner = owner.pid(), "Session server starting"),
        None => warn!(session = session_id, "No owner process to watch, running until stopped"),
    }

    let daemon_path = resolve_daemon_path(config)?;
    let (daemon, pipes) = Daemon::spawn(&daemon_path, &config.daemon_args)?;

    let state = Arc::new(SharedState::new(None));
    let cancel = CancellationToken::new();
    let (upstream, upstream_ctl) = Pump::new(Direction::ClientToServer)
        .sink(pipes.stdin)
        .observed_by(state.clone())
        .reattachable();
    let (downstream, downstream_ctl) = Pump::new(Direction::ServerToClient)
        .source(Source::stream(pipes.stdout))
        .observed_by(state.clone())
        .reattachable();

    let mut server = Server {
        queue,
        state,
        owner,
        daemon,
        cancel: cancel.clone(),
        upstream: tokio::spawn(upstream.run(cancel.clone())),
        downstream: tokio::spawn(downstream.run(cancel)),
        upstream_ctl,
        downstream_ctl,
        attached: None,
        pending: None,
    };

    let exit = server.serve().await;
    let code = server.shutdown(exit).await;
    drop(instance);
    Ok(code)
}

struct Server {
    queue: HandshakeQueue,
    state: Arc<SharedState>,
    owner: Option<OwnerWatch>,
    daemon: Daemon,
    cancel: CancellationToken,
    upstream: PumpTask,
    downstream: PumpTask,
    upstream_ctl: tokio::sync::mpsc::Sender<Reattach>,
    downstream_ctl: tokio::sync::mpsc::Sender<Reattach>,
    attached: Option<HandshakeMessage>,
    pending: Option<HandshakeMessage>,
}

impl Server {
    async fn serve(&mut self) -> Exit {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;

            if let Some(owner) = self.owner.as_ref() {
                if !owner.is_alive() {
                    info!(owner = owner.pid(), "Owner process gone");
                    return Exit::OwnerGone;
                }
            }

            match self.daemon.try_exit_code() {
                Ok(Some(code)) => return Exit::DaemonExited(code),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Failed to poll daemon"),
            }
            if self.upstream.is_finished() || self.downstream.is_finished() {
                return Exit::RelayEnded;
            }

            match self.queue.poll().await {
                Ok(Some(message)) => {
                    if let Some(stale) = self.pending.replace(message) {
                        debug!(build_id = stale.build_id, "Pending handshake superseded");
                    }
                }
                Ok(None) => {}
                Err(ProxyError::LockTimeout { .. }) => debug!("Handshake busy, polling again"),
                Err(err) => warn!(error = %err, "Failed to poll handshake"),
            }

            let Some(message) = self.pending.take() else {
                continue;
            };
            match hand_off(&message, self.state.is_building()) {
                HandOff::Stop => {
                    self.set_status(message.build_id, SessionStatus::Stopped).await;
                    return Exit::Stopped;
                }
                HandOff::Defer => {
                    debug!(build_id = message.build_id, "Build in progress, deferring hand-off");
                    self.pending = Some(message);
                }
                HandOff::Attach => {
                    let build_id = message.build_id;
                    if let Err(err) = self.attach(message).await {
                        warn!(build_id, error = %err, "Failed to attach client");
                    }
                }
            }
        }
    }

    /// Points both relays at the pipe files `message` names.
    async fn attach(&mut self, message: HandshakeMessage) -> Result<(), ProxyError> {
        let source = TailFile::open(&message.stdin_file).await?;
        let sink = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&message.stdout_file)
            .await?;

        let status_sink = message.status_file.as_deref().and_then(open_status_sink);
        self.state.begin_build(status_sink);

        let modifier = RequestModifier::new(RequestFlags {
            continue_building_after_errors: message.continue_building_after_errors,
            single_file_path: message.single_file_path.clone(),
        });
        let detached = || ProxyError::Process("relay stopped".to_string());
        self.upstream_ctl
            .send(Reattach {
                source: Some(Source::Tail(source)),
                modifier: Some(modifier),
                ..Reattach::default()
            })
            .await
            .map_err(|_| detached())?;
        self.downstream_ctl
            .send(Reattach {
                sink: Some(Box::new(sink)),
                ..Reattach::default()
            })
            .await
            .map_err(|_| detached())?;

        self.set_status(message.build_id, SessionStatus::Attached).await;
        info!(build_id = message.build_id, "Client attached");

        if let Some(previous) = self.attached.replace(message) {
            remove_build_files(&previous);
        }
        Ok(())
    }

    async fn set_status(&self, build_id: u64, status: SessionStatus) {
        set_status(&self.queue, build_id, status).await
    }

    async fn shutdown(self, exit: Exit) -> i32 {
        let Server {
            queue,
            daemon,
            cancel,
            mut upstream,
            mut downstream,
            attached,
            ..
        } = self;

        let code = match exit {
            Exit::DaemonExited(code) => {
                let _ = tokio::time::timeout(FINAL_FLUSH_WAIT, &mut downstream).await;
                cancel.cancel();
                report_daemon_exit(&queue, code).await;
                code
            }
            Exit::RelayEnded => {
                for (direction, task) in [("client", &mut upstream), ("server", &mut downstream)] {
                    if let Some(Err(err)) = finished_result(task).await {
                        error!(direction, error = %err, "Relay failed");
                    }
                }
                cancel.cancel();
                let mut daemon = daemon;
                let waited = tokio::time::timeout(DAEMON_STOP_GRACE, daemon.wait()).await;
                let code = match waited {
                    Ok(Ok(code)) => code,
                    _ => daemon.terminate(DAEMON_STOP_GRACE).await,
                };
                report_daemon_exit(&queue, code).await;
                code
            }
            Exit::Stopped | Exit::OwnerGone => {
                cancel.cancel();
                daemon.terminate(DAEMON_STOP_GRACE).await;
                0
            }
        };

        if let Some(attached) = attached {
            remove_build_files(&attached);
        }
        info!(?exit, code, "Session server stopped");
        code
    }
}

async fn set_status(queue: &HandshakeQueue, build_id: u64, status: SessionStatus) {
    match queue.set_status(build_id, status).await {
        Ok(true) => {}
        Ok(false) => debug!(build_id, "Handshake moved on, status not written"),
        Err(err) => warn!(build_id, error = %err, "Failed to write handshake status"),
    }
}

/// Tells whichever client the handshake names that the daemon is gone.
async fn report_daemon_exit(queue: &HandshakeQueue, code: i32) {
    match queue.current().await {
        Ok(Some(current)) => {
            set_status(queue, current.build_id, SessionStatus::DaemonExited(code)).await
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "Failed to read handshake"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandOff {
    Stop,
    Defer,
    Attach,
}

/// Pipes are never re-pointed while a build operation is running.
fn hand_off(message: &HandshakeMessage, building: bool) -> HandOff {
    match message.command {
        HandshakeCommand::Stop => HandOff::Stop,
        HandshakeCommand::Build if building => HandOff::Defer,
        HandshakeCommand::Build => HandOff::Attach,
    }
}

/// Result of a pump task that has already ended, `None` if still running.
async fn finished_result(task: &mut PumpTask) -> Option<Result<u64, ProxyError>> {
    if !task.is_finished() {
        return None;
    }
    match task.await {
        Ok(result) => Some(result),
        Err(err) => Some(Err(ProxyError::Process(format!("relay task failed: {}", err)))),
    }
}
