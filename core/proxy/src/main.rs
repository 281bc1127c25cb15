//! Build service proxy entrypoint.
//!
//! Installed in place of the IDE's build service daemon. In `direct` mode it
//! spawns the real daemon and relays stdio frames both ways, rewriting the
//! first build request and writing per-target results to a status file. In
//! `client`/`server` mode one daemon outlives the invocations that use it.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod config;
mod daemon;
mod error;
mod logging;
mod modifier;
mod process;
mod relay;
mod session;
mod signature;
mod state;
mod tracker;

use config::{Cli, ProxyConfig, Role};
use daemon::{resolve_daemon_path, Daemon};
use error::ProxyError;
use modifier::RequestModifier;
use process::OwnerWatch;
use relay::{Direction, Pump, Source};
use state::SharedState;

const DAEMON_STOP_GRACE: Duration = Duration::from_secs(2);
const FINAL_FLUSH_WAIT: Duration = Duration::from_secs(1);
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

fn main() {
    let cli = Cli::parse();
    let config = match ProxyConfig::load(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("buildservice-proxy: {}", err);
            std::process::exit(err.exit_code());
        }
    };

    let guard = logging::init(config.role.as_str(), &config.log_dir(), config.debug_log);
    info!(
        role = config.role.as_str(),
        service = %config.service_name,
        session = ?config.session_id,
        "Proxy started"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            drop(guard);
            std::process::exit(1);
        }
    };
    let result = runtime.block_on(run(&config));
    // Blocking stdin reads never return on their own.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    let code = match result {
        Ok(code) => code,
        Err(err @ ProxyError::SessionConflict { .. }) => {
            debug!(error = %err, "Build superseded before it started");
            err.exit_code()
        }
        Err(err) => {
            error!(error = %err, "Proxy failed");
            err.exit_code()
        }
    };
    info!(code, "Proxy exiting");
    drop(guard);
    std::process::exit(code);
}

async fn run(config: &ProxyConfig) -> Result<i32, ProxyError> {
    match (config.role, config.session_id.as_deref()) {
        (Role::Auto | Role::Direct, _) => run_direct(config).await,
        (Role::Client, Some(session)) => session::client::run(config, session).await,
        (Role::Server, Some(session)) => session::server::run(config, session).await,
        (Role::Stop, Some(session)) => session::stop(config, session).await,
        (role, None) => Err(ProxyError::Config(format!(
            "role {} requires a session",
            role.as_str()
        ))),
    }
}

enum DirectStop {
    Exited(i32),
    ParentGone,
    Failed(ProxyError),
}

/// One daemon per invocation, living exactly as long as we do.
async fn run_direct(config: &ProxyConfig) -> Result<i32, ProxyError> {
    let daemon_path = resolve_daemon_path(config)?;
    let (mut daemon, pipes) = Daemon::spawn(&daemon_path, &config.daemon_args)?;

    let state = Arc::new(SharedState::new(
        config
            .status_file
            .as_deref()
            .and_then(tracker::open_status_sink),
    ));
    let cancel = CancellationToken::new();
    let mut upstream: JoinHandle<Result<u64, ProxyError>> = tokio::spawn(
        Pump::new(Direction::ClientToServer)
            .source(Source::stream(tokio::io::stdin()))
            .sink(pipes.stdin)
            .observed_by(state.clone())
            .modifier(RequestModifier::new(config.flags.clone()))
            .run(cancel.clone()),
    );
    let mut downstream: JoinHandle<Result<u64, ProxyError>> = tokio::spawn(
        Pump::new(Direction::ServerToClient)
            .source(Source::stream(pipes.stdout))
            .sink(tokio::io::stdout())
            .observed_by(state)
            .run(cancel.clone()),
    );

    let parent = OwnerWatch::parent();
    let mut ticker = tokio::time::interval(session::POLL_INTERVAL);
    let mut upstream_done = false;
    let mut downstream_done = false;

    let stop = loop {
        tokio::select! {
            exited = daemon.wait() => match exited {
                Ok(code) => break DirectStop::Exited(code),
                Err(err) => break DirectStop::Failed(err),
            },
            joined = &mut upstream, if !upstream_done => {
                upstream_done = true;
                if let Some(err) = relay_failure(joined) {
                    break DirectStop::Failed(err);
                }
                debug!("Client stdin closed");
            }
            joined = &mut downstream, if !downstream_done => {
                downstream_done = true;
                if let Some(err) = relay_failure(joined) {
                    break DirectStop::Failed(err);
                }
                debug!("Daemon stdout closed");
            }
            _ = ticker.tick() => {
                if !parent.is_alive() {
                    break DirectStop::ParentGone;
                }
            }
        }
    };

    let result = match stop {
        DirectStop::Exited(code) => {
            if !downstream_done {
                match tokio::time::timeout(FINAL_FLUSH_WAIT, &mut downstream).await {
                    Ok(joined) => {
                        if let Some(err) = relay_failure(joined) {
                            error!(error = %err, "Relay failed after daemon exit");
                        }
                    }
                    Err(_) => debug!("Daemon output not drained in time"),
                }
            }
            info!(code, "Daemon exited");
            Ok(code)
        }
        DirectStop::ParentGone => {
            info!(pid = parent.pid(), "Parent process gone, stopping daemon");
            Ok(daemon.terminate(DAEMON_STOP_GRACE).await)
        }
        DirectStop::Failed(err) => {
            daemon.terminate(DAEMON_STOP_GRACE).await;
            Err(err)
        }
    };

    cancel.cancel();
    upstream.abort();
    downstream.abort();
    result
}

fn relay_failure(
    joined: Result<Result<u64, ProxyError>, tokio::task::JoinError>,
) -> Option<ProxyError> {
    match joined {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => Some(err),
        Err(err) => Some(ProxyError::Process(format!("relay task failed: {}", err))),
    }
}
