//! Command line and environment configuration.
//!
//! The proxy is installed in place of the daemon executable, so it must accept
//! whatever arguments the daemon accepts. Our own flags are all prefixed
//! `--proxy-` and must come first; everything else is forwarded unchanged.

use clap::{Parser, ValueEnum};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ProxyError;

pub const CONTINUE_AFTER_ERRORS_ENV: &str = "continueBuildingAfterErrors";
pub const SINGLE_FILE_PATH_ENV: &str = "BUILD_XCODE_SINGLE_FILE_PATH";
pub const SESSION_ENV: &str = "BUILD_SERVICE_PROXY_SESSION";
pub const OWNER_PID_ENV: &str = "BUILD_SERVICE_PROXY_OWNER_PID";
pub const DAEMON_PATH_ENV: &str = "BUILD_SERVICE_PROXY_DAEMON_PATH";
pub const CACHE_DIR_ENV: &str = "BUILD_SERVICE_PROXY_CACHE_DIR";
pub const DEBUG_LOG_ENV: &str = "BUILD_SERVICE_PROXY_DEBUG_LOG";

/// Status sink flag understood by earlier installs, stripped from daemon args.
pub const LEGACY_STATUS_FILE_ARG: &str = "-log-file-name-proxy";

pub const XCB_SERVICE: &str = "XCBBuildService";
pub const SWB_SERVICE: &str = "SWBBuildService";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// `client` when a session is configured, `direct` otherwise
    Auto,
    Direct,
    Client,
    Server,
    Stop,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Auto => "auto",
            Role::Direct => "direct",
            Role::Client => "client",
            Role::Server => "server",
            Role::Stop => "stop",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "buildservice-proxy")]
#[command(about = "Transparent proxy for the build service daemon")]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct Cli {
    /// Which part of the proxy this process plays
    #[arg(long = "proxy-role", value_enum, default_value_t = Role::Auto)]
    pub role: Role,

    /// Session identifier shared by every client of one persistent daemon
    #[arg(long = "proxy-session")]
    pub session: Option<String>,

    /// Host process whose exit stops the persistent server
    #[arg(long = "proxy-owner-pid")]
    pub owner_pid: Option<u32>,

    /// File receiving `<Status>:<target>:end_tail` records
    #[arg(long = "proxy-status-file", value_name = "PATH")]
    pub status_file: Option<PathBuf>,

    /// Arguments forwarded to the daemon unchanged
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub daemon_args: Vec<String>,
}

/// Request rewrite switches, see `modifier`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub continue_building_after_errors: bool,
    pub single_file_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub role: Role,
    pub service_name: String,
    pub flags: RequestFlags,
    pub session_id: Option<String>,
    pub owner_pid: Option<u32>,
    pub status_file: Option<PathBuf>,
    pub daemon_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub debug_log: bool,
    pub daemon_args: Vec<String>,
}

impl ProxyConfig {
    pub fn load(cli: Cli) -> Result<Self, ProxyError> {
        let argv0 = env::args().next();
        Self::from_lookup(cli, argv0.as_deref(), |key| env::var(key).ok())
    }

    pub fn from_lookup<F>(cli: Cli, argv0: Option<&str>, lookup: F) -> Result<Self, ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = service_name_from_argv0(argv0);

        let flags = RequestFlags {
            continue_building_after_errors: lookup(CONTINUE_AFTER_ERRORS_ENV)
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
            single_file_path: lookup(SINGLE_FILE_PATH_ENV).filter(|value| !value.trim().is_empty()),
        };

        let session_id = cli
            .session
            .or_else(|| lookup(SESSION_ENV))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let owner_pid = match cli.owner_pid {
            Some(pid) => Some(pid),
            None => match lookup(OWNER_PID_ENV) {
                Some(value) => Some(value.trim().parse::<u32>().map_err(|err| {
                    ProxyError::Config(format!("{} is not a pid: {}", OWNER_PID_ENV, err))
                })?),
                None => None,
            },
        };

        let role = match (cli.role, session_id.is_some()) {
            (Role::Auto, true) => Role::Client,
            (Role::Auto, false) => Role::Direct,
            (Role::Client | Role::Server | Role::Stop, false) => {
                return Err(ProxyError::Config(format!(
                    "role {} needs a session identifier ({} or --proxy-session)",
                    cli.role.as_str(),
                    SESSION_ENV
                )));
            }
            (role, _) => role,
        };

        let cache_dir = match lookup(CACHE_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .map(|dir| dir.join(format!("{}Proxy", service_name)))
                .ok_or_else(|| ProxyError::Config("user cache directory not found".to_string()))?,
        };

        let (daemon_args, legacy_status_file) = split_legacy_status_file(cli.daemon_args);

        Ok(Self {
            role,
            service_name,
            flags,
            session_id,
            owner_pid,
            status_file: cli.status_file.or(legacy_status_file),
            daemon_path: lookup(DAEMON_PATH_ENV)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            cache_dir,
            debug_log: lookup(DEBUG_LOG_ENV)
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
            daemon_args,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    /// Directory holding the handshake and pipe files of one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.cache_dir
            .join("sessions")
            .join(session_dir_name(session_id))
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "True" | "TRUE" | "yes" | "YES")
}

fn service_name_from_argv0(argv0: Option<&str>) -> String {
    let file_name = argv0
        .and_then(|value| Path::new(value).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if file_name.contains(SWB_SERVICE) {
        SWB_SERVICE.to_string()
    } else {
        XCB_SERVICE.to_string()
    }
}

fn split_legacy_status_file(args: Vec<String>) -> (Vec<String>, Option<PathBuf>) {
    let mut forwarded = Vec::with_capacity(args.len());
    let mut status_file = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == LEGACY_STATUS_FILE_ARG {
            status_file = args.next().map(PathBuf::from);
        } else {
            forwarded.push(arg);
        }
    }
    (forwarded, status_file)
}

fn session_dir_name(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
