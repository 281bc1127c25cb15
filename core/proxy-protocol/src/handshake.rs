//! On-disk handshake between short-lived clients and the persistent server.
//!
//! A client writes one of these documents into the session directory to ask
//! the server to attach the shared daemon to its pair of pipe files. The
//! server writes `status` back once it acts on the request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeCommand {
    Build,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Attached,
    Stopped,
    DaemonExited(i32),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} is required for a build handshake")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub command: HandshakeCommand,
    #[serde(default)]
    pub stdin_file: PathBuf,
    #[serde(default)]
    pub stdout_file: PathBuf,
    pub build_id: u64,
    /// Target status sink for this build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_building_after_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl HandshakeMessage {
    pub fn build(build_id: u64, stdin_file: PathBuf, stdout_file: PathBuf) -> Self {
        Self {
            command: HandshakeCommand::Build,
            stdin_file,
            stdout_file,
            build_id,
            status_file: None,
            continue_building_after_errors: false,
            single_file_path: None,
            status: None,
        }
    }

    pub fn stop(build_id: u64) -> Self {
        Self {
            command: HandshakeCommand::Stop,
            stdin_file: PathBuf::new(),
            stdout_file: PathBuf::new(),
            build_id,
            status_file: None,
            continue_building_after_errors: false,
            single_file_path: None,
            status: None,
        }
    }

    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.command == HandshakeCommand::Build {
            if self.stdin_file.as_os_str().is_empty() {
                return Err(HandshakeError::MissingField("stdin_file"));
            }
            if self.stdout_file.as_os_str().is_empty() {
                return Err(HandshakeError::MissingField("stdout_file"));
            }
        }
        Ok(())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let message: HandshakeMessage = serde_json::from_slice(bytes)?;
        message.validate()?;
        Ok(message)
    }
}
