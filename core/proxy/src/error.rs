//! Error types for the proxy.

use buildservice_proxy_protocol::{FramingError, HandshakeError};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────
    #[error("framing error on {direction} stream: {source}")]
    Framing {
        direction: &'static str,
        #[source]
        source: FramingError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────────────
    // Daemon process
    // ─────────────────────────────────────────────────────────────────────
    #[error("failed to start daemon {path}: {source}")]
    DaemonSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process error: {0}")]
    Process(String),

    // ─────────────────────────────────────────────────────────────────────
    // Session handshake
    // ─────────────────────────────────────────────────────────────────────
    #[error("build {build_id} superseded by newer build {newer}")]
    SessionConflict { build_id: u64, newer: u64 },

    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Exit code reported to the caller of the proxy binary. A daemon's own
    /// exit code is returned as a successful result, not an error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::SessionConflict { .. } => 0,
            _ => 1,
        }
    }
}
