//! The handshake file as a one-slot message queue.
//!
//! Clients and the server live in different processes with no broker
//! between them, so requests travel through `handshake.json` in the session
//! directory. This is the only code that touches that file, its lock, or its
//! modification time.

use buildservice_proxy_protocol::{HandshakeCommand, HandshakeError, HandshakeMessage, SessionStatus};
use fs_err as fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::lock::FileLock;
use crate::error::ProxyError;

pub const HANDSHAKE_FILE: &str = "handshake.json";
pub const HANDSHAKE_LOCK_FILE: &str = "handshake.lock";
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Files younger than this are re-read even when their mtime did not move,
/// since coarse filesystem timestamps can hide a second write.
const MTIME_RESOLUTION: Duration = Duration::from_secs(2);

pub struct HandshakeQueue {
    dir: PathBuf,
    last_mtime: Option<SystemTime>,
    last_delivered: Option<(HandshakeCommand, u64)>,
}

impl HandshakeQueue {
    pub fn open(dir: &Path) -> Result<Self, ProxyError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            last_mtime: None,
            last_delivered: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self) -> PathBuf {
        self.dir.join(HANDSHAKE_FILE)
    }

    async fn lock(&self) -> Result<FileLock, ProxyError> {
        FileLock::acquire(&self.dir.join(HANDSHAKE_LOCK_FILE), LOCK_TIMEOUT).await
    }

    /// Publishes a request. A build request loses to any handshake already
    /// carrying an equal or newer build id.
    pub async fn publish(&self, message: &HandshakeMessage) -> Result<(), ProxyError> {
        let _lock = self.lock().await?;
        if message.command == HandshakeCommand::Build {
            if let Ok(Some(current)) = self.read() {
                if current.build_id >= message.build_id {
                    return Err(ProxyError::SessionConflict {
                        build_id: message.build_id,
                        newer: current.build_id,
                    });
                }
            }
        }
        self.write(message)?;
        debug!(build_id = message.build_id, command = ?message.command, "Handshake published");
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<HandshakeMessage>, ProxyError> {
        let _lock = self.lock().await?;
        self.read()
    }

    /// Returns the handshake if it changed since the last one delivered.
    pub async fn poll(&mut self) -> Result<Option<HandshakeMessage>, ProxyError> {
        let mtime = match fs::metadata(self.path()) {
            Ok(metadata) => metadata.modified()?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let recent = SystemTime::now()
            .duration_since(mtime)
            .map(|age| age < MTIME_RESOLUTION)
            .unwrap_or(true);
        if self.last_mtime == Some(mtime) && !recent {
            return Ok(None);
        }

        let message = {
            let _lock = self.lock().await?;
            self.read()
        };
        self.last_mtime = Some(mtime);

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable handshake");
                return Ok(None);
            }
        };
        let key = (message.command, message.build_id);
        if self.last_delivered == Some(key) {
            return Ok(None);
        }
        self.last_delivered = Some(key);
        Ok(Some(message))
    }

    /// Records the server's answer, unless a newer handshake replaced
    /// `build_id` in the meantime. Returns whether it was written.
    pub async fn set_status(&self, build_id: u64, status: SessionStatus) -> Result<bool, ProxyError> {
        let _lock = self.lock().await?;
        let Some(mut current) = self.read()? else {
            return Ok(false);
        };
        if current.build_id != build_id {
            return Ok(false);
        }
        current.status = Some(status);
        self.write(&current)?;
        Ok(true)
    }

    /// `None` only when no handshake exists; any other failure is an error.
    fn read(&self) -> Result<Option<HandshakeMessage>, ProxyError> {
        match fs::read(self.path()) {
            Ok(bytes) => Ok(Some(HandshakeMessage::parse(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, message: &HandshakeMessage) -> Result<(), ProxyError> {
        let content = serde_json::to_vec_pretty(message).map_err(HandshakeError::from)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.flush()?;
        tmp.persist(self.path()).map_err(|err| err.error)?;
        Ok(())
    }
}
