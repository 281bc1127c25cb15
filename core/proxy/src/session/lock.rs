//! Advisory file locks shared between client and server processes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::ProxyError;

const RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// An exclusive `flock` held until drop.
#[derive(Debug)]
pub struct FileLock {
    file: fs_err::File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock without waiting; `None` when another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, ProxyError> {
        let file = fs_err::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if try_lock_exclusive(file.file())? {
            Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Retries until `timeout` elapses, then fails with `LockTimeout`.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, ProxyError> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ProxyError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(self.file.file());
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &std::fs::File) -> io::Result<bool> {
    use std::os::fd::AsRawFd;
    // SAFETY: the descriptor is owned by `file` for the duration of the call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &std::fs::File) {
    use std::os::fd::AsRawFd;
    // SAFETY: as above; closing the file would release the lock anyway.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &std::fs::File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &std::fs::File) {}
