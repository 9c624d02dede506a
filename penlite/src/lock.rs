//! State-directory lock preventing concurrent controllers.
//!
//! Uses file locking (flock) to ensure only one controller drives a given
//! state directory at a time. Two controllers over the same instance
//! database would both believe they own every instance's queue.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::{PenliteError, PenliteResult};

/// Guard holding an exclusive lock on the controller state directory.
///
/// Released when dropped, or by the OS when the process exits.
#[derive(Debug)]
pub(crate) struct StateDirLock {
    #[allow(dead_code)] // held for its lifetime, not accessed
    file: File,
    path: PathBuf,
}

impl StateDirLock {
    /// Attempt to acquire an exclusive lock under `state_dir`.
    ///
    /// # Errors
    ///
    /// Fails if another controller already holds the lock, or on I/O
    /// errors creating the lock file.
    pub(crate) fn acquire(state_dir: &Path) -> PenliteResult<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| PenliteError::Storage(format!("creating state dir: {}", e)))?;

        let lock_path = state_dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| PenliteError::Storage(format!("opening lock file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(PenliteError::AlreadyExists(format!(
                        "another controller is already using state dir {}",
                        state_dir.display()
                    )));
                }
                return Err(PenliteError::Storage(format!("acquiring lock: {}", err)));
            }
        }

        tracing::debug!(lock_path = %lock_path.display(), "acquired state dir lock");
        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for StateDirLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        tracing::debug!(lock_path = %self.path.display(), "released state dir lock");
    }
}
