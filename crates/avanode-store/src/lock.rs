use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::debug;

use crate::error::{at, StoreError};
use crate::layout::NodeLayout;

/// Exclusive hold on a node root for the duration of one operation.
///
/// Backup, restore, upgrade and migrate all require one; passing `&OperationLock`
/// into them is the proof that nothing else is mutating the identity or
/// config directories. Released when dropped.
#[derive(Debug)]
pub struct OperationLock {
    file: File,
    path: PathBuf,
}

impl OperationLock {
    /// Take the lock without waiting; fails with `Locked` if it is held.
    pub fn acquire(layout: &NodeLayout) -> Result<Self, StoreError> {
        Self::acquire_at(&layout.lock_path())
    }

    pub fn acquire_at(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(at(parent))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(at(path))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                return Err(StoreError::Locked {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(StoreError::LockFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        // holder pid is informational only
        file.set_len(0).map_err(at(path))?;
        let _ = writeln!(file, "{}", std::process::id());
        debug!("Acquired {}", path.display());

        Ok(OperationLock {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        debug!("Released {}", self.path.display());
    }
}
