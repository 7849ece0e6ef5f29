use super::LedgerError;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};
use tracing::trace;

/// path of the lock file guarding a ledger
pub fn lock_path(ledger: &Path) -> PathBuf {
    let mut name = ledger.as_os_str().to_owned();
    name.push(".lock");

    PathBuf::from(name)
}

/// Exclusive advisory lock on `<ledger>.lock`, released when dropped
#[derive(Debug)]
pub struct LedgerLock {
    path: PathBuf,
    // closing the descriptor releases the flock
    _file: File,
}

impl LedgerLock {
    /// take the lock without blocking, `LedgerError::Locked` if somebody else holds it
    pub fn acquire(ledger: &Path) -> Result<Self, LedgerError> {
        let path = lock_path(ledger);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                trace!("Acquired {}", path.to_string_lossy());
                Ok(Self { path, _file: file })
            }
            Err(Errno::EWOULDBLOCK) => Err(LedgerError::Locked(ledger.to_path_buf())),
            Err(errno) => Err(LedgerError::Lock(errno)),
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        trace!("Releasing {}", self.path.to_string_lossy());
    }
}
