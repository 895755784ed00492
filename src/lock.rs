//! Exclusive apply lock.
//!
//! Apply and rollback are serialized twice: by an in-process mutex, and by
//! an advisory `flock` on `<state_dir>/apply.lock` so a second process
//! working on the same MTA also waits.  Both are acquired with a bounded
//! wait; the guard releases them on drop, including on every error path.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, trace};

use crate::errors::{Result, StageError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct LockManager {
    path: PathBuf,
    timeout: Duration,
    local: Mutex<()>,
}

/// Held for the whole apply or rollback.
pub struct ApplyGuard<'a> {
    _local: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("failed to release apply lock: {e}");
        }
        debug!("Released apply lock");
    }
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting at most the configured timeout.
    /// Returns `Busy` if it is still held by someone else.
    pub fn acquire(&self) -> Result<ApplyGuard<'_>> {
        // An unrepresentable deadline means waiting without one.
        let deadline = Instant::now().checked_add(self.timeout);

        let local = loop {
            match self.local.try_lock() {
                Ok(guard) => break guard,
                // The protected data is `()`; a panic elsewhere cannot corrupt it.
                Err(TryLockError::Poisoned(p)) => break p.into_inner(),
                Err(TryLockError::WouldBlock) => wait_or_busy(deadline)?,
            }
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    trace!("apply lock held by another process, waiting");
                    wait_or_busy(deadline)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Owner pid, for operators inspecting a stuck lock.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;

        debug!("Obtained exclusive apply lock");
        Ok(ApplyGuard {
            _local: local,
            file,
        })
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn wait_or_busy(deadline: Option<Instant>) -> Result<()> {
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Err(StageError::Busy);
    }
    thread::sleep(POLL_INTERVAL);
    Ok(())
}
