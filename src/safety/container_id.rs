//! Host-unique container identities.
//!
//! An id is held through an exclusive `flock` on `<lock_dir>/sandcell-<id>.lock`,
//! so two processes on one host never build containers with the same cgroup
//! or root directory name. Lock files are never unlinked: the inode stays
//! stable and a waiter can never lock a file that was just replaced.

use crate::config::types::{IsolateError, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Written into a held lock file for whoever inspects the lock directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    pub pid: u32,
    pub container_id: u32,
    pub acquired_at: DateTime<Utc>,
    pub version: String,
}

/// An exclusively held container id. Dropping it releases the id.
#[derive(Debug)]
pub struct ContainerId {
    id: u32,
    lock_path: PathBuf,
    _lock_file: File,
}

impl ContainerId {
    /// Take the lowest free id below `max`.
    pub fn allocate(lock_dir: &Path, max: u32) -> Result<Self> {
        create_lock_dir(lock_dir)?;
        for id in 0..max {
            if let Some(held) = Self::try_lock(lock_dir, id)? {
                return Ok(held);
            }
        }
        Err(IsolateError::Lock(format!(
            "All {} container ids in {} are in use",
            max,
            lock_dir.display()
        )))
    }

    /// Take exactly `id`, failing if another holder has it.
    pub fn acquire(lock_dir: &Path, id: u32) -> Result<Self> {
        create_lock_dir(lock_dir)?;
        Self::try_lock(lock_dir, id)?
            .ok_or_else(|| IsolateError::Lock(format!("Container id {} is busy", id)))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path segment used for the cgroup and the root directory.
    pub fn name(&self) -> String {
        format!("sandcell-{}", self.id)
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// `Ok(None)` when someone else holds the id.
    fn try_lock(lock_dir: &Path, id: u32) -> Result<Option<Self>> {
        let lock_path = lock_dir.join(format!("sandcell-{}.lock", id));
        // Never truncate before holding the lock
        let mut lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                IsolateError::Lock(format!("Cannot open {}: {}", lock_path.display(), e))
            })?;

        // SAFETY: flock on a descriptor this function owns.
        let rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => Ok(None),
                _ => Err(IsolateError::Lock(format!(
                    "flock {} failed: {}",
                    lock_path.display(),
                    err
                ))),
            };
        }

        let info = LockInfo {
            pid: std::process::id(),
            container_id: id,
            acquired_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        lock_file.seek(SeekFrom::Start(0))?;
        writeln!(lock_file, "{}", serde_json::to_string(&info)?)?;
        // Trim whatever a previous holder left behind
        let len = lock_file.stream_position()?;
        lock_file.set_len(len)?;

        debug!("Acquired container id {} ({})", id, lock_path.display());
        Ok(Some(Self {
            id,
            lock_path,
            _lock_file: lock_file,
        }))
    }
}

impl Drop for ContainerId {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock
        debug!("Released container id {}", self.id);
    }
}

fn create_lock_dir(lock_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(lock_dir).map_err(|e| {
        IsolateError::Lock(format!(
            "Cannot create lock directory {}: {}",
            lock_dir.display(),
            e
        ))
    })
}
