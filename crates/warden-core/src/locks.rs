//! Worker and per-task lock files.
//!
//! Both lock kinds are JSON records created with `O_CREAT|O_EXCL`
//! semantics (`create_new`), so acquisition is a single atomic filesystem
//! operation and never blocks.
//!
//! - The **worker lock** (`__worker__.lock`) is a singleton per handoff
//!   root. A present lock from the same host whose pid is dead is stale
//!   and is taken over; a live or foreign-host lock means busy.
//! - A **task lock** (`<id>.lock`) marks one task as claimed by an
//!   operator. Staleness is not inferred: a present task lock always
//!   means "skip for now".
//!
//! Both guards release by unlinking their file, deterministically on every
//! exit path via `Drop`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// File name of the singleton worker lock.
pub const WORKER_LOCK_NAME: &str = "__worker__.lock";

/// Maximum size of a lock record read (a record is well under 1 KiB).
const MAX_LOCK_RECORD_SIZE: u64 = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from lock acquisition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock is held by another live operator.
    #[error("lock busy: {reason}")]
    Busy {
        /// Why the lock is considered held.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock record
// ─────────────────────────────────────────────────────────────────────────────

/// On-disk lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Pid of the holding process.
    pub pid: u32,
    /// Hostname of the holding process.
    pub host: String,
    /// When the lock was taken.
    pub created_at: DateTime<Utc>,
    /// Task the lock covers, for task locks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Advisory holder timeout, reserved for future TTL recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

impl LockRecord {
    /// Record describing the current process.
    #[must_use]
    pub fn current(task_id: Option<String>) -> Self {
        Self {
            pid: std::process::id(),
            host: local_hostname(),
            created_at: Utc::now(),
            task_id,
            timeout_sec: None,
        }
    }
}

/// Hostname of this machine, `unknown` when it cannot be read.
#[must_use]
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Whether a pid refers to a live process on this host.
///
/// Signal 0 probes existence without delivering anything; `EPERM` still
/// means the process exists.
#[must_use]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Acquisition
// ─────────────────────────────────────────────────────────────────────────────

fn try_create(path: &Path, record: &LockRecord) -> Result<bool, LockError> {
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => {
            return Err(LockError::io(
                format!("creating lock {}", path.display()),
                e,
            ));
        },
    };
    let bytes = serde_json::to_vec_pretty(record).map_err(|e| {
        LockError::io(
            "serializing lock record".to_string(),
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })?;
    file.write_all(&bytes)
        .and_then(|()| file.flush())
        .map_err(|e| LockError::io(format!("writing lock {}", path.display()), e))?;
    Ok(true)
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let file = fs::File::open(path).ok()?;
    let mut bytes = Vec::new();
    io::Read::read_to_end(&mut io::Read::take(file, MAX_LOCK_RECORD_SIZE), &mut bytes).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Exclusive worker lock for one handoff root.
#[derive(Debug)]
pub struct WorkerLock {
    path: PathBuf,
    released: bool,
}

impl WorkerLock {
    /// Acquires the singleton worker lock in `locks_dir`.
    ///
    /// A present lock is inspected: same host and live pid means busy; a
    /// dead same-host holder is stale and is replaced (one retry). A lock
    /// from another host, or one that does not parse, is never stolen.
    ///
    /// # Errors
    ///
    /// [`LockError::Busy`] when another operator holds the lock,
    /// [`LockError::Io`] otherwise.
    pub fn acquire(locks_dir: &Path) -> Result<Self, LockError> {
        let path = locks_dir.join(WORKER_LOCK_NAME);
        let record = LockRecord::current(None);

        for attempt in 0..2 {
            if try_create(&path, &record)? {
                return Ok(Self {
                    path,
                    released: false,
                });
            }

            let Some(existing) = read_record(&path) else {
                return Err(LockError::Busy {
                    reason: format!("unparseable lock record at {}", path.display()),
                });
            };
            let same_host = existing.host == record.host;
            if same_host && !pid_is_alive(existing.pid) {
                warn!(
                    pid = existing.pid,
                    host = %existing.host,
                    "removing stale worker lock from dead process"
                );
                match fs::remove_file(&path) {
                    Ok(()) => {},
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                    Err(e) => {
                        return Err(LockError::io(
                            format!("removing stale lock {}", path.display()),
                            e,
                        ));
                    },
                }
                if attempt == 0 {
                    continue;
                }
                return Err(LockError::Busy {
                    reason: "lock contended during stale takeover".to_string(),
                });
            }
            return Err(LockError::Busy {
                reason: if same_host {
                    format!("worker pid {} is alive on this host", existing.pid)
                } else {
                    format!("held by {}@{}", existing.pid, existing.host)
                },
            });
        }
        Err(LockError::Busy {
            reason: "lock contended during stale takeover".to_string(),
        })
    }

    /// Releases the lock by unlinking its file.
    pub fn release(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// Non-blocking per-task lock.
#[derive(Debug)]
pub struct TaskLock {
    path: PathBuf,
    released: bool,
}

impl TaskLock {
    /// Acquires `<task_id>.lock` in `locks_dir`.
    ///
    /// Presence always means busy; there is no staleness inference for
    /// task locks.
    ///
    /// # Errors
    ///
    /// [`LockError::Busy`] when the lock file exists, [`LockError::Io`]
    /// otherwise.
    pub fn acquire(locks_dir: &Path, task_id: &str) -> Result<Self, LockError> {
        let path = locks_dir.join(format!("{task_id}.lock"));
        let record = LockRecord::current(Some(task_id.to_string()));
        if try_create(&path, &record)? {
            Ok(Self {
                path,
                released: false,
            })
        } else {
            Err(LockError::Busy {
                reason: format!("task {task_id} is locked by another operator"),
            })
        }
    }

    /// Releases the lock by unlinking its file.
    pub fn release(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        self.unlink();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A pid that will not exist on any sane test host.
    const DEAD_PID: u32 = 3_999_999;

    #[test]
    fn worker_lock_acquire_and_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = WorkerLock::acquire(dir.path()).expect("acquire");
        assert!(dir.path().join(WORKER_LOCK_NAME).exists());
        lock.release();
        assert!(!dir.path().join(WORKER_LOCK_NAME).exists());
    }

    #[test]
    fn worker_lock_busy_while_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _held = WorkerLock::acquire(dir.path()).expect("acquire");
        // Same pid, alive: must report busy.
        assert!(matches!(
            WorkerLock::acquire(dir.path()),
            Err(LockError::Busy { .. })
        ));
    }

    #[test]
    fn stale_worker_lock_is_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = LockRecord {
            pid: DEAD_PID,
            host: local_hostname(),
            created_at: Utc::now(),
            task_id: None,
            timeout_sec: None,
        };
        fs::write(
            dir.path().join(WORKER_LOCK_NAME),
            serde_json::to_vec(&stale).expect("serialize"),
        )
        .expect("write");

        let lock = WorkerLock::acquire(dir.path()).expect("stale lock taken over");
        lock.release();
    }

    #[test]
    fn foreign_host_lock_is_not_stolen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let foreign = LockRecord {
            pid: DEAD_PID,
            host: "some-other-host".to_string(),
            created_at: Utc::now(),
            task_id: None,
            timeout_sec: None,
        };
        fs::write(
            dir.path().join(WORKER_LOCK_NAME),
            serde_json::to_vec(&foreign).expect("serialize"),
        )
        .expect("write");

        assert!(matches!(
            WorkerLock::acquire(dir.path()),
            Err(LockError::Busy { .. })
        ));
    }

    #[test]
    fn unparseable_lock_is_not_stolen() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(WORKER_LOCK_NAME), b"not json").expect("write");
        assert!(matches!(
            WorkerLock::acquire(dir.path()),
            Err(LockError::Busy { .. })
        ));
    }

    #[test]
    fn task_lock_presence_always_means_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let held = TaskLock::acquire(dir.path(), "t1").expect("acquire");
        assert!(matches!(
            TaskLock::acquire(dir.path(), "t1"),
            Err(LockError::Busy { .. })
        ));
        // A different task id is independent.
        let other = TaskLock::acquire(dir.path(), "t2").expect("acquire t2");
        other.release();
        held.release();
        TaskLock::acquire(dir.path(), "t1")
            .expect("acquirable after release")
            .release();
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let _lock = TaskLock::acquire(dir.path(), "t1").expect("acquire");
            assert!(dir.path().join("t1.lock").exists());
        }
        assert!(!dir.path().join("t1.lock").exists());
    }

    #[test]
    fn own_pid_is_alive_and_dead_pid_is_not() {
        assert!(pid_is_alive(std::process::id()));
        assert!(!pid_is_alive(DEAD_PID));
        assert!(!pid_is_alive(0));
    }

    #[test]
    fn lock_record_roundtrip() {
        let record = LockRecord::current(Some("t9".to_string()));
        let bytes = serde_json::to_vec(&record).expect("serialize");
        let restored: LockRecord = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(restored.pid, record.pid);
        assert_eq!(restored.task_id.as_deref(), Some("t9"));
    }
}
