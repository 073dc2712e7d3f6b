//! Handoff directory layout and queue transitions.
//!
//! The handoff root is the only shared mutable state in the system. Its
//! subdirectories have fixed semantics:
//!
//! | dir        | meaning                                         |
//! |------------|-------------------------------------------------|
//! | `tasks/`   | inbox; producers drop `<id>.json` atomically    |
//! | `running/` | tasks currently being processed                 |
//! | `results/` | terminal results; presence implies idempotency  |
//! | `patches/` | post-execution diffs for successful runs        |
//! | `logs/`    | spilled (redaction-gated) output overflow       |
//! | `locks/`   | worker and per-task lock files                  |
//! | `tmp/`     | per-task working trees `ws-<id>/`               |
//!
//! Queue transitions are single atomic renames, so an observer never sees
//! partial state; result files land through `write_atomic`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::result::TaskResult;
use crate::safefs::{self, SafeFsError};
use crate::task::{self, Task, TaskError};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Subdirectory names under the handoff root.
pub const QUEUE_DIRS: &[&str] = &[
    "tasks", "running", "results", "patches", "logs", "locks", "tmp",
];

/// Bound on directory entries examined per queue scan.
pub const MAX_QUEUE_SCAN_ENTRIES: usize = 10_000;

/// Bound on result-file reads (a result embeds the task snapshot and
/// capped verification output).
pub const MAX_RESULT_FILE_SIZE: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from handoff-root operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Confined filesystem layer refused or failed an operation.
    #[error(transparent)]
    SafeFs(#[from] SafeFsError),

    /// JSON handling failed.
    #[error("queue JSON error: {detail}")]
    Json {
        /// Detail about the failure.
        detail: String,
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

impl QueueError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan outcome
// ─────────────────────────────────────────────────────────────────────────────

/// A parseable, valid task waiting in the inbox.
#[derive(Debug)]
pub struct TaskCandidate {
    /// Path of the task file in `tasks/`.
    pub path: PathBuf,
    /// The validated task.
    pub task: Task,
}

/// Why an inbox file is not a valid candidate.
#[derive(Debug)]
pub enum InvalidReason {
    /// Deserialization or schema validation failed.
    Schema(TaskError),
    /// The file name stem does not equal the task's id.
    FilenameMismatch {
        /// Id taken from the file name.
        file_id: String,
        /// Id declared inside the file.
        task_id: String,
    },
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(e) => write!(f, "{e}"),
            Self::FilenameMismatch { file_id, task_id } => {
                write!(f, "file is named {file_id}.json but declares id {task_id}")
            },
        }
    }
}

/// An inbox file that failed validation.
#[derive(Debug)]
pub struct InvalidTaskFile {
    /// Path of the offending file.
    pub path: PathBuf,
    /// Id derived from the file name stem.
    pub file_id: String,
    /// Why it was rejected.
    pub reason: InvalidReason,
}

/// Result of one inbox scan.
#[derive(Debug, Default)]
pub struct QueueScan {
    /// Valid candidates, sorted (priority desc, created_at asc, id asc).
    pub valid: Vec<TaskCandidate>,
    /// Files that failed validation.
    pub invalid: Vec<InvalidTaskFile>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handoff root
// ─────────────────────────────────────────────────────────────────────────────

/// Accessor for one handoff root directory.
#[derive(Debug, Clone)]
pub struct HandoffRoot {
    root: PathBuf,
}

impl HandoffRoot {
    /// Wraps `root`; call [`Self::ensure_layout`] before first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root and every queue subdirectory.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] when creation fails.
    pub fn ensure_layout(&self) -> Result<(), QueueError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| QueueError::io(format!("creating {}", self.root.display()), e))?;
        for dir in QUEUE_DIRS {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| QueueError::io(format!("creating {}", path.display()), e))?;
        }
        Ok(())
    }

    /// `tasks/` inbox directory.
    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    /// `running/` directory.
    #[must_use]
    pub fn running_dir(&self) -> PathBuf {
        self.root.join("running")
    }

    /// `results/` directory.
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// `patches/` directory.
    #[must_use]
    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }

    /// `logs/` directory.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// `locks/` directory.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// `tmp/` directory for per-task worktrees.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Inbox file for a task id.
    #[must_use]
    pub fn task_file(&self, id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{id}.json"))
    }

    /// Running-state file for a task id.
    #[must_use]
    pub fn running_file(&self, id: &str) -> PathBuf {
        self.running_dir().join(format!("{id}.json"))
    }

    /// Result file for a task id.
    #[must_use]
    pub fn result_file(&self, id: &str) -> PathBuf {
        self.results_dir().join(format!("{id}.json"))
    }

    /// Patch file for a task id.
    #[must_use]
    pub fn patch_file(&self, id: &str) -> PathBuf {
        self.patches_dir().join(format!("{id}.patch"))
    }

    /// Spill log file for one captured stream of one verification step.
    #[must_use]
    pub fn log_file(&self, id: &str, index: usize, stream: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}_{index}_{stream}.log"))
    }

    /// Per-task worktree directory `tmp/ws-<id>`.
    #[must_use]
    pub fn worktree_dir(&self, id: &str) -> PathBuf {
        self.tmp_dir().join(format!("ws-{id}"))
    }

    /// Whether a result for `id` already exists (idempotency gate).
    #[must_use]
    pub fn has_result(&self, id: &str) -> bool {
        self.result_file(id).exists()
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Atomically moves `tasks/<id>.json` to `running/<id>.json`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] when the rename fails.
    pub fn claim(&self, id: &str) -> Result<PathBuf, QueueError> {
        let from = self.task_file(id);
        let to = self.running_file(id);
        fs::rename(&from, &to).map_err(|e| {
            QueueError::io(
                format!("claiming {} -> {}", from.display(), to.display()),
                e,
            )
        })?;
        debug!(task_id = id, "claimed task");
        Ok(to)
    }

    /// Removes the running-state file for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SafeFs`] when removal fails.
    pub fn finish_running(&self, id: &str) -> Result<(), QueueError> {
        safefs::unlink(&self.running_file(id), &self.root)?;
        Ok(())
    }

    /// Atomically enqueues a validated task: the file is staged in `tmp/`
    /// and renamed into `tasks/` so inbox readers never see a partial
    /// write.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on serialization or filesystem failure.
    pub fn enqueue(&self, task: &Task) -> Result<PathBuf, QueueError> {
        let bytes = serde_json::to_vec_pretty(task).map_err(|e| QueueError::Json {
            detail: e.to_string(),
        })?;
        let staging = self.tmp_dir().join(format!(".enqueue-{}.json", task.id));
        safefs::write_atomic(&staging, &bytes, &self.root)?;
        let dest = self.task_file(&task.id);
        fs::rename(&staging, &dest).map_err(|e| {
            QueueError::io(
                format!("enqueueing {} -> {}", staging.display(), dest.display()),
                e,
            )
        })?;
        Ok(dest)
    }

    /// Deletes an inbox file (used after writing a `schema_invalid`
    /// result).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SafeFs`] when removal fails.
    pub fn discard_task_file(&self, path: &Path) -> Result<(), QueueError> {
        safefs::unlink(path, &self.root)?;
        Ok(())
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Atomically writes `results/<task_id>.json`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on serialization or filesystem failure.
    pub fn write_result(&self, result: &TaskResult) -> Result<PathBuf, QueueError> {
        let bytes = serde_json::to_vec_pretty(result).map_err(|e| QueueError::Json {
            detail: e.to_string(),
        })?;
        let path = self.result_file(&result.task_id);
        safefs::write_atomic(&path, &bytes, &self.root)?;
        Ok(path)
    }

    /// Reads and parses `results/<id>.json`, bounded by
    /// [`MAX_RESULT_FILE_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on read or parse failure.
    pub fn read_result(&self, id: &str) -> Result<TaskResult, QueueError> {
        let bytes = safefs::read(&self.result_file(id), &self.root)?;
        if bytes.len() > MAX_RESULT_FILE_SIZE {
            return Err(QueueError::Json {
                detail: format!(
                    "result file exceeds {MAX_RESULT_FILE_SIZE} bytes"
                ),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| QueueError::Json {
            detail: e.to_string(),
        })
    }

    /// Writes a patch file for `id` and returns its root-relative path.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on filesystem failure.
    pub fn write_patch(&self, id: &str, diff: &str) -> Result<String, QueueError> {
        let path = self.patch_file(id);
        safefs::write_atomic(&path, diff.as_bytes(), &self.root)?;
        Ok(format!("patches/{id}.patch"))
    }

    /// Writes a spill log for one captured stream and returns its
    /// root-relative path.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on filesystem failure.
    pub fn write_log(
        &self,
        id: &str,
        index: usize,
        stream: &str,
        payload: &[u8],
    ) -> Result<String, QueueError> {
        let path = self.log_file(id, index, stream);
        safefs::write_atomic(&path, payload, &self.root)?;
        Ok(format!("logs/{id}_{index}_{stream}.log"))
    }

    // ── Scanning ─────────────────────────────────────────────────────

    /// Scans the inbox for task files.
    ///
    /// Valid candidates come back sorted for execution; files that fail
    /// validation are reported separately so the loop can write
    /// `schema_invalid` results. Non-`.json` entries are ignored. The
    /// scan is bounded by [`MAX_QUEUE_SCAN_ENTRIES`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] when the inbox cannot be read.
    pub fn scan_tasks(&self) -> Result<QueueScan, QueueError> {
        let tasks_dir = self.tasks_dir();
        let mut scan = QueueScan::default();
        if !tasks_dir.is_dir() {
            return Ok(scan);
        }

        let entries = fs::read_dir(&tasks_dir)
            .map_err(|e| QueueError::io(format!("reading {}", tasks_dir.display()), e))?;

        for (count, entry) in entries.enumerate() {
            if count >= MAX_QUEUE_SCAN_ENTRIES {
                break;
            }
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(file_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(ToString::to_string)
            else {
                continue;
            };

            let bytes = match safefs::read(&path, &self.root) {
                Ok(b) => b,
                Err(e) => {
                    scan.invalid.push(InvalidTaskFile {
                        path,
                        file_id,
                        reason: InvalidReason::Schema(TaskError::Json {
                            detail: e.to_string(),
                        }),
                    });
                    continue;
                },
            };

            match task::deserialize_task(&bytes) {
                Ok(task) if task.id == file_id => {
                    scan.valid.push(TaskCandidate { path, task });
                },
                Ok(task) => {
                    scan.invalid.push(InvalidTaskFile {
                        path,
                        file_id: file_id.clone(),
                        reason: InvalidReason::FilenameMismatch {
                            file_id,
                            task_id: task.id,
                        },
                    });
                },
                Err(e) => {
                    scan.invalid.push(InvalidTaskFile {
                        path,
                        file_id,
                        reason: InvalidReason::Schema(e),
                    });
                },
            }
        }

        scan.valid.sort_by_key(|c| c.task.queue_key());
        Ok(scan)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
