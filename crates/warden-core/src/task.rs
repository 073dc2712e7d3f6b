//! Task schema: the immutable description of one unit of work.
//!
//! Tasks arrive as UTF-8 JSON files dropped into the handoff inbox by
//! external producers and are therefore untrusted input: reads are
//! size-bounded before parsing, unknown fields are rejected, and
//! validation is fail-closed.
//!
//! - [INV-TASK-001] All task-file reads are bounded by
//!   [`MAX_TASK_FILE_SIZE`].
//! - [INV-TASK-002] `id` is path-safe: `[A-Za-z0-9._-]+`, never a dot
//!   component.
//! - [INV-TASK-003] `scope` is nonempty and every entry is a relative,
//!   traversal-free repository path.
//! - [INV-TASK-004] Every `verify` entry has a non-empty `cmd`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum serialized size of a task file (bytes).
pub const MAX_TASK_FILE_SIZE: usize = 65_536;

/// Maximum length of a task id.
pub const MAX_TASK_ID_LENGTH: usize = 128;

/// Maximum number of scope entries.
pub const MAX_SCOPE_ENTRIES: usize = 256;

/// Maximum number of verification commands.
pub const MAX_VERIFY_ENTRIES: usize = 64;

/// Maximum length of a single scope entry.
pub const MAX_SCOPE_ENTRY_LENGTH: usize = 512;

/// Default expected exit code for a verification command.
const fn default_expected_exit() -> i32 {
    0
}

/// Default per-command verification timeout in seconds.
const fn default_timeout_sec() -> u64 {
    60
}

const fn default_stop_on_failure() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from task deserialization and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// Input exceeds [`MAX_TASK_FILE_SIZE`].
    #[error("task file size {size} exceeds maximum {max}")]
    InputTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// JSON deserialization failed.
    #[error("task JSON error: {detail}")]
    Json {
        /// Detail about the failure.
        detail: String,
    },

    /// The id is empty, too long, or contains disallowed characters.
    #[error("invalid task id {id:?}: {reason}")]
    InvalidId {
        /// The offending id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The scope set is empty.
    #[error("scope must be nonempty")]
    EmptyScope,

    /// A bound on collection size was exceeded.
    #[error("{field} has {len} entries, maximum is {max}")]
    TooManyEntries {
        /// Name of the oversize field.
        field: &'static str,
        /// Actual count.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// A scope entry is not a safe relative path.
    #[error("invalid scope entry {entry:?}: {reason}")]
    InvalidScopeEntry {
        /// The offending entry.
        entry: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A verification command has an empty `cmd`.
    #[error("verify[{index}] has an empty cmd")]
    EmptyVerifyCmd {
        /// Index of the offending entry.
        index: usize,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// One verification command, run in order inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCommand {
    /// Program to execute. REQUIRED, non-empty.
    pub cmd: String,

    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Exit code that counts as a pass.
    #[serde(default = "default_expected_exit")]
    pub expected_exit: i32,

    /// Wall-clock timeout for this command, in seconds.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

/// The immutable, schema-validated description of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Unique path-safe identifier; primary key across queue directories.
    pub id: String,

    /// Enqueue timestamp, used for age ordering.
    pub created_at: DateTime<Utc>,

    /// Opaque instructions for the executor.
    pub prompt: String,

    /// Repository-relative path patterns the executor may modify.
    pub scope: Vec<String>,

    /// Verification commands, run in order.
    #[serde(default)]
    pub verify: Vec<VerifyCommand>,

    /// Queue priority; higher runs first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Whether a failing task terminates the worker's queue pass.
    #[serde(default = "default_stop_on_failure")]
    pub stop_on_failure: bool,
}

impl Task {
    /// Validates id, scope, and verify invariants (INV-TASK-002..004).
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), TaskError> {
        validate_task_id(&self.id)?;

        if self.scope.is_empty() {
            return Err(TaskError::EmptyScope);
        }
        if self.scope.len() > MAX_SCOPE_ENTRIES {
            return Err(TaskError::TooManyEntries {
                field: "scope",
                len: self.scope.len(),
                max: MAX_SCOPE_ENTRIES,
            });
        }
        for entry in &self.scope {
            validate_scope_entry(entry)?;
        }

        if self.verify.len() > MAX_VERIFY_ENTRIES {
            return Err(TaskError::TooManyEntries {
                field: "verify",
                len: self.verify.len(),
                max: MAX_VERIFY_ENTRIES,
            });
        }
        for (index, entry) in self.verify.iter().enumerate() {
            if entry.cmd.is_empty() {
                return Err(TaskError::EmptyVerifyCmd { index });
            }
        }

        Ok(())
    }

    /// Sort key for queue ordering: priority descending, age ascending,
    /// id ascending.
    #[must_use]
    pub fn queue_key(&self) -> (i64, DateTime<Utc>, String) {
        // Negated priority so a plain ascending sort runs high priority
        // first.
        (
            -self.priority.unwrap_or(0),
            self.created_at,
            self.id.clone(),
        )
    }
}

/// Checks a task id against INV-TASK-002.
///
/// # Errors
///
/// Returns [`TaskError::InvalidId`] when the id is unusable as a file
/// name.
pub fn validate_task_id(id: &str) -> Result<(), TaskError> {
    let reject = |reason: &str| {
        Err(TaskError::InvalidId {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    };
    if id.is_empty() {
        return reject("empty");
    }
    if id.len() > MAX_TASK_ID_LENGTH {
        return reject("too long");
    }
    if id == "." || id == ".." {
        return reject("dot component");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return reject("characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}

fn validate_scope_entry(entry: &str) -> Result<(), TaskError> {
    let reject = |reason: &str| {
        Err(TaskError::InvalidScopeEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        })
    };
    if entry.is_empty() {
        return reject("empty");
    }
    if entry.len() > MAX_SCOPE_ENTRY_LENGTH {
        return reject("too long");
    }
    if entry.starts_with('/') || entry.contains('\\') {
        return reject("must be a relative slash path");
    }
    if entry.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return reject("contains empty or dot path component");
    }
    Ok(())
}

/// Deserializes and validates a task from JSON bytes with the
/// [`MAX_TASK_FILE_SIZE`] gate applied first (INV-TASK-001).
///
/// # Errors
///
/// Returns [`TaskError`] on oversize input, malformed JSON, or any
/// validation failure.
pub fn deserialize_task(bytes: &[u8]) -> Result<Task, TaskError> {
    if bytes.len() > MAX_TASK_FILE_SIZE {
        return Err(TaskError::InputTooLarge {
            size: bytes.len(),
            max: MAX_TASK_FILE_SIZE,
        });
    }
    let task: Task = serde_json::from_slice(bytes).map_err(|e| TaskError::Json {
        detail: e.to_string(),
    })?;
    task.validate()?;
    Ok(task)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(id: &str) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "created_at": "2026-05-01T12:00:00Z",
                "prompt": "fix the thing",
                "scope": ["src/a.txt"],
                "verify": [{{"cmd": "true"}}]
            }}"#
        )
    }

    #[test]
    fn defaults_are_applied() {
        let task = deserialize_task(minimal_json("t1").as_bytes()).expect("valid");
        assert_eq!(task.id, "t1");
        assert!(task.stop_on_failure);
        assert_eq!(task.priority, None);
        assert_eq!(task.verify[0].expected_exit, 0);
        assert_eq!(task.verify[0].timeout_sec, 60);
        assert!(task.verify[0].args.is_empty());
    }

    #[test]
    fn roundtrip_preserves_value() {
        let task = deserialize_task(minimal_json("round-trip_1.0").as_bytes()).expect("valid");
        let bytes = serde_json::to_vec(&task).expect("serialize");
        let restored = deserialize_task(&bytes).expect("deserialize");
        assert_eq!(task, restored);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = minimal_json("t1").replace("\"prompt\"", "\"evil\": 1, \"prompt\"");
        assert!(matches!(
            deserialize_task(json.as_bytes()),
            Err(TaskError::Json { .. })
        ));
    }

    #[test]
    fn oversize_input_is_rejected() {
        let oversized = vec![b' '; MAX_TASK_FILE_SIZE + 1];
        assert!(matches!(
            deserialize_task(&oversized),
            Err(TaskError::InputTooLarge { .. })
        ));
    }

    #[test]
    fn bad_ids_are_rejected() {
        for id in ["", "..", ".", "a/b", "a b", "a\tb", "ä", "x".repeat(129).as_str()] {
            assert!(
                matches!(validate_task_id(id), Err(TaskError::InvalidId { .. })),
                "{id:?} should be rejected"
            );
        }
        for id in ["t1", "T.1_x-2", "0", "a.b.c"] {
            assert!(validate_task_id(id).is_ok(), "{id:?} should pass");
        }
    }

    #[test]
    fn empty_scope_is_rejected() {
        let json = minimal_json("t1").replace(r#"["src/a.txt"]"#, "[]");
        assert!(matches!(
            deserialize_task(json.as_bytes()),
            Err(TaskError::EmptyScope)
        ));
    }

    #[test]
    fn unsafe_scope_entries_are_rejected() {
        for entry in ["/abs/path", "a/../b", "./x", "a//b", ""] {
            let json = minimal_json("t1").replace("src/a.txt", entry);
            assert!(
                matches!(
                    deserialize_task(json.as_bytes()),
                    Err(TaskError::InvalidScopeEntry { .. }) | Err(TaskError::EmptyScope)
                ),
                "{entry:?} should be rejected"
            );
        }
    }

    #[test]
    fn empty_verify_cmd_is_rejected() {
        let json = minimal_json("t1").replace(r#""cmd": "true""#, r#""cmd": """#);
        assert!(matches!(
            deserialize_task(json.as_bytes()),
            Err(TaskError::EmptyVerifyCmd { index: 0 })
        ));
    }

    #[test]
    fn queue_key_orders_priority_then_age_then_id() {
        let mut high = deserialize_task(minimal_json("b").as_bytes()).expect("valid");
        high.priority = Some(5);
        let low = deserialize_task(minimal_json("a").as_bytes()).expect("valid");

        let mut tasks = vec![low.clone(), high.clone()];
        tasks.sort_by_key(Task::queue_key);
        assert_eq!(tasks[0].id, "b");
        assert_eq!(tasks[1].id, "a");
    }
}
