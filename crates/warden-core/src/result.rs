//! Result records: the canonical account of one task's lifecycle.
//!
//! Exactly one result is written per task, whatever happened to it. The
//! record names its terminal transition through a closed [`ExitPath`]
//! enum, carries the full task snapshot for audit, and — when secrets
//! were detected — an incident summary that names patterns only, never
//! matched text.
//!
//! - [INV-RES-001] `completed_at >= started_at`; both derive from one
//!   monotonic measurement.
//! - [INV-RES-002] A `secret_detected` result carries no artifacts: no
//!   patch path, no log paths.
//! - [INV-RES-003] Consumers must tolerate additive fields; this module
//!   never removes or renames existing keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Executor ran, all verifications passed.
    Success,
    /// The task completed but a gate or verification failed.
    Failed,
    /// The worker could not process the task.
    Error,
    /// A secret pattern was detected in some output.
    SecretDetected,
}

/// The closed set of terminal transitions. Exactly one per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPath {
    /// All verifications passed.
    CompletedSuccess,
    /// At least one verification failed.
    CompletedFailed,
    /// Another live worker holds the worker lock.
    WorkerLocked,
    /// The task file failed schema validation.
    SchemaInvalid,
    /// A result for this id already exists.
    IdempotentSkip,
    /// The per-task worktree or branch could not be created.
    BranchCheckoutFailed,
    /// The target repository had uncommitted changes.
    RepoDirty,
    /// The executor exceeded its timeout.
    OpencodeTimeout,
    /// The executor could not be launched or crashed.
    OpencodeCrashed,
    /// Verification could not be run to completion.
    VerifyFailed,
    /// The executor modified files outside the task scope.
    ScopeViolation,
    /// A secret pattern was detected.
    SecretDetected,
    /// An unexpected worker-side error.
    InternalError,
}

impl ExitPath {
    /// The status a result with this exit path carries.
    #[must_use]
    pub const fn status(self) -> TaskStatus {
        match self {
            Self::CompletedSuccess => TaskStatus::Success,
            Self::CompletedFailed | Self::ScopeViolation => TaskStatus::Failed,
            Self::SecretDetected => TaskStatus::SecretDetected,
            Self::WorkerLocked
            | Self::SchemaInvalid
            | Self::IdempotentSkip
            | Self::BranchCheckoutFailed
            | Self::RepoDirty
            | Self::OpencodeTimeout
            | Self::OpencodeCrashed
            | Self::VerifyFailed
            | Self::InternalError => TaskStatus::Error,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one verification command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Program that was executed.
    pub cmd: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Observed exit code (`-1` when killed).
    pub exit_code: i32,
    /// Exit code that would have counted as a pass.
    pub expected_exit: i32,
    /// Whether the command passed.
    pub passed: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout, capped at 10 KiB (lossy UTF-8). Scanned before
    /// recording: a stream with a secret match never reaches a result.
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr, capped at 10 KiB (lossy UTF-8).
    #[serde(default)]
    pub stderr: String,
    /// Whether either captured stream exceeded the inline cap (full
    /// redaction-gated payload spilled to the logs directory).
    pub output_truncated: bool,
}

/// Paths of artifacts produced for this task, relative to the handoff
/// root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    /// First spilled log file, if any output exceeded the inline cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// All spilled log files (additive field; `log_path` is its first
    /// entry).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_paths: Vec<String>,
    /// Unified diff of the task's changes, if the task succeeded far
    /// enough to produce one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_path: Option<String>,
}

impl Artifacts {
    /// Whether no artifact was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log_path.is_none() && self.log_paths.is_empty() && self.patch_path.is_none()
    }
}

/// Secret detection summary: pattern names only, never matched bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretIncident {
    /// Sorted, deduplicated catalog names of the matching patterns.
    pub patterns: Vec<String>,
    /// Total number of matches across all scanned streams.
    pub match_count: u64,
    /// First 16 hex chars of `SHA-256(task_id + "," + sorted names)`.
    pub incident_hash: String,
}

/// Canonical record of one task's lifecycle outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the task this result belongs to.
    pub task_id: String,

    /// Full task as it was read from the queue (absent only when the file
    /// never parsed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_snapshot: Option<Task>,

    /// Coarse outcome.
    pub status: TaskStatus,

    /// Terminal transition.
    pub exit_path: ExitPath,

    /// When processing began.
    pub started_at: DateTime<Utc>,

    /// When processing finished; always `>= started_at` (INV-RES-001).
    pub completed_at: DateTime<Utc>,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// Per-command verification outcomes, in execution order.
    #[serde(default)]
    pub verification: Vec<VerificationOutcome>,

    /// Branch the task ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// `HEAD` before the executor ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_before: Option<String>,

    /// `HEAD` after a worker-authored commit, if one was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_after: Option<String>,

    /// Changed files observed after the executor ran.
    #[serde(default)]
    pub files_changed: Vec<String>,

    /// Artifact paths, relative to the handoff root.
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Secret detection summary (INV-RES-002 clears artifacts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_incident: Option<SecretIncident>,

    /// Whether the insecure local runner executed any command for this
    /// task. Must be `false` in production.
    pub insecure_runner_used: bool,

    /// Human-readable failure detail for error-class results. Never
    /// contains raw command output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a [`TaskResult`] while enforcing the record invariants.
pub struct TaskResultBuilder {
    task_id: String,
    task_snapshot: Option<Task>,
    started_at: DateTime<Utc>,
    verification: Vec<VerificationOutcome>,
    branch: Option<String>,
    commit_before: Option<String>,
    commit_after: Option<String>,
    files_changed: Vec<String>,
    artifacts: Artifacts,
    secret_incident: Option<SecretIncident>,
    insecure_runner_used: bool,
    reason: Option<String>,
}

impl TaskResultBuilder {
    /// Starts a builder for `task_id`, stamping `started_at` now.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_snapshot: None,
            started_at: Utc::now(),
            verification: Vec::new(),
            branch: None,
            commit_before: None,
            commit_after: None,
            files_changed: Vec::new(),
            artifacts: Artifacts::default(),
            secret_incident: None,
            insecure_runner_used: false,
            reason: None,
        }
    }

    /// Records the full task for audit.
    #[must_use]
    pub fn task_snapshot(mut self, task: Task) -> Self {
        self.task_snapshot = Some(task);
        self
    }

    /// Appends one verification outcome.
    #[must_use]
    pub fn push_verification(mut self, outcome: VerificationOutcome) -> Self {
        self.verification.push(outcome);
        self
    }

    /// Records the branch the task ran on.
    #[must_use]
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Records `HEAD` before the executor ran.
    #[must_use]
    pub fn commit_before(mut self, commit: impl Into<String>) -> Self {
        self.commit_before = Some(commit.into());
        self
    }

    /// Records `HEAD` after the worker-authored commit.
    #[must_use]
    pub fn commit_after(mut self, commit: impl Into<String>) -> Self {
        self.commit_after = Some(commit.into());
        self
    }

    /// Records the observed changed-file set.
    #[must_use]
    pub fn files_changed(mut self, files: Vec<String>) -> Self {
        self.files_changed = files;
        self
    }

    /// Records artifact paths.
    #[must_use]
    pub fn artifacts(mut self, artifacts: Artifacts) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Records the secret incident summary.
    #[must_use]
    pub fn secret_incident(mut self, incident: SecretIncident) -> Self {
        self.secret_incident = Some(incident);
        self
    }

    /// Marks that the insecure local runner executed a command.
    #[must_use]
    pub const fn insecure_runner_used(mut self, used: bool) -> Self {
        self.insecure_runner_used = used;
        self
    }

    /// Records a human-readable failure detail.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Finishes the record with the given terminal transition.
    ///
    /// `completed_at` is derived from `started_at` plus the elapsed wall
    /// clock, so INV-RES-001 holds by construction. A `secret_detected`
    /// exit clears all artifacts (INV-RES-002).
    #[must_use]
    pub fn finish(self, exit_path: ExitPath) -> TaskResult {
        let completed_at = Utc::now().max(self.started_at);
        let duration_ms = completed_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64;

        let artifacts = if exit_path == ExitPath::SecretDetected {
            Artifacts::default()
        } else {
            self.artifacts
        };

        TaskResult {
            task_id: self.task_id,
            task_snapshot: self.task_snapshot,
            status: exit_path.status(),
            exit_path,
            started_at: self.started_at,
            completed_at,
            duration_ms,
            verification: self.verification,
            branch: self.branch,
            commit_before: self.commit_before,
            commit_after: self.commit_after,
            files_changed: self.files_changed,
            artifacts,
            secret_incident: self.secret_incident,
            insecure_runner_used: self.insecure_runner_used,
            reason: self.reason,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_paths_serialize_snake_case() {
        let cases = [
            (ExitPath::CompletedSuccess, "\"completed_success\""),
            (ExitPath::CompletedFailed, "\"completed_failed\""),
            (ExitPath::WorkerLocked, "\"worker_locked\""),
            (ExitPath::SchemaInvalid, "\"schema_invalid\""),
            (ExitPath::IdempotentSkip, "\"idempotent_skip\""),
            (ExitPath::BranchCheckoutFailed, "\"branch_checkout_failed\""),
            (ExitPath::RepoDirty, "\"repo_dirty\""),
            (ExitPath::OpencodeTimeout, "\"opencode_timeout\""),
            (ExitPath::OpencodeCrashed, "\"opencode_crashed\""),
            (ExitPath::VerifyFailed, "\"verify_failed\""),
            (ExitPath::ScopeViolation, "\"scope_violation\""),
            (ExitPath::SecretDetected, "\"secret_detected\""),
            (ExitPath::InternalError, "\"internal_error\""),
        ];
        for (path, expected) in cases {
            assert_eq!(serde_json::to_string(&path).expect("serialize"), expected);
        }
    }

    #[test]
    fn status_follows_exit_path() {
        assert_eq!(ExitPath::CompletedSuccess.status(), TaskStatus::Success);
        assert_eq!(ExitPath::CompletedFailed.status(), TaskStatus::Failed);
        assert_eq!(ExitPath::ScopeViolation.status(), TaskStatus::Failed);
        assert_eq!(ExitPath::SecretDetected.status(), TaskStatus::SecretDetected);
        assert_eq!(ExitPath::RepoDirty.status(), TaskStatus::Error);
        assert_eq!(ExitPath::InternalError.status(), TaskStatus::Error);
    }

    #[test]
    fn completed_at_never_precedes_started_at() {
        let result = TaskResultBuilder::new("t1").finish(ExitPath::InternalError);
        assert!(result.completed_at >= result.started_at);
    }

    #[test]
    fn secret_detected_clears_artifacts() {
        let result = TaskResultBuilder::new("t1")
            .artifacts(Artifacts {
                log_path: Some("logs/t1_0_stdout.log".to_string()),
                log_paths: vec!["logs/t1_0_stdout.log".to_string()],
                patch_path: Some("patches/t1.patch".to_string()),
            })
            .secret_incident(SecretIncident {
                patterns: vec!["BEARER_TOKEN".to_string()],
                match_count: 1,
                incident_hash: "0011223344556677".to_string(),
            })
            .finish(ExitPath::SecretDetected);

        assert!(result.artifacts.is_empty());
        assert_eq!(result.status, TaskStatus::SecretDetected);
        let incident = result.secret_incident.expect("incident");
        assert_eq!(incident.patterns, vec!["BEARER_TOKEN"]);
    }

    #[test]
    fn roundtrip_preserves_record() {
        let result = TaskResultBuilder::new("t1")
            .branch("feat/ai/t1")
            .commit_before("abc123")
            .files_changed(vec!["src/a.txt".to_string()])
            .push_verification(VerificationOutcome {
                cmd: "true".to_string(),
                args: vec![],
                exit_code: 0,
                expected_exit: 0,
                passed: true,
                duration_ms: 12,
                stdout: String::new(),
                stderr: String::new(),
                output_truncated: false,
            })
            .finish(ExitPath::CompletedSuccess);

        let bytes = serde_json::to_vec_pretty(&result).expect("serialize");
        let restored: TaskResult = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(result, restored);
    }

    #[test]
    fn unknown_result_fields_are_tolerated() {
        let result = TaskResultBuilder::new("t1").finish(ExitPath::IdempotentSkip);
        let mut value = serde_json::to_value(&result).expect("to value");
        value["future_field"] = serde_json::json!({"x": 1});
        let restored: TaskResult =
            serde_json::from_value(value).expect("additive fields tolerated");
        assert_eq!(restored.task_id, "t1");
    }
}
