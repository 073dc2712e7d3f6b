//! The worker loop: claims tasks, materializes isolated worktrees, runs
//! the executor and verification commands in the sandbox, enforces the
//! safety gates, and writes durable results.
//!
//! # Processing pipeline
//!
//! ```text
//! scan <handoff>/tasks/*.json
//!   -> sort by (priority DESC, created_at ASC, id ASC)
//!   -> for each:
//!     1. Invalid schema        -> schema_invalid result, file deleted
//!     2. Result already exists -> skip (idempotent), duplicate deleted
//!     3. Task lock held        -> skip for now
//!     4. Atomic claim: rename tasks/X.json -> running/X.json
//!     5. Dirty target repo     -> repo_dirty result
//!     6. Worktree + branch     -> branch_checkout_failed on error
//!     7. Executor in sandbox   -> opencode_timeout / opencode_crashed
//!     8. Verify commands, each output stream scanned for secrets
//!     9. Any secret match      -> secret_detected, no artifacts
//!    10. Scope + filename gate -> scope_violation
//!    11. Patch, commit, result -> completed_success / completed_failed
//!    12. Worktree removed, running file deleted, lock released
//! ```
//!
//! Every terminal state is one result record; the worker never crashes on
//! a task. Fatal aborts happen only before any task is touched (missing
//! engine or image).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use warden_core::config::WorkerConfig;
use warden_core::locks::{LockError, TaskLock, WorkerLock};
use warden_core::queue::{HandoffRoot, InvalidTaskFile, TaskCandidate};
use warden_core::result::{
    Artifacts, ExitPath, SecretIncident, TaskResult, TaskResultBuilder, VerificationOutcome,
};
use warden_core::safety;
use warden_core::sandbox::{RunResult, Runner, SandboxError};
use warden_core::scan::{self, SecretMatch};
use warden_core::task::{Task, validate_task_id};
use warden_core::safefs;
use warden_core::vcs::{DiffScope, Git};

use crate::exit_codes;

/// Inline cap per captured stream in a result record. Streams over the
/// cap spill in full to `logs/`.
const INLINE_OUTPUT_CAP: usize = 10 * 1024;

/// Slice size for the interruptible poll sleep.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Runs the worker until stopped, or for a single queue pass.
///
/// # Errors
///
/// Returns an error only for infrastructure failures outside the per-task
/// state machine (unreadable handoff root, unexpected lock I/O).
pub fn run(config: &WorkerConfig, once: bool) -> Result<u8> {
    let handoff = HandoffRoot::new(&config.handoff_root);
    handoff.ensure_layout().context("creating handoff layout")?;

    let git = Git::with_timeout(config.vcs_timeout);
    if !git.is_repo(&config.repo_root) {
        eprintln!(
            "error: target repository {} is not a git work tree",
            config.repo_root.display()
        );
        return Ok(exit_codes::GENERIC_ERROR);
    }

    // Pre-flight: the only fatal failures, raised before any task is
    // touched.
    let runner = config.runner();
    if runner.is_insecure() {
        warn!("insecure local runner enabled; results will carry insecure_runner_used = true");
    }
    if let Err(e) = runner.preflight() {
        eprintln!("error: sandbox pre-flight failed: {e}");
        return Ok(exit_codes::PREFLIGHT_FAILED);
    }

    let worker_lock = match WorkerLock::acquire(&handoff.locks_dir()) {
        Ok(lock) => lock,
        Err(LockError::Busy { reason }) => {
            eprintln!("error: worker already active: {reason}");
            return Ok(exit_codes::WORKER_LOCKED);
        },
        Err(e) => return Err(e).context("acquiring worker lock"),
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        }) {
            warn!("cannot install signal handler: {e}");
        }
    }

    info!(
        handoff = %config.handoff_root.display(),
        repo = %config.repo_root.display(),
        once,
        "worker started"
    );

    let code = run_passes(config, &handoff, &git, &runner, &stop, once);
    worker_lock.release();
    info!("worker stopped");
    code
}

fn run_passes(
    config: &WorkerConfig,
    handoff: &HandoffRoot,
    git: &Git,
    runner: &Runner,
    stop: &AtomicBool,
    once: bool,
) -> Result<u8> {
    loop {
        let scan = handoff.scan_tasks().context("scanning task inbox")?;

        for invalid in scan.invalid {
            handle_invalid_task(handoff, &invalid);
        }

        let mut halt = false;
        for candidate in scan.valid {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match process_task(config, handoff, git, runner, candidate) {
                TaskOutcome::Completed { halt_queue } => {
                    if halt_queue {
                        info!("stop_on_failure: terminating queue pass");
                        halt = true;
                        break;
                    }
                },
                TaskOutcome::SkippedLocked => {},
            }
        }

        if once || halt || stop.load(Ordering::SeqCst) {
            return Ok(exit_codes::OK);
        }
        interruptible_sleep(config.poll_interval, stop);
        if stop.load(Ordering::SeqCst) {
            return Ok(exit_codes::OK);
        }
    }
}

fn interruptible_sleep(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invalid tasks
// ─────────────────────────────────────────────────────────────────────────────

fn handle_invalid_task(handoff: &HandoffRoot, invalid: &InvalidTaskFile) {
    warn!(
        file = %invalid.path.display(),
        reason = %invalid.reason,
        "rejecting invalid task file"
    );
    // A result can only be named after a path-safe id; otherwise the file
    // is dropped with a log line as the sole trace.
    if validate_task_id(&invalid.file_id).is_ok() && !handoff.has_result(&invalid.file_id) {
        let result = TaskResultBuilder::new(&invalid.file_id)
            .reason(invalid.reason.to_string())
            .finish(ExitPath::SchemaInvalid);
        if let Err(e) = handoff.write_result(&result) {
            error!("cannot write schema_invalid result: {e}");
        }
    }
    if let Err(e) = handoff.discard_task_file(&invalid.path) {
        error!("cannot delete invalid task file: {e}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-task state machine
// ─────────────────────────────────────────────────────────────────────────────

enum TaskOutcome {
    /// A result was written (or the task was an idempotent duplicate).
    Completed { halt_queue: bool },
    /// Another operator holds the task lock; the file stays queued.
    SkippedLocked,
}

fn process_task(
    config: &WorkerConfig,
    handoff: &HandoffRoot,
    git: &Git,
    runner: &Runner,
    candidate: TaskCandidate,
) -> TaskOutcome {
    let task = candidate.task;
    let id = task.id.clone();

    // ── Idempotency ──────────────────────────────────────────────────
    if handoff.has_result(&id) {
        info!(task_id = %id, "result exists; idempotent skip");
        if let Err(e) = handoff.discard_task_file(&candidate.path) {
            error!("cannot remove duplicate task file: {e}");
        }
        return TaskOutcome::Completed { halt_queue: false };
    }

    // ── Task lock ────────────────────────────────────────────────────
    let task_lock = match TaskLock::acquire(&handoff.locks_dir(), &id) {
        Ok(lock) => lock,
        Err(LockError::Busy { reason }) => {
            info!(task_id = %id, %reason, "task locked; skipping");
            return TaskOutcome::SkippedLocked;
        },
        Err(e) => {
            error!(task_id = %id, "task lock I/O failure: {e}");
            return TaskOutcome::SkippedLocked;
        },
    };

    // ── Claim ────────────────────────────────────────────────────────
    if let Err(e) = handoff.claim(&id) {
        // The file vanished between scan and claim; nothing to do.
        warn!(task_id = %id, "claim failed: {e}");
        task_lock.release();
        return TaskOutcome::Completed { halt_queue: false };
    }

    info!(task_id = %id, "processing task");
    let execution = execute_claimed(config, handoff, git, runner, &task);

    let (result, halt_queue) = match execution {
        Ok(done) => done,
        Err(e) => {
            // Unexpected failure: the worker records it and keeps going.
            error!(task_id = %id, "internal error: {e:#}");
            cleanup_worktree(handoff, git, config, &id);
            let result = TaskResultBuilder::new(&id)
                .task_snapshot(task.clone())
                .insecure_runner_used(runner.is_insecure())
                .reason(format!("{e:#}"))
                .finish(ExitPath::InternalError);
            (result, false)
        },
    };

    finalize_task(handoff, &id, &result);
    task_lock.release();
    TaskOutcome::Completed { halt_queue }
}

/// Writes the result and clears the running-state file. The worktree is
/// already gone by the time this runs.
fn finalize_task(handoff: &HandoffRoot, id: &str, result: &TaskResult) {
    match handoff.write_result(result) {
        Ok(path) => info!(
            task_id = %id,
            exit_path = ?result.exit_path,
            result = %path.display(),
            "task finalized"
        ),
        Err(e) => error!(task_id = %id, "cannot write result: {e}"),
    }
    if let Err(e) = handoff.finish_running(id) {
        error!(task_id = %id, "cannot remove running file: {e}");
    }
}

/// Removes the per-task worktree, both from git's bookkeeping and from
/// `tmp/`. Best-effort on every step; the worktree path is confined to
/// `tmp/` by construction and re-checked here.
fn cleanup_worktree(handoff: &HandoffRoot, git: &Git, config: &WorkerConfig, id: &str) {
    let ws = handoff.worktree_dir(id);
    if !safefs::is_contained(&ws, &handoff.tmp_dir()) {
        error!(task_id = %id, "worktree path escaped tmp/; refusing cleanup");
        return;
    }
    if ws.exists() {
        if let Err(e) = git.worktree_remove(&config.repo_root, &ws) {
            warn!(task_id = %id, "git worktree remove failed: {e}");
        }
    }
    if let Err(e) = safefs::rmdir(&ws, &handoff.tmp_dir()) {
        warn!(task_id = %id, "worktree directory cleanup failed: {e}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Claimed-task execution
// ─────────────────────────────────────────────────────────────────────────────

/// Everything between a successful claim and the result write. Returns
/// the finished result plus whether `stop_on_failure` halts the pass.
/// `Err` means an unexpected infrastructure failure (`internal_error`).
fn execute_claimed(
    config: &WorkerConfig,
    handoff: &HandoffRoot,
    git: &Git,
    runner: &Runner,
    task: &Task,
) -> Result<(TaskResult, bool)> {
    let id = task.id.as_str();
    let insecure = runner.is_insecure();
    let base = || {
        TaskResultBuilder::new(id)
            .task_snapshot(task.clone())
            .insecure_runner_used(insecure)
    };

    // ── Dirty-repo gate ──────────────────────────────────────────────
    let repo_status = git
        .status(&config.repo_root)
        .context("checking target repository status")?;
    if !repo_status.is_clean() {
        let result = base()
            .reason("target repository has uncommitted changes")
            .finish(ExitPath::RepoDirty);
        return Ok((result, false));
    }

    // ── Worktree and branch ──────────────────────────────────────────
    let branch = safety::auto_branch(&repo_status.branch, id);
    let ws = handoff.worktree_dir(id);
    if let Err(e) = git.worktree_add(&config.repo_root, &ws, &branch) {
        cleanup_worktree(handoff, git, config, id);
        let result = base()
            .branch(branch.name())
            .reason(format!("worktree creation failed: {e}"))
            .finish(ExitPath::BranchCheckoutFailed);
        return Ok((result, false));
    }
    let commit_before = git.head_commit(&ws).context("reading worktree HEAD")?;

    let builder_for = |b: TaskResultBuilder| {
        b.branch(branch.name()).commit_before(commit_before.clone())
    };

    // ── Executor in the sandbox ──────────────────────────────────────
    let mut executor_args = config.executor_args.clone();
    executor_args.push(task.prompt.clone());
    let executor = match runner.run(&ws, &config.executor_cmd, &executor_args, config.executor_timeout)
    {
        Ok(run) => run,
        Err(SandboxError::Spawn { source }) => {
            cleanup_worktree(handoff, git, config, id);
            let result = builder_for(base())
                .reason(format!("executor failed to launch: {source}"))
                .finish(ExitPath::OpencodeCrashed);
            return Ok((result, false));
        },
        Err(e) => {
            cleanup_worktree(handoff, git, config, id);
            let result = builder_for(base())
                .reason(format!("executor sandbox failure: {e}"))
                .finish(ExitPath::OpencodeCrashed);
            return Ok((result, false));
        },
    };

    // Every byte of executor output goes through the scanner before any
    // other decision: a leak beats a timeout in severity.
    let mut matches = scan_streams(&executor);
    if !matches.is_empty() {
        cleanup_worktree(handoff, git, config, id);
        return Ok((secret_result(builder_for(base()), id, &matches), false));
    }
    if executor.timed_out {
        cleanup_worktree(handoff, git, config, id);
        let result = builder_for(base())
            .reason(format!(
                "executor exceeded {}s",
                config.executor_timeout.as_secs()
            ))
            .finish(ExitPath::OpencodeTimeout);
        return Ok((result, false));
    }
    if executor.exit_code != 0 {
        cleanup_worktree(handoff, git, config, id);
        let result = builder_for(base())
            .reason(format!("executor exited with code {}", executor.exit_code))
            .finish(ExitPath::OpencodeCrashed);
        return Ok((result, false));
    }

    // ── Verification commands ────────────────────────────────────────
    let mut artifacts = Artifacts::default();
    let mut verification = Vec::with_capacity(task.verify.len());
    let mut all_passed = true;

    for (index, verify) in task.verify.iter().enumerate() {
        let timeout = Duration::from_secs(verify.timeout_sec);
        let run = match runner.run(&ws, &verify.cmd, &verify.args, timeout) {
            Ok(run) => run,
            Err(e) => {
                cleanup_worktree(handoff, git, config, id);
                let mut builder = builder_for(base());
                for outcome in verification {
                    builder = builder.push_verification(outcome);
                }
                let result = builder
                    .reason(format!("verify[{index}] `{}` failed to launch: {e}", verify.cmd))
                    .finish(ExitPath::VerifyFailed);
                return Ok((result, false));
            },
        };

        // One scanner instance per stream, before anything is recorded.
        let stream_matches = scan_streams(&run);
        if !stream_matches.is_empty() {
            matches.extend(stream_matches);
            cleanup_worktree(handoff, git, config, id);
            return Ok((secret_result(builder_for(base()), id, &matches), false));
        }

        let (stdout_excerpt, stdout_spilled) =
            record_stream(handoff, id, index, "stdout", &run.stdout, &mut artifacts);
        let (stderr_excerpt, stderr_spilled) =
            record_stream(handoff, id, index, "stderr", &run.stderr, &mut artifacts);

        let passed = !run.timed_out && run.exit_code == verify.expected_exit;
        all_passed &= passed;
        verification.push(VerificationOutcome {
            cmd: verify.cmd.clone(),
            args: verify.args.clone(),
            exit_code: run.exit_code,
            expected_exit: verify.expected_exit,
            passed,
            duration_ms: run.duration_ms,
            stdout: stdout_excerpt,
            stderr: stderr_excerpt,
            output_truncated: stdout_spilled || stderr_spilled,
        });
    }

    // ── Scope and filename gates ─────────────────────────────────────
    let ws_status = git.status(&ws).context("reading worktree status")?;
    let changed = ws_status.changed_files();
    let scope_violations = safety::scope_violations(&task.scope, &changed);
    let banned_files = safety::filename_policy_violations(&ws_status.untracked);
    if !scope_violations.is_empty() || !banned_files.is_empty() {
        cleanup_worktree(handoff, git, config, id);
        let reason = if scope_violations.is_empty() {
            format!("secretless filename policy violated: {}", banned_files.join(", "))
        } else {
            format!("files outside scope: {}", scope_violations.join(", "))
        };
        let mut builder = builder_for(base()).files_changed(changed).reason(reason);
        for outcome in verification {
            builder = builder.push_verification(outcome);
        }
        return Ok((builder.finish(ExitPath::ScopeViolation), false));
    }

    // ── Patch and commit ─────────────────────────────────────────────
    let mut commit_after = None;
    if !ws_status.is_clean() {
        git.add_all(&ws).context("staging changes")?;
        let diff = git.diff(&ws, DiffScope::Staged).context("producing patch")?;
        if !diff.is_empty() {
            artifacts.patch_path = Some(handoff.write_patch(id, &diff).context("writing patch")?);
        }
        match git.commit(&ws, &format!("warden: apply task {id}")) {
            Ok(()) => commit_after = git.head_commit(&ws).ok(),
            Err(e) => warn!(task_id = %id, "commit failed: {e}"),
        }
    }

    // ── Terminal transition ──────────────────────────────────────────
    cleanup_worktree(handoff, git, config, id);
    let exit_path = if all_passed {
        ExitPath::CompletedSuccess
    } else {
        ExitPath::CompletedFailed
    };
    let halt_queue = exit_path == ExitPath::CompletedFailed && task.stop_on_failure;

    let mut builder = builder_for(base())
        .files_changed(changed)
        .artifacts(artifacts);
    if let Some(commit) = commit_after {
        builder = builder.commit_after(commit);
    }
    for outcome in verification {
        builder = builder.push_verification(outcome);
    }
    Ok((builder.finish(exit_path), halt_queue))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Scans both output streams of one run, one scanner instance per
/// stream.
fn scan_streams(run: &RunResult) -> Vec<SecretMatch> {
    let mut matches = scan::scan_bytes(&run.stdout);
    matches.extend(scan::scan_bytes(&run.stderr));
    matches
}

fn secret_result(builder: TaskResultBuilder, id: &str, matches: &[SecretMatch]) -> TaskResult {
    let patterns = scan::pattern_names(matches);
    let incident = SecretIncident {
        incident_hash: scan::incident_hash(id, &patterns),
        match_count: matches.len() as u64,
        patterns,
    };
    warn!(
        task_id = %id,
        incident = %incident.incident_hash,
        "secret detected; suppressing artifacts"
    );
    builder
        .secret_incident(incident)
        .reason("secret pattern detected in command output")
        .finish(ExitPath::SecretDetected)
}

/// Caps one stream for inline recording; payloads over the cap spill in
/// full to `logs/<id>_<index>_<stream>.log`. Only secret-free streams
/// reach this point.
fn record_stream(
    handoff: &HandoffRoot,
    id: &str,
    index: usize,
    stream: &str,
    payload: &[u8],
    artifacts: &mut Artifacts,
) -> (String, bool) {
    if payload.len() <= INLINE_OUTPUT_CAP {
        return (String::from_utf8_lossy(payload).into_owned(), false);
    }
    match handoff.write_log(id, index, stream, payload) {
        Ok(rel_path) => {
            if artifacts.log_path.is_none() {
                artifacts.log_path = Some(rel_path.clone());
            }
            artifacts.log_paths.push(rel_path);
        },
        Err(e) => error!(task_id = %id, "cannot spill {stream} log: {e}"),
    }
    let excerpt = utf8_prefix(payload, INLINE_OUTPUT_CAP);
    (excerpt, true)
}

fn utf8_prefix(payload: &[u8], cap: usize) -> String {
    if payload.len() <= cap {
        return String::from_utf8_lossy(payload).into_owned();
    }
    let mut cut = cap;
    while cut > 0 && payload[cut] & 0b1100_0000 == 0b1000_0000 {
        cut -= 1;
    }
    String::from_utf8_lossy(&payload[..cut]).into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
