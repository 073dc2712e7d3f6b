//! Hook-proof git operations.
//!
//! Every git invocation made by this module carries a safety envelope that
//! makes attacker-controlled repository content inert:
//!
//! - `core.hooksPath=/dev/null` — hook lookup short-circuits to a path
//!   that can never contain executables, so checked-in hook scripts do not
//!   run.
//! - `gc.auto=0` — no background maintenance is spawned mid-operation.
//! - `GIT_TERMINAL_PROMPT=0`, `GIT_CONFIG_NOSYSTEM=1`,
//!   `GIT_CONFIG_GLOBAL=/dev/null`, `GIT_ADVICE=0`,
//!   `GIT_OPTIONAL_LOCKS=0` — no prompts, no system or user config, no
//!   advisory chatter, no opportunistic lock taking.
//! - A wall-clock timeout per call (default 30 s); expiry kills the child.
//! - A fixed, caller-supplied working directory for every call.
//!
//! Diff output is truncated at [`MAX_DIFF_BYTES`] with
//! [`DIFF_TRUNCATION_SENTINEL`] appended, so a hostile worktree cannot
//! balloon result records or patch files.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;

use crate::process::{self, Captured};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Default wall-clock timeout for a single git invocation.
pub const DEFAULT_VCS_TIMEOUT: Duration = Duration::from_secs(30);

/// Diff output beyond this many bytes is truncated.
pub const MAX_DIFF_BYTES: usize = 10 * 1024 * 1024;

/// Appended to a diff that was truncated at [`MAX_DIFF_BYTES`].
pub const DIFF_TRUNCATION_SENTINEL: &str = "\n[diff truncated at 10 MiB]\n";

/// Commit identity injected for worker-authored commits.
const COMMIT_IDENT_NAME: &str = "warden";
const COMMIT_IDENT_EMAIL: &str = "warden@localhost";

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from safe git operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VcsError {
    /// The git command exited unsuccessfully.
    #[error("git {op} failed: {reason}")]
    CommandFailed {
        /// The operation that failed (first git argument).
        op: String,
        /// Failure reason, from stderr then stdout.
        reason: String,
    },

    /// The git command exceeded its wall-clock timeout and was killed.
    #[error("git {op} timed out after {timeout_secs}s")]
    Timeout {
        /// The operation that timed out.
        op: String,
        /// The timeout that expired.
        timeout_secs: u64,
    },

    /// The worktree destination already exists.
    #[error("worktree destination already exists: {}", path.display())]
    WorktreeExists {
        /// The pre-existing path.
        path: PathBuf,
    },

    /// Spawning git failed.
    #[error("failed to spawn git for {op}: {source}")]
    Spawn {
        /// The operation being attempted.
        op: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// A rename entry from `git status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    /// Pre-rename path.
    pub from: String,
    /// Post-rename path.
    pub to: String,
}

/// Structured `git status` report for a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStatus {
    /// Current branch name (`HEAD` when detached).
    pub branch: String,
    /// Paths with staged changes.
    pub staged: Vec<String>,
    /// Paths with unstaged changes.
    pub unstaged: Vec<String>,
    /// Untracked paths.
    pub untracked: Vec<String>,
    /// Renamed paths.
    pub renamed: Vec<Rename>,
}

impl RepoStatus {
    /// Whether the workspace has no pending changes of any kind.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.unstaged.is_empty()
            && self.untracked.is_empty()
            && self.renamed.is_empty()
    }

    /// All changed paths, sorted and deduplicated. Renames contribute both
    /// sides.
    #[must_use]
    pub fn changed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .staged
            .iter()
            .chain(self.unstaged.iter())
            .chain(self.untracked.iter())
            .cloned()
            .chain(
                self.renamed
                    .iter()
                    .flat_map(|r| [r.from.clone(), r.to.clone()]),
            )
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// Which diff a [`Git::diff`] call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffScope {
    /// Working tree against the index.
    Unstaged,
    /// Index against `HEAD`.
    Staged,
    /// Working tree and index against `HEAD`.
    Head,
}

/// Branch disposition for a new worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeBranch {
    /// Create a fresh branch of this name off `HEAD`.
    Fresh(String),
    /// Check out an existing branch (forced: the branch may already be
    /// checked out in the primary worktree, which the core never writes
    /// to).
    Existing(String),
}

impl WorktreeBranch {
    /// The branch name this disposition lands on.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Fresh(name) | Self::Existing(name) => name,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Git wrapper
// ─────────────────────────────────────────────────────────────────────────────

/// Git command runner with the module's safety envelope applied to every
/// invocation.
#[derive(Debug, Clone)]
pub struct Git {
    timeout: Duration,
}

impl Default for Git {
    fn default() -> Self {
        Self::new()
    }
}

impl Git {
    /// Creates a runner with [`DEFAULT_VCS_TIMEOUT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_VCS_TIMEOUT,
        }
    }

    /// Creates a runner with a custom per-call timeout.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Whether `path` is inside a git work tree.
    #[must_use]
    pub fn is_repo(&self, path: &Path) -> bool {
        self.run(path, &["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    /// Initializes a new repository at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn init(&self, path: &Path) -> Result<(), VcsError> {
        self.run(path, &["init", "--initial-branch", "main"])
            .map(|_| ())
    }

    /// Structured status report for `ws`.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn status(&self, ws: &Path) -> Result<RepoStatus, VcsError> {
        let porcelain = self.run(ws, &["status", "--porcelain"])?;
        let mut status = parse_porcelain(&porcelain);
        status.branch = self.current_branch(ws)?;
        Ok(status)
    }

    /// Current branch name (`HEAD` when detached).
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn current_branch(&self, ws: &Path) -> Result<String, VcsError> {
        self.run(ws, &["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|out| out.trim().to_string())
    }

    /// Commit id of `HEAD`.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn head_commit(&self, ws: &Path) -> Result<String, VcsError> {
        self.run(ws, &["rev-parse", "HEAD"])
            .map(|out| out.trim().to_string())
    }

    /// Raw unified diff, truncated at [`MAX_DIFF_BYTES`] with
    /// [`DIFF_TRUNCATION_SENTINEL`].
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn diff(&self, ws: &Path, scope: DiffScope) -> Result<String, VcsError> {
        let args: &[&str] = match scope {
            DiffScope::Unstaged => &["diff"],
            DiffScope::Staged => &["diff", "--cached"],
            DiffScope::Head => &["diff", "HEAD"],
        };
        let captured = self.run_captured(ws, args)?;
        let out = check_success("diff", captured, self.timeout)?;
        Ok(truncate_diff(&out.stdout))
    }

    /// Creates `ws_path` as a new worktree of the repository at `main`.
    ///
    /// With [`WorktreeBranch::Fresh`] a new branch is created off `HEAD`;
    /// with [`WorktreeBranch::Existing`] the named branch is checked out
    /// (forced past the already-checked-out guard, since the primary
    /// worktree is read-only to the core). Fails if `ws_path` exists.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError::WorktreeExists`] when the destination exists,
    /// otherwise [`VcsError`] when git fails.
    pub fn worktree_add(
        &self,
        main: &Path,
        ws_path: &Path,
        branch: &WorktreeBranch,
    ) -> Result<(), VcsError> {
        if ws_path.exists() {
            return Err(VcsError::WorktreeExists {
                path: ws_path.to_path_buf(),
            });
        }
        let ws = ws_path.to_string_lossy().into_owned();
        match branch {
            WorktreeBranch::Fresh(name) => {
                self.run(
                    main,
                    &["worktree", "add", "-b", name.as_str(), ws.as_str(), "HEAD"],
                )?;
            },
            WorktreeBranch::Existing(name) => {
                self.run(
                    main,
                    &["worktree", "add", "--force", ws.as_str(), name.as_str()],
                )?;
            },
        }
        Ok(())
    }

    /// Force-removes the worktree at `ws_path` from the repository at
    /// `main` and prunes its bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn worktree_remove(&self, main: &Path, ws_path: &Path) -> Result<(), VcsError> {
        let ws = ws_path.to_string_lossy().into_owned();
        self.run(main, &["worktree", "remove", "--force", ws.as_str()])?;
        Ok(())
    }

    /// Stages every change in `ws`.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn add_all(&self, ws: &Path) -> Result<(), VcsError> {
        self.run(ws, &["add", "-A"]).map(|_| ())
    }

    /// Commits staged changes in `ws` with a fixed worker identity.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when git fails.
    pub fn commit(&self, ws: &Path, message: &str) -> Result<(), VcsError> {
        let name = format!("user.name={COMMIT_IDENT_NAME}");
        let email = format!("user.email={COMMIT_IDENT_EMAIL}");
        self.run(
            ws,
            &[
                "-c",
                name.as_str(),
                "-c",
                email.as_str(),
                "commit",
                "-m",
                message,
            ],
        )
        .map(|_| ())
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
        let captured = self.run_captured(cwd, args)?;
        let out = check_success(op_name(args), captured, self.timeout)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn run_captured(&self, cwd: &Path, args: &[&str]) -> Result<Captured, VcsError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(cwd)
            .args([
                "-c",
                "core.hooksPath=/dev/null",
                "-c",
                "gc.auto=0",
                "-c",
                "advice.detachedHead=false",
                "-c",
                "color.ui=false",
            ])
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_ADVICE", "0")
            .env("GIT_OPTIONAL_LOCKS", "0");

        process::run_captured(cmd, self.timeout, MAX_DIFF_BYTES).map_err(|e| VcsError::Spawn {
            op: op_name(args).to_string(),
            source: e,
        })
    }
}

/// First positional git argument, skipping `-c key=value` pairs.
fn op_name<'a>(args: &[&'a str]) -> &'a str {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if *arg == "-c" {
            let _ = iter.next();
            continue;
        }
        if !arg.starts_with('-') {
            return arg;
        }
    }
    "git"
}

fn check_success(op: &str, captured: Captured, timeout: Duration) -> Result<Captured, VcsError> {
    if captured.timed_out {
        return Err(VcsError::Timeout {
            op: op.to_string(),
            timeout_secs: timeout.as_secs(),
        });
    }
    if captured.status.is_some_and(|s| s.success()) {
        return Ok(captured);
    }
    let mut reason = String::from_utf8_lossy(&captured.stderr).trim().to_string();
    if reason.is_empty() {
        reason = String::from_utf8_lossy(&captured.stdout).trim().to_string();
    }
    if reason.is_empty() {
        reason = "git command failed with no output".to_string();
    }
    Err(VcsError::CommandFailed {
        op: op.to_string(),
        reason,
    })
}

fn truncate_diff(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_DIFF_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut cut = MAX_DIFF_BYTES;
    // Back off to a char boundary so the lossy conversion stays honest.
    while cut > 0 && bytes[cut] & 0b1100_0000 == 0b1000_0000 {
        cut -= 1;
    }
    let mut out = String::from_utf8_lossy(&bytes[..cut]).into_owned();
    out.push_str(DIFF_TRUNCATION_SENTINEL);
    out
}

fn parse_porcelain(porcelain: &str) -> RepoStatus {
    let mut status = RepoStatus::default();
    for line in porcelain.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, rest) = line.split_at(2);
        let rest = &rest[1..];
        let staged_code = code.as_bytes()[0];
        let unstaged_code = code.as_bytes()[1];

        if code == "??" {
            status.untracked.push(unquote(rest));
            continue;
        }
        if staged_code == b'R' || unstaged_code == b'R' {
            if let Some((from, to)) = rest.split_once(" -> ") {
                status.renamed.push(Rename {
                    from: unquote(from),
                    to: unquote(to),
                });
                continue;
            }
        }
        if staged_code != b' ' {
            status.staged.push(unquote(rest));
        }
        if unstaged_code != b' ' {
            status.unstaged.push(unquote(rest));
        }
    }
    status
}

/// Strips the quoting git applies to paths with special characters.
fn unquote(path: &str) -> String {
    let trimmed = path.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(trimmed)
        .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, Git) {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = Git::new();
        git.init(dir.path()).expect("init");
        std::fs::write(dir.path().join("seed.txt"), b"seed\n").expect("write");
        git.add_all(dir.path()).expect("add");
        git.commit(dir.path(), "seed").expect("commit");
        (dir, git)
    }

    // ── Status parsing ───────────────────────────────────────────────

    #[test]
    fn parse_porcelain_classifies_entries() {
        let out = "M  staged.rs\n M unstaged.rs\n?? new.rs\nR  old.rs -> new_name.rs\n";
        let status = parse_porcelain(out);
        assert_eq!(status.staged, vec!["staged.rs"]);
        assert_eq!(status.unstaged, vec!["unstaged.rs"]);
        assert_eq!(status.untracked, vec!["new.rs"]);
        assert_eq!(
            status.renamed,
            vec![Rename {
                from: "old.rs".to_string(),
                to: "new_name.rs".to_string()
            }]
        );
        assert!(!status.is_clean());

        let files = status.changed_files();
        assert_eq!(
            files,
            vec!["new.rs", "new_name.rs", "old.rs", "staged.rs", "unstaged.rs"]
        );
    }

    #[test]
    fn parse_porcelain_empty_is_clean() {
        assert!(parse_porcelain("").is_clean());
    }

    // ── Live repository ──────────────────────────────────────────────

    #[test]
    fn init_status_commit_cycle() {
        let (dir, git) = repo();
        assert!(git.is_repo(dir.path()));
        assert!(git.status(dir.path()).expect("status").is_clean());

        std::fs::write(dir.path().join("new.txt"), b"x").expect("write");
        let status = git.status(dir.path()).expect("status");
        assert_eq!(status.untracked, vec!["new.txt"]);
        assert_eq!(status.branch, "main");
    }

    #[test]
    fn head_commit_changes_after_commit() {
        let (dir, git) = repo();
        let before = git.head_commit(dir.path()).expect("head");
        std::fs::write(dir.path().join("seed.txt"), b"changed\n").expect("write");
        git.add_all(dir.path()).expect("add");
        git.commit(dir.path(), "update").expect("commit");
        let after = git.head_commit(dir.path()).expect("head");
        assert_ne!(before, after);
    }

    #[test]
    fn diff_head_reports_modification() {
        let (dir, git) = repo();
        std::fs::write(dir.path().join("seed.txt"), b"altered\n").expect("write");
        let diff = git.diff(dir.path(), DiffScope::Head).expect("diff");
        assert!(diff.contains("-seed"));
        assert!(diff.contains("+altered"));
    }

    #[test]
    fn worktree_add_fresh_branch_and_remove() {
        let (dir, git) = repo();
        let ws = dir.path().join("tmp-ws");
        git.worktree_add(
            dir.path(),
            &ws,
            &WorktreeBranch::Fresh("feat/ai/t1".to_string()),
        )
        .expect("worktree add");
        assert!(ws.join("seed.txt").exists());
        assert_eq!(git.current_branch(&ws).expect("branch"), "feat/ai/t1");

        git.worktree_remove(dir.path(), &ws).expect("worktree remove");
        assert!(!ws.exists());
    }

    #[test]
    fn worktree_add_refuses_existing_destination() {
        let (dir, git) = repo();
        let ws = dir.path().join("tmp-ws");
        std::fs::create_dir(&ws).expect("mkdir");
        let result = git.worktree_add(
            dir.path(),
            &ws,
            &WorktreeBranch::Fresh("feat/ai/t2".to_string()),
        );
        assert!(matches!(result, Err(VcsError::WorktreeExists { .. })));
    }

    #[test]
    fn hooks_do_not_execute() {
        let (dir, git) = repo();
        // A pre-commit hook that would poison the workspace if it ran.
        let hooks = dir.path().join(".git/hooks");
        std::fs::create_dir_all(&hooks).expect("mkdir");
        let hook = hooks.join("pre-commit");
        std::fs::write(&hook, "#!/bin/sh\ntouch hook-ran\nexit 1\n").expect("write");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }

        std::fs::write(dir.path().join("f.txt"), b"x").expect("write");
        git.add_all(dir.path()).expect("add");
        git.commit(dir.path(), "no hooks").expect("commit succeeds despite hook");
        assert!(
            !dir.path().join("hook-ran").exists(),
            "hook must never execute"
        );
    }

    // ── Truncation ───────────────────────────────────────────────────

    #[test]
    fn diff_at_cap_is_untouched() {
        let exact = vec![b'a'; MAX_DIFF_BYTES];
        let out = truncate_diff(&exact);
        assert_eq!(out.len(), MAX_DIFF_BYTES);
        assert!(!out.contains("truncated"));
    }

    #[test]
    fn diff_over_cap_gets_sentinel() {
        let over = vec![b'a'; MAX_DIFF_BYTES + 1];
        let out = truncate_diff(&over);
        assert!(out.ends_with(DIFF_TRUNCATION_SENTINEL));
        assert_eq!(out.len(), MAX_DIFF_BYTES + DIFF_TRUNCATION_SENTINEL.len());
    }
}
