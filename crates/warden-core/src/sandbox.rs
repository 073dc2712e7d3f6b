//! Sandboxed command execution.
//!
//! All untrusted commands — the AI executor and every verification
//! command — are dispatched through a [`Runner`]. The production backend
//! launches an external container engine (docker or podman CLI) with a
//! hardened flag set; the insecure local backend executes directly on the
//! host and exists for development and tests only, behind an explicit
//! opt-in that is surfaced in every result it touches.
//!
//! # Container contract
//!
//! The launched container has no network, a read-only root filesystem
//! with the per-task worktree as its only writable bind mount (at
//! `/workspace`), all capabilities dropped, `no-new-privileges`, pid /
//! memory / cpu limits, the invoking user's uid:gid, and a `noexec`
//! tmpfs at `/tmp`. Host environment variables pass through only from a
//! fixed allow-list. Argument construction is deterministic for the same
//! inputs.
//!
//! The wall-clock timeout is enforced host-side: on expiry the engine
//! client is killed (`SIGKILL`) and whatever output accumulated is still
//! returned with `timed_out = true`.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::process;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Host environment variables forwarded into the sandbox.
pub const ENV_ALLOWLIST: &[&str] = &[
    "CI", "NODE_ENV", "HOME", "PATH", "TERM", "LANG", "LC_ALL", "TZ",
];

/// Default wall-clock timeout for a sandboxed command.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-stream capture bound. Streams beyond this are truncated; the
/// in-record cap (10 KiB) is applied later by the loop.
pub const MAX_CAPTURED_STREAM: usize = 8 * 1024 * 1024;

/// Timeout for availability probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Container-internal mount point of the task worktree.
const WORKSPACE_MOUNT: &str = "/workspace";

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from sandbox execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The container engine binary is missing or not responding.
    #[error("container engine `{engine}` is unavailable")]
    EngineUnavailable {
        /// Engine binary name.
        engine: String,
    },

    /// The sandbox image is not present.
    #[error("sandbox image `{image}` is unavailable")]
    ImageUnavailable {
        /// Image tag.
        image: String,
    },

    /// The command could not be spawned.
    #[error("failed to spawn sandboxed command: {source}")]
    Spawn {
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one sandboxed command.
#[derive(Debug)]
pub struct RunResult {
    /// Exit code (`-1` when killed or unreaped).
    pub exit_code: i32,
    /// Captured stdout, bounded by [`MAX_CAPTURED_STREAM`].
    pub stdout: Vec<u8>,
    /// Captured stderr, bounded by [`MAX_CAPTURED_STREAM`].
    pub stderr: Vec<u8>,
    /// Whether the wall-clock timeout expired.
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Resource limits for the container sandbox.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SandboxLimits {
    /// Memory ceiling, engine syntax (default `2g`).
    #[serde(default = "default_memory")]
    pub memory: String,
    /// CPU ceiling (default `2`).
    #[serde(default = "default_cpus")]
    pub cpus: String,
    /// Pid ceiling (default 256).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// `/tmp` tmpfs size, engine syntax (default `512m`).
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

const fn default_pids_limit() -> u32 {
    256
}

fn default_tmpfs_size() -> String {
    "512m".to_string()
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            tmpfs_size: default_tmpfs_size(),
        }
    }
}

/// Container-backed sandbox runner.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    engine: String,
    image: String,
    limits: SandboxLimits,
}

/// Direct host execution. Development and tests only.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

/// The execution backend for untrusted commands.
#[derive(Debug, Clone)]
pub enum Runner {
    /// Hardened container sandbox (production).
    Container(ContainerRunner),
    /// Direct host execution (insecure; explicit opt-in only).
    InsecureLocal(LocalRunner),
}

impl Runner {
    /// Whether this backend executes on the host without isolation.
    #[must_use]
    pub const fn is_insecure(&self) -> bool {
        matches!(self, Self::InsecureLocal(_))
    }

    /// Fails fast when the backend cannot execute anything.
    ///
    /// # Errors
    ///
    /// [`SandboxError::EngineUnavailable`] or
    /// [`SandboxError::ImageUnavailable`] for the container backend; the
    /// local backend has no preconditions.
    pub fn preflight(&self) -> Result<(), SandboxError> {
        match self {
            Self::Container(runner) => runner.preflight(),
            Self::InsecureLocal(_) => Ok(()),
        }
    }

    /// Runs one command with `worktree` as its writable working
    /// directory.
    ///
    /// # Errors
    ///
    /// [`SandboxError::Spawn`] when the child cannot be started.
    pub fn run(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        match self {
            Self::Container(runner) => runner.run(worktree, cmd, args, timeout),
            Self::InsecureLocal(runner) => runner.run(worktree, cmd, args, timeout),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Container backend
// ─────────────────────────────────────────────────────────────────────────────

impl ContainerRunner {
    /// Creates a runner for `engine` (e.g. `docker`, `podman`) and
    /// `image`.
    #[must_use]
    pub fn new(engine: impl Into<String>, image: impl Into<String>, limits: SandboxLimits) -> Self {
        Self {
            engine: engine.into(),
            image: image.into(),
            limits,
        }
    }

    /// Whether the engine responds to `version`.
    #[must_use]
    pub fn is_engine_available(&self) -> bool {
        let mut cmd = Command::new(&self.engine);
        cmd.arg("version");
        process::run_captured(cmd, PROBE_TIMEOUT, 4096)
            .map(|c| c.success())
            .unwrap_or(false)
    }

    /// Whether `image` is present in the local image store.
    #[must_use]
    pub fn is_image_available(&self) -> bool {
        let mut cmd = Command::new(&self.engine);
        cmd.args(["image", "inspect", &self.image]);
        process::run_captured(cmd, PROBE_TIMEOUT, 64 * 1024)
            .map(|c| c.success())
            .unwrap_or(false)
    }

    fn preflight(&self) -> Result<(), SandboxError> {
        if !self.is_engine_available() {
            return Err(SandboxError::EngineUnavailable {
                engine: self.engine.clone(),
            });
        }
        if !self.is_image_available() {
            return Err(SandboxError::ImageUnavailable {
                image: self.image.clone(),
            });
        }
        Ok(())
    }

    /// Assembles the full engine argument vector for one command.
    ///
    /// Construction is deterministic: fixed hardening flags, then
    /// allow-listed environment variables in catalog order, then the
    /// image tag, then the command and its arguments.
    #[must_use]
    pub fn build_args(&self, worktree: &Path, cmd: &str, args: &[String]) -> Vec<String> {
        let uid = nix::unistd::Uid::current().as_raw();
        let gid = nix::unistd::Gid::current().as_raw();

        let mut argv: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--pids-limit".into(),
            self.limits.pids_limit.to_string(),
            "--memory".into(),
            self.limits.memory.clone(),
            "--cpus".into(),
            self.limits.cpus.clone(),
            "--user".into(),
            format!("{uid}:{gid}"),
            "--volume".into(),
            format!("{}:{WORKSPACE_MOUNT}:rw", worktree.display()),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,nodev,size={}", self.limits.tmpfs_size),
            "--workdir".into(),
            WORKSPACE_MOUNT.into(),
        ];

        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                argv.push("--env".into());
                argv.push(format!("{key}={value}"));
            }
        }

        argv.push(self.image.clone());
        argv.push(cmd.to_string());
        argv.extend(args.iter().cloned());
        argv
    }

    fn run(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        let argv = self.build_args(worktree, cmd, args);
        debug!(engine = %self.engine, command = cmd, "launching sandboxed command");
        let mut engine_cmd = Command::new(&self.engine);
        engine_cmd.args(&argv);
        let captured = process::run_captured(engine_cmd, timeout, MAX_CAPTURED_STREAM)
            .map_err(|e| SandboxError::Spawn { source: e })?;
        Ok(into_run_result(captured))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Insecure local backend
// ─────────────────────────────────────────────────────────────────────────────

impl LocalRunner {
    fn run(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        debug!(command = cmd, "running command with insecure local runner");
        let mut command = Command::new(cmd);
        command.args(args).current_dir(worktree).env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        let captured = process::run_captured(command, timeout, MAX_CAPTURED_STREAM)
            .map_err(|e| SandboxError::Spawn { source: e })?;
        Ok(into_run_result(captured))
    }
}

fn into_run_result(captured: process::Captured) -> RunResult {
    RunResult {
        exit_code: captured.exit_code(),
        stdout: clamp(captured.stdout),
        stderr: clamp(captured.stderr),
        timed_out: captured.timed_out,
        duration_ms: captured.duration.as_millis().min(u128::from(u64::MAX)) as u64,
    }
}

/// Drops the sentinel byte the capture layer reads past the cap.
fn clamp(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes.truncate(MAX_CAPTURED_STREAM);
    bytes
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ContainerRunner {
        ContainerRunner::new("docker", "warden-sandbox:latest", SandboxLimits::default())
    }

    // ── Argument assembly ────────────────────────────────────────────

    #[test]
    fn build_args_carries_every_hardening_flag() {
        let argv = runner().build_args(
            Path::new("/handoff/tmp/ws-t1"),
            "npm",
            &["test".to_string()],
        );
        let joined = argv.join(" ");

        for required in [
            "run",
            "--rm",
            "--network none",
            "--read-only",
            "--cap-drop ALL",
            "--security-opt no-new-privileges",
            "--pids-limit 256",
            "--memory 2g",
            "--cpus 2",
            "--volume /handoff/tmp/ws-t1:/workspace:rw",
            "--tmpfs /tmp:rw,noexec,nosuid,nodev,size=512m",
            "--workdir /workspace",
        ] {
            assert!(joined.contains(required), "missing `{required}` in {joined}");
        }
    }

    #[test]
    fn build_args_ends_with_image_then_command() {
        let argv = runner().build_args(
            Path::new("/ws"),
            "pytest",
            &["-q".to_string(), "tests/".to_string()],
        );
        let tail = &argv[argv.len() - 4..];
        assert_eq!(
            tail,
            &["warden-sandbox:latest", "pytest", "-q", "tests/"]
        );
    }

    #[test]
    fn build_args_maps_invoking_user() {
        let argv = runner().build_args(Path::new("/ws"), "true", &[]);
        let uid = nix::unistd::Uid::current().as_raw();
        let gid = nix::unistd::Gid::current().as_raw();
        let pos = argv
            .iter()
            .position(|a| a == "--user")
            .expect("--user flag present");
        assert_eq!(argv[pos + 1], format!("{uid}:{gid}"));
    }

    #[test]
    fn env_passthrough_is_allowlist_only() {
        // PATH is effectively always present in test environments.
        let argv = runner().build_args(Path::new("/ws"), "true", &[]);
        let envs: Vec<&String> = argv
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && argv[*i - 1] == "--env")
            .map(|(_, a)| a)
            .collect();
        for env in &envs {
            let key = env.split('=').next().expect("key");
            assert!(
                ENV_ALLOWLIST.contains(&key),
                "non-allowlisted env {key} passed through"
            );
        }
        assert!(
            envs.iter().any(|e| e.starts_with("PATH=")),
            "PATH should pass through"
        );
    }

    #[test]
    fn build_args_is_deterministic() {
        let a = runner().build_args(Path::new("/ws"), "true", &[]);
        let b = runner().build_args(Path::new("/ws"), "true", &[]);
        assert_eq!(a, b);
    }

    // ── Probes ───────────────────────────────────────────────────────

    #[test]
    fn missing_engine_is_unavailable() {
        let runner = ContainerRunner::new(
            "definitely-not-an-engine-4159",
            "img:latest",
            SandboxLimits::default(),
        );
        assert!(!runner.is_engine_available());
        assert!(matches!(
            Runner::Container(runner).preflight(),
            Err(SandboxError::EngineUnavailable { .. })
        ));
    }

    // ── Local runner ─────────────────────────────────────────────────

    #[test]
    fn local_runner_executes_in_worktree() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("probe.txt"), b"present").expect("write");

        let runner = Runner::InsecureLocal(LocalRunner);
        assert!(runner.is_insecure());
        runner.preflight().expect("no preconditions");

        let result = runner
            .run(
                dir.path(),
                "cat",
                &["probe.txt".to_string()],
                Duration::from_secs(10),
            )
            .expect("run");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"present");
        assert!(!result.timed_out);
    }

    #[test]
    fn local_runner_enforces_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Runner::InsecureLocal(LocalRunner);
        let result = runner
            .run(
                dir.path(),
                "sleep",
                &["30".to_string()],
                Duration::from_millis(200),
            )
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[test]
    fn local_runner_strips_environment() {
        std::env::set_var("WARDEN_TEST_LEAK_CHECK", "leaky");
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Runner::InsecureLocal(LocalRunner);
        let result = runner
            .run(
                dir.path(),
                "sh",
                &["-c".to_string(), "echo ${WARDEN_TEST_LEAK_CHECK:-clean}".to_string()],
                Duration::from_secs(10),
            )
            .expect("run");
        std::env::remove_var("WARDEN_TEST_LEAK_CHECK");
        assert_eq!(result.stdout, b"clean\n");
    }
}
