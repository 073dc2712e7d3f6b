//! Worker configuration.
//!
//! Loaded from an optional TOML file (`warden.toml` by convention) with
//! serde defaults for every field, so an empty file — or none at all —
//! yields a fully working production configuration. Durations accept
//! humantime strings (`"2s"`, `"5m"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::{ContainerRunner, LocalRunner, Runner, SandboxLimits};

/// Maximum config file size.
const MAX_CONFIG_SIZE: u64 = 65_536;

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid config {}: {detail}", path.display())]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// Parser detail.
        detail: String,
    },
}

/// Full worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Handoff root directory (`tasks/`, `results/`, ...).
    #[serde(default = "default_handoff_root")]
    pub handoff_root: PathBuf,

    /// Target repository the worker operates on.
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,

    /// Container engine binary.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Sandbox image tag.
    #[serde(default = "default_image")]
    pub image: String,

    /// AI executor command, run inside the sandbox.
    #[serde(default = "default_executor_cmd")]
    pub executor_cmd: String,

    /// Extra arguments for the executor (the prompt is appended last).
    #[serde(default)]
    pub executor_args: Vec<String>,

    /// Wall-clock timeout for the executor.
    #[serde(default = "default_executor_timeout", with = "humantime_serde")]
    pub executor_timeout: Duration,

    /// Sleep between queue passes in continuous mode.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Per-call timeout for git operations.
    #[serde(default = "default_vcs_timeout", with = "humantime_serde")]
    pub vcs_timeout: Duration,

    /// Opt-in to the insecure local runner (no container isolation).
    /// Every result produced with it carries `insecure_runner_used`.
    #[serde(default)]
    pub allow_insecure_runner: bool,

    /// Container resource limits.
    #[serde(default)]
    pub limits: SandboxLimits,
}

fn default_handoff_root() -> PathBuf {
    PathBuf::from("handoff")
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "warden-sandbox:latest".to_string()
}

fn default_executor_cmd() -> String {
    "opencode".to_string()
}

const fn default_executor_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_vcs_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            handoff_root: default_handoff_root(),
            repo_root: default_repo_root(),
            engine: default_engine(),
            image: default_image(),
            executor_cmd: default_executor_cmd(),
            executor_args: Vec::new(),
            executor_timeout: default_executor_timeout(),
            poll_interval: default_poll_interval(),
            vcs_timeout: default_vcs_timeout(),
            allow_insecure_runner: false,
            limits: SandboxLimits::default(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from a TOML file, bounded at 64 KiB.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read or parse failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if meta.len() > MAX_CONFIG_SIZE {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                detail: format!("config exceeds {MAX_CONFIG_SIZE} bytes"),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Builds the execution backend this configuration selects.
    ///
    /// The insecure local runner is only ever chosen through the explicit
    /// `allow_insecure_runner` opt-in.
    #[must_use]
    pub fn runner(&self) -> Runner {
        if self.allow_insecure_runner {
            Runner::InsecureLocal(LocalRunner)
        } else {
            Runner::Container(ContainerRunner::new(
                self.engine.clone(),
                self.image.clone(),
                self.limits.clone(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "").expect("write");

        let config = WorkerConfig::load(&path).expect("load");
        assert_eq!(config.engine, "docker");
        assert_eq!(config.executor_cmd, "opencode");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.executor_timeout, Duration::from_secs(300));
        assert!(!config.allow_insecure_runner);
        assert!(!config.runner().is_insecure());
    }

    #[test]
    fn fields_and_humantime_durations_parse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.toml");
        std::fs::write(
            &path,
            r#"
                handoff_root = "/srv/warden/handoff"
                engine = "podman"
                poll_interval = "500ms"
                executor_timeout = "10m"
                allow_insecure_runner = true

                [limits]
                memory = "4g"
            "#,
        )
        .expect("write");

        let config = WorkerConfig::load(&path).expect("load");
        assert_eq!(config.handoff_root, PathBuf::from("/srv/warden/handoff"));
        assert_eq!(config.engine, "podman");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.executor_timeout, Duration::from_secs(600));
        assert_eq!(config.limits.memory, "4g");
        assert_eq!(config.limits.cpus, "2");
        assert!(config.runner().is_insecure());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "no_such_knob = true\n").expect("write");
        assert!(matches!(
            WorkerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            WorkerConfig::load(Path::new("/nonexistent/warden.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
