//! Stable exit codes for the `warden` binary.

/// Command succeeded (including a clean queue pass with failing tasks —
/// task outcomes live in result records, not the process exit code).
pub const OK: u8 = 0;
/// Invalid input, unreadable state, or other generic failure.
pub const GENERIC_ERROR: u8 = 1;
/// Another live worker holds the worker lock for this handoff root.
pub const WORKER_LOCKED: u8 = 2;
/// Sandbox pre-flight failed: engine or image unavailable.
pub const PREFLIGHT_FAILED: u8 = 3;
