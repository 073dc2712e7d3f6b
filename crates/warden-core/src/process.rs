//! Bounded subprocess execution.
//!
//! Runs a child process with piped output, a wall-clock deadline, and a
//! hard byte cap per stream. Both pipes are drained on dedicated reader
//! threads so a child that fills one pipe cannot deadlock the other, and
//! the calling thread keeps exclusive kill authority: on deadline expiry
//! the child is killed (`SIGKILL` semantics of [`std::process::Child::kill`]),
//! reaped with a bounded wait, and whatever output accumulated is still
//! returned.
//!
//! The drain pattern (reader thread + `Take` bound + timeout poll + bounded
//! reap) is deliberately free of any lock shared with the child handle, so
//! a stuck pipe can never block the kill path.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Poll interval while waiting for child exit or reader completion.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Bounded wait for reaping a killed child.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for reader threads to observe pipe EOF after a kill.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Output of a bounded subprocess run.
#[derive(Debug)]
pub struct Captured {
    /// Exit status, `None` if the child could not be reaped after a kill.
    pub status: Option<ExitStatus>,
    /// Captured stdout, truncated at the configured cap.
    pub stdout: Vec<u8>,
    /// Captured stderr, truncated at the configured cap.
    pub stderr: Vec<u8>,
    /// Whether the deadline expired and the child was killed.
    pub timed_out: bool,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl Captured {
    /// Exit code, with killed/unreaped children reported as `-1`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.status.and_then(|s| s.code()).unwrap_or(-1)
    }

    /// Whether the child exited successfully within the deadline.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns `command` and drains both output streams concurrently, killing
/// the child when `timeout` expires.
///
/// Each stream is read through a `Take` bound of `stream_cap` bytes plus
/// one sentinel byte, so truncation is detectable by the caller comparing
/// lengths against the cap. Stdin is closed.
///
/// # Errors
///
/// Returns the spawn error; everything after a successful spawn is
/// reported through [`Captured`].
pub fn run_captured(
    mut command: Command,
    timeout: Duration,
    stream_cap: usize,
) -> std::io::Result<Captured> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = command.spawn()?;

    let stdout_capture = child.stdout.take().map(|pipe| spawn_reader(pipe, stream_cap));
    let stderr_capture = child.stderr.take().map(|pipe| spawn_reader(pipe, stream_cap));

    let deadline = started + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {},
            Err(_) => break None,
        }
        if Instant::now() >= deadline {
            timed_out = true;
            let _ = child.kill();
            break bounded_reap(&mut child);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    // Dropping the handle closes our copies of the pipe write ends, which
    // unblocks the readers when no descendant still holds them open.
    drop(child);

    let stdout = collect_capture(stdout_capture);
    let stderr = collect_capture(stderr_capture);

    Ok(Captured {
        status,
        stdout,
        stderr,
        timed_out,
        duration: started.elapsed(),
    })
}

/// One stream being drained on its own thread.
///
/// The buffer is shared so accumulated bytes stay retrievable even when a
/// grandchild keeps the pipe open past the kill and the reader never sees
/// EOF.
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: std::thread::JoinHandle<()>,
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, cap: usize) -> StreamCapture {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&buf);
    let handle = std::thread::spawn(move || {
        // One extra byte so callers can distinguish "exactly at the cap"
        // from "truncated".
        let limit = cap.saturating_add(1) as u64;
        let mut bounded = pipe.take(limit);
        let mut chunk = [0u8; 8192];
        loop {
            match bounded.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Ok(mut guard) = writer.lock() else { break };
                    guard.extend_from_slice(&chunk[..n]);
                },
            }
        }
    });
    StreamCapture { buf, handle }
}

fn collect_capture(capture: Option<StreamCapture>) -> Vec<u8> {
    let Some(capture) = capture else {
        return Vec::new();
    };
    let join_deadline = Instant::now() + READER_JOIN_TIMEOUT;
    while !capture.handle.is_finished() {
        if Instant::now() >= join_deadline {
            // Reader stuck on a pipe a grandchild kept open; take what
            // accumulated and abandon the thread.
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if capture.handle.is_finished() {
        let _ = capture.handle.join();
    }
    capture
        .buf
        .lock()
        .map(|mut guard| std::mem::take(&mut *guard))
        .unwrap_or_default()
}

fn bounded_reap(child: &mut Child) -> Option<ExitStatus> {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {},
            Err(_) => return None,
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
