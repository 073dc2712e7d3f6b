//! Queue helper subcommands: init, submit, list, show result.

use std::path::Path;

use anyhow::{Context, Result, bail};
use warden_core::config::WorkerConfig;
use warden_core::queue::HandoffRoot;
use warden_core::safefs;
use warden_core::task::{MAX_TASK_FILE_SIZE, deserialize_task};

/// Creates the handoff directory skeleton.
///
/// # Errors
///
/// Returns an error when the layout cannot be created.
pub fn run_init(config: &WorkerConfig) -> Result<()> {
    let handoff = HandoffRoot::new(&config.handoff_root);
    handoff.ensure_layout().context("creating handoff layout")?;
    println!("initialized handoff root at {}", handoff.root().display());
    Ok(())
}

/// Validates a task file and enqueues it atomically.
///
/// # Errors
///
/// Returns an error when the file is unreadable, oversize, schema
/// invalid, or already queued/completed.
pub fn run_submit(config: &WorkerConfig, file: &Path) -> Result<()> {
    let handoff = HandoffRoot::new(&config.handoff_root);
    handoff.ensure_layout().context("creating handoff layout")?;

    let meta = std::fs::metadata(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    if meta.len() > MAX_TASK_FILE_SIZE as u64 {
        bail!(
            "{} exceeds the {MAX_TASK_FILE_SIZE}-byte task size limit",
            file.display()
        );
    }
    let bytes =
        std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    let task = deserialize_task(&bytes).context("task failed validation")?;

    if handoff.has_result(&task.id) {
        bail!("task {} already has a result", task.id);
    }
    if handoff.task_file(&task.id).exists() || handoff.running_file(&task.id).exists() {
        bail!("task {} is already queued", task.id);
    }

    let dest = handoff.enqueue(&task).context("enqueueing task")?;
    println!("queued {} at {}", task.id, dest.display());
    Ok(())
}

/// Lists pending, running, and completed tasks.
///
/// # Errors
///
/// Returns an error when the handoff root cannot be read.
pub fn run_queue(config: &WorkerConfig) -> Result<()> {
    let handoff = HandoffRoot::new(&config.handoff_root);

    let scan = handoff.scan_tasks().context("scanning inbox")?;
    println!("pending ({}):", scan.valid.len());
    for candidate in &scan.valid {
        let task = &candidate.task;
        println!(
            "  {}  priority={}  created={}",
            task.id,
            task.priority.unwrap_or(0),
            task.created_at.to_rfc3339()
        );
    }
    for invalid in &scan.invalid {
        println!("  {}  INVALID: {}", invalid.file_id, invalid.reason);
    }

    println!("running ({}):", count_json(&handoff.running_dir(), &handoff));
    for id in list_ids(&handoff.running_dir(), &handoff) {
        println!("  {id}");
    }

    let result_ids = list_ids(&handoff.results_dir(), &handoff);
    println!("results ({}):", result_ids.len());
    for id in result_ids {
        match handoff.read_result(&id) {
            Ok(result) => println!(
                "  {id}  {}  {}ms",
                serde_json::to_string(&result.exit_path)
                    .unwrap_or_else(|_| "?".to_string())
                    .trim_matches('"'),
                result.duration_ms
            ),
            Err(e) => println!("  {id}  unreadable: {e}"),
        }
    }
    Ok(())
}

/// Prints one result record as pretty JSON.
///
/// # Errors
///
/// Returns an error when no result exists for `id` or it cannot be read.
pub fn run_result(config: &WorkerConfig, id: &str) -> Result<()> {
    let handoff = HandoffRoot::new(&config.handoff_root);
    let result = handoff
        .read_result(id)
        .with_context(|| format!("no readable result for task {id}"))?;
    let json = serde_json::to_string_pretty(&result).context("serializing result")?;
    println!("{json}");
    Ok(())
}

fn list_ids(dir: &Path, handoff: &HandoffRoot) -> Vec<String> {
    let Ok(entries) = safefs::read_dir(dir, handoff.root()) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
        .collect()
}

fn count_json(dir: &Path, handoff: &HandoffRoot) -> usize {
    list_ids(dir, handoff).len()
}
