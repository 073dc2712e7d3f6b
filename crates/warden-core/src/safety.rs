//! Per-task safety gates: scope enforcement, filename policy, branch
//! naming.
//!
//! These are pure predicates over data the loop already has; every gate
//! failure maps to a terminal exit path rather than an error, so the
//! worker keeps draining its queue.

use crate::vcs::WorktreeBranch;

// ─────────────────────────────────────────────────────────────────────────────
// Scope enforcement
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `file` is covered by a single scope entry.
///
/// Matching rules, in order:
/// 1. exact path match,
/// 2. `file` lies under `entry` as a directory (`entry + "/"` prefix),
/// 3. `entry` ends in `/*`: `file` starts with the preceding directory.
#[must_use]
pub fn scope_entry_matches(entry: &str, file: &str) -> bool {
    if file == entry {
        return true;
    }
    if let Some(prefix) = entry.strip_suffix("/*") {
        let mut dir = prefix.to_string();
        dir.push('/');
        return file.starts_with(&dir);
    }
    let mut dir = entry.to_string();
    dir.push('/');
    file.starts_with(&dir)
}

/// Whether any scope entry covers `file`.
#[must_use]
pub fn scope_allows(scope: &[String], file: &str) -> bool {
    scope.iter().any(|entry| scope_entry_matches(entry, file))
}

/// Changed files not covered by the scope, sorted.
#[must_use]
pub fn scope_violations(scope: &[String], changed_files: &[String]) -> Vec<String> {
    let mut violations: Vec<String> = changed_files
        .iter()
        .filter(|file| !scope_allows(scope, file))
        .cloned()
        .collect();
    violations.sort();
    violations
}

// ─────────────────────────────────────────────────────────────────────────────
// Secretless filename policy
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a created file's name is banned by the secretless policy.
///
/// Banned: `.env`, `.env.*`, `*.pem`, `*.key`.
/// Allowed exceptions: `.env.example`, `.env.template`.
#[must_use]
pub fn filename_is_banned(path: &str) -> bool {
    let base = path.rsplit('/').next().unwrap_or(path);
    if base == ".env.example" || base == ".env.template" {
        return false;
    }
    base == ".env"
        || base.starts_with(".env.")
        || base.ends_with(".pem")
        || base.ends_with(".key")
}

/// Created files that violate the secretless filename policy, sorted.
#[must_use]
pub fn filename_policy_violations(created_files: &[String]) -> Vec<String> {
    let mut violations: Vec<String> = created_files
        .iter()
        .filter(|file| filename_is_banned(file))
        .cloned()
        .collect();
    violations.sort();
    violations
}

// ─────────────────────────────────────────────────────────────────────────────
// Branch naming
// ─────────────────────────────────────────────────────────────────────────────

/// Branch disposition for a task's worktree.
///
/// On `main` or `master` a fresh `feat/ai/<id>` branch is created inside
/// the worktree; any other current branch is kept.
#[must_use]
pub fn auto_branch(current_branch: &str, task_id: &str) -> WorktreeBranch {
    if current_branch == "main" || current_branch == "master" {
        WorktreeBranch::Fresh(format!("feat/ai/{task_id}"))
    } else {
        WorktreeBranch::Existing(current_branch.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| (*s).to_string()).collect()
    }

    // ── Scope matching ───────────────────────────────────────────────

    #[test]
    fn exact_match() {
        assert!(scope_entry_matches("src/a.txt", "src/a.txt"));
        assert!(!scope_entry_matches("src/a.txt", "src/a.txt.bak"));
        assert!(!scope_entry_matches("src/a.txt", "src/b.txt"));
    }

    #[test]
    fn directory_prefix_match() {
        assert!(scope_entry_matches("src", "src/a.txt"));
        assert!(scope_entry_matches("src", "src/sub/deep.txt"));
        assert!(!scope_entry_matches("src", "srcfoo/a.txt"));
        assert!(!scope_entry_matches("src", "other/src/a.txt"));
    }

    #[test]
    fn star_suffix_matches_whole_subtree() {
        assert!(scope_entry_matches("src/*", "src/a.txt"));
        assert!(scope_entry_matches("src/*", "src/sub/b.txt"));
        assert!(!scope_entry_matches("src/*", "src"));
        assert!(!scope_entry_matches("src/*", "srcx/a.txt"));
    }

    #[test]
    fn violations_are_the_uncovered_files() {
        let scope = scope(&["src/a.txt", "docs/*"]);
        let changed = vec![
            "src/a.txt".to_string(),
            "docs/guide.md".to_string(),
            "README.md".to_string(),
            "src/b.txt".to_string(),
        ];
        assert_eq!(
            scope_violations(&scope, &changed),
            vec!["README.md", "src/b.txt"]
        );
    }

    #[test]
    fn subset_passes() {
        let scope = scope(&["src/*"]);
        let changed = vec!["src/a.txt".to_string(), "src/deep/b.txt".to_string()];
        assert!(scope_violations(&scope, &changed).is_empty());
    }

    // ── Filename policy ──────────────────────────────────────────────

    #[test]
    fn banned_filenames() {
        for path in [
            ".env",
            "config/.env",
            ".env.production",
            "certs/server.pem",
            "keys/id_rsa.key",
        ] {
            assert!(filename_is_banned(path), "{path} should be banned");
        }
    }

    #[test]
    fn allowed_filenames() {
        for path in [
            ".env.example",
            "config/.env.template",
            "environment.md",
            "src/keygen.rs",
            "monkey.rs",
        ] {
            assert!(!filename_is_banned(path), "{path} should be allowed");
        }
    }

    #[test]
    fn policy_violations_sorted() {
        let created = vec![
            "src/ok.rs".to_string(),
            "b.key".to_string(),
            ".env".to_string(),
        ];
        assert_eq!(filename_policy_violations(&created), vec![".env", "b.key"]);
    }

    // ── Branch naming ────────────────────────────────────────────────

    #[test]
    fn main_and_master_get_task_branch() {
        assert_eq!(
            auto_branch("main", "t1"),
            WorktreeBranch::Fresh("feat/ai/t1".to_string())
        );
        assert_eq!(
            auto_branch("master", "t1"),
            WorktreeBranch::Fresh("feat/ai/t1".to_string())
        );
    }

    #[test]
    fn other_branches_are_kept() {
        assert_eq!(
            auto_branch("feature/login", "t1"),
            WorktreeBranch::Existing("feature/login".to_string())
        );
    }
}
