//! Root-confined filesystem access with symlink-race defense.
//!
//! Every operation in this module takes a target path and a confinement
//! `root`; the target must resolve inside `root` or the operation fails
//! with [`SafeFsError::PathEscape`]. Reads refuse symlinks at the kernel
//! level (`O_NOFOLLOW`), writes validate the ancestor chain with
//! non-following metadata and land through an atomic rename, and recursive
//! deletion refuses to traverse symlinks or leave the root.
//!
//! # Security Model
//!
//! - **Containment**: target paths are resolved against the canonicalized
//!   root and compared component-wise, never by string prefix, so
//!   `/work/ws` cannot authorize `/work/ws-evil`.
//! - **Symlink refusal**: reads open with `O_NOFOLLOW` so a swap between
//!   the lstat check and the open cannot redirect the read (TOCTOU).
//!   Writes lstat every ancestor below the root before touching the
//!   target.
//! - **Atomicity**: writes go to a sibling temp file named with a
//!   high-entropy nonce and are renamed into place; readers never observe
//!   a partial file. The temp file is removed on any failure.
//! - **Fail-closed**: any ambiguity (unresolvable prefix, `..` escape,
//!   unexpected file type) aborts the operation.
//!
//! # Invariants
//!
//! - [INV-FS-001] No operation ever touches a path outside the resolved
//!   root.
//! - [INV-FS-002] A symlink at the terminal component fails reads with
//!   [`SafeFsError::Symlink`]; the link is never followed.
//! - [INV-FS-003] No ancestor of a write target below the root is a
//!   symlink at write time.
//! - [INV-FS-004] Recursive deletion is depth- and entry-bounded and
//!   refuses symlinks, sockets, FIFOs, and devices.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use rand::RngCore;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum recursion depth for [`rmdir`] (INV-FS-004).
pub const MAX_TRAVERSAL_DEPTH: usize = 128;

/// Maximum entries read from a single directory (INV-FS-004).
pub const MAX_DIR_ENTRIES: usize = 100_000;

/// Mode for files created by [`write_atomic`].
const ATOMIC_WRITE_MODE: u32 = 0o644;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from confined filesystem operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SafeFsError {
    /// The target path resolves outside the confinement root (INV-FS-001).
    #[error("path {} escapes root {}", path.display(), root.display())]
    PathEscape {
        /// The offending target path.
        path: PathBuf,
        /// The confinement root.
        root: PathBuf,
    },

    /// A symlink was found where none is allowed (INV-FS-002, INV-FS-003).
    #[error("symlink at {}", path.display())]
    Symlink {
        /// Path of the symlink.
        path: PathBuf,
    },

    /// An unexpected file type (socket, FIFO, device) was encountered.
    #[error("unexpected file type at {}: {file_type}", path.display())]
    UnexpectedFileType {
        /// Path with the unexpected type.
        path: PathBuf,
        /// Description of the type.
        file_type: String,
    },

    /// Traversal depth exceeded during recursive deletion.
    #[error("traversal depth exceeded maximum of {max} at {}", path.display())]
    DepthExceeded {
        /// Path where the bound was hit.
        path: PathBuf,
        /// Maximum allowed depth.
        max: usize,
    },

    /// Too many entries in a single directory.
    #[error("directory {} has more than {max} entries", path.display())]
    TooManyEntries {
        /// Directory with too many entries.
        path: PathBuf,
        /// Maximum allowed entries.
        max: usize,
    },

    /// An I/O error occurred.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl SafeFsError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Containment
// ─────────────────────────────────────────────────────────────────────────────

/// Returns whether `path` resolves to the root itself or to a descendant
/// of it.
///
/// Both sides are resolved: the root must exist and canonicalize; the
/// target is resolved through its deepest existing ancestor with the
/// remaining components appended lexically (rejecting any `..`). The check
/// is then an exact component-prefix match, so a sibling that merely
/// shares a string prefix with the root does not pass.
#[must_use]
pub fn is_contained(path: &Path, root: &Path) -> bool {
    let Ok(root) = root.canonicalize() else {
        return false;
    };
    let Ok(resolved) = resolve_lexical(path, &root) else {
        return false;
    };
    resolved == root || resolved.starts_with(&root)
}

/// Resolves `path` against `root` and confirms containment.
///
/// Relative paths are joined onto the root. The deepest existing ancestor
/// is canonicalized (following any symlinks *outside* the target chain to
/// their real location so the prefix comparison is honest); non-existing
/// trailing components are appended lexically and must not contain `..`.
///
/// # Errors
///
/// Returns [`SafeFsError::PathEscape`] when the resolved path leaves the
/// root, and [`SafeFsError::Io`] when the root itself cannot be resolved.
pub fn confine(path: &Path, root: &Path) -> Result<PathBuf, SafeFsError> {
    let root = root
        .canonicalize()
        .map_err(|e| SafeFsError::io(format!("resolving root {}", root.display()), e))?;
    let resolved = resolve_lexical(path, &root).map_err(|()| SafeFsError::PathEscape {
        path: path.to_path_buf(),
        root: root.clone(),
    })?;
    if resolved == root || resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(SafeFsError::PathEscape {
            path: path.to_path_buf(),
            root,
        })
    }
}

/// Resolves a path to an absolute form without requiring it to exist.
///
/// The deepest existing prefix is canonicalized; remaining components are
/// appended one by one. `..` in the non-existing suffix is rejected
/// outright (it cannot be resolved against a directory that does not
/// exist yet).
fn resolve_lexical(path: &Path, root: &Path) -> Result<PathBuf, ()> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    // Find the deepest existing ancestor and canonicalize it.
    let mut existing = joined.clone();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                suffix.push(name.to_os_string());
                existing = parent.to_path_buf();
            },
            _ => return Err(()),
        }
    }

    let mut resolved = existing.canonicalize().map_err(|_| ())?;
    for component in suffix.iter().rev() {
        match Path::new(component).components().next() {
            Some(Component::Normal(_)) => resolved.push(component),
            Some(Component::CurDir) => {},
            // `..` through a not-yet-existing directory is unresolvable.
            _ => return Err(()),
        }
    }
    Ok(resolved)
}

/// Validates that no ancestor of `target` strictly below `root` is a
/// symlink, using non-following metadata (INV-FS-003).
fn validate_parent_chain(target: &Path, root: &Path) -> Result<(), SafeFsError> {
    let mut current = root.to_path_buf();
    let Ok(relative) = target.strip_prefix(root) else {
        return Err(SafeFsError::PathEscape {
            path: target.to_path_buf(),
            root: root.to_path_buf(),
        });
    };
    let components: Vec<_> = relative.components().collect();
    // Walk every ancestor below the root, excluding the terminal component.
    for component in components.iter().take(components.len().saturating_sub(1)) {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SafeFsError::Symlink { path: current });
            },
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(SafeFsError::io(
                    format!("validating ancestor {}", current.display()),
                    e,
                ));
            },
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Read
// ─────────────────────────────────────────────────────────────────────────────

/// Reads a regular file confined to `root`.
///
/// The terminal component must not be a symlink: the file is opened with
/// `O_NOFOLLOW` so a link swapped in between the metadata check and the
/// open is refused by the kernel rather than followed (INV-FS-002).
///
/// # Errors
///
/// [`SafeFsError::Symlink`] when the target is a symlink,
/// [`SafeFsError::PathEscape`] when it leaves the root, [`SafeFsError::Io`]
/// otherwise.
pub fn read(path: &Path, root: &Path) -> Result<Vec<u8>, SafeFsError> {
    let target = confine(path, root)?;

    let meta = fs::symlink_metadata(&target)
        .map_err(|e| SafeFsError::io(format!("stat {}", target.display()), e))?;
    if meta.file_type().is_symlink() {
        return Err(SafeFsError::Symlink { path: target });
    }

    let file = open_nofollow(&target).map_err(|e| {
        // ELOOP means the terminal component became a symlink after the
        // lstat above: report it as the symlink violation it is.
        if e.raw_os_error() == Some(libc::ELOOP) {
            SafeFsError::Symlink {
                path: target.clone(),
            }
        } else {
            SafeFsError::io(format!("opening {}", target.display()), e)
        }
    })?;

    let mut reader = io::BufReader::new(file);
    let mut bytes = Vec::new();
    io::Read::read_to_end(&mut reader, &mut bytes)
        .map_err(|e| SafeFsError::io(format!("reading {}", target.display()), e))?;
    Ok(bytes)
}

#[cfg(unix)]
fn open_nofollow(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
        .open(path)
}

#[cfg(not(unix))]
fn open_nofollow(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().read(true).open(path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Write
// ─────────────────────────────────────────────────────────────────────────────

/// Atomically writes `bytes` to a file confined to `root`.
///
/// The ancestor chain below the root is validated with lstat, the payload
/// goes to a sibling temp file named with a 16-hex-digit nonce (mode
/// 0o644), and the temp file is renamed over the target. On any failure
/// the temp file is removed.
///
/// # Errors
///
/// [`SafeFsError::PathEscape`], [`SafeFsError::Symlink`], or
/// [`SafeFsError::Io`].
pub fn write_atomic(path: &Path, bytes: &[u8], root: &Path) -> Result<(), SafeFsError> {
    let target = confine(path, root)?;
    let root = root
        .canonicalize()
        .map_err(|e| SafeFsError::io(format!("resolving root {}", root.display()), e))?;
    validate_parent_chain(&target, &root)?;

    let parent = target.parent().ok_or_else(|| SafeFsError::PathEscape {
        path: target.clone(),
        root: root.clone(),
    })?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SafeFsError::PathEscape {
            path: target.clone(),
            root: root.clone(),
        })?;

    let mut nonce_bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = nonce_bytes
        .iter()
        .fold(String::with_capacity(16), |mut acc, b| {
            use std::fmt::Write as _;
            let _ = write!(acc, "{b:02x}");
            acc
        });
    let tmp_path = parent.join(format!(".{file_name}.{nonce}.tmp"));

    let write_result = write_temp(&tmp_path, bytes);
    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(SafeFsError::io(
            format!("writing temp file {}", tmp_path.display()),
            e,
        ));
    }

    if let Err(e) = fs::rename(&tmp_path, &target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(SafeFsError::io(
            format!("renaming {} into place", tmp_path.display()),
            e,
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn write_temp(tmp_path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(ATOMIC_WRITE_MODE)
        .open(tmp_path)?;
    file.write_all(bytes)?;
    file.flush()
}

#[cfg(not(unix))]
fn write_temp(tmp_path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)?;
    file.write_all(bytes)?;
    file.flush()
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory operations
// ─────────────────────────────────────────────────────────────────────────────

/// Removes a file confined to `root`.
///
/// # Errors
///
/// [`SafeFsError::PathEscape`] or [`SafeFsError::Io`].
pub fn unlink(path: &Path, root: &Path) -> Result<(), SafeFsError> {
    let target = confine(path, root)?;
    let root = root
        .canonicalize()
        .map_err(|e| SafeFsError::io(format!("resolving root {}", root.display()), e))?;
    validate_parent_chain(&target, &root)?;
    fs::remove_file(&target).map_err(|e| SafeFsError::io(format!("removing {}", target.display()), e))
}

/// Creates a directory (and missing ancestors) confined to `root`.
///
/// # Errors
///
/// [`SafeFsError::PathEscape`], [`SafeFsError::Symlink`], or
/// [`SafeFsError::Io`].
pub fn mkdir(path: &Path, root: &Path) -> Result<(), SafeFsError> {
    let target = confine(path, root)?;
    let root = root
        .canonicalize()
        .map_err(|e| SafeFsError::io(format!("resolving root {}", root.display()), e))?;
    validate_parent_chain(&target, &root)?;
    fs::create_dir_all(&target)
        .map_err(|e| SafeFsError::io(format!("creating directory {}", target.display()), e))
}

/// Returns whether a confined path exists. Escaping paths report `false`.
#[must_use]
pub fn exists(path: &Path, root: &Path) -> bool {
    match confine(path, root) {
        Ok(target) => fs::symlink_metadata(target).is_ok(),
        Err(_) => false,
    }
}

/// Lists entry names of a directory confined to `root`, bounded by
/// [`MAX_DIR_ENTRIES`].
///
/// # Errors
///
/// [`SafeFsError::PathEscape`], [`SafeFsError::TooManyEntries`], or
/// [`SafeFsError::Io`].
pub fn read_dir(path: &Path, root: &Path) -> Result<Vec<PathBuf>, SafeFsError> {
    let target = confine(path, root)?;
    let entries = fs::read_dir(&target)
        .map_err(|e| SafeFsError::io(format!("reading directory {}", target.display()), e))?;

    let mut names = Vec::new();
    for entry in entries {
        if names.len() >= MAX_DIR_ENTRIES {
            return Err(SafeFsError::TooManyEntries {
                path: target,
                max: MAX_DIR_ENTRIES,
            });
        }
        let entry = entry
            .map_err(|e| SafeFsError::io(format!("reading entry in {}", target.display()), e))?;
        names.push(entry.path());
    }
    names.sort();
    Ok(names)
}

/// Recursively deletes a directory tree confined to `root`.
///
/// Symlinks at any depth abort the deletion (INV-FS-004); sockets, FIFOs,
/// and devices likewise. Deletion is depth-first bottom-up and bounded by
/// [`MAX_TRAVERSAL_DEPTH`] and [`MAX_DIR_ENTRIES`]. A non-existent target
/// is a no-op.
///
/// # Errors
///
/// [`SafeFsError::PathEscape`], [`SafeFsError::Symlink`],
/// [`SafeFsError::UnexpectedFileType`], [`SafeFsError::DepthExceeded`],
/// [`SafeFsError::TooManyEntries`], or [`SafeFsError::Io`].
pub fn rmdir(path: &Path, root: &Path) -> Result<(), SafeFsError> {
    let target = confine(path, root)?;

    let meta = match fs::symlink_metadata(&target) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SafeFsError::io(format!("stat {}", target.display()), e)),
    };
    if meta.file_type().is_symlink() {
        return Err(SafeFsError::Symlink { path: target });
    }
    if !meta.is_dir() {
        return Err(SafeFsError::UnexpectedFileType {
            path: target,
            file_type: describe_file_type(&meta),
        });
    }
    recursive_delete(&target, 0)
}

fn recursive_delete(dir: &Path, depth: usize) -> Result<(), SafeFsError> {
    if depth >= MAX_TRAVERSAL_DEPTH {
        return Err(SafeFsError::DepthExceeded {
            path: dir.to_path_buf(),
            max: MAX_TRAVERSAL_DEPTH,
        });
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| SafeFsError::io(format!("reading directory {}", dir.display()), e))?;
    let mut paths = Vec::new();
    for entry in entries {
        if paths.len() >= MAX_DIR_ENTRIES {
            return Err(SafeFsError::TooManyEntries {
                path: dir.to_path_buf(),
                max: MAX_DIR_ENTRIES,
            });
        }
        let entry =
            entry.map_err(|e| SafeFsError::io(format!("reading entry in {}", dir.display()), e))?;
        paths.push(entry.path());
    }

    for entry_path in &paths {
        let meta = fs::symlink_metadata(entry_path)
            .map_err(|e| SafeFsError::io(format!("stat {}", entry_path.display()), e))?;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            return Err(SafeFsError::Symlink {
                path: entry_path.clone(),
            });
        }
        if file_type.is_dir() {
            recursive_delete(entry_path, depth + 1)?;
        } else if file_type.is_file() {
            fs::remove_file(entry_path)
                .map_err(|e| SafeFsError::io(format!("removing {}", entry_path.display()), e))?;
        } else {
            return Err(SafeFsError::UnexpectedFileType {
                path: entry_path.clone(),
                file_type: describe_file_type(&meta),
            });
        }
    }

    fs::remove_dir(dir)
        .map_err(|e| SafeFsError::io(format!("removing directory {}", dir.display()), e))
}

fn describe_file_type(meta: &fs::Metadata) -> String {
    let ft = meta.file_type();
    if ft.is_dir() {
        "directory".to_string()
    } else if ft.is_file() {
        "regular file".to_string()
    } else if ft.is_symlink() {
        "symlink".to_string()
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_fifo() {
                return "FIFO/named pipe".to_string();
            }
            if ft.is_socket() {
                return "Unix socket".to_string();
            }
            if ft.is_block_device() {
                return "block device".to_string();
            }
            if ft.is_char_device() {
                return "character device".to_string();
            }
        }
        "unknown".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
