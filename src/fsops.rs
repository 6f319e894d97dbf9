//! Filesystem primitives with lock tolerance.
//!
//! Destructive operations go through the [`FileSystem`] trait so that the
//! engine can be driven against a filesystem that refuses to touch files
//! the host holds open. [`OsFileSystem`] is the real thing.

use crate::error::{Result, StowageError};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Mutating filesystem calls the engine makes on live package content.
pub trait FileSystem: Send + Sync {
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {}

/// Remove everything under `dir` except the paths in `keep`.
///
/// Files that cannot be removed are renamed into `trash_dir`. Directories
/// still holding kept entries are left in place. Returns `false` if anything
/// could be neither removed nor moved aside.
pub fn clear_directory(
    fs_ops: &dyn FileSystem,
    dir: &Path,
    keep: &HashSet<PathBuf>,
    trash_dir: &Path,
) -> bool {
    if !dir.is_dir() {
        return true;
    }

    let session = chrono::Local::now().to_rfc3339();
    let mut complete = true;

    for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "unable to walk directory");
                complete = false;
                continue;
            }
        };
        let path = entry.path();
        if keep.contains(path) {
            continue;
        }

        if entry.file_type().is_dir() {
            if fs_ops.remove_dir(path).is_err() && !has_entries(path) {
                complete = false;
            }
            continue;
        }

        if let Err(e) = fs_ops.remove_file(path) {
            debug!(path = %path.display(), error = %e, "moving file to trash");
            if move_to_trash(fs_ops, path, trash_dir, &session).is_err() {
                complete = false;
            }
        }
    }

    complete
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn move_to_trash(
    fs_ops: &dyn FileSystem,
    path: &Path,
    trash_dir: &Path,
    session: &str,
) -> io::Result<()> {
    fs::create_dir_all(trash_dir)?;
    let mut hasher = Sha256::new();
    hasher.update(session.as_bytes());
    hasher.update(path.to_string_lossy().as_bytes());
    let name = format!("{:x}", hasher.finalize());
    fs_ops.rename(path, &trash_dir.join(name))
}

/// Delete a directory tree deepest-first. A symlinked directory is unlinked,
/// never followed. A missing directory counts as deleted.
pub fn delete_directory(fs_ops: &dyn FileSystem, dir: &Path, trash_dir: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(dir) else {
        return true;
    };

    if meta.file_type().is_symlink() {
        #[cfg(windows)]
        let unlinked = fs_ops.remove_dir(dir);
        #[cfg(not(windows))]
        let unlinked = fs_ops.remove_file(dir);
        return unlinked.is_ok();
    }

    clear_directory(fs_ops, dir, &HashSet::new(), trash_dir) && fs_ops.remove_dir(dir).is_ok()
}

/// Best-effort removal of everything in the trash directory.
pub fn empty_trash(trash_dir: &Path) {
    let Ok(entries) = fs::read_dir(trash_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            debug!(path = %path.display(), error = %e, "trash entry still in use");
        }
    }
}

/// Recursively copy `src` into a new directory `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Write via a sibling temp file and rename into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(|e| StowageError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StowageError::io(path, e)
    })
}

/// Create a zero-byte marker file, creating parent directories as needed.
pub fn create_empty_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StowageError::io(parent, e))?;
    }
    fs::write(path, b"").map_err(|e| StowageError::io(path, e))
}
