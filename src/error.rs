//! Error types shared by every engine component.
//!
//! Each variant belongs to one [`ErrorKind`]. Callers that need to decide
//! between "failed" and "retry after restart" look at the kind, never at the
//! message text.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Coarse classification of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    ArchiveFormat,
    ArchiveSecurity,
    FileLocked,
    Filesystem,
    ManifestParse,
    UserModification,
    Other,
}

#[derive(Error, Debug)]
pub enum StowageError {
    #[error("failed to fetch {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive for \"{name}\" is unreadable: {message}")]
    ArchiveFormat { name: String, message: String },

    #[error("archive for \"{name}\" contains entry \"{entry}\" that escapes the destination")]
    ArchiveSecurity { name: String, entry: String },

    #[error("files in \"{name}\" failed archive integrity checks: {}", .paths.join(", "))]
    ArchiveIntegrity { name: String, paths: Vec<String> },

    #[error("{} is in use: {source}", .path.display())]
    FileLocked {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("files of \"{name}\" were modified on disk: {}", format_paths(.paths))]
    UserModification { name: String, paths: Vec<PathBuf> },

    #[error("\"{name}\" is not available: {reason}")]
    NotAvailable { name: String, reason: String },

    #[error("\"{0}\" is not installed")]
    NotInstalled(String),

    #[error("\"{name}\" is protected: {reason}")]
    Protected { name: String, reason: String },

    #[error("invalid version \"{0}\"")]
    InvalidVersion(String),

    #[error("settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, StowageError>;

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl StowageError {
    /// Wrap an I/O error, classifying host file locks separately from
    /// ordinary filesystem failures.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if is_lock_error(&source) {
            StowageError::FileLocked { path, source }
        } else {
            StowageError::Filesystem { path, source }
        }
    }

    pub fn archive(name: &str, err: impl std::fmt::Display) -> Self {
        StowageError::ArchiveFormat {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StowageError::Transport { .. } | StowageError::Http(_) => ErrorKind::Transport,
            StowageError::ArchiveFormat { .. } | StowageError::ArchiveIntegrity { .. } => {
                ErrorKind::ArchiveFormat
            }
            StowageError::ArchiveSecurity { .. } => ErrorKind::ArchiveSecurity,
            StowageError::FileLocked { .. } => ErrorKind::FileLocked,
            StowageError::Filesystem { .. } => ErrorKind::Filesystem,
            StowageError::ManifestParse { .. } => ErrorKind::ManifestParse,
            StowageError::UserModification { .. } => ErrorKind::UserModification,
            StowageError::NotAvailable { .. }
            | StowageError::NotInstalled(_)
            | StowageError::Protected { .. }
            | StowageError::InvalidVersion(_)
            | StowageError::Settings(_) => ErrorKind::Other,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.kind() == ErrorKind::FileLocked
    }
}

/// Whether an I/O error means another process holds the file open.
///
/// Windows reports sharing and lock violations (32, 33) and denies access
/// to open files; Unix hosts report `EBUSY`/`ETXTBSY` or a permission error.
pub fn is_lock_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    match err.raw_os_error() {
        #[cfg(windows)]
        Some(32) | Some(33) => true,
        #[cfg(unix)]
        Some(16) | Some(26) => true,
        _ => false,
    }
}
