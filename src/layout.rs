//! On-disk layout of the data directory.
//!
//! ```text
//! <data>/
//!   settings.json
//!   Packages/<name>/                        unpacked packages and overrides
//!   Installed Packages/<name>.sublime-package
//!   Lib/python33/, Lib/python38/            shared libraries per runtime
//!   Backup/<YYYYMMDDhhmmss>/<name>/         pre-mutation snapshots
//!   Cache/<name>/                           host caches, dropped on removal
//!   Trash/                                  locked files moved aside
//!   Temp/                                   download scratch space
//! ```

use crate::error::{Result, StowageError};
use std::fs;
use std::path::{Path, PathBuf};

pub const PACKAGE_EXTENSION: &str = ".sublime-package";
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `STOWAGE_DATA_DIR`, else the platform data directory.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("STOWAGE_DATA_DIR") {
            return Self::new(dir);
        }
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("stowage"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("Packages")
    }

    pub fn installed_packages_dir(&self) -> PathBuf {
        self.root.join("Installed Packages")
    }

    pub fn lib_root(&self) -> PathBuf {
        self.root.join("Lib")
    }

    /// `3.8` maps to `Lib/python38`.
    pub fn lib_dir(&self, python_version: &str) -> PathBuf {
        self.lib_root()
            .join(format!("python{}", python_version.replace('.', "")))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("Backup")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join("Trash")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("Temp")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("Cache")
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.packages_dir().join(name)
    }

    pub fn package_file(&self, name: &str) -> PathBuf {
        self.installed_packages_dir()
            .join(format!("{name}{PACKAGE_EXTENSION}"))
    }

    /// Where a blocked package-file swap parks the new archive.
    pub fn pending_package_file(&self, name: &str) -> PathBuf {
        self.installed_packages_dir()
            .join(format!("{name}{PACKAGE_EXTENSION}-new"))
    }

    pub fn package_cache_dir(&self, name: &str) -> PathBuf {
        self.cache_dir().join(name)
    }

    pub fn ensure(&self, python_versions: &[String]) -> Result<()> {
        let mut dirs = vec![
            self.packages_dir(),
            self.installed_packages_dir(),
            self.backup_dir(),
            self.trash_dir(),
            self.temp_dir(),
            self.cache_dir(),
        ];
        dirs.extend(python_versions.iter().map(|v| self.lib_dir(v)));
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| StowageError::io(&dir, e))?;
        }
        Ok(())
    }
}
