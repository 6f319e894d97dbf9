//! Zip archive validation, extraction and packing.
//!
//! Archives produced by code-hosting "download zip" endpoints wrap their
//! content in a single top-level folder (`repo-1.2.0/...`). [`common_folder`]
//! detects that prefix so extraction can strip it. Any entry that could land
//! outside the destination (absolute paths, `..` segments) rejects the whole
//! archive before a single byte is written.
//!
//! Extraction distinguishes a destination file held open by the host from
//! every other write failure. The former stops extraction and asks the caller
//! to retry after a restart; the latter skips that one file.
//!
//! # Examples
//!
//! ```
//! use stowage::archive::common_folder;
//!
//! let entries = ["Pkg-1.0/", "Pkg-1.0/main.py", "Pkg-1.0/sub/util.py"];
//! assert_eq!(common_folder("Pkg", &entries).unwrap(), "Pkg-1.0/");
//!
//! let mixed = ["main.py", "sub/util.py"];
//! assert_eq!(common_folder("Pkg", &mixed).unwrap(), "");
//!
//! assert!(common_folder("Pkg", &["../evil.py"]).is_err());
//! ```

use crate::error::{Result, StowageError, is_lock_error};
use crate::fsops::FileSystem;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

/// Find the single top-level folder shared by every entry.
///
/// Returns the prefix including its trailing `/`, or an empty string when
/// entries live at more than one top level.
pub fn common_folder<S: AsRef<str>>(name: &str, entries: &[S]) -> Result<String> {
    let mut top: Option<&str> = None;
    let mut shared = true;

    for entry in entries {
        let path = entry.as_ref();
        if is_unsafe_entry(path) {
            return Err(StowageError::ArchiveSecurity {
                name: name.to_string(),
                entry: path.to_string(),
            });
        }

        match path.split_once('/') {
            Some((first, _)) if !first.is_empty() => match top {
                None => top = Some(first),
                Some(existing) if existing == first => {}
                Some(_) => shared = false,
            },
            // A file at the root level.
            _ => shared = false,
        }
    }

    match top {
        Some(folder) if shared => Ok(format!("{folder}/")),
        _ => Ok(String::new()),
    }
}

pub(crate) fn is_unsafe_entry(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    if path.contains("../") || path.contains("..\\") {
        return true;
    }
    path.split(['/', '\\']).any(|segment| segment == "..")
        || path.chars().nth(1) == Some(':')
}

/// Characters Windows refuses in file names.
fn has_invalid_windows_chars(path: &str) -> bool {
    cfg!(windows) && path.contains([':', '*', '?', '"', '<', '>', '|'])
}

/// What an extraction produced.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Every file and directory written, as destination paths.
    pub paths: HashSet<PathBuf>,
    /// A destination file was locked; extraction stopped early.
    pub retry: bool,
}

/// An opened zip archive.
pub struct PackageArchive<R: Read + Seek> {
    name: String,
    zip: ZipArchive<R>,
}

impl PackageArchive<File> {
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| StowageError::io(path, e))?;
        Self::from_reader(name, file)
    }
}

impl PackageArchive<Cursor<Vec<u8>>> {
    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> Result<Self> {
        Self::from_reader(name, Cursor::new(bytes))
    }
}

impl<R: Read + Seek> PackageArchive<R> {
    pub fn from_reader(name: &str, reader: R) -> Result<Self> {
        let zip = ZipArchive::new(reader).map_err(|e| StowageError::archive(name, e))?;
        Ok(Self {
            name: name.to_string(),
            zip,
        })
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(str::to_string).collect()
    }

    pub fn common_folder(&self) -> Result<String> {
        common_folder(&self.name, &self.entry_names())
    }

    pub fn contains(&mut self, path: &str) -> bool {
        self.zip.by_name(path).is_ok()
    }

    /// Read one entry; `None` when absent.
    pub fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut entry = match self.zip.by_name(path) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(StowageError::archive(&self.name, e)),
        };
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| StowageError::archive(&self.name, e))?;
        Ok(Some(buf))
    }

    pub fn read_string(&mut self, path: &str) -> Result<Option<String>> {
        Ok(self
            .read(path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Extract every entry under `common` into `dest`, stripping the prefix.
    pub fn extract(
        &mut self,
        dest: &Path,
        common: &str,
        fs_ops: &dyn FileSystem,
    ) -> Result<Extraction> {
        let mut extraction = Extraction::default();

        for index in 0..self.zip.len() {
            let mut entry = match self.zip.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(package = %self.name, error = %e, "skipping unreadable archive entry");
                    continue;
                }
            };

            let name = entry.name().to_string();
            let Some(rel) = name.strip_prefix(common) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            if has_invalid_windows_chars(rel) {
                warn!(package = %self.name, entry = %name, "skipping file with invalid name");
                continue;
            }

            let target = dest.join(rel.trim_end_matches('/'));

            if entry.is_dir() {
                if let Err(e) = fs::create_dir_all(&target) {
                    warn!(path = %target.display(), error = %e, "unable to create directory");
                    continue;
                }
                record_dirs(&mut extraction.paths, dest, &target);
                continue;
            }

            let parent = target.parent().unwrap_or(dest).to_path_buf();
            if let Err(e) = fs::create_dir_all(&parent) {
                if is_lock_error(&e) {
                    extraction.retry = true;
                    break;
                }
                warn!(path = %parent.display(), error = %e, "unable to create directory");
                continue;
            }
            record_dirs(&mut extraction.paths, dest, &parent);
            extraction.paths.insert(target.clone());

            let mut contents = Vec::with_capacity(entry.size() as usize);
            if let Err(e) = entry.read_to_end(&mut contents) {
                warn!(package = %self.name, entry = %name, error = %e, "skipping undecodable file");
                continue;
            }

            if let Err(e) = fs_ops.write(&target, &contents) {
                if is_lock_error(&e) {
                    debug!(path = %target.display(), "destination file is locked");
                    extraction.retry = true;
                    break;
                }
                warn!(path = %target.display(), error = %e, "skipping file that could not be written");
            }
        }

        Ok(extraction)
    }
}

fn record_dirs(paths: &mut HashSet<PathBuf>, root: &Path, dir: &Path) {
    let mut current = Some(dir);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) || !paths.insert(dir.to_path_buf()) {
            break;
        }
        current = dir.parent();
    }
}

/// Pack the contents of `src_dir` into a deflated zip at `dest`.
pub fn create_package_file(src_dir: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest).map_err(|e| StowageError::io(dest, e))?;
    let mut zip = ZipWriter::new(file);
    let options: FileOptions<'_, ()> = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut files: Vec<PathBuf> = WalkDir::new(src_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    for path in files {
        let rel = path
            .strip_prefix(src_dir)
            .map_err(|e| StowageError::io(&path, io::Error::other(e)))?;
        let entry_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(entry_name, options)
            .map_err(|e| StowageError::archive(&dest.display().to_string(), e))?;
        let contents = fs::read(&path).map_err(|e| StowageError::io(&path, e))?;
        zip.write_all(&contents)
            .map_err(|e| StowageError::io(dest, e))?;
    }

    zip.finish()
        .map_err(|e| StowageError::archive(&dest.display().to_string(), e))?;
    Ok(())
}
