//! On-disk store of shared libraries.
//!
//! Each installed library sits in `Lib/<pythonXY>/` next to a
//! `<name>-<version>.dist-info` directory describing it:
//!
//! ```text
//! Lib/python38/
//!   yaml/
//!   pyyaml-6.0.1.dist-info/
//!     INSTALLER   "stowage" for libraries this engine owns
//!     METADATA    Name / Version / Summary / Home-page
//!     RECORD      path,sha256=<urlsafe-b64>,size per installed file
//!     WHEEL       runtime tags, for wheel-built libraries
//! ```
//!
//! A library whose INSTALLER names anything else is unmanaged and is never
//! removed. RECORD hashes detect local edits before an upgrade would
//! overwrite them.

use crate::archive::is_unsafe_entry;
use crate::error::{Result, StowageError};
use crate::fsops::{self, FileSystem};
use crate::layout::Layout;
use crate::platform::HostInfo;
use crate::resolver::{LibraryRef, normalize_name};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const INSTALLER_NAME: &str = "stowage";
const DIST_INFO_SUFFIX: &str = ".dist-info";

/// One RECORD line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub relative_path: String,
    pub sha256: Option<String>,
    pub size: Option<u64>,
}

/// A `.dist-info` directory inside some library directory.
#[derive(Debug, Clone)]
pub struct DistInfo {
    pub root: PathBuf,
    pub dir_name: String,
}

/// Dist-info directory name for a library release.
pub fn dist_info_name(name: &str, version: &str) -> String {
    format!("{}-{}{}", name.replace('-', "_"), version, DIST_INFO_SUFFIX)
}

fn hash_bytes(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes))
}

impl DistInfo {
    pub fn new(root: impl Into<PathBuf>, dir_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dir_name: dir_name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(&self.dir_name)
    }

    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    pub fn ensure_exists(&self) -> Result<()> {
        let path = self.path();
        fs::create_dir_all(&path).map_err(|e| StowageError::io(&path, e))
    }

    /// Library name as encoded in the directory name.
    pub fn library_name(&self) -> &str {
        let stem = self
            .dir_name
            .strip_suffix(DIST_INFO_SUFFIX)
            .unwrap_or(&self.dir_name);
        stem.rsplit_once('-').map_or(stem, |(name, _)| name)
    }

    fn write_file(&self, file: &str, content: &str) -> Result<()> {
        let path = self.path().join(file);
        fs::write(&path, content).map_err(|e| StowageError::io(&path, e))
    }

    fn read_file(&self, file: &str) -> Option<String> {
        fs::read_to_string(self.path().join(file)).ok()
    }

    pub fn write_metadata(
        &self,
        name: &str,
        version: &str,
        summary: &str,
        homepage: &str,
    ) -> Result<()> {
        let content = format!(
            "Metadata-Version: 2.1\nName: {name}\nVersion: {version}\nSummary: {summary}\nHome-page: {homepage}\n"
        );
        self.write_file("METADATA", &content)
    }

    /// METADATA headers, keys lowercased. Empty when unreadable.
    pub fn read_metadata(&self) -> BTreeMap<String, String> {
        let Some(content) = self.read_file("METADATA") else {
            return BTreeMap::new();
        };
        content
            .lines()
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            .collect()
    }

    pub fn version(&self) -> Option<String> {
        self.read_metadata().remove("version")
    }

    pub fn write_installer(&self) -> Result<()> {
        self.write_file("INSTALLER", &format!("{INSTALLER_NAME}\n"))
    }

    pub fn read_installer(&self) -> Option<String> {
        self.read_file("INSTALLER").map(|s| s.trim().to_string())
    }

    pub fn is_managed(&self) -> bool {
        self.read_installer().as_deref() == Some(INSTALLER_NAME)
    }

    pub fn write_wheel(&self, python_version: &str) -> Result<()> {
        let tag = python_version.replace('.', "");
        let content = format!(
            "Wheel-Version: 1.0\nGenerator: {INSTALLER_NAME} ({})\nRoot-Is-Purelib: true\nTag: py{tag}-none-any\n",
            env!("CARGO_PKG_VERSION")
        );
        self.write_file("WHEEL", &content)
    }

    /// Check that a wheel's `Tag:` lines admit the runtime.
    pub fn verify_python_version(&self, python_version: &str) -> Result<()> {
        let Some(wheel) = self.read_file("WHEEL") else {
            return Ok(());
        };
        let compact = python_version.replace('.', "");
        let accepted = [
            "py3".to_string(),
            format!("py{compact}"),
            format!("cp{compact}"),
        ];
        let compatible = wheel
            .lines()
            .filter_map(|line| line.strip_prefix("Tag:"))
            .flat_map(|tag| {
                let python_tags = tag.trim().split('-').next().unwrap_or("").to_string();
                python_tags
                    .split('.')
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .any(|tag| accepted.contains(&tag));

        if compatible {
            Ok(())
        } else {
            Err(StowageError::NotAvailable {
                name: self.library_name().to_string(),
                reason: format!("wheel is not built for python {python_version}"),
            })
        }
    }

    /// Write RECORD covering this dist-info and the given top-level paths.
    pub fn write_record(&self, top_level: &[String]) -> Result<()> {
        let mut lines = Vec::new();
        let record_rel = format!("{}/RECORD", self.dir_name);

        let mut roots = top_level.to_vec();
        roots.push(self.dir_name.clone());

        for top in roots {
            let start = self.root.join(&top);
            for entry in WalkDir::new(&start).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = relative_slash_path(&self.root, entry.path());
                if rel == record_rel {
                    continue;
                }
                let bytes = fs::read(entry.path()).map_err(|e| StowageError::io(entry.path(), e))?;
                lines.push(format!("{rel},sha256={},{}", hash_bytes(&bytes), bytes.len()));
            }
        }
        lines.push(format!("{record_rel},,"));
        lines.sort();
        lines.dedup();

        let mut content = lines.join("\n");
        content.push('\n');
        self.write_file("RECORD", &content)
    }

    pub fn read_record(&self) -> Result<Vec<RecordEntry>> {
        let path = self.path().join("RECORD");
        let content = fs::read_to_string(&path).map_err(|e| StowageError::io(&path, e))?;
        let records: Vec<RecordEntry> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_record_line)
            .collect();
        if let Some(bad) = records.iter().find(|r| is_unsafe_entry(&r.relative_path)) {
            return Err(self.escaping_entry(&bad.relative_path));
        }
        Ok(records)
    }

    fn escaping_entry(&self, entry: &str) -> StowageError {
        StowageError::ArchiveSecurity {
            name: self.library_name().to_string(),
            entry: entry.to_string(),
        }
    }

    /// Split RECORD entries into unmodified and modified (changed or missing).
    pub fn verify_files(&self) -> Result<(Vec<RecordEntry>, Vec<RecordEntry>)> {
        let records = self.read_record()?;
        let results: Vec<(RecordEntry, bool)> = records
            .into_par_iter()
            .map(|record| {
                let intact = match &record.sha256 {
                    None => true,
                    Some(expected) => fs::read(self.root.join(&record.relative_path))
                        .map(|bytes| {
                            &hash_bytes(&bytes) == expected
                                && record.size.is_none_or(|size| size == bytes.len() as u64)
                        })
                        .unwrap_or(false),
                };
                (record, intact)
            })
            .collect();

        let (unmodified, modified): (Vec<_>, Vec<_>) =
            results.into_iter().partition(|(_, intact)| *intact);
        Ok((
            unmodified.into_iter().map(|(r, _)| r).collect(),
            modified.into_iter().map(|(r, _)| r).collect(),
        ))
    }

    /// First path component of every RECORD entry, sorted.
    ///
    /// Each one is a single plain name inside the library directory.
    pub fn top_level_paths(&self) -> Result<Vec<String>> {
        let mut tops = BTreeSet::new();
        for record in self.read_record()? {
            let Some(top) = record.relative_path.split('/').next() else {
                continue;
            };
            if top.is_empty() {
                continue;
            }
            if !is_plain_component(top) {
                return Err(self.escaping_entry(&record.relative_path));
            }
            tops.insert(top.to_string());
        }
        Ok(tops.into_iter().collect())
    }
}

fn parse_record_line(line: &str) -> RecordEntry {
    let mut parts = line.rsplitn(3, ',');
    let size = parts.next().and_then(|s| s.trim().parse().ok());
    let hash = parts
        .next()
        .and_then(|h| h.strip_prefix("sha256="))
        .map(str::to_string);
    let relative_path = parts.next().unwrap_or(line).to_string();
    RecordEntry {
        relative_path,
        sha256: hash,
        size,
    }
}

fn is_plain_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// A library found on disk.
#[derive(Debug, Clone)]
pub struct InstalledLibrary {
    pub library: LibraryRef,
    pub dist_info: DistInfo,
}

impl InstalledLibrary {
    pub fn version(&self) -> Option<String> {
        self.dist_info.version()
    }
}

/// Every dist-info in a runtime's library directory.
fn scan(layout: &Layout, python_version: &str) -> Vec<InstalledLibrary> {
    let lib_dir = layout.lib_dir(python_version);
    let Ok(entries) = fs::read_dir(&lib_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(DIST_INFO_SUFFIX))
        .map(|dir_name| {
            let dist_info = DistInfo::new(&lib_dir, dir_name);
            let name = dist_info
                .read_metadata()
                .remove("name")
                .unwrap_or_else(|| dist_info.library_name().to_string());
            InstalledLibrary {
                library: LibraryRef::new(name, python_version),
                dist_info,
            }
        })
        .collect()
}

pub fn list_all(layout: &Layout, python_versions: &[String]) -> BTreeSet<LibraryRef> {
    python_versions
        .iter()
        .flat_map(|v| scan(layout, v))
        .map(|installed| installed.library)
        .collect()
}

/// Libraries another tool installed.
pub fn list_unmanaged(layout: &Layout, python_versions: &[String]) -> BTreeSet<LibraryRef> {
    python_versions
        .iter()
        .flat_map(|v| scan(layout, v))
        .filter(|installed| !installed.dist_info.is_managed())
        .map(|installed| installed.library)
        .collect()
}

pub fn find_installed(layout: &Layout, library: &LibraryRef) -> Option<InstalledLibrary> {
    let wanted = library.normalized_name();
    scan(layout, &library.python_version)
        .into_iter()
        .find(|installed| normalize_name(&installed.library.name) == wanted)
}

/// Remove a library's files, then its dist-info.
///
/// The dist-info goes last so an interrupted removal still shows the
/// library as installed and can be retried.
pub fn remove(fs_ops: &dyn FileSystem, installed: &InstalledLibrary, trash_dir: &Path) -> Result<()> {
    let dist_info = &installed.dist_info;
    for top in dist_info.top_level_paths()? {
        if top == dist_info.dir_name {
            continue;
        }
        remove_path(fs_ops, &dist_info.root.join(&top), trash_dir)?;
    }
    remove_path(fs_ops, &dist_info.path(), trash_dir)
}

fn remove_path(fs_ops: &dyn FileSystem, path: &Path, trash_dir: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.is_dir() {
        if fsops::delete_directory(fs_ops, path, trash_dir) {
            return Ok(());
        }
        return Err(StowageError::io(
            path,
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        ));
    }
    fs_ops.remove_file(path).map_err(|e| StowageError::io(path, e))
}

/// Move a staged library into `lib_dir`.
pub fn install(staged: &DistInfo, lib_dir: &Path, trash_dir: &Path) -> Result<DistInfo> {
    fs::create_dir_all(lib_dir).map_err(|e| StowageError::io(lib_dir, e))?;
    for top in staged.top_level_paths()? {
        let src = staged.root.join(&top);
        let dst = lib_dir.join(&top);
        if !src.exists() {
            continue;
        }
        if dst.exists() {
            debug!(path = %dst.display(), "replacing existing library path");
            remove_path(&fsops::OsFileSystem, &dst, trash_dir)?;
        }
        if fs::rename(&src, &dst).is_err() {
            if src.is_dir() {
                fsops::copy_tree(&src, &dst).map_err(|e| StowageError::io(&dst, e))?;
            } else {
                fs::copy(&src, &dst).map_err(|e| StowageError::io(&dst, e))?;
            }
        }
    }
    Ok(DistInfo::new(lib_dir, staged.dir_name.clone()))
}

/// Content folders of a legacy dependency archive, most specific first.
pub fn legacy_content_folders(python_version: &str, host: &HostInfo) -> Vec<String> {
    let py = python_version.replace('.', "");
    let (platform, arch) = (&host.platform, &host.arch);
    let mut folders = vec![
        format!("st4_py{py}_{platform}_{arch}"),
        format!("st4_py{py}_{platform}"),
        format!("st4_py{py}"),
    ];
    if python_version == "3.3" {
        folders.extend([
            format!("st3_{platform}_{arch}"),
            format!("st3_{platform}"),
            "st3".to_string(),
        ]);
    }
    folders.push("all".to_string());
    folders
}

/// Turn an extracted legacy dependency into a staged library with a
/// generated dist-info.
pub fn convert_dependency(
    extracted_dir: &Path,
    staging_dir: &Path,
    python_version: &str,
    host: &HostInfo,
    name: &str,
    version: &str,
    description: &str,
    homepage: &str,
) -> Result<DistInfo> {
    let source = legacy_content_folders(python_version, host)
        .into_iter()
        .map(|folder| extracted_dir.join(folder))
        .find(|path| path.is_dir())
        .ok_or_else(|| StowageError::NotAvailable {
            name: name.to_string(),
            reason: format!("no content for python {python_version} on this platform"),
        })?;

    fs::create_dir_all(staging_dir).map_err(|e| StowageError::io(staging_dir, e))?;
    let mut top_level = Vec::new();
    for entry in fs::read_dir(&source).map_err(|e| StowageError::io(&source, e))? {
        let entry = entry.map_err(|e| StowageError::io(&source, e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let dst = staging_dir.join(&file_name);
        fs::rename(entry.path(), &dst).map_err(|e| StowageError::io(&dst, e))?;
        top_level.push(file_name);
    }

    let dist_info = DistInfo::new(staging_dir, dist_info_name(name, version));
    dist_info.ensure_exists()?;
    dist_info.write_metadata(name, version, description, homepage)?;
    dist_info.write_installer()?;
    dist_info.write_wheel(python_version)?;
    dist_info.write_record(&top_level)?;

    if top_level.is_empty() {
        warn!(library = name, "legacy dependency has no files");
    }
    Ok(dist_info)
}
