//! Reading installed package content and sentinel markers.
//!
//! A package may exist as an unpacked directory, a packed archive, or both
//! (the directory then overrides individual files of the archive). Reads
//! look in the directory first.

use crate::archive::PackageArchive;
use crate::layout::{Layout, PACKAGE_EXTENSION};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Directory must be deleted; a previous attempt hit locked files.
pub const CLEANUP_SENTINEL: &str = "package-control.cleanup";
/// Directory must be wiped and the package installed afresh.
pub const REINSTALL_SENTINEL: &str = "package-control.reinstall";
/// Archive marker: install unpacked rather than as a package file.
pub const NO_PACKAGE_FILE_MARKER: &str = ".no-sublime-package";
/// Local marker: this directory is not tied to any archive; never overwrite.
pub const HIDDEN_PACKAGE_MARKER: &str = ".hidden-sublime-package";
pub const PYTHON_VERSION_FILE: &str = ".python-version";

/// Names that are part of the host and never managed here.
pub const RESERVED_PACKAGES: [&str; 4] = ["Binary", "Default", "Text", "User"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PACKAGES.contains(&name)
}

/// Read a text file from a package, unpacked directory first.
pub fn read_package_file(layout: &Layout, name: &str, rel: &str) -> Option<String> {
    let path = layout.package_dir(name).join(rel);
    if path.is_file() {
        match fs::read_to_string(&path) {
            Ok(content) => return Some(content),
            Err(e) => debug!(path = %path.display(), error = %e, "unreadable package file"),
        }
    }
    read_packed_file(layout, name, rel)
}

fn read_packed_file(layout: &Layout, name: &str, rel: &str) -> Option<String> {
    let package_file = layout.package_file(name);
    if !package_file.is_file() {
        return None;
    }
    let mut archive = match PackageArchive::open(name, &package_file) {
        Ok(archive) => archive,
        Err(e) => {
            debug!(package = name, error = %e, "unreadable package file");
            return None;
        }
    };
    archive.read_string(rel).ok().flatten()
}

/// Whether a package contains `rel`, unpacked or packed.
pub fn package_file_exists(layout: &Layout, name: &str, rel: &str) -> bool {
    if regular_file_exists(layout, name, rel) {
        return true;
    }
    let package_file = layout.package_file(name);
    package_file.is_file()
        && PackageArchive::open(name, &package_file)
            .map(|mut archive| archive.contains(rel))
            .unwrap_or(false)
}

/// Whether the unpacked directory contains the file `rel`.
pub fn regular_file_exists(layout: &Layout, name: &str, rel: &str) -> bool {
    layout.package_dir(name).join(rel).is_file()
}

/// Non-hidden directories in `dir`.
pub fn list_package_dirs(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect()
}

/// Package names of the package files in `dir`.
pub fn list_package_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|file| strip_extension_ci(&file, PACKAGE_EXTENSION))
        .collect()
}

/// Package names with a pending `-new` archive in `dir`.
pub fn list_pending_package_files(dir: &Path) -> Vec<String> {
    let suffix = format!("{PACKAGE_EXTENSION}-new");
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|file| strip_extension_ci(&file, &suffix))
        .collect()
}

fn strip_extension_ci(file: &str, ext: &str) -> Option<String> {
    if file.len() <= ext.len() {
        return None;
    }
    let split = file.len() - ext.len();
    if !file.is_char_boundary(split) {
        return None;
    }
    let (stem, tail) = file.split_at(split);
    tail.eq_ignore_ascii_case(ext).then(|| stem.to_string())
}

/// Sort names the way the registry stores them.
pub fn sort_case_insensitive(names: &mut [String]) {
    names.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create_package_file;
    use tempfile::TempDir;

    fn layout() -> (TempDir, Layout) {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        layout.ensure(&["3.3".to_string()]).unwrap();
        (temp, layout)
    }

    #[test]
    fn test_unpacked_overrides_packed() {
        let (temp, layout) = layout();
        let working = temp.path().join("working");
        fs::create_dir_all(&working).unwrap();
        fs::write(working.join("a.txt"), "packed").unwrap();
        fs::write(working.join("b.txt"), "only packed").unwrap();
        create_package_file(&working, &layout.package_file("P")).unwrap();

        fs::create_dir_all(layout.package_dir("P")).unwrap();
        fs::write(layout.package_dir("P").join("a.txt"), "override").unwrap();

        assert_eq!(read_package_file(&layout, "P", "a.txt").unwrap(), "override");
        assert_eq!(read_package_file(&layout, "P", "b.txt").unwrap(), "only packed");
        assert!(read_package_file(&layout, "P", "c.txt").is_none());
        assert!(package_file_exists(&layout, "P", "b.txt"));
        assert!(!regular_file_exists(&layout, "P", "b.txt"));
    }

    #[test]
    fn test_listing() {
        let (_temp, layout) = layout();
        fs::create_dir_all(layout.packages_dir().join("Alpha")).unwrap();
        fs::create_dir_all(layout.packages_dir().join(".hidden")).unwrap();
        fs::write(layout.package_file("Beta"), "").unwrap();
        fs::write(layout.pending_package_file("Gamma"), "").unwrap();
        fs::write(layout.installed_packages_dir().join("notes.txt"), "").unwrap();

        assert_eq!(list_package_dirs(&layout.packages_dir()), vec!["Alpha"]);
        assert_eq!(list_package_files(&layout.installed_packages_dir()), vec!["Beta"]);
        assert_eq!(
            list_pending_package_files(&layout.installed_packages_dir()),
            vec!["Gamma"]
        );
    }

    #[test]
    fn test_sort_case_insensitive() {
        let mut names = vec!["beta".to_string(), "Alpha".to_string(), "alpha".to_string()];
        sort_case_insensitive(&mut names);
        assert_eq!(names, vec!["Alpha", "alpha", "beta"]);
    }
}
