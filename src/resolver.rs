//! Library dependency selection and set algebra.
//!
//! Libraries are identified by name and runtime tag. Names compare
//! case-insensitively with `-` and `_` treated alike, so `PyYAML` and
//! `pyyaml` refer to the same installable unit.
//!
//! # Examples
//!
//! ```
//! use stowage::platform::HostInfo;
//! use stowage::resolver::select_libraries;
//! use std::collections::BTreeMap;
//!
//! let mut manifest = BTreeMap::new();
//! manifest.insert("*".to_string(), BTreeMap::from([
//!     (">=4000".to_string(), vec!["requests".to_string()]),
//!     ("*".to_string(), vec!["legacy-requests".to_string()]),
//! ]));
//!
//! let host = HostInfo::new("linux", "x64", 4100);
//! assert_eq!(select_libraries(&manifest, &host), vec!["requests"]);
//! ```

use crate::metadata::DependencyManifest;
use crate::platform::{HostInfo, is_compatible_version};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A library variant: name plus runtime tag (`3.3`, `3.8`, ...).
#[derive(Debug, Clone)]
pub struct LibraryRef {
    pub name: String,
    pub python_version: String,
}

impl LibraryRef {
    pub fn new(name: impl Into<String>, python_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            python_version: python_version.into(),
        }
    }

    /// Name used for comparisons and on-disk dist-info lookup.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    fn key(&self) -> (String, &str) {
        (self.normalized_name(), self.python_version.as_str())
    }
}

pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

impl PartialEq for LibraryRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for LibraryRef {}

impl Hash for LibraryRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for LibraryRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LibraryRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for LibraryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (python {})", self.name, self.python_version)
    }
}

/// Library names a manifest declares for this host.
///
/// The most specific platform key wins. Within it, version-range keys are
/// tried in descending string order (`>` and `>=` keys, then `<` and `<=`,
/// then explicit ranges, then `*`) and the first satisfied one is used.
/// No match is not an error: the package needs nothing on this machine.
pub fn select_libraries(manifest: &DependencyManifest, host: &HostInfo) -> Vec<String> {
    let platforms: Vec<&str> = manifest.keys().map(String::as_str).collect();
    let Some(platform) = host.compatible_platform(&platforms) else {
        return Vec::new();
    };
    let Some(by_version) = manifest.get(platform) else {
        return Vec::new();
    };

    by_version
        .iter()
        .rev()
        .find(|(selector, _)| is_compatible_version(selector, host.version))
        .map(|(_, names)| names.clone())
        .unwrap_or_default()
}

/// `required - installed`.
pub fn missing_libraries(
    required: &BTreeSet<LibraryRef>,
    installed: &BTreeSet<LibraryRef>,
) -> BTreeSet<LibraryRef> {
    required.difference(installed).cloned().collect()
}

/// `installed - required - unmanaged`.
pub fn orphaned_libraries(
    installed: &BTreeSet<LibraryRef>,
    required: &BTreeSet<LibraryRef>,
    unmanaged: &BTreeSet<LibraryRef>,
) -> BTreeSet<LibraryRef> {
    installed
        .iter()
        .filter(|lib| !required.contains(lib) && !unmanaged.contains(lib))
        .cloned()
        .collect()
}
