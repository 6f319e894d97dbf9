//! Persisted per-package records.

use crate::error::{Result, StowageError};
use crate::fsops::write_atomic;
use crate::platform::{HostInfo, is_compatible_version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const METADATA_FILE: &str = "package-metadata.json";
pub const DEPENDENCIES_FILE: &str = "dependencies.json";

/// Contents of `package-metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sublime_text: Option<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    /// Older installs recorded these under `dependencies`.
    #[serde(default, alias = "dependencies")]
    pub libraries: Vec<String>,
}

impl PackageMetadata {
    pub fn parse(path: &Path, json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|source| StowageError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, package_dir: &Path) -> Result<()> {
        let path = package_dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(|source| {
            StowageError::ManifestParse {
                path: path.clone(),
                source,
            }
        })?;
        write_atomic(&path, &json)
    }

    /// Metadata without compatibility fields predates them; assume a match.
    pub fn is_compatible(&self, host: &HostInfo) -> bool {
        let sublime_text = self.sublime_text.as_deref().unwrap_or("");
        if sublime_text.is_empty() && self.platforms.is_empty() {
            return true;
        }
        host.is_compatible_platform(&self.platforms)
            && (sublime_text.is_empty() || is_compatible_version(sublime_text, host.version))
    }
}

/// Contents of `dependencies.json`: platform selector, then version-range
/// selector, then library names.
pub type DependencyManifest = BTreeMap<String, BTreeMap<String, Vec<String>>>;

pub fn parse_dependencies(path: &Path, json: &str) -> Result<DependencyManifest> {
    serde_json::from_str(json).map_err(|source| StowageError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
