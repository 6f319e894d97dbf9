//! Engine configuration.
//!
//! Settings live in `settings.json` inside the data directory, next to the
//! `installed_packages` registry. Every key is optional:
//!
//! ```json
//! {
//!   "install_prereleases": ["Terminus"],
//!   "remove_orphaned": true,
//!   "max_backup_age": 14,
//!   "package_name_map": { "Catalog Name": "Local Name" },
//!   "python_versions": ["3.3", "3.8"]
//! }
//! ```

use crate::error::{Result, StowageError};
use crate::platform::HostInfo;
use crate::selector::PrereleasePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST_VERSION: u32 = 4200;
pub const DEFAULT_PYTHON_VERSION: &str = "3.3";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub install_prereleases: PrereleasePolicy,
    pub remove_orphaned: bool,
    pub install_missing: bool,
    pub max_backup_age: u32,
    pub package_name_map: BTreeMap<String, String>,
    pub renamed_packages: BTreeMap<String, String>,
    pub python_versions: Vec<String>,
    pub host_version: u32,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub settle_delay_ms: u64,
    pub temp_cleanup_delay_ms: u64,
    pub submit_usage: bool,
    pub submit_url: String,
    pub http_timeout_secs: u64,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_prereleases: PrereleasePolicy::default(),
            remove_orphaned: true,
            install_missing: true,
            max_backup_age: 14,
            package_name_map: BTreeMap::new(),
            renamed_packages: BTreeMap::new(),
            python_versions: vec!["3.3".to_string(), "3.8".to_string()],
            host_version: DEFAULT_HOST_VERSION,
            platform: None,
            arch: None,
            settle_delay_ms: 700,
            temp_cleanup_delay_ms: 1000,
            submit_usage: false,
            submit_url: String::new(),
            http_timeout_secs: 30,
            debug: false,
        }
    }
}

impl Config {
    /// Read configuration from a settings file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StowageError::io(path, e)),
        };
        serde_json::from_str(&content).map_err(|source| StowageError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Host triple, with configured overrides applied over detection.
    pub fn host(&self) -> HostInfo {
        let mut host = HostInfo::detect(self.host_version);
        if let Some(platform) = &self.platform {
            host.platform = platform.clone();
        }
        if let Some(arch) = &self.arch {
            host.arch = arch.clone();
        }
        host
    }

    pub fn supports_python(&self, version: &str) -> bool {
        self.python_versions.iter().any(|v| v == version)
    }

    pub fn default_python_version(&self) -> &str {
        self.python_versions
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_PYTHON_VERSION)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn temp_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.temp_cleanup_delay_ms)
    }
}
