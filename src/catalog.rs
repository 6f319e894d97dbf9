//! Catalog data and the provider seam.
//!
//! Fetching and caching remote catalogs is the provider's job. The engine
//! only sees the [`CatalogProvider`] trait: repositories in registration
//! order, each listing packages and libraries with newest-first releases.
//!
//! [`StaticCatalog`] is a provider backed by a JSON document, used by the CLI
//! (`--catalog`) and by tests:
//!
//! ```json
//! {
//!   "repositories": [
//!     {
//!       "name": "default",
//!       "packages": [
//!         {
//!           "name": "Alignment",
//!           "description": "Align selections",
//!           "releases": [
//!             { "version": "2.1.0", "url": "https://example.com/a.zip",
//!               "platforms": ["*"], "sublime_text": ">=3000" }
//!           ]
//!         }
//!       ],
//!       "libraries": []
//!     }
//!   ],
//!   "renamed_packages": { "OldName": "Alignment" }
//! }
//! ```

use crate::config::Config;
use crate::error::{Result, StowageError};
use crate::platform::HostInfo;
use crate::selector::select_releases;
use crate::version::PackageVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

fn any_platform() -> Vec<String> {
    vec!["*".to_string()]
}

fn any_version() -> String {
    "*".to_string()
}

/// One downloadable release of a package or library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub version: PackageVersion,
    pub url: String,
    #[serde(default = "any_platform")]
    pub platforms: Vec<String>,
    #[serde(default = "any_version")]
    pub sublime_text: String,
    #[serde(default)]
    pub python_versions: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

/// Source of catalog data.
pub trait CatalogProvider: Send + Sync {
    /// Repository identifiers, in registration order.
    fn repositories(&self) -> Vec<String>;

    fn packages(&self, repo: &str) -> Vec<PackageInfo>;

    fn libraries(&self, repo: &str) -> Vec<LibraryInfo>;

    /// Old name to new name.
    fn renamed_packages(&self) -> BTreeMap<String, String>;

    fn failed_sources(&self) -> Vec<String> {
        Vec::new()
    }

    fn broken_packages(&self) -> Vec<String> {
        Vec::new()
    }

    fn broken_libraries(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticRepository {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<PackageInfo>,
    #[serde(default)]
    pub libraries: Vec<LibraryInfo>,
}

/// A catalog held entirely in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    pub repositories: Vec<StaticRepository>,
    #[serde(default)]
    pub renamed_packages: BTreeMap<String, String>,
    #[serde(default)]
    pub failed_sources: Vec<String>,
    #[serde(default)]
    pub broken_packages: Vec<String>,
    #[serde(default)]
    pub broken_libraries: Vec<String>,
}

impl StaticCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| StowageError::io(path, e))?;
        serde_json::from_str(&content).map_err(|source| StowageError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn repository(&self, repo: &str) -> Option<&StaticRepository> {
        self.repositories.iter().find(|r| r.name == repo)
    }
}

impl CatalogProvider for StaticCatalog {
    fn repositories(&self) -> Vec<String> {
        self.repositories.iter().map(|r| r.name.clone()).collect()
    }

    fn packages(&self, repo: &str) -> Vec<PackageInfo> {
        self.repository(repo)
            .map(|r| r.packages.clone())
            .unwrap_or_default()
    }

    fn libraries(&self, repo: &str) -> Vec<LibraryInfo> {
        self.repository(repo)
            .map(|r| r.libraries.clone())
            .unwrap_or_default()
    }

    fn renamed_packages(&self) -> BTreeMap<String, String> {
        self.renamed_packages.clone()
    }

    fn failed_sources(&self) -> Vec<String> {
        self.failed_sources.clone()
    }

    fn broken_packages(&self) -> Vec<String> {
        self.broken_packages.clone()
    }

    fn broken_libraries(&self) -> Vec<String> {
        self.broken_libraries.clone()
    }
}

/// Packages usable on this host, keyed by local name.
///
/// When two repositories publish the same name, the repository registered
/// first wins; later entries are ignored.
#[derive(Debug, Clone, Default)]
pub struct AvailablePackages {
    pub packages: BTreeMap<String, PackageInfo>,
    /// Known names with no release for this host.
    pub unavailable: BTreeSet<String>,
    /// Repositories the provider could not fetch.
    pub failed_sources: Vec<String>,
    /// Packages the provider could not parse.
    pub broken: Vec<String>,
}

impl AvailablePackages {
    pub fn build(provider: &dyn CatalogProvider, host: &HostInfo, config: &Config) -> Self {
        let mut available = Self {
            failed_sources: provider.failed_sources(),
            broken: provider.broken_packages(),
            ..Self::default()
        };
        report_catalog_failures(&available.failed_sources, &available.broken, "packages");

        for repo in provider.repositories() {
            for mut info in provider.packages(&repo) {
                let name = config
                    .package_name_map
                    .get(&info.name)
                    .cloned()
                    .unwrap_or_else(|| info.name.clone());

                if available.packages.contains_key(&name) || available.unavailable.contains(&name)
                {
                    debug!(package = %name, repository = %repo, "shadowed by earlier repository");
                    continue;
                }

                let releases: Vec<Release> = select_releases(
                    &name,
                    &info.releases,
                    host,
                    &config.install_prereleases,
                )
                .into_iter()
                .cloned()
                .collect();

                if releases.is_empty() {
                    available.unavailable.insert(name);
                    continue;
                }

                info.name = name.clone();
                info.releases = releases;
                available.packages.insert(name, info);
            }
        }

        available
    }

    pub fn get(&self, name: &str) -> Option<&PackageInfo> {
        self.packages.get(name)
    }
}

/// Libraries usable on this host for one runtime tag.
#[derive(Debug, Clone, Default)]
pub struct AvailableLibraries {
    pub libraries: BTreeMap<String, LibraryInfo>,
    pub unavailable: BTreeSet<String>,
    pub failed_sources: Vec<String>,
    pub broken: Vec<String>,
}

impl AvailableLibraries {
    pub fn build(
        provider: &dyn CatalogProvider,
        host: &HostInfo,
        config: &Config,
        python_version: &str,
    ) -> Self {
        let mut available = Self {
            failed_sources: provider.failed_sources(),
            broken: provider.broken_libraries(),
            ..Self::default()
        };
        report_catalog_failures(&available.failed_sources, &available.broken, "libraries");

        for repo in provider.repositories() {
            for mut info in provider.libraries(&repo) {
                if available.libraries.contains_key(&info.name)
                    || available.unavailable.contains(&info.name)
                {
                    continue;
                }

                let releases: Vec<Release> = select_releases(
                    &info.name,
                    &info.releases,
                    host,
                    &config.install_prereleases,
                )
                .into_iter()
                .filter(|r| r.python_versions.iter().any(|v| v == python_version))
                .cloned()
                .collect();

                if releases.is_empty() {
                    available.unavailable.insert(info.name);
                    continue;
                }

                info.releases = releases;
                available.libraries.insert(info.name.clone(), info);
            }
        }

        available
    }

    pub fn get(&self, name: &str) -> Option<&LibraryInfo> {
        self.libraries.get(name)
    }
}

fn report_catalog_failures(failed_sources: &[String], broken: &[String], kind: &str) {
    if !failed_sources.is_empty() {
        warn!(sources = ?failed_sources, "unable to fetch {kind} from some repositories");
    }
    if !broken.is_empty() {
        warn!(names = ?broken, "skipping broken {kind} entries");
    }
}

/// Combined rename table; configured renames override catalog renames.
pub fn renamed_packages(
    provider: &dyn CatalogProvider,
    config: &Config,
) -> BTreeMap<String, String> {
    let mut renames = provider.renamed_packages();
    renames.extend(
        config
            .renamed_packages
            .iter()
            .map(|(old, new)| (old.clone(), new.clone())),
    );
    renames
}
