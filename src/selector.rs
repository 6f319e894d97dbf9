//! Release compatibility filtering.

use crate::catalog::Release;
use crate::platform::{HostInfo, is_compatible_version};
use serde::{Deserialize, Serialize};

/// Which packages may install prerelease versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrereleasePolicy {
    All(bool),
    Only(Vec<String>),
}

impl Default for PrereleasePolicy {
    fn default() -> Self {
        PrereleasePolicy::All(false)
    }
}

impl PrereleasePolicy {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            PrereleasePolicy::All(allowed) => *allowed,
            PrereleasePolicy::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Keep the releases that run on `host`.
///
/// Input order is preserved; catalogs list releases newest first, so the
/// first element of the result is the latest usable release.
pub fn select_releases<'a>(
    name: &str,
    releases: &'a [Release],
    host: &HostInfo,
    policy: &PrereleasePolicy,
) -> Vec<&'a Release> {
    let allow_prereleases = policy.allows(name);
    releases
        .iter()
        .filter(|r| host.is_compatible_platform(&r.platforms))
        .filter(|r| is_compatible_version(&r.sublime_text, host.version))
        .filter(|r| allow_prereleases || !r.version.is_prerelease())
        .collect()
}
