//! Host platform detection and selector matching.
//!
//! Releases and dependency manifests describe where they run with two kinds
//! of selector strings:
//!
//! - **Platform selectors**: `*`, an OS (`windows`, `osx`, `linux`) or an
//!   OS-arch pair (`linux-x64`, `osx-arm64`, `windows-x32`)
//! - **Version-range selectors** over the host's integer build number:
//!   `*`, `>4000`, `>=4000`, `<4000`, `<=4000`, `4000 - 4100`
//!
//! A host resolves platform selectors through a fallback chain, most specific
//! first: `linux-x64`, then `linux`, then `*`.
//!
//! # Examples
//!
//! ```
//! use stowage::platform::{HostInfo, is_compatible_version};
//!
//! let host = HostInfo::new("linux", "x64", 4180);
//! assert!(host.is_compatible_platform(&["linux".to_string()]));
//! assert!(is_compatible_version(">=4107", host.version));
//! assert!(!is_compatible_version("3000 - 3211", host.version));
//! ```

use serde::{Deserialize, Serialize};

/// The platform/arch/version triple of the running host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub platform: String,
    pub arch: String,
    pub version: u32,
}

impl HostInfo {
    pub fn new(platform: &str, arch: &str, version: u32) -> Self {
        Self {
            platform: platform.to_string(),
            arch: arch.to_string(),
            version,
        }
    }

    /// Detect the platform and architecture this binary runs on.
    pub fn detect(version: u32) -> Self {
        Self::new(detect_platform(), detect_arch(), version)
    }

    /// Platform selectors this host accepts, most specific first.
    pub fn platform_chain(&self) -> [String; 3] {
        [
            format!("{}-{}", self.platform, self.arch),
            self.platform.clone(),
            "*".to_string(),
        ]
    }

    /// Pick the most specific selector out of `selectors` that applies here.
    pub fn compatible_platform<'a, S: AsRef<str>>(&self, selectors: &'a [S]) -> Option<&'a str> {
        self.platform_chain().iter().find_map(|wanted| {
            selectors
                .iter()
                .map(AsRef::as_ref)
                .find(|candidate| *candidate == wanted.as_str())
        })
    }

    pub fn is_compatible_platform<S: AsRef<str>>(&self, selectors: &[S]) -> bool {
        self.compatible_platform(selectors).is_some()
    }

    /// Case-insensitive filesystems reject case-only renames in place.
    pub fn has_case_insensitive_fs(&self) -> bool {
        matches!(self.platform.as_str(), "windows" | "osx")
    }
}

fn detect_platform() -> &'static str {
    match std::env::consts::OS {
        "windows" => "windows",
        "macos" => "osx",
        _ => "linux",
    }
}

fn detect_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "x32",
        "aarch64" | "arm" => "arm64",
        _ => "x64",
    }
}

/// Whether `version` satisfies a version-range selector.
///
/// Malformed selectors never match.
pub fn is_compatible_version(selector: &str, version: u32) -> bool {
    let selector = selector.trim();
    if selector == "*" {
        return true;
    }

    if let Some((low, high)) = selector.split_once(" - ") {
        return match (low.trim().parse::<u32>(), high.trim().parse::<u32>()) {
            (Ok(low), Ok(high)) => low <= version && version <= high,
            _ => false,
        };
    }

    let (op, number) = if let Some(rest) = selector.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = selector.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = selector.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = selector.strip_prefix('<') {
        ("<", rest)
    } else {
        ("=", selector)
    };

    let Ok(number) = number.trim().parse::<u32>() else {
        return false;
    };

    match op {
        ">=" => version >= number,
        "<=" => version <= number,
        ">" => version > number,
        "<" => version < number,
        _ => version == number,
    }
}
