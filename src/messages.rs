//! Release notes shipped with packages.
//!
//! A package may include `messages.json` mapping `install` or a version to
//! a text file. Fresh installs show the `install` note; upgrades show every
//! versioned note in `(old, new]`, newest first.

use crate::version::PackageVersion;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const MESSAGES_FILE: &str = "messages.json";

/// Collect the notes for an install (`old` is `None`) or an upgrade.
pub fn release_notes(
    package_dir: &Path,
    name: &str,
    old: Option<&PackageVersion>,
    new: &PackageVersion,
) -> Option<String> {
    let content = fs::read_to_string(package_dir.join(MESSAGES_FILE)).ok()?;
    let index: BTreeMap<String, String> = match serde_json::from_str(&content) {
        Ok(index) => index,
        Err(e) => {
            warn!(package = name, error = %e, "unparseable messages.json");
            return None;
        }
    };

    let files: Vec<&String> = match old {
        None => index.get("install").into_iter().collect(),
        Some(old) => {
            let mut versioned: Vec<(PackageVersion, &String)> = index
                .iter()
                .filter(|(key, _)| key.as_str() != "install")
                .filter_map(|(key, file)| PackageVersion::parse(key).ok().map(|v| (v, file)))
                .filter(|(v, _)| v > old && v <= new)
                .collect();
            versioned.sort_by(|a, b| b.0.cmp(&a.0));
            versioned.into_iter().map(|(_, file)| file).collect()
        }
    };

    let mut output = String::new();
    for file in files {
        match fs::read_to_string(package_dir.join(file)) {
            Ok(text) => {
                output.push_str("\n  ");
                output.push_str(&text.trim_end().replace('\n', "\n  "));
                output.push('\n');
            }
            Err(e) => warn!(package = name, file = %file, error = %e, "missing release note"),
        }
    }

    if output.is_empty() {
        return None;
    }
    Some(format!("\n\n{name}\n{}\n{output}", "-".repeat(name.chars().count())))
}
