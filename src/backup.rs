//! Timestamped package snapshots taken before destructive changes.

use crate::error::{Result, StowageError};
use crate::fsops::copy_tree;
use crate::layout::Layout;
use chrono::{Local, NaiveDate};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Copy `Packages/<name>` into `Backup/<timestamp>/<name>`.
///
/// Returns `None` when there is no directory to back up.
pub fn backup_package_dir(layout: &Layout, name: &str) -> Result<Option<PathBuf>> {
    let source = layout.package_dir(name);
    if !source.is_dir() {
        return Ok(None);
    }

    let stamp_dir = layout
        .backup_dir()
        .join(Local::now().format(STAMP_FORMAT).to_string());
    let mut dest = stamp_dir.join(name);
    let mut suffix = 1;
    while dest.exists() {
        dest = stamp_dir.join(format!("{name}-{suffix}"));
        suffix += 1;
    }

    if let Err(e) = copy_tree(&source, &dest) {
        // A half-written snapshot is worse than none.
        if let Err(cleanup) = fs::remove_dir_all(&dest) {
            debug!(path = %dest.display(), error = %cleanup, "partial backup left behind");
        }
        return Err(StowageError::io(&dest, e));
    }
    debug!(package = name, backup = %dest.display(), "backed up package");
    Ok(Some(dest))
}

/// Delete snapshot directories older than `max_age_days`.
pub fn prune_backups(layout: &Layout, max_age_days: u32, today: NaiveDate) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(layout.backup_dir()) else {
        return Vec::new();
    };

    let mut pruned = Vec::new();
    for entry in entries.flatten() {
        let Ok(dir_name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(date) = dir_name
            .get(..8)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        else {
            continue;
        };
        if (today - date).num_days() <= i64::from(max_age_days) {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => pruned.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to prune backup"),
        }
    }
    pruned.sort();
    pruned
}
