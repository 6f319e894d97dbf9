//! Capabilities the engine consumes from its host application.
//!
//! The host owns its settings storage and decides which packages are
//! loaded. Both are injected as trait objects so the engine never reaches
//! them through global state; [`JsonSettings`] and [`SettingsDisabler`]
//! provide a file-backed stand-in for running outside a host.

use crate::error::{Result, StowageError};
use crate::fsops::write_atomic;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const INSTALLED_PACKAGES_KEY: &str = "installed_packages";
pub const IGNORED_PACKAGES_KEY: &str = "ignored_packages";
pub const IN_PROCESS_PACKAGES_KEY: &str = "in_process_packages";

/// Key/value settings with explicit persistence.
pub trait SettingsStore: Send + Sync {
    fn get_list(&self, key: &str) -> Vec<String>;
    fn set_list(&self, key: &str, values: Vec<String>);
    /// Write pending changes to durable storage.
    fn save(&self) -> Result<()>;
}

/// Settings held in a JSON object, optionally backed by a file.
pub struct JsonSettings {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
}

impl JsonSettings {
    pub fn open(path: &Path) -> Result<Self> {
        let values = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(StowageError::Settings(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )));
                }
                Err(source) => {
                    return Err(StowageError::ManifestParse {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(StowageError::io(path, e)),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            values: Mutex::new(values),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(Map::new()),
        }
    }
}

impl SettingsStore for JsonSettings {
    fn get_list(&self, key: &str) -> Vec<String> {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_list(&self, key: &str, values: Vec<String>) {
        let array = values.into_iter().map(Value::String).collect();
        self.values.lock().insert(key.to_string(), Value::Array(array));
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let values = self.values.lock();
            serde_json::to_vec_pretty(&*values).map_err(|source| StowageError::ManifestParse {
                path: path.clone(),
                source,
            })?
        };
        write_atomic(path, &json)
    }
}

/// Why packages are being disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Disable,
    Enable,
    Install,
    Remove,
    Upgrade,
}

/// Host capability to unload packages before their files change.
pub trait PackageDisabler: Send + Sync {
    /// Disable `names`; returns the ones this call actually disabled and
    /// which must be re-enabled afterwards.
    fn disable_packages(&self, names: &BTreeSet<String>, action: Action) -> BTreeSet<String>;
    fn reenable_packages(&self, names: &BTreeSet<String>, action: Action);
    /// Packages force-disabled by an operation that never finished.
    fn in_process_packages(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
    fn clear_in_process(&self, _keep: &BTreeSet<String>) {}
}

/// Disabler that tracks `ignored_packages` and `in_process_packages` in a
/// settings store.
pub struct SettingsDisabler {
    settings: Arc<dyn SettingsStore>,
    lock: Mutex<()>,
}

impl SettingsDisabler {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            lock: Mutex::new(()),
        }
    }

    fn set(&self, key: &str) -> BTreeSet<String> {
        self.settings.get_list(key).into_iter().collect()
    }

    fn store(&self, key: &str, values: &BTreeSet<String>) {
        self.settings.set_list(key, values.iter().cloned().collect());
    }

    fn save(&self) {
        if let Err(e) = self.settings.save() {
            warn!(error = %e, "failed to save disabled packages");
        }
    }
}

impl PackageDisabler for SettingsDisabler {
    fn disable_packages(&self, names: &BTreeSet<String>, action: Action) -> BTreeSet<String> {
        let _guard = self.lock.lock();
        let mut ignored = self.set(IGNORED_PACKAGES_KEY);
        let mut in_process = self.set(IN_PROCESS_PACKAGES_KEY);

        // Packages disabled by a pending operation are ours to manage again;
        // ones the user disabled stay untouched.
        let user_disabled: BTreeSet<String> = ignored.difference(&in_process).cloned().collect();
        let affected: BTreeSet<String> = names.difference(&user_disabled).cloned().collect();

        match action {
            Action::Disable => {
                in_process.retain(|n| !names.contains(n));
            }
            Action::Install | Action::Remove | Action::Upgrade => {
                in_process.extend(affected.iter().cloned());
            }
            Action::Enable => {}
        }
        ignored.extend(affected.iter().cloned());

        self.store(IGNORED_PACKAGES_KEY, &ignored);
        self.store(IN_PROCESS_PACKAGES_KEY, &in_process);
        self.save();
        debug!(packages = ?affected, ?action, "disabled packages");
        affected
    }

    fn reenable_packages(&self, names: &BTreeSet<String>, action: Action) {
        let _guard = self.lock.lock();
        let mut ignored = self.set(IGNORED_PACKAGES_KEY);
        let mut in_process = self.set(IN_PROCESS_PACKAGES_KEY);

        let names: BTreeSet<String> = match action {
            Action::Install | Action::Upgrade | Action::Remove => {
                names.intersection(&in_process).cloned().collect()
            }
            Action::Disable | Action::Enable => names.clone(),
        };
        if names.is_empty() {
            return;
        }

        ignored.retain(|n| !names.contains(n));
        in_process.retain(|n| !names.contains(n));
        self.store(IGNORED_PACKAGES_KEY, &ignored);
        self.store(IN_PROCESS_PACKAGES_KEY, &in_process);
        self.save();
        debug!(packages = ?names, ?action, "re-enabled packages");
    }

    fn in_process_packages(&self) -> BTreeSet<String> {
        self.set(IN_PROCESS_PACKAGES_KEY)
    }

    fn clear_in_process(&self, keep: &BTreeSet<String>) {
        let _guard = self.lock.lock();
        let in_process = self.set(IN_PROCESS_PACKAGES_KEY);
        let remaining: BTreeSet<String> = in_process.intersection(keep).cloned().collect();
        if remaining != in_process {
            self.store(IN_PROCESS_PACKAGES_KEY, &remaining);
            self.save();
        }
    }
}

/// Keeps packages disabled while a destructive batch runs.
///
/// Dropping the guard re-enables everything it disabled, so early returns
/// and panics never strand a package. [`DisableGuard::finish`] is the
/// normal exit: it waits for the host to settle before re-enabling.
pub struct DisableGuard {
    disabler: Arc<dyn PackageDisabler>,
    action: Action,
    disabled: BTreeSet<String>,
    settle: Duration,
}

impl DisableGuard {
    pub async fn disable(
        disabler: Arc<dyn PackageDisabler>,
        names: &BTreeSet<String>,
        action: Action,
        settle: Duration,
    ) -> Self {
        let disabled = if names.is_empty() {
            BTreeSet::new()
        } else {
            disabler.disable_packages(names, action)
        };
        if !disabled.is_empty() && !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Self {
            disabler,
            action,
            disabled,
            settle,
        }
    }

    pub fn disabled(&self) -> &BTreeSet<String> {
        &self.disabled
    }

    /// Leave `name` disabled; its operation is still pending.
    pub fn exclude(&mut self, name: &str) {
        self.disabled.remove(name);
    }

    pub async fn finish(mut self) {
        if !self.disabled.is_empty() && !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        self.release();
    }

    fn release(&mut self) {
        let names = std::mem::take(&mut self.disabled);
        if !names.is_empty() {
            self.disabler.reenable_packages(&names, self.action);
        }
    }
}

impl Drop for DisableGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn disabler() -> (Arc<JsonSettings>, SettingsDisabler) {
        let settings = Arc::new(JsonSettings::in_memory());
        let disabler = SettingsDisabler::new(settings.clone());
        (settings, disabler)
    }

    #[test]
    fn test_user_disabled_packages_untouched() {
        let (settings, disabler) = disabler();
        settings.set_list(IGNORED_PACKAGES_KEY, vec!["Vintage".into()]);

        let affected = disabler.disable_packages(&names(&["A", "Vintage"]), Action::Remove);
        assert_eq!(affected, names(&["A"]));

        disabler.reenable_packages(&names(&["A", "Vintage"]), Action::Remove);
        assert_eq!(settings.get_list(IGNORED_PACKAGES_KEY), vec!["Vintage"]);
        assert!(settings.get_list(IN_PROCESS_PACKAGES_KEY).is_empty());
    }

    #[test]
    fn test_upgrade_tracks_only_affected() {
        let (settings, disabler) = disabler();
        settings.set_list(IGNORED_PACKAGES_KEY, vec!["B".into()]);
        disabler.disable_packages(&names(&["A", "B"]), Action::Upgrade);
        assert_eq!(disabler.in_process_packages(), names(&["A"]));
        assert_eq!(
            settings.get_list(IGNORED_PACKAGES_KEY),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[test]
    fn test_clear_in_process_keeps_pending() {
        let (_settings, disabler) = disabler();
        disabler.disable_packages(&names(&["A", "B"]), Action::Install);
        disabler.clear_in_process(&names(&["B"]));
        assert_eq!(disabler.in_process_packages(), names(&["B"]));
    }

    #[test]
    fn test_json_settings_persist() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_backup_age": 3}"#).unwrap();

        let settings = JsonSettings::open(&path).unwrap();
        settings.set_list(INSTALLED_PACKAGES_KEY, vec!["A".into(), "b".into()]);
        settings.save().unwrap();

        let reopened = JsonSettings::open(&path).unwrap();
        assert_eq!(reopened.get_list(INSTALLED_PACKAGES_KEY), vec!["A", "b"]);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["max_backup_age"], 3);
    }

    #[tokio::test]
    async fn test_guard_reenables_on_drop() {
        let (settings, disabler) = disabler();
        let disabler: Arc<dyn PackageDisabler> = Arc::new(disabler);
        {
            let guard = DisableGuard::disable(
                disabler.clone(),
                &names(&["A", "B"]),
                Action::Upgrade,
                Duration::ZERO,
            )
            .await;
            assert_eq!(guard.disabled(), &names(&["A", "B"]));
        }
        assert!(settings.get_list(IGNORED_PACKAGES_KEY).is_empty());
    }

    #[tokio::test]
    async fn test_guard_exclude_leaves_pending_disabled() {
        let (settings, disabler) = disabler();
        let disabler: Arc<dyn PackageDisabler> = Arc::new(disabler);
        let mut guard =
            DisableGuard::disable(disabler, &names(&["A", "B"]), Action::Upgrade, Duration::ZERO)
                .await;
        guard.exclude("B");
        guard.finish().await;
        assert_eq!(settings.get_list(IGNORED_PACKAGES_KEY), vec!["B"]);
        assert_eq!(settings.get_list(IN_PROCESS_PACKAGES_KEY), vec!["B"]);
    }
}
