//! The `installed_packages` registry.
//!
//! Operations stage their changes in memory; [`Registry::persist`] writes
//! them to the settings store in one call so concurrent installs never race
//! on the file.

use crate::error::Result;
use crate::host::{INSTALLED_PACKAGES_KEY, SettingsStore};
use crate::package_io::sort_case_insensitive;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

struct State {
    names: BTreeSet<String>,
    dirty: bool,
}

pub struct Registry {
    settings: Arc<dyn SettingsStore>,
    state: Mutex<State>,
}

impl Registry {
    pub fn load(settings: Arc<dyn SettingsStore>) -> Self {
        let names = settings.get_list(INSTALLED_PACKAGES_KEY).into_iter().collect();
        Self {
            settings,
            state: Mutex::new(State {
                names,
                dirty: false,
            }),
        }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.state.lock().names.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().names.contains(name)
    }

    /// Apply a delta without saving.
    pub fn stage(&self, add: Option<&str>, remove: Option<&str>) {
        let mut state = self.state.lock();
        let mut changed = false;
        if let Some(name) = remove {
            changed |= state.names.remove(name);
        }
        if let Some(name) = add {
            changed |= state.names.insert(name.to_string());
        }
        if changed {
            let mut sorted: Vec<String> = state.names.iter().cloned().collect();
            sort_case_insensitive(&mut sorted);
            self.settings.set_list(INSTALLED_PACKAGES_KEY, sorted);
            state.dirty = true;
            debug!(?add, ?remove, "staged registry change");
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Save staged changes, if any.
    pub fn persist(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        self.settings.save()?;
        state.dirty = false;
        Ok(())
    }
}
