//! Install, upgrade and removal orchestration.
//!
//! [`PackageManager`] drives every operation that changes installed content.
//! A package install walks through a fixed sequence of phases:
//!
//! ```text
//! Resolve -> LibDeps -> Download -> Extract -> Finalize
//! ```
//!
//! and ends in one of three [`Outcome`]s. `Failed` leaves the installed state
//! untouched. `Deferred` means the host held a file open: a sentinel was
//! written and the work resumes on the next startup sweep.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use stowage::catalog::StaticCatalog;
//! use stowage::config::Config;
//! use stowage::host::{JsonSettings, SettingsDisabler};
//! use stowage::layout::Layout;
//! use stowage::transport::HttpTransport;
//! use stowage::{Outcome, PackageManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layout = Layout::from_env();
//!     let config = Config::load(&layout.settings_file())?;
//!     let settings = Arc::new(JsonSettings::open(&layout.settings_file())?);
//!     let pm = PackageManager::new(
//!         layout,
//!         config.clone(),
//!         settings.clone(),
//!         Arc::new(StaticCatalog::load("catalog.json".as_ref())?),
//!         Arc::new(HttpTransport::new(std::time::Duration::from_secs(30))?),
//!         Arc::new(SettingsDisabler::new(settings)),
//!     );
//!
//!     pm.cleanup().await;
//!     match pm.install_package("Terminus").await {
//!         Outcome::Done => println!("installed"),
//!         Outcome::Deferred => println!("finishes after restart"),
//!         Outcome::Failed(e) => eprintln!("{e}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Operations on one package name never overlap; different names may run
//! in parallel. The startup sweep holds an exclusive gate, so no operation
//! starts until it has finished reconciling the previous session.

use crate::archive::{PackageArchive, create_package_file};
use crate::backup::backup_package_dir;
use crate::catalog::{
    AvailableLibraries, AvailablePackages, CatalogProvider, LibraryInfo, PackageInfo, Release,
    renamed_packages,
};
use crate::config::Config;
use crate::error::{Result, StowageError, is_lock_error};
use crate::fsops::{
    FileSystem, OsFileSystem, clear_directory, create_empty_file, delete_directory,
};
use crate::host::{Action, DisableGuard, PackageDisabler, SettingsStore};
use crate::layout::{Layout, PACKAGE_EXTENSION};
use crate::library::{self, DistInfo, InstalledLibrary};
use crate::messages::release_notes;
use crate::metadata::{
    DEPENDENCIES_FILE, METADATA_FILE, PackageMetadata, now_timestamp, parse_dependencies,
};
use crate::package_io::{
    CLEANUP_SENTINEL, HIDDEN_PACKAGE_MARKER, NO_PACKAGE_FILE_MARKER, PYTHON_VERSION_FILE,
    REINSTALL_SENTINEL, is_reserved, list_package_dirs, list_package_files, read_package_file,
    regular_file_exists, sort_case_insensitive,
};
use crate::platform::HostInfo;
use crate::registry::Registry;
use crate::resolver::{
    LibraryRef, missing_libraries, normalize_name, orphaned_libraries, select_libraries,
};
use crate::transport::Transport;
use crate::usage::{self, Operation, UsageEvent};
use crate::version::PackageVersion;
use futures::future::{BoxFuture, FutureExt, join_all};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Result of one package or library operation.
#[derive(Debug)]
pub enum Outcome {
    Done,
    Failed(StowageError),
    /// Partially applied; resumes on the next startup sweep.
    Deferred,
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn error(&self) -> Option<&StowageError> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Host locks defer; everything else fails.
    fn from_error(err: StowageError) -> Self {
        if err.is_locked() {
            Outcome::Deferred
        } else {
            Outcome::Failed(err)
        }
    }
}

/// Early exit from an install sequence.
enum Halt {
    Failed(StowageError),
    Deferred,
}

impl From<StowageError> for Halt {
    fn from(err: StowageError) -> Self {
        Halt::Failed(err)
    }
}

type Step<T> = std::result::Result<T, Halt>;

impl From<Step<()>> for Outcome {
    fn from(step: Step<()>) -> Self {
        match step {
            Ok(()) => Outcome::Done,
            Err(Halt::Failed(e)) => Outcome::Failed(e),
            Err(Halt::Deferred) => Outcome::Deferred,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Resolve,
    LibDeps,
    Download,
    Extract,
    Finalize,
}

/// An installed package with a newer compatible release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedPackage {
    pub name: String,
    pub installed: String,
    pub latest: String,
}

/// Everything resolved about one package install before files change.
struct InstallPlan<'a> {
    name: String,
    old_name: String,
    info: &'a PackageInfo,
    release: &'a Release,
    old_metadata: PackageMetadata,
    is_upgrade: bool,
    python_version: String,
}

pub struct PackageManager {
    layout: Layout,
    config: Config,
    host: HostInfo,
    catalog: Arc<dyn CatalogProvider>,
    transport: Arc<dyn Transport>,
    fs_ops: Arc<dyn FileSystem>,
    disabler: Arc<dyn PackageDisabler>,
    registry: Registry,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    gate: RwLock<()>,
    notes: Mutex<Vec<String>>,
}

impl PackageManager {
    pub fn new(
        layout: Layout,
        config: Config,
        settings: Arc<dyn SettingsStore>,
        catalog: Arc<dyn CatalogProvider>,
        transport: Arc<dyn Transport>,
        disabler: Arc<dyn PackageDisabler>,
    ) -> Self {
        let host = config.host();
        Self {
            layout,
            config,
            host,
            catalog,
            transport,
            fs_ops: Arc::new(OsFileSystem),
            disabler,
            registry: Registry::load(settings),
            locks: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
            notes: Mutex::new(Vec::new()),
        }
    }

    /// Route destructive file operations through `fs_ops`.
    pub fn with_file_system(mut self, fs_ops: Arc<dyn FileSystem>) -> Self {
        self.fs_ops = fs_ops;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn disabler(&self) -> &Arc<dyn PackageDisabler> {
        &self.disabler
    }

    pub(crate) fn fs_ops(&self) -> &dyn FileSystem {
        &*self.fs_ops
    }

    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Release notes gathered since the last call.
    pub fn take_release_notes(&self) -> Vec<String> {
        std::mem::take(&mut *self.notes.lock())
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(key.to_lowercase())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Lock several names, always in sorted key order.
    async fn lock_names(&self, names: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock_for(&key).lock_owned().await);
        }
        guards
    }

    pub fn persist_registry(&self) {
        if let Err(e) = self.registry.persist() {
            warn!(error = %e, "failed to save installed packages");
        }
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    pub fn available_packages(&self) -> AvailablePackages {
        AvailablePackages::build(&*self.catalog, &self.host, &self.config)
    }

    pub fn available_libraries(&self, python_version: &str) -> AvailableLibraries {
        AvailableLibraries::build(&*self.catalog, &self.host, &self.config, python_version)
    }

    /// Installed package names, excluding the host's own packages.
    pub fn list_packages(&self, unpacked_only: bool) -> Vec<String> {
        let mut names: BTreeSet<String> =
            list_package_dirs(&self.layout.packages_dir()).into_iter().collect();
        if !unpacked_only {
            names.extend(list_package_files(&self.layout.installed_packages_dir()));
        }
        let mut names: Vec<String> = names.into_iter().filter(|n| !is_reserved(n)).collect();
        sort_case_insensitive(&mut names);
        names
    }

    pub fn list_libraries(&self) -> BTreeSet<LibraryRef> {
        library::list_all(&self.layout, &self.config.python_versions)
    }

    /// Metadata of an installed package; empty when absent or unreadable.
    pub fn get_metadata(&self, name: &str) -> PackageMetadata {
        let Some(json) = read_package_file(&self.layout, name, METADATA_FILE) else {
            return PackageMetadata::default();
        };
        let path = self.layout.package_dir(name).join(METADATA_FILE);
        PackageMetadata::parse(&path, &json).unwrap_or_else(|e| {
            warn!(package = name, error = %e, "ignoring unreadable metadata");
            PackageMetadata::default()
        })
    }

    /// Runtime tag the package opted into, or the default one.
    pub fn get_python_version(&self, name: &str) -> String {
        read_package_file(&self.layout, name, PYTHON_VERSION_FILE)
            .map(|raw| raw.trim().to_string())
            .filter(|v| self.config.supports_python(v))
            .unwrap_or_else(|| self.config.default_python_version().to_string())
    }

    /// Libraries an installed package needs on this host.
    pub fn get_libraries(&self, name: &str) -> BTreeSet<LibraryRef> {
        let python_version = self.get_python_version(name);
        let mut names = self.get_metadata(name).libraries;
        if names.is_empty() {
            names = read_package_file(&self.layout, name, DEPENDENCIES_FILE)
                .and_then(|json| {
                    let path = self.layout.package_dir(name).join(DEPENDENCIES_FILE);
                    parse_dependencies(&path, &json)
                        .map_err(|e| warn!(package = name, error = %e, "ignoring dependencies"))
                        .ok()
                })
                .map(|manifest| select_libraries(&manifest, &self.host))
                .unwrap_or_default();
        }
        names
            .into_iter()
            .map(|lib| LibraryRef::new(lib, python_version.clone()))
            .collect()
    }

    /// Libraries needed by every installed package, optionally ignoring one.
    pub fn find_required_libraries(&self, ignore_package: Option<&str>) -> BTreeSet<LibraryRef> {
        self.list_packages(false)
            .iter()
            .filter(|name| Some(name.as_str()) != ignore_package)
            .flat_map(|name| self.get_libraries(name))
            .collect()
    }

    pub fn find_missing_libraries(&self, required: &BTreeSet<LibraryRef>) -> BTreeSet<LibraryRef> {
        missing_libraries(required, &self.list_libraries())
    }

    pub fn find_orphaned_libraries(
        &self,
        required: &BTreeSet<LibraryRef>,
    ) -> BTreeSet<LibraryRef> {
        let unmanaged = library::list_unmanaged(&self.layout, &self.config.python_versions);
        orphaned_libraries(&self.list_libraries(), required, &unmanaged)
    }

    /// Installed packages whose catalog entry has a newer release.
    pub fn list_outdated(&self) -> Vec<OutdatedPackage> {
        let available = self.available_packages();
        self.list_packages(false)
            .into_iter()
            .filter_map(|name| {
                let installed = self.get_metadata(&name).version?;
                let current = PackageVersion::parse(&installed).ok()?;
                let latest = available.get(&name)?.releases.first()?;
                (latest.version > current).then(|| OutdatedPackage {
                    name,
                    installed,
                    latest: latest.version.to_string(),
                })
            })
            .collect()
    }

    // ----------------------------------------------------------------------
    // Package operations
    // ----------------------------------------------------------------------

    /// Install `name`, or upgrade it when a newer release exists.
    pub async fn install_package(&self, name: &str) -> Outcome {
        let _gate = self.gate.read().await;
        let outcome = self.install_ungated(name, false).await;
        self.persist_registry();
        outcome
    }

    /// Install `name` even when the installed version is current.
    pub async fn reinstall_package(&self, name: &str) -> Outcome {
        let _gate = self.gate.read().await;
        let outcome = self.install_ungated(name, true).await;
        self.persist_registry();
        outcome
    }

    pub async fn upgrade_package(&self, name: &str) -> Outcome {
        let _gate = self.gate.read().await;
        if !self.is_present(name) {
            return Outcome::Failed(StowageError::NotInstalled(name.to_string()));
        }
        let outcome = self.install_ungated(name, false).await;
        self.persist_registry();
        outcome
    }

    /// Install several packages while they are disabled in the host.
    pub async fn install_packages(&self, names: &[String]) -> Vec<(String, Outcome)> {
        self.run_batch(names, Action::Install, |name| {
            self.install_ungated(name, false).boxed()
        })
        .await
    }

    pub async fn reinstall_packages(&self, names: &[String]) -> Vec<(String, Outcome)> {
        self.run_batch(names, Action::Upgrade, |name| {
            self.install_ungated(name, true).boxed()
        })
        .await
    }

    /// Upgrade the named packages, or every outdated one when `names` is empty.
    pub async fn upgrade_packages(&self, names: &[String]) -> Vec<(String, Outcome)> {
        let targets: Vec<String> = if names.is_empty() {
            self.list_outdated().into_iter().map(|p| p.name).collect()
        } else {
            names.to_vec()
        };
        self.run_batch(&targets, Action::Upgrade, |name| {
            async move {
                if self.is_present(name) {
                    self.install_ungated(name, false).await
                } else {
                    Outcome::Failed(StowageError::NotInstalled(name.to_string()))
                }
            }
            .boxed()
        })
        .await
    }

    pub async fn remove_packages(&self, names: &[String]) -> Vec<(String, Outcome)> {
        self.run_batch(names, Action::Remove, |name| self.remove_ungated(name).boxed())
            .await
    }

    async fn run_batch<'a, F>(
        &'a self,
        names: &'a [String],
        action: Action,
        op: F,
    ) -> Vec<(String, Outcome)>
    where
        F: Fn(&'a str) -> BoxFuture<'a, Outcome>,
    {
        if names.is_empty() {
            return Vec::new();
        }
        let _gate = self.gate.read().await;
        let targets: BTreeSet<String> = names.iter().cloned().collect();
        let mut guard = DisableGuard::disable(
            self.disabler.clone(),
            &targets,
            action,
            self.config.settle_delay(),
        )
        .await;

        let outcomes = join_all(names.iter().map(|name| op(name.as_str()))).await;
        let results: Vec<(String, Outcome)> = names.iter().cloned().zip(outcomes).collect();

        for (name, outcome) in &results {
            if outcome.is_deferred() {
                guard.exclude(name);
            }
        }
        self.persist_registry();
        guard.finish().await;
        results
    }

    pub(crate) async fn install_ungated(&self, name: &str, force: bool) -> Outcome {
        // A rename touches both directories.
        let target = self.resolve_name(name);
        let _held = self.lock_names(&[name, target.as_str()]).await;
        let outcome: Outcome = self.run_install(name, force).await.into();
        match &outcome {
            Outcome::Failed(e) => warn!(package = name, error = %e, "install failed"),
            Outcome::Deferred => {
                warn!(package = name, "install deferred until next start")
            }
            Outcome::Done => {}
        }
        outcome
    }

    fn is_present(&self, name: &str) -> bool {
        self.layout.package_dir(name).is_dir() || self.layout.package_file(name).is_file()
    }

    pub(crate) fn has_pending_work(&self, name: &str) -> bool {
        let dir = self.layout.package_dir(name);
        dir.join(REINSTALL_SENTINEL).exists()
            || dir.join(CLEANUP_SENTINEL).exists()
            || self.layout.pending_package_file(name).exists()
    }

    /// Name a package is installed under after catalog renames.
    fn resolve_name(&self, requested: &str) -> String {
        renamed_packages(&*self.catalog, &self.config)
            .remove(requested)
            .unwrap_or_else(|| requested.to_string())
    }

    async fn run_install(&self, requested: &str, force: bool) -> Step<()> {
        debug!(package = requested, phase = ?Phase::Resolve);
        let name = self.resolve_name(requested);

        if is_reserved(&name) {
            return Err(StowageError::Protected {
                name,
                reason: "reserved by the host".to_string(),
            }
            .into());
        }

        let available = self.available_packages();
        let Some(info) = available.get(&name) else {
            let reason = if available.unavailable.contains(&name) {
                "no release for this platform or host version"
            } else {
                "not found in any repository"
            };
            return Err(StowageError::NotAvailable {
                name,
                reason: reason.to_string(),
            }
            .into());
        };
        let Some(release) = info.releases.first() else {
            return Err(StowageError::NotAvailable {
                name,
                reason: "no releases".to_string(),
            }
            .into());
        };

        let old_metadata = self.get_metadata(requested);
        let is_upgrade = old_metadata.version.is_some();

        if !force && name == requested && self.is_current(&name, &old_metadata, release) {
            debug!(package = %name, version = %release.version, "already up to date");
            self.registry.stage(Some(&name), None);
            return Ok(());
        }

        let mut plan = InstallPlan {
            python_version: self.tentative_python_version(release, requested),
            name,
            old_name: requested.to_string(),
            info,
            release,
            old_metadata,
            is_upgrade,
        };

        debug!(package = %plan.name, phase = ?Phase::LibDeps);
        if !release.libraries.is_empty() {
            self.install_library_names(&release.libraries, &plan.python_version)
                .await;
        }

        let temp_root = self.layout.temp_dir();
        fs::create_dir_all(&temp_root).map_err(|e| StowageError::io(&temp_root, e))?;
        let tmp = tempfile::Builder::new()
            .prefix("install-")
            .tempdir_in(&temp_root)
            .map_err(|e| StowageError::io(&temp_root, e))?;

        let result = self.apply_release(&mut plan, tmp.path()).await;
        self.schedule_temp_cleanup(tmp);
        result
    }

    fn is_current(&self, name: &str, metadata: &PackageMetadata, release: &Release) -> bool {
        let installed = metadata
            .version
            .as_deref()
            .and_then(|v| PackageVersion::parse(v).ok());
        installed.as_ref() == Some(&release.version)
            && self.is_present(name)
            && !self.has_pending_work(name)
    }

    async fn apply_release(&self, plan: &mut InstallPlan<'_>, tmp_dir: &Path) -> Step<()> {
        let name = plan.name.clone();

        debug!(package = %name, phase = ?Phase::Download, url = %plan.release.url);
        let bytes = self.transport.get(&plan.release.url).await?;
        let archive_path = tmp_dir.join(format!("{name}{PACKAGE_EXTENSION}.download"));
        fs::write(&archive_path, &bytes).map_err(|e| StowageError::io(&archive_path, e))?;
        let mut archive = PackageArchive::open(&name, &archive_path)?;
        let common = archive.common_folder()?;
        let unpack = archive.contains(&format!("{common}{NO_PACKAGE_FILE_MARKER}"));

        debug!(package = %name, phase = ?Phase::LibDeps);
        let tentative = plan.python_version.clone();
        plan.python_version = self.archive_python_version(&mut archive, &common, plan, unpack);
        let library_names = if plan.release.libraries.is_empty() {
            self.archive_libraries(&name, &mut archive, &common)
        } else {
            plan.release.libraries.clone()
        };
        if !library_names.is_empty()
            && (plan.release.libraries.is_empty() || plan.python_version != tentative)
        {
            self.install_library_names(&library_names, &plan.python_version)
                .await;
        }

        if name != plan.old_name {
            if let Err(e) = self.rename_package(&plan.old_name, &name) {
                warn!(from = %plan.old_name, to = %name, error = %e, "rename failed");
            }
        }

        debug!(package = %name, phase = ?Phase::Extract, unpack);
        let package_dir = self.layout.package_dir(&name);
        let target_dir = if unpack {
            if regular_file_exists(&self.layout, &name, HIDDEN_PACKAGE_MARKER) {
                return Err(StowageError::Protected {
                    name,
                    reason: "an unmanaged unpacked override exists".to_string(),
                }
                .into());
            }
            backup_package_dir(&self.layout, &name)?;
            package_dir.clone()
        } else {
            if regular_file_exists(&self.layout, &name, METADATA_FILE) {
                // Switching from unpacked to packed: the old directory goes.
                backup_package_dir(&self.layout, &name)?;
                if !delete_directory(&*self.fs_ops, &package_dir, &self.layout.trash_dir()) {
                    self.write_sentinel(&package_dir, REINSTALL_SENTINEL);
                    return Err(Halt::Deferred);
                }
            }
            tmp_dir.join("working")
        };
        fs::create_dir_all(&target_dir).map_err(|e| StowageError::io(&target_dir, e))?;

        let extraction = archive.extract(&target_dir, &common, &*self.fs_ops)?;
        drop(archive);

        if extraction.retry {
            self.write_sentinel(&package_dir, REINSTALL_SENTINEL);
            return Err(Halt::Deferred);
        }

        debug!(package = %name, phase = ?Phase::Finalize);
        if !clear_directory(
            &*self.fs_ops,
            &target_dir,
            &extraction.paths,
            &self.layout.trash_dir(),
        ) {
            debug!(package = %name, "stale files left for the next upgrade");
        }

        if plan.python_version != self.config.default_python_version() {
            write_python_version(&target_dir, &plan.python_version);
        }

        let old_version = plan.old_metadata.version.clone();
        let previous = old_version
            .as_deref()
            .and_then(|v| PackageVersion::parse(v).ok());
        if let Some(notes) =
            release_notes(&target_dir, &name, previous.as_ref(), &plan.release.version)
        {
            info!(package = %name, "{notes}");
            self.notes.lock().push(notes);
        }

        let now = now_timestamp();
        let metadata = PackageMetadata {
            version: Some(plan.release.version.to_string()),
            install_time: Some(plan.old_metadata.install_time.unwrap_or(now)),
            upgrade_time: plan.is_upgrade.then_some(now),
            sublime_text: Some(plan.release.sublime_text.clone()),
            platforms: plan.release.platforms.clone(),
            url: plan.info.homepage.clone(),
            description: plan.info.description.clone(),
            libraries: library_names,
        };
        metadata.write(&target_dir)?;

        let (operation, old) = if plan.is_upgrade {
            (Operation::Upgrade, old_version.as_deref())
        } else {
            (Operation::Install, None)
        };
        let event = UsageEvent::new(&name, operation, metadata.version.as_deref())
            .with_old_version(old);
        usage::record(&event, &self.config, &self.host, &*self.transport).await;

        let renamed_from = (name != plan.old_name).then_some(plan.old_name.as_str());
        self.registry.stage(Some(&name), renamed_from);

        let package_file = self.layout.package_file(&name);
        if unpack {
            match self.fs_ops.remove_file(&package_file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    package = %name,
                    error = %e,
                    "unable to remove package file after switching to unpacked"
                ),
            }
        } else {
            let packed = tmp_dir.join(format!("{name}{PACKAGE_EXTENSION}"));
            create_package_file(&target_dir, &packed)?;
            if let Err(e) = self.swap_package_file(&packed, &package_file) {
                warn!(package = %name, error = %e, "package file in use");
                let pending = self.layout.pending_package_file(&name);
                if let Err(e) = move_file(&*self.fs_ops, &packed, &pending) {
                    warn!(path = %pending.display(), error = %e, "unable to stage new package file");
                }
                return Err(Halt::Deferred);
            }
            // A deferred packed install leaves only its sentinel behind.
            match fs::remove_file(package_dir.join(REINSTALL_SENTINEL)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(package = %name, error = %e, "unable to remove reinstall sentinel"),
            }
            remove_if_empty(&package_dir);
        }

        if plan.is_upgrade {
            info!(package = %name, version = %plan.release.version, "upgraded");
        } else {
            info!(package = %name, version = %plan.release.version, "installed");
        }
        Ok(())
    }

    fn swap_package_file(&self, packed: &Path, package_file: &Path) -> io::Result<()> {
        match self.fs_ops.remove_file(package_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        move_file(&*self.fs_ops, packed, package_file)
    }

    fn write_sentinel(&self, package_dir: &Path, sentinel: &str) {
        if let Err(e) = create_empty_file(&package_dir.join(sentinel)) {
            warn!(path = %package_dir.display(), error = %e, "unable to write sentinel");
        }
    }

    fn schedule_temp_cleanup(&self, tmp: tempfile::TempDir) {
        let delay = self.config.temp_cleanup_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tmp.close() {
                debug!(error = %e, "temporary directory left behind");
            }
        });
    }

    /// Highest runtime tag both the release and this engine support.
    fn release_python_version(&self, release: &Release) -> Option<String> {
        release
            .python_versions
            .iter()
            .filter(|v| self.config.supports_python(v))
            .filter_map(|v| PackageVersion::parse(v).ok().map(|parsed| (parsed, v)))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, v)| v.clone())
    }

    fn local_python_version(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.layout.package_dir(name).join(PYTHON_VERSION_FILE))
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|v| self.config.supports_python(v))
    }

    /// Runtime tag known before the archive is downloaded.
    fn tentative_python_version(&self, release: &Release, name: &str) -> String {
        let base = self
            .release_python_version(release)
            .unwrap_or_else(|| self.config.default_python_version().to_string());
        match self.local_python_version(name) {
            Some(local) if is_higher(&local, &base) => local,
            _ => base,
        }
    }

    fn archive_python_version<R: io::Read + io::Seek>(
        &self,
        archive: &mut PackageArchive<R>,
        common: &str,
        plan: &InstallPlan<'_>,
        unpack: bool,
    ) -> String {
        let from_archive = archive
            .read_string(&format!("{common}{PYTHON_VERSION_FILE}"))
            .ok()
            .flatten()
            .map(|raw| raw.trim().to_string());

        let base = match from_archive {
            Some(v) if self.config.supports_python(&v) => v,
            Some(_) => self.config.default_python_version().to_string(),
            None => self
                .release_python_version(plan.release)
                .unwrap_or_else(|| self.config.default_python_version().to_string()),
        };

        match self.local_python_version(&plan.old_name) {
            Some(local) if unpack || is_higher(&local, &base) => local,
            _ => base,
        }
    }

    fn archive_libraries<R: io::Read + io::Seek>(
        &self,
        name: &str,
        archive: &mut PackageArchive<R>,
        common: &str,
    ) -> Vec<String> {
        let entry = format!("{common}{DEPENDENCIES_FILE}");
        let json = match archive.read_string(&entry) {
            Ok(Some(json)) => json,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(package = name, error = %e, "unreadable dependencies.json");
                return Vec::new();
            }
        };
        match parse_dependencies(Path::new(&entry), &json) {
            Ok(manifest) => select_libraries(&manifest, &self.host),
            Err(e) => {
                warn!(package = name, error = %e, "ignoring dependencies.json");
                Vec::new()
            }
        }
    }

    async fn install_library_names(&self, names: &[String], python_version: &str) {
        let libs: Vec<LibraryRef> = names
            .iter()
            .map(|n| LibraryRef::new(n.clone(), python_version))
            .collect();
        if !self.install_libraries(&libs, false).await {
            warn!(python = python_version, "some libraries failed to install");
        }
    }

    /// Rename an installed package on disk.
    pub fn rename_package(&self, old: &str, new: &str) -> Result<()> {
        if old.eq_ignore_ascii_case("user") || new.eq_ignore_ascii_case("user") {
            return Err(StowageError::Protected {
                name: old.to_string(),
                reason: "cannot be renamed".to_string(),
            });
        }
        let changing_case =
            self.host.has_case_insensitive_fs() && old.to_lowercase() == new.to_lowercase();

        let old_file = self.layout.package_file(old);
        let new_file = self.layout.package_file(new);
        if old_file.is_file() {
            if new_file.exists() && !changing_case {
                if let Err(e) = self.fs_ops.remove_file(&old_file) {
                    warn!(path = %old_file.display(), error = %e, "unable to remove renamed package file");
                }
            } else {
                self.rename_path(&old_file, &new_file, new, changing_case)?;
            }
        }

        let old_dir = self.layout.package_dir(old);
        let new_dir = self.layout.package_dir(new);
        if old_dir.is_dir() {
            if new_dir.exists() && !changing_case {
                backup_package_dir(&self.layout, old)?;
                if !delete_directory(&*self.fs_ops, &old_dir, &self.layout.trash_dir()) {
                    self.write_sentinel(&old_dir, CLEANUP_SENTINEL);
                }
            } else {
                self.rename_path(&old_dir, &new_dir, new, changing_case)?;
            }
        }

        delete_directory(
            &*self.fs_ops,
            &self.layout.package_cache_dir(old),
            &self.layout.trash_dir(),
        );
        info!(from = old, to = new, "renamed package");
        Ok(())
    }

    /// Case-only renames go through a temporary name.
    fn rename_path(&self, from: &Path, to: &Path, new: &str, changing_case: bool) -> Result<()> {
        let mut source = from.to_path_buf();
        if changing_case {
            let temp = self.layout.root().join(format!("__{new}"));
            self.fs_ops
                .rename(&source, &temp)
                .map_err(|e| StowageError::io(&source, e))?;
            source = temp;
        }
        self.fs_ops
            .rename(&source, to)
            .map_err(|e| StowageError::io(to, e))
    }

    /// Remove `name` from the registry and from disk, then release
    /// libraries nothing needs anymore.
    pub async fn remove_package(&self, name: &str) -> Outcome {
        let _gate = self.gate.read().await;
        let outcome = self.remove_ungated(name).await;
        self.persist_registry();
        outcome
    }

    async fn remove_ungated(&self, name: &str) -> Outcome {
        let lock = self.lock_for(name);
        let _held = lock.lock().await;

        if is_reserved(name) {
            return Outcome::Failed(StowageError::Protected {
                name: name.to_string(),
                reason: "reserved by the host".to_string(),
            });
        }
        if !self.is_present(name) {
            return Outcome::Failed(StowageError::NotInstalled(name.to_string()));
        }

        let old_version = self.get_metadata(name).version;
        self.registry.stage(None, Some(name));

        let outcome = self.delete_files(name);
        if outcome.is_failed() {
            return outcome;
        }

        let event = UsageEvent::new(name, Operation::Remove, old_version.as_deref());
        usage::record(&event, &self.config, &self.host, &*self.transport).await;

        if !self.cleanup_libraries(Some(name)) {
            warn!(package = name, "some unneeded libraries could not be removed");
        }
        outcome
    }

    /// Delete a package's files without touching the registry.
    pub async fn delete_package(&self, name: &str) -> Outcome {
        let _gate = self.gate.read().await;
        self.delete_ungated(name).await
    }

    pub(crate) async fn delete_ungated(&self, name: &str) -> Outcome {
        let lock = self.lock_for(name);
        let _held = lock.lock().await;
        self.delete_files(name)
    }

    fn delete_files(&self, name: &str) -> Outcome {
        if name.eq_ignore_ascii_case("user") {
            return Outcome::Failed(StowageError::Protected {
                name: name.to_string(),
                reason: "cannot be removed".to_string(),
            });
        }

        let package_file = self.layout.package_file(name);
        let package_dir = self.layout.package_dir(name);
        let has_file = package_file.exists();
        let has_dir = package_dir.exists();
        if !has_file && !has_dir {
            return Outcome::Failed(StowageError::NotInstalled(name.to_string()));
        }

        let mut outcome = Outcome::Done;
        if has_file {
            if let Err(e) = self.fs_ops.remove_file(&package_file) {
                debug!(package = name, error = %e, "package file in use");
                outcome = Outcome::Deferred;
            }
        }

        if has_dir {
            if let Err(e) = backup_package_dir(&self.layout, name) {
                warn!(package = name, error = %e, "backup failed; directory kept");
                return Outcome::Failed(e);
            }
            if !delete_directory(&*self.fs_ops, &package_dir, &self.layout.trash_dir()) {
                self.write_sentinel(&package_dir, CLEANUP_SENTINEL);
                outcome = Outcome::Deferred;
            }
        }

        delete_directory(
            &*self.fs_ops,
            &self.layout.package_cache_dir(name),
            &self.layout.trash_dir(),
        );

        if outcome.is_deferred() {
            info!(package = name, "removed; cleanup finishes on next start");
        } else {
            info!(package = name, "removed");
        }
        outcome
    }

    // ----------------------------------------------------------------------
    // Library operations
    // ----------------------------------------------------------------------

    /// Install libraries one by one. With `fail_early`, stop at the first
    /// failure. Returns whether every library ended up installed.
    pub async fn install_libraries(&self, libs: &[LibraryRef], fail_early: bool) -> bool {
        let mut all_ok = true;
        for lib in libs {
            if !self.install_library(lib).await.is_done() {
                all_ok = false;
                if fail_early {
                    break;
                }
            }
        }
        all_ok
    }

    /// Install or upgrade one library and its own dependencies.
    pub async fn install_library(&self, lib: &LibraryRef) -> Outcome {
        let mut visiting = HashSet::new();
        visiting.insert(lib.clone());
        let outcome = self.install_library_tree(lib.clone(), &mut visiting).await;
        match &outcome {
            Outcome::Failed(e) => warn!(library = %lib, error = %e, "library install failed"),
            Outcome::Deferred => warn!(library = %lib, "library files in use; deferring"),
            Outcome::Done => {}
        }
        outcome
    }

    fn install_library_tree<'a>(
        &'a self,
        lib: LibraryRef,
        visiting: &'a mut HashSet<LibraryRef>,
    ) -> BoxFuture<'a, Outcome> {
        async move {
            match self.run_library_install(&lib, visiting).await {
                Ok(()) => Outcome::Done,
                Err(e) => Outcome::from_error(e),
            }
        }
        .boxed()
    }

    async fn run_library_install(
        &self,
        lib: &LibraryRef,
        visiting: &mut HashSet<LibraryRef>,
    ) -> Result<()> {
        let installed = library::find_installed(&self.layout, lib);
        let installed_version = installed
            .as_ref()
            .and_then(InstalledLibrary::version)
            .and_then(|v| PackageVersion::parse(&v).ok());

        let available = self.available_libraries(&lib.python_version);
        let wanted = lib.normalized_name();
        let info = available
            .libraries
            .values()
            .find(|info| normalize_name(&info.name) == wanted)
            .ok_or_else(|| StowageError::NotAvailable {
                name: lib.name.clone(),
                reason: format!("no release for python {}", lib.python_version),
            })?;
        let release = info.releases.first().ok_or_else(|| StowageError::NotAvailable {
            name: lib.name.clone(),
            reason: "no releases".to_string(),
        })?;

        if let Some(current) = &installed_version {
            if *current >= release.version {
                debug!(library = %lib, version = %current, "library up to date");
                return Ok(());
            }
        }
        if let Some(installed) = &installed {
            refuse_modified(lib, installed)?;
        }

        let temp_root = self.layout.temp_dir();
        fs::create_dir_all(&temp_root).map_err(|e| StowageError::io(&temp_root, e))?;
        let tmp = tempfile::Builder::new()
            .prefix("library-")
            .tempdir_in(&temp_root)
            .map_err(|e| StowageError::io(&temp_root, e))?;
        let result = self
            .apply_library_release(lib, info, release, tmp.path(), visiting)
            .await;
        self.schedule_temp_cleanup(tmp);
        result
    }

    async fn apply_library_release(
        &self,
        lib: &LibraryRef,
        info: &LibraryInfo,
        release: &Release,
        tmp_dir: &Path,
        visiting: &mut HashSet<LibraryRef>,
    ) -> Result<()> {
        let bytes = self.transport.get(&release.url).await?;
        let archive_path = tmp_dir.join("download.zip");
        fs::write(&archive_path, &bytes).map_err(|e| StowageError::io(&archive_path, e))?;
        let mut archive = PackageArchive::open(&lib.name, &archive_path)?;
        let common = archive.common_folder()?;

        let dependency_names = if release.libraries.is_empty() {
            self.archive_libraries(&lib.name, &mut archive, &common)
        } else {
            release.libraries.clone()
        };
        for dep in dependency_names {
            let dep = LibraryRef::new(dep, lib.python_version.clone());
            if !visiting.insert(dep.clone()) {
                continue;
            }
            let outcome = self.install_library_tree(dep.clone(), visiting).await;
            if let Outcome::Failed(e) = outcome {
                warn!(library = %dep, required_by = %lib, error = %e, "dependency failed");
            }
        }

        let lock = self.lock_for(&format!("lib:{}:{}", lib.normalized_name(), lib.python_version));
        let _held = lock.lock().await;

        // Another task may have finished the same upgrade meanwhile.
        let installed = library::find_installed(&self.layout, lib);
        let current = installed
            .as_ref()
            .and_then(InstalledLibrary::version)
            .and_then(|v| PackageVersion::parse(&v).ok());
        if current.is_some_and(|v| v >= release.version) {
            return Ok(());
        }

        let extract_dir = tmp_dir.join(&lib.name);
        fs::create_dir_all(&extract_dir).map_err(|e| StowageError::io(&extract_dir, e))?;
        let extraction = archive.extract(&extract_dir, &common, &*self.fs_ops)?;
        drop(archive);
        if extraction.retry {
            return Err(StowageError::io(
                &extract_dir,
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }

        let staged = match find_wheel_dist_info(&extract_dir, lib) {
            Some(did) => {
                let (_, modified) = did.verify_files()?;
                if !modified.is_empty() {
                    return Err(StowageError::ArchiveIntegrity {
                        name: lib.name.clone(),
                        paths: modified.into_iter().map(|r| r.relative_path).collect(),
                    });
                }
                did.verify_python_version(&lib.python_version)?;
                did.write_installer()?;
                did
            }
            None => library::convert_dependency(
                &extract_dir,
                &tmp_dir.join("staging"),
                &lib.python_version,
                &self.host,
                &info.name,
                release.version.as_str(),
                &info.description,
                &info.homepage,
            )?,
        };

        let trash = self.layout.trash_dir();
        if let Some(old) = &installed {
            library::remove(&*self.fs_ops, old, &trash)?;
        }
        library::install(&staged, &self.layout.lib_dir(&lib.python_version), &trash)?;

        if installed.is_some() {
            info!(library = %lib, version = %release.version, "upgraded library");
        } else {
            info!(library = %lib, version = %release.version, "installed library");
        }
        Ok(())
    }

    pub fn remove_library(&self, lib: &LibraryRef) -> Outcome {
        let Some(installed) = library::find_installed(&self.layout, lib) else {
            return Outcome::Failed(StowageError::NotInstalled(lib.to_string()));
        };
        if !installed.dist_info.is_managed() {
            return Outcome::Failed(StowageError::Protected {
                name: lib.name.clone(),
                reason: "installed by another tool".to_string(),
            });
        }
        match library::remove(&*self.fs_ops, &installed, &self.layout.trash_dir()) {
            Ok(()) => {
                info!(library = %lib, "removed unneeded library");
                Outcome::Done
            }
            Err(e) => Outcome::from_error(e),
        }
    }

    /// Remove libraries no installed package needs.
    pub fn cleanup_libraries(&self, ignore_package: Option<&str>) -> bool {
        let required = self.find_required_libraries(ignore_package);
        let mut all_removed = true;
        for lib in self.find_orphaned_libraries(&required) {
            let outcome = self.remove_library(&lib);
            if !outcome.is_done() {
                warn!(library = %lib, "unable to remove unneeded library");
                all_removed = false;
            }
        }
        all_removed
    }
}

fn refuse_modified(lib: &LibraryRef, installed: &InstalledLibrary) -> Result<()> {
    let (_, modified) = installed.dist_info.verify_files()?;
    if modified.is_empty() {
        return Ok(());
    }
    let mut paths: Vec<PathBuf> = modified
        .into_iter()
        .map(|r| installed.dist_info.root.join(r.relative_path))
        .collect();
    paths.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    Err(StowageError::UserModification {
        name: lib.name.clone(),
        paths,
    })
}

/// A wheel's dist-info among the extracted top-level directories.
fn find_wheel_dist_info(dir: &Path, lib: &LibraryRef) -> Option<DistInfo> {
    let wanted = lib.normalized_name();
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .map(|dir_name| DistInfo::new(dir, dir_name))
        .find(|did| {
            did.dir_name.ends_with(".dist-info")
                && did.path().join("WHEEL").is_file()
                && normalize_name(did.library_name()) == wanted
        })
}

fn is_higher(candidate: &str, base: &str) -> bool {
    match (PackageVersion::parse(candidate), PackageVersion::parse(base)) {
        (Ok(c), Ok(b)) => c > b,
        _ => false,
    }
}

fn write_python_version(dir: &Path, version: &str) {
    let path = dir.join(PYTHON_VERSION_FILE);
    match File::options().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            if let Err(e) = file.write_all(version.as_bytes()) {
                warn!(path = %path.display(), error = %e, "unable to write runtime marker");
            }
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => warn!(path = %path.display(), error = %e, "unable to write runtime marker"),
    }
}

/// Rename, falling back to copy and delete across devices.
fn move_file(fs_ops: &dyn FileSystem, from: &Path, to: &Path) -> io::Result<()> {
    match fs_ops.rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if is_lock_error(&e) => Err(e),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

fn remove_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_error() {
        let locked = StowageError::io("x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(Outcome::from_error(locked).is_deferred());

        let missing = StowageError::io("x", io::Error::from(io::ErrorKind::NotFound));
        assert!(Outcome::from_error(missing).is_failed());
    }

    #[test]
    fn test_step_conversion() {
        let done: Step<()> = Ok(());
        assert!(Outcome::from(done).is_done());
        let deferred: Step<()> = Err(Halt::Deferred);
        assert!(Outcome::from(deferred).is_deferred());
        let failed: Step<()> = Err(Halt::Failed(StowageError::NotInstalled("A".into())));
        let failed = Outcome::from(failed);
        assert!(matches!(failed.error(), Some(StowageError::NotInstalled(n)) if n == "A"));
    }

    #[test]
    fn test_runtime_tag_ordering() {
        assert!(is_higher("3.8", "3.3"));
        assert!(is_higher("3.13", "3.8"));
        assert!(!is_higher("3.3", "3.3"));
        assert!(!is_higher("bogus", "3.3"));
    }

    #[test]
    fn test_python_marker_never_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join(PYTHON_VERSION_FILE), "3.3").unwrap();
        write_python_version(dir.path(), "3.8");
        assert_eq!(
            fs::read_to_string(dir.path().join(PYTHON_VERSION_FILE)).unwrap(),
            "3.3"
        );
    }
}
