//! Startup reconciliation.
//!
//! Runs once per process start, before any other operation is admitted.
//! It resumes work a previous session could not finish because the host
//! held files open, removes packages that are on disk but absent from the
//! registry, and reports packages synced from an incompatible host.

use crate::backup::prune_backups;
use crate::fsops::{clear_directory, create_empty_file, delete_directory, empty_trash};
use crate::host::{Action, DisableGuard};
use crate::metadata::METADATA_FILE;
use crate::package_io::{
    CLEANUP_SENTINEL, REINSTALL_SENTINEL, is_reserved, list_package_dirs, list_package_files,
    list_pending_package_files, package_file_exists,
};
use crate::package_manager::{Outcome, PackageManager};
use crate::resolver::LibraryRef;
use chrono::Local;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// What the sweep found and did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Packages present on disk after reconciliation.
    pub found_packages: BTreeSet<String>,
    pub found_libraries: BTreeSet<LibraryRef>,
    /// Pending `-new` archives moved into place.
    pub swapped: Vec<String>,
    /// Directories whose deferred deletion completed.
    pub deleted: Vec<String>,
    pub reinstalled: Vec<String>,
    pub removed_orphans: Vec<String>,
    pub installed_missing: Vec<String>,
    /// Packages whose metadata does not match this host.
    pub incompatible: Vec<String>,
    /// Packages still waiting on a restart.
    pub pending: BTreeSet<String>,
    pub pruned_backups: Vec<PathBuf>,
    pub libraries_clean: bool,
}

impl PackageManager {
    /// Reconcile disk, registry and host state left by earlier sessions.
    pub async fn cleanup(&self) -> CleanupReport {
        let _gate = self.exclusive().await;
        let mut sweep = Sweep {
            pm: self,
            report: CleanupReport::default(),
        };
        sweep.run().await;
        self.persist_registry();
        sweep.report
    }
}

struct Sweep<'a> {
    pm: &'a PackageManager,
    report: CleanupReport,
}

impl Sweep<'_> {
    async fn run(&mut self) {
        let pm = self.pm;
        let layout = pm.layout();
        if let Err(e) = layout.ensure(&pm.config().python_versions) {
            warn!(error = %e, "unable to create data directories");
        }
        let registry_at_start = pm.registry().names();

        // Scratch space from interrupted sessions goes the same way as trash.
        empty_trash(&layout.trash_dir());
        empty_trash(&layout.temp_dir());
        self.report.pruned_backups =
            prune_backups(layout, pm.config().max_backup_age, Local::now().date_naive());

        self.apply_pending_archives();
        self.report
            .found_packages
            .extend(list_package_files(&layout.installed_packages_dir()));
        self.scan_package_dirs().await;

        if pm.config().remove_orphaned {
            self.remove_orphans(&registry_at_start).await;
        }
        if pm.config().install_missing {
            self.install_missing(&registry_at_start).await;
        }

        self.audit_compatibility();
        self.reconcile_in_process();

        self.report.libraries_clean = pm.cleanup_libraries(None);
        self.report.found_libraries = pm.list_libraries();
        debug!(
            packages = self.report.found_packages.len(),
            libraries = self.report.found_libraries.len(),
            "startup sweep finished"
        );
    }

    fn apply_pending_archives(&mut self) {
        let pm = self.pm;
        let layout = pm.layout();
        for name in list_pending_package_files(&layout.installed_packages_dir()) {
            let pending = layout.pending_package_file(&name);
            let target = layout.package_file(&name);

            let swapped = match pm.fs_ops().remove_file(&target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
            .and_then(|()| pm.fs_ops().rename(&pending, &target));

            match swapped {
                Ok(()) => {
                    info!(package = %name, "applied pending package file");
                    self.report.swapped.push(name.clone());
                }
                Err(e) => {
                    warn!(package = %name, error = %e, "package file still in use");
                    self.report.pending.insert(name.clone());
                }
            }
            self.report.found_packages.insert(name);
        }
    }

    async fn scan_package_dirs(&mut self) {
        let pm = self.pm;
        let layout = pm.layout();
        let trash = layout.trash_dir();

        for name in list_package_dirs(&layout.packages_dir()) {
            if name.eq_ignore_ascii_case("user") {
                continue;
            }
            let dir = layout.package_dir(&name);

            if dir.join(CLEANUP_SENTINEL).exists() {
                if delete_directory(pm.fs_ops(), &dir, &trash) {
                    info!(package = %name, "finished deferred removal");
                    self.report.deleted.push(name);
                } else {
                    warn!(package = %name, "directory still in use; removal stays pending");
                    rewrite_sentinel(&dir.join(CLEANUP_SENTINEL));
                    self.report.pending.insert(name.clone());
                    self.report.found_packages.insert(name);
                }
                continue;
            }

            if dir.join(REINSTALL_SENTINEL).exists() {
                let keep: HashSet<PathBuf> =
                    [dir.join(REINSTALL_SENTINEL), dir.join(METADATA_FILE)].into();
                if !clear_directory(pm.fs_ops(), &dir, &keep, &trash) {
                    debug!(package = %name, "files left before reinstall");
                }
                match pm.install_ungated(&name, true).await {
                    Outcome::Done => {
                        info!(package = %name, "finished deferred install");
                        self.report.reinstalled.push(name.clone());
                    }
                    Outcome::Deferred => {
                        self.report.pending.insert(name.clone());
                    }
                    Outcome::Failed(e) => {
                        warn!(package = %name, error = %e, "deferred install failed again");
                        rewrite_sentinel(&dir.join(REINSTALL_SENTINEL));
                        self.report.pending.insert(name.clone());
                    }
                }
            }

            self.report.found_packages.insert(name);
        }
    }

    async fn remove_orphans(&mut self, registry_at_start: &BTreeSet<String>) {
        let pm = self.pm;
        let orphans: BTreeSet<String> = self
            .report
            .found_packages
            .iter()
            // Names this sweep just installed are staged in the registry.
            .filter(|name| !registry_at_start.contains(*name) && !pm.registry().contains(name))
            .filter(|name| !self.report.pending.contains(*name) && !is_reserved(name))
            .filter(|name| package_file_exists(pm.layout(), name, METADATA_FILE))
            .cloned()
            .collect();
        if orphans.is_empty() {
            return;
        }
        info!(packages = ?orphans, "removing orphaned packages");

        // Every disabled package is re-enabled afterwards: removed ones so
        // the host forgets them, failed ones so they keep working.
        let guard = DisableGuard::disable(
            pm.disabler().clone(),
            &orphans,
            Action::Remove,
            pm.config().settle_delay(),
        )
        .await;

        for name in &orphans {
            match pm.delete_ungated(name).await {
                Outcome::Done => {
                    self.report.found_packages.remove(name);
                    self.report.removed_orphans.push(name.clone());
                }
                Outcome::Deferred => {
                    self.report.pending.insert(name.clone());
                }
                Outcome::Failed(e) => {
                    warn!(package = %name, error = %e, "unable to remove orphaned package");
                }
            }
        }

        guard.finish().await;
    }

    async fn install_missing(&mut self, registry_at_start: &BTreeSet<String>) {
        let pm = self.pm;
        let missing: Vec<String> = registry_at_start
            .iter()
            .filter(|name| !self.report.found_packages.contains(*name) && !is_reserved(name))
            .cloned()
            .collect();

        for name in missing {
            match pm.install_ungated(&name, false).await {
                Outcome::Done => {
                    self.report.installed_missing.push(name.clone());
                    self.report.found_packages.insert(name);
                }
                Outcome::Deferred => {
                    self.report.pending.insert(name.clone());
                    self.report.found_packages.insert(name);
                }
                Outcome::Failed(e) => {
                    warn!(package = %name, error = %e, "unable to install missing package");
                }
            }
        }

        let required = pm.find_required_libraries(None);
        let missing_libs: Vec<LibraryRef> =
            pm.find_missing_libraries(&required).into_iter().collect();
        if !missing_libs.is_empty() && !pm.install_libraries(&missing_libs, false).await {
            warn!("some missing libraries could not be installed");
        }
    }

    fn audit_compatibility(&mut self) {
        let pm = self.pm;
        self.report.incompatible = self
            .report
            .found_packages
            .iter()
            .filter(|name| !pm.get_metadata(name).is_compatible(pm.host()))
            .cloned()
            .collect();

        if !self.report.incompatible.is_empty() {
            warn!(
                packages = ?self.report.incompatible,
                platform = %pm.host().platform,
                host_version = pm.host().version,
                "installed packages are not compatible with this host; reinstall or remove them"
            );
        }
    }

    /// Re-enable packages a finished operation left disabled.
    fn reconcile_in_process(&mut self) {
        let pm = self.pm;
        let disabler = pm.disabler();
        let in_process = disabler.in_process_packages();
        if in_process.is_empty() {
            return;
        }

        let still_pending: BTreeSet<String> = in_process
            .iter()
            .filter(|name| self.report.pending.contains(*name) || pm.has_pending_work(name))
            .cloned()
            .collect();
        let finished: BTreeSet<String> = in_process.difference(&still_pending).cloned().collect();

        if !finished.is_empty() {
            disabler.reenable_packages(&finished, Action::Enable);
        }
        disabler.clear_in_process(&still_pending);
    }
}

fn rewrite_sentinel(path: &std::path::Path) {
    if let Err(e) = create_empty_file(path) {
        warn!(path = %path.display(), error = %e, "unable to write sentinel");
    }
}
