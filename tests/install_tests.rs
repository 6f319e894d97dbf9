// Package install, upgrade, rename and removal against an isolated data dir


use std::fs;
use stowage::host::Action;
use stowage::package_io::{CLEANUP_SENTINEL, REINSTALL_SENTINEL};
use stowage::{ErrorKind, StowageError};
use test_helpers::{CatalogBuilder, TestEnvironment, names, release};

fn alpha_catalog(versions: &[&str]) -> stowage::catalog::StaticCatalog {
    CatalogBuilder::new()
        .package("Alpha", versions.iter().map(|v| release("Alpha", v)).collect())
        .build()
}

fn alpha_entries(version: &str, unpacked: bool) -> Vec<(String, String)> {
    let root = format!("Alpha-{version}/");
    let marker = if unpacked {
        format!("{root}.no-sublime-package")
    } else {
        root.clone()
    };
    vec![
        (marker, String::new()),
        (format!("{root}main.py"), "print('alpha')\n".to_string()),
        (format!("{root}core.py"), format!("VERSION = '{version}'\n")),
    ]
}

fn serve_alpha(env: &TestEnvironment, version: &str, unpacked: bool) {
    let entries = alpha_entries(version, unpacked);
    let entries: Vec<(&str, &str)> = entries
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_str()))
        .collect();
    env.serve("Alpha", version, &entries);
}

fn serve_packed(env: &TestEnvironment, version: &str) {
    serve_alpha(env, version, false);
}

fn serve_unpacked(env: &TestEnvironment, version: &str) {
    serve_alpha(env, version, true);
}

#[tokio::test]
async fn test_install_packed_package() {
    let env = TestEnvironment::new();
    serve_packed(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    let outcome = pm.install_package("Alpha").await;
    assert!(outcome.is_done(), "{outcome:?}");

    assert!(env.layout.package_file("Alpha").is_file());
    assert!(!env.layout.package_dir("Alpha").exists());
    assert_eq!(pm.get_metadata("Alpha").version.as_deref(), Some("1.0.0"));
    assert_eq!(pm.list_packages(false), vec!["Alpha"]);
    assert!(pm.list_packages(true).is_empty());
    assert_eq!(env.saved_registry(), vec!["Alpha"]);
}

#[tokio::test]
async fn test_install_unpacked_package() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    assert!(pm.install_package("Alpha").await.is_done());

    let dir = env.layout.package_dir("Alpha");
    assert!(dir.join("main.py").is_file());
    assert!(dir.join("package-metadata.json").is_file());
    assert!(!env.layout.package_file("Alpha").exists());
    assert_eq!(pm.list_packages(true), vec!["Alpha"]);

    let metadata = pm.get_metadata("Alpha");
    assert_eq!(metadata.version.as_deref(), Some("1.0.0"));
    assert_eq!(metadata.url, "https://example.com/Alpha");
    assert!(metadata.install_time.is_some());
    assert!(metadata.upgrade_time.is_none());
}

#[tokio::test]
async fn test_install_current_version_is_noop() {
    let env = TestEnvironment::new();
    serve_packed(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    assert!(pm.install_package("Alpha").await.is_done());
    let first = pm.get_metadata("Alpha");

    assert!(pm.install_package("Alpha").await.is_done());
    assert_eq!(env.transport.requests().len(), 1);
    assert_eq!(pm.get_metadata("Alpha").install_time, first.install_time);
}

#[tokio::test]
async fn test_reinstall_downloads_again() {
    let env = TestEnvironment::new();
    serve_packed(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    assert!(pm.install_package("Alpha").await.is_done());
    assert!(pm.reinstall_package("Alpha").await.is_done());
    assert_eq!(env.transport.requests().len(), 2);
}

#[tokio::test]
async fn test_upgrade_records_time_and_release_notes() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    assert!(
        env.manager(alpha_catalog(&["1.0.0"]))
            .install_package("Alpha")
            .await
            .is_done()
    );
    let installed = env.manager(alpha_catalog(&["1.0.0"])).get_metadata("Alpha");

    env.serve(
        "Alpha",
        "1.1.0",
        &[
            ("Alpha-1.1.0/.no-sublime-package", ""),
            ("Alpha-1.1.0/main.py", "print('alpha')\n"),
            ("Alpha-1.1.0/messages.json", r#"{"1.1.0": "messages/1.1.0.txt"}"#),
            ("Alpha-1.1.0/messages/1.1.0.txt", "Now with more alpha"),
        ],
    );
    let pm = env.manager(alpha_catalog(&["1.1.0", "1.0.0"]));

    let outdated = pm.list_outdated();
    assert_eq!(outdated.len(), 1);
    assert_eq!(outdated[0].installed, "1.0.0");
    assert_eq!(outdated[0].latest, "1.1.0");

    assert!(pm.upgrade_package("Alpha").await.is_done());

    let metadata = pm.get_metadata("Alpha");
    assert_eq!(metadata.version.as_deref(), Some("1.1.0"));
    assert_eq!(metadata.install_time, installed.install_time);
    assert!(metadata.upgrade_time.is_some());
    // Files dropped by the new release are gone.
    assert!(!env.layout.package_dir("Alpha").join("core.py").exists());
    assert_eq!(env.backups_of("Alpha").len(), 1);

    let notes = pm.take_release_notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("Now with more alpha"));
    assert!(pm.take_release_notes().is_empty());
    assert!(pm.list_outdated().is_empty());
}

#[tokio::test]
async fn test_upgrade_requires_installed_package() {
    let env = TestEnvironment::new();
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    let outcome = pm.upgrade_package("Alpha").await;
    assert!(matches!(outcome.error(), Some(StowageError::NotInstalled(_))));
    assert!(env.transport.requests().is_empty());
}

#[tokio::test]
async fn test_locked_file_during_upgrade_defers() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    assert!(
        env.manager(alpha_catalog(&["1.0.0"]))
            .install_package("Alpha")
            .await
            .is_done()
    );

    serve_unpacked(&env, "1.1.0");
    let dir = env.layout.package_dir("Alpha");
    env.fs.lock(dir.join("core.py"));
    let pm = env.manager(alpha_catalog(&["1.1.0", "1.0.0"]));

    let outcome = pm.upgrade_package("Alpha").await;
    assert!(outcome.is_deferred(), "{outcome:?}");
    assert!(dir.join(REINSTALL_SENTINEL).is_file());
    // Metadata still describes what is really installed.
    assert_eq!(pm.get_metadata("Alpha").version.as_deref(), Some("1.0.0"));
    assert!(pm.registry().contains("Alpha"));
}

#[tokio::test]
async fn test_escaping_archive_changes_nothing() {
    for escaping in ["../evil.py", "/evil.py", "Alpha-1.1.0/../../evil.py"] {
        let env = TestEnvironment::new();
        serve_unpacked(&env, "1.0.0");
        assert!(
            env.manager(alpha_catalog(&["1.0.0"]))
                .install_package("Alpha")
                .await
                .is_done()
        );
        let dir = env.layout.package_dir("Alpha");
        let core_before = fs::read_to_string(dir.join("core.py")).unwrap();
        let metadata_before = fs::read_to_string(dir.join("package-metadata.json")).unwrap();

        env.serve(
            "Alpha",
            "1.1.0",
            &[
                ("Alpha-1.1.0/.no-sublime-package", ""),
                ("Alpha-1.1.0/core.py", "VERSION = '1.1.0'\n"),
                (escaping, "import os\n"),
            ],
        );
        let pm = env.manager(alpha_catalog(&["1.1.0", "1.0.0"]));

        let outcome = pm.upgrade_package("Alpha").await;
        assert_eq!(
            outcome.error().map(|e| e.kind()),
            Some(ErrorKind::ArchiveSecurity),
            "{escaping}"
        );
        assert_eq!(fs::read_to_string(dir.join("core.py")).unwrap(), core_before);
        assert_eq!(
            fs::read_to_string(dir.join("package-metadata.json")).unwrap(),
            metadata_before
        );
        assert!(env.backups_of("Alpha").is_empty());
        assert!(!env.layout.packages_dir().join("evil.py").exists());
        assert!(!env.layout.root().join("evil.py").exists());
        assert!(pm.registry().contains("Alpha"));
        assert_eq!(env.saved_registry(), vec!["Alpha"]);
    }
}

#[tokio::test]
async fn test_hidden_override_is_protected() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    env.write_package_dir("Alpha", &[(".hidden-sublime-package", ""), ("mine.py", "")]);
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    let outcome = pm.install_package("Alpha").await;
    assert!(matches!(outcome.error(), Some(StowageError::Protected { .. })));
    assert!(env.layout.package_dir("Alpha").join("mine.py").is_file());
    assert!(!env.layout.package_dir("Alpha").join("main.py").exists());
}

#[tokio::test]
async fn test_reserved_and_unknown_names() {
    let env = TestEnvironment::new();
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    let reserved = pm.install_package("User").await;
    assert!(matches!(reserved.error(), Some(StowageError::Protected { .. })));

    let unknown = pm.install_package("Nonexistent").await;
    match unknown.error() {
        Some(StowageError::NotAvailable { name, reason }) => {
            assert_eq!(name, "Nonexistent");
            assert!(reason.contains("not found"));
        }
        other => panic!("expected NotAvailable, got {other:?}"),
    }
    assert!(env.transport.requests().is_empty());
}

#[tokio::test]
async fn test_download_failure_leaves_state_untouched() {
    let env = TestEnvironment::new();
    let pm = env.manager(alpha_catalog(&["1.0.0"]));

    let outcome = pm.install_package("Alpha").await;
    assert_eq!(outcome.error().map(|e| e.kind()), Some(ErrorKind::Transport));
    assert!(pm.list_packages(false).is_empty());
    assert!(env.saved_registry().is_empty());
}

#[tokio::test]
async fn test_install_follows_rename() {
    let env = TestEnvironment::new();
    env.write_package_dir("OldName", &[("plugin.py", "")]);
    env.write_metadata("OldName", "1.0.0", &["*"]);
    env.set_registry(&["OldName"]);

    env.serve(
        "NewName",
        "2.0.0",
        &[("NewName-2.0.0/", ""), ("NewName-2.0.0/plugin.py", "")],
    );
    let catalog = CatalogBuilder::new()
        .package("NewName", vec![release("NewName", "2.0.0")])
        .rename("OldName", "NewName")
        .build();
    let pm = env.manager(catalog);

    assert!(pm.install_package("OldName").await.is_done());

    assert!(env.layout.package_file("NewName").is_file());
    assert!(!env.layout.package_dir("OldName").exists());
    assert_eq!(pm.get_metadata("NewName").version.as_deref(), Some("2.0.0"));
    assert!(pm.get_metadata("NewName").upgrade_time.is_some());
    assert_eq!(env.saved_registry(), vec!["NewName"]);
}

#[tokio::test]
async fn test_old_and_new_name_installs_do_not_interleave() {
    let env = TestEnvironment::new();
    env.write_package_dir("OldName", &[("plugin.py", "")]);
    env.write_metadata("OldName", "1.0.0", &["*"]);
    env.set_registry(&["OldName"]);

    env.serve(
        "NewName",
        "2.0.0",
        &[("NewName-2.0.0/", ""), ("NewName-2.0.0/plugin.py", "")],
    );
    let catalog = CatalogBuilder::new()
        .package("NewName", vec![release("NewName", "2.0.0")])
        .rename("OldName", "NewName")
        .build();
    let pm = env.manager(catalog);

    let (renamed, direct) = tokio::join!(
        pm.install_package("OldName"),
        pm.install_package("NewName")
    );
    assert!(renamed.is_done(), "{renamed:?}");
    assert!(direct.is_done(), "{direct:?}");

    assert!(env.layout.package_file("NewName").is_file());
    assert!(!env.layout.package_dir("OldName").exists());
    assert!(!env.layout.package_dir("NewName").exists());
    assert_eq!(pm.get_metadata("NewName").version.as_deref(), Some("2.0.0"));
    assert_eq!(env.saved_registry(), vec!["NewName"]);
}

#[tokio::test]
async fn test_remove_backs_up_directory() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));
    assert!(pm.install_package("Alpha").await.is_done());

    assert!(pm.remove_package("Alpha").await.is_done());

    assert!(!env.layout.package_dir("Alpha").exists());
    assert_eq!(env.backups_of("Alpha").len(), 1);
    assert!(env.saved_registry().is_empty());

    let again = pm.remove_package("Alpha").await;
    assert!(matches!(again.error(), Some(StowageError::NotInstalled(_))));
}

#[tokio::test]
async fn test_remove_packed_package() {
    let env = TestEnvironment::new();
    serve_packed(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));
    assert!(pm.install_package("Alpha").await.is_done());

    assert!(pm.remove_package("Alpha").await.is_done());
    assert!(!env.layout.package_file("Alpha").exists());
    assert!(env.backups_of("Alpha").is_empty());
}

#[tokio::test]
async fn test_locked_remove_leaves_cleanup_sentinel() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));
    assert!(pm.install_package("Alpha").await.is_done());

    let dir = env.layout.package_dir("Alpha");
    env.fs.lock(dir.join("core.py"));

    let outcome = pm.remove_package("Alpha").await;
    assert!(outcome.is_deferred(), "{outcome:?}");
    assert!(dir.join(CLEANUP_SENTINEL).is_file());
    assert!(env.saved_registry().is_empty());
}

#[tokio::test]
async fn test_remove_reserved_is_protected() {
    let env = TestEnvironment::new();
    env.write_package_dir("User", &[("Preferences.json", "{}")]);
    let pm = env.manager(CatalogBuilder::new().build());

    let outcome = pm.remove_package("User").await;
    assert!(matches!(outcome.error(), Some(StowageError::Protected { .. })));
    assert!(env.layout.package_dir("User").join("Preferences.json").is_file());
}

#[tokio::test]
async fn test_batch_disables_then_reenables() {
    let env = TestEnvironment::new();
    serve_packed(&env, "1.0.0");
    env.serve("Beta", "1.0.0", &[("Beta-1.0.0/", ""), ("Beta-1.0.0/beta.py", "")]);
    let catalog = CatalogBuilder::new()
        .package("Alpha", vec![release("Alpha", "1.0.0")])
        .package("Beta", vec![release("Beta", "1.0.0")])
        .build();
    let pm = env.manager(catalog);

    let results = pm
        .install_packages(&["Alpha".to_string(), "Beta".to_string()])
        .await;
    assert!(results.iter().all(|(_, outcome)| outcome.is_done()));

    let calls = env.disabler.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], ("disable", Action::Install, names(&["Alpha", "Beta"])));
    assert_eq!(calls[1], ("reenable", Action::Install, names(&["Alpha", "Beta"])));
    assert!(env.ignored().is_empty());
    assert!(env.in_process().is_empty());
    assert_eq!(env.saved_registry(), vec!["Alpha", "Beta"]);
}

#[tokio::test]
async fn test_deferred_batch_member_stays_disabled() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));
    assert!(pm.install_package("Alpha").await.is_done());

    serve_unpacked(&env, "1.1.0");
    env.fs.lock(env.layout.package_dir("Alpha").join("core.py"));
    let pm = env.manager(alpha_catalog(&["1.1.0", "1.0.0"]));

    let results = pm.upgrade_packages(&[]).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_deferred());

    assert_eq!(env.ignored(), names(&["Alpha"]));
    assert_eq!(env.in_process(), names(&["Alpha"]));
}

#[tokio::test]
async fn test_locked_package_file_is_staged() {
    let env = TestEnvironment::new();
    serve_packed(&env, "1.0.0");
    let pm = env.manager(alpha_catalog(&["1.0.0"]));
    assert!(pm.install_package("Alpha").await.is_done());

    serve_packed(&env, "1.1.0");
    env.fs.lock(env.layout.package_file("Alpha"));
    let pm = env.manager(alpha_catalog(&["1.1.0", "1.0.0"]));

    let outcome = pm.upgrade_package("Alpha").await;
    assert!(outcome.is_deferred(), "{outcome:?}");
    assert!(env.layout.pending_package_file("Alpha").is_file());
    assert_eq!(pm.get_metadata("Alpha").version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_switch_from_unpacked_to_packed() {
    let env = TestEnvironment::new();
    serve_unpacked(&env, "1.0.0");
    assert!(
        env.manager(alpha_catalog(&["1.0.0"]))
            .install_package("Alpha")
            .await
            .is_done()
    );

    serve_packed(&env, "1.1.0");
    let pm = env.manager(alpha_catalog(&["1.1.0", "1.0.0"]));
    assert!(pm.upgrade_package("Alpha").await.is_done());

    assert!(!env.layout.package_dir("Alpha").exists());
    assert!(env.layout.package_file("Alpha").is_file());
    assert_eq!(env.backups_of("Alpha").len(), 1);
    assert_eq!(
        fs::read_dir(env.layout.installed_packages_dir()).unwrap().count(),
        1
    );
}
