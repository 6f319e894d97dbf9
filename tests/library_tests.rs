// Library install, upgrade protection, wheels and orphan cleanup


use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use stowage::catalog::Release;
use stowage::library::{self, DistInfo};
use stowage::{ErrorKind, LibraryRef, StowageError};
use test_helpers::{CatalogBuilder, TestEnvironment, release};

fn lib_release(name: &str, version: &str, dependencies: &[&str]) -> Release {
    let mut release = release(name, version);
    release.python_versions = vec!["3.3".to_string(), "3.8".to_string()];
    release.libraries = dependencies.iter().map(|s| s.to_string()).collect();
    release
}

fn serve_legacy(env: &TestEnvironment, name: &str, version: &str, body: &str) {
    let root = format!("{name}-{version}");
    let init = format!("{root}/all/{name}/__init__.py");
    let other = format!("{root}/st4_py33/{name}/__init__.py");
    env.serve(
        name,
        version,
        &[(init.as_str(), body), (other.as_str(), "WRONG_RUNTIME = True\n")],
    );
}

fn toolkit() -> LibraryRef {
    LibraryRef::new("toolkit", "3.8")
}

fn sha(content: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(content.as_bytes()))
}

/// A wheel for `wheelie` 2.0.0; `recorded` is the content RECORD vouches for.
fn serve_wheel(env: &TestEnvironment, tag: &str, content: &str, recorded: &str) {
    let record = format!(
        "wheelie/__init__.py,sha256={},{}\n\
         wheelie-2.0.0.dist-info/METADATA,,\n\
         wheelie-2.0.0.dist-info/WHEEL,,\n\
         wheelie-2.0.0.dist-info/RECORD,,\n",
        sha(recorded),
        recorded.len()
    );
    let wheel = format!("Wheel-Version: 1.0\nRoot-Is-Purelib: true\nTag: {tag}\n");
    env.serve(
        "wheelie",
        "2.0.0",
        &[
            ("wheelie/__init__.py", content),
            (
                "wheelie-2.0.0.dist-info/METADATA",
                "Metadata-Version: 2.1\nName: wheelie\nVersion: 2.0.0\n",
            ),
            ("wheelie-2.0.0.dist-info/WHEEL", wheel.as_str()),
            ("wheelie-2.0.0.dist-info/RECORD", record.as_str()),
        ],
    );
}

fn wheel_catalog() -> stowage::catalog::StaticCatalog {
    CatalogBuilder::new()
        .library("wheelie", vec![lib_release("wheelie", "2.0.0", &[])])
        .build()
}

#[tokio::test]
async fn test_package_release_installs_its_libraries() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "toolkit", "1.0.0", "X = 1\n");
    env.serve("Alpha", "1.0.0", &[("Alpha-1.0.0/", ""), ("Alpha-1.0.0/main.py", "")]);

    let mut alpha = release("Alpha", "1.0.0");
    alpha.python_versions = vec!["3.8".to_string()];
    alpha.libraries = vec!["toolkit".to_string()];
    let catalog = CatalogBuilder::new()
        .package("Alpha", vec![alpha])
        .library("toolkit", vec![lib_release("toolkit", "1.0.0", &[])])
        .build();
    let pm = env.manager(catalog);

    assert!(pm.install_package("Alpha").await.is_done());

    let lib_dir = env.layout.lib_dir("3.8");
    assert_eq!(
        fs::read_to_string(lib_dir.join("toolkit/__init__.py")).unwrap(),
        "X = 1\n"
    );
    assert_eq!(pm.list_libraries(), BTreeSet::from([toolkit()]));
    assert_eq!(pm.get_python_version("Alpha"), "3.8");
    assert_eq!(pm.get_libraries("Alpha"), BTreeSet::from([toolkit()]));

    let required = pm.find_required_libraries(None);
    assert!(pm.find_missing_libraries(&required).is_empty());
    assert!(pm.find_orphaned_libraries(&required).is_empty());
}

#[tokio::test]
async fn test_dependencies_manifest_in_archive() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "toolkit", "1.0.0", "X = 1\n");
    env.serve(
        "Alpha",
        "1.0.0",
        &[
            ("Alpha-1.0.0/main.py", ""),
            ("Alpha-1.0.0/.python-version", "3.8\n"),
            ("Alpha-1.0.0/dependencies.json", r#"{"*": {"*": ["toolkit"]}}"#),
        ],
    );
    let catalog = CatalogBuilder::new()
        .package("Alpha", vec![release("Alpha", "1.0.0")])
        .library("toolkit", vec![lib_release("toolkit", "1.0.0", &[])])
        .build();
    let pm = env.manager(catalog);

    assert!(pm.install_package("Alpha").await.is_done());

    assert_eq!(pm.get_metadata("Alpha").libraries, vec!["toolkit"]);
    assert_eq!(pm.get_python_version("Alpha"), "3.8");
    assert_eq!(pm.list_libraries(), BTreeSet::from([toolkit()]));
}

#[tokio::test]
async fn test_removing_last_user_removes_library() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "toolkit", "1.0.0", "X = 1\n");
    env.serve("Alpha", "1.0.0", &[("Alpha-1.0.0/", ""), ("Alpha-1.0.0/main.py", "")]);

    let mut alpha = release("Alpha", "1.0.0");
    alpha.python_versions = vec!["3.8".to_string()];
    alpha.libraries = vec!["toolkit".to_string()];
    let catalog = CatalogBuilder::new()
        .package("Alpha", vec![alpha])
        .library("toolkit", vec![lib_release("toolkit", "1.0.0", &[])])
        .build();
    let pm = env.manager(catalog);
    assert!(pm.install_package("Alpha").await.is_done());

    assert!(pm.remove_package("Alpha").await.is_done());

    assert!(pm.list_libraries().is_empty());
    assert!(!env.layout.lib_dir("3.8").join("toolkit").exists());
}

#[test]
fn test_unmanaged_library_is_never_removed() {
    let env = TestEnvironment::new();
    let lib_dir = env.layout.lib_dir("3.8");
    fs::create_dir_all(lib_dir.join("foreign")).unwrap();
    fs::write(lib_dir.join("foreign/__init__.py"), "").unwrap();
    let did = DistInfo::new(&lib_dir, "foreign-1.0.dist-info");
    did.ensure_exists().unwrap();
    did.write_metadata("foreign", "1.0", "", "").unwrap();
    did.write_record(&["foreign".to_string()]).unwrap();
    fs::write(did.path().join("INSTALLER"), "pip\n").unwrap();

    let pm = env.manager(CatalogBuilder::new().build());
    let foreign = LibraryRef::new("foreign", "3.8");

    assert!(pm.cleanup_libraries(None));
    assert_eq!(pm.list_libraries(), BTreeSet::from([foreign.clone()]));

    let outcome = pm.remove_library(&foreign);
    assert!(matches!(outcome.error(), Some(StowageError::Protected { .. })));
    assert!(lib_dir.join("foreign/__init__.py").is_file());
}

#[tokio::test]
async fn test_up_to_date_library_is_not_downloaded() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "toolkit", "1.0.0", "X = 1\n");
    let catalog = CatalogBuilder::new()
        .library("toolkit", vec![lib_release("toolkit", "1.0.0", &[])])
        .build();
    let pm = env.manager(catalog);

    assert!(pm.install_library(&toolkit()).await.is_done());
    assert!(pm.install_library(&toolkit()).await.is_done());
    assert_eq!(env.transport.requests().len(), 1);
}

#[tokio::test]
async fn test_upgrade_replaces_library_files() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "toolkit", "1.0.0", "X = 1\n");
    let v1 = CatalogBuilder::new()
        .library("toolkit", vec![lib_release("toolkit", "1.0.0", &[])])
        .build();
    assert!(env.manager(v1).install_library(&toolkit()).await.is_done());

    serve_legacy(&env, "toolkit", "1.1.0", "X = 2\n");
    let v2 = CatalogBuilder::new()
        .library("toolkit", vec![lib_release("toolkit", "1.1.0", &[])])
        .build();
    assert!(env.manager(v2).install_library(&toolkit()).await.is_done());

    let installed = library::find_installed(&env.layout, &toolkit()).unwrap();
    assert_eq!(installed.version().as_deref(), Some("1.1.0"));
    assert!(!env.layout.lib_dir("3.8").join("toolkit-1.0.0.dist-info").exists());
    assert_eq!(
        fs::read_to_string(env.layout.lib_dir("3.8").join("toolkit/__init__.py")).unwrap(),
        "X = 2\n"
    );
}

#[tokio::test]
async fn test_modified_library_refuses_upgrade() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "toolkit", "1.0.0", "X = 1\n");
    let v1 = CatalogBuilder::new()
        .library("toolkit", vec![lib_release("toolkit", "1.0.0", &[])])
        .build();
    assert!(env.manager(v1).install_library(&toolkit()).await.is_done());

    let edited = env.layout.lib_dir("3.8").join("toolkit/__init__.py");
    fs::write(&edited, "X = 'patched locally'\n").unwrap();

    serve_legacy(&env, "toolkit", "1.1.0", "X = 2\n");
    let v2 = CatalogBuilder::new()
        .library("toolkit", vec![lib_release("toolkit", "1.1.0", &[])])
        .build();
    let outcome = env.manager(v2).install_library(&toolkit()).await;

    match outcome.error() {
        Some(StowageError::UserModification { paths, .. }) => {
            assert_eq!(paths, &vec![edited.clone()]);
        }
        other => panic!("expected UserModification, got {other:?}"),
    }
    assert_eq!(
        fs::read_to_string(&edited).unwrap(),
        "X = 'patched locally'\n"
    );
}

#[tokio::test]
async fn test_library_dependencies_install_first() {
    let env = TestEnvironment::new();
    serve_legacy(&env, "outer", "1.0.0", "import inner\n");
    serve_legacy(&env, "inner", "1.0.0", "");
    let catalog = CatalogBuilder::new()
        .library("outer", vec![lib_release("outer", "1.0.0", &["inner"])])
        .library("inner", vec![lib_release("inner", "1.0.0", &["outer"])])
        .build();
    let pm = env.manager(catalog);

    assert!(pm.install_library(&LibraryRef::new("outer", "3.8")).await.is_done());

    assert_eq!(
        pm.list_libraries(),
        BTreeSet::from([LibraryRef::new("inner", "3.8"), LibraryRef::new("outer", "3.8")])
    );
    // The cycle back to `outer` is not followed twice.
    assert_eq!(env.transport.requests().len(), 2);
}

#[tokio::test]
async fn test_unknown_library_is_not_available() {
    let env = TestEnvironment::new();
    let pm = env.manager(CatalogBuilder::new().build());

    let outcome = pm.install_library(&LibraryRef::new("ghost", "3.8")).await;
    assert!(matches!(outcome.error(), Some(StowageError::NotAvailable { .. })));
    assert!(!pm.install_libraries(&[LibraryRef::new("ghost", "3.8")], true).await);
}

#[tokio::test]
async fn test_wheel_install() {
    let env = TestEnvironment::new();
    serve_wheel(&env, "py3-none-any", "VALUE = 2\n", "VALUE = 2\n");
    let pm = env.manager(wheel_catalog());
    let wheelie = LibraryRef::new("wheelie", "3.8");

    let outcome = pm.install_library(&wheelie).await;
    assert!(outcome.is_done(), "{outcome:?}");

    let lib_dir = env.layout.lib_dir("3.8");
    assert!(lib_dir.join("wheelie/__init__.py").is_file());
    let installed = library::find_installed(&env.layout, &wheelie).unwrap();
    assert_eq!(installed.version().as_deref(), Some("2.0.0"));
    assert!(installed.dist_info.is_managed());
}

#[tokio::test]
async fn test_wheel_for_other_runtime_is_rejected() {
    let env = TestEnvironment::new();
    serve_wheel(&env, "cp27-cp27m-win32", "VALUE = 2\n", "VALUE = 2\n");
    let pm = env.manager(wheel_catalog());

    let outcome = pm.install_library(&LibraryRef::new("wheelie", "3.8")).await;
    assert!(matches!(outcome.error(), Some(StowageError::NotAvailable { .. })));
    assert!(pm.list_libraries().is_empty());
}

#[tokio::test]
async fn test_tampered_wheel_fails_integrity_check() {
    let env = TestEnvironment::new();
    serve_wheel(&env, "py3-none-any", "VALUE = 'evil'\n", "VALUE = 2\n");
    let pm = env.manager(wheel_catalog());

    let outcome = pm.install_library(&LibraryRef::new("wheelie", "3.8")).await;
    let err = outcome.error().expect("tampered wheel must fail");
    assert_eq!(err.kind(), ErrorKind::ArchiveFormat);
    match err {
        StowageError::ArchiveIntegrity { paths, .. } => {
            assert_eq!(paths, &vec!["wheelie/__init__.py".to_string()]);
        }
        other => panic!("expected ArchiveIntegrity, got {other:?}"),
    }
    assert!(pm.list_libraries().is_empty());
}

#[tokio::test]
async fn test_wheel_record_escaping_library_dir_is_rejected() {
    let env = TestEnvironment::new();
    let lib_dir = env.layout.lib_dir("3.8");
    fs::create_dir_all(lib_dir.join("foreign")).unwrap();
    fs::write(lib_dir.join("foreign/__init__.py"), "KEEP = True\n").unwrap();
    let did = DistInfo::new(&lib_dir, "foreign-1.0.dist-info");
    did.ensure_exists().unwrap();
    did.write_metadata("foreign", "1.0", "", "").unwrap();
    did.write_record(&["foreign".to_string()]).unwrap();
    fs::write(did.path().join("INSTALLER"), "pip\n").unwrap();

    let content = "VALUE = 2\n";
    let record = format!(
        "wheelie/__init__.py,sha256={},{}\n\
         ../python38/foreign/__init__.py,,\n\
         wheelie-2.0.0.dist-info/RECORD,,\n",
        sha(content),
        content.len()
    );
    env.serve(
        "wheelie",
        "2.0.0",
        &[
            ("wheelie/__init__.py", content),
            (
                "wheelie-2.0.0.dist-info/METADATA",
                "Metadata-Version: 2.1\nName: wheelie\nVersion: 2.0.0\n",
            ),
            (
                "wheelie-2.0.0.dist-info/WHEEL",
                "Wheel-Version: 1.0\nTag: py3-none-any\n",
            ),
            ("wheelie-2.0.0.dist-info/RECORD", record.as_str()),
        ],
    );
    let pm = env.manager(wheel_catalog());

    let outcome = pm.install_library(&LibraryRef::new("wheelie", "3.8")).await;
    let err = outcome.error().expect("escaping RECORD entry must fail");
    assert_eq!(err.kind(), ErrorKind::ArchiveSecurity);
    assert_eq!(
        fs::read_to_string(lib_dir.join("foreign/__init__.py")).unwrap(),
        "KEEP = True\n"
    );
    assert!(did.path().join("INSTALLER").is_file());
    assert!(!lib_dir.join("wheelie").exists());
    assert_eq!(
        pm.list_libraries(),
        BTreeSet::from([LibraryRef::new("foreign", "3.8")])
    );
}
