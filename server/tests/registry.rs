//! Registry lifecycle tests against a real (but disposable) cgroup v2
//! sub-tree.
//!
//! These are skipped, rather than failed, on a host with no cgroup v2
//! mount or without permission to create cgroups there -- both of which
//! are common in CI containers.
use envdeploy_core::cgroup::CGroup;
use envdeploy_core::users::User;
use envdeploy_server::job::{CreateError, Registry};

/// Creates a throwaway cgroup under the host's cgroup v2 mount, or returns
/// `None` if that is not possible in this environment.
fn test_cgroup(name: &str) -> Option<CGroup> {
    let mount = envdeploy_core::cgroup::mount_point().ok()?;
    let root = CGroup::import_root(&mount).ok()?;
    root.new(name).ok()
}

#[test]
fn create_reserves_the_id_for_the_whole_build() {
    let Some(cgroup) = test_cgroup("envdeploy-test-reserve") else {
        eprintln!("skipping: no usable cgroup v2 mount in this environment");
        return;
    };
    let log_dir = tempfile::tempdir().expect("creating a scratch log dir");

    let registry = Registry::new();
    let (job, _worker) = registry
        .create("alice-ab12", User::new("alice"), &cgroup, log_dir.path(), "127.0.0.1:8000".into())
        .expect("first create should succeed");
    assert_eq!(job.id, "alice-ab12");
    assert!(!job.is_finished());

    match registry.create("alice-ab12", User::new("alice"), &cgroup, log_dir.path(), "127.0.0.1:8000".into()) {
        Err(CreateError::AlreadyExists) => {}
        other => panic!("expected AlreadyExists, got {:?}", other.is_ok()),
    }

    let _ = cgroup.rm();
}

#[test]
fn remove_refuses_an_unfinished_job() {
    let Some(cgroup) = test_cgroup("envdeploy-test-remove") else {
        eprintln!("skipping: no usable cgroup v2 mount in this environment");
        return;
    };
    let log_dir = tempfile::tempdir().expect("creating a scratch log dir");

    let registry = Registry::new();
    let (_job, _worker) = registry
        .create("bob-cd34", User::new("bob"), &cgroup, log_dir.path(), "127.0.0.1:8001".into())
        .expect("create should succeed");

    assert!(matches!(
        registry.remove("bob-cd34"),
        Err(envdeploy_server::job::RegistryError::NotFinished)
    ));
    assert!(registry.lookup("bob-cd34").is_some());

    let _ = cgroup.rm();
}

#[test]
fn lookup_and_remove_of_unknown_id_fail_cleanly() {
    let registry = Registry::new();
    assert!(registry.lookup("nope").is_none());
    assert!(matches!(
        registry.remove("nope"),
        Err(envdeploy_server::job::RegistryError::NotFound)
    ));
}
