//! Integration tests for the realm tree and the component creation
//! pipeline against real processes.

use async_trait::async_trait;
use magikrealm::controller::SharedDirectories;
use magikrealm::{
    ComponentRunner, ComponentUrl, Error, LaunchInfo, LoaderRegistry, RealmOptions, RealmTree,
    RealmTreeConfig, Result, RunnerConnector, TerminationReason, KILL_RETURN_CODE,
    STARTUP_FAILURE_RETURN_CODE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct NoRunners;

#[async_trait]
impl RunnerConnector for NoRunners {
    async fn connect(
        &self,
        runner_url: &ComponentUrl,
        _runner_dirs: SharedDirectories,
    ) -> Result<Arc<dyn ComponentRunner>> {
        Err(Error::RunnerUnavailable {
            url: runner_url.to_string(),
            reason: "native-only test".to_string(),
        })
    }
}

fn tree(base: &Path) -> Arc<RealmTree> {
    RealmTree::new(RealmTreeConfig {
        base_storage: base.to_path_buf(),
        loaders: Arc::new(LoaderRegistry::new()),
        connector: Arc::new(NoRunners),
    })
}

fn sleep_launch() -> LaunchInfo {
    let mut launch = LaunchInfo::new("file:///bin/sleep");
    launch.arguments = vec!["30".to_string()];
    launch
}

/// Writes an executable shell script into `dir`.
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_garbage_url_terminates_with_url_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let mut handle = root.create_component(LaunchInfo::new("garbage://test")).await;
    assert_eq!(
        handle.wait_for_termination().await,
        Some((STARTUP_FAILURE_RETURN_CODE, TerminationReason::UrlInvalid))
    );
    assert_eq!(tree.component_count(root.id()), 0);
}

#[tokio::test]
async fn test_exit_code_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let mut launch = LaunchInfo::new("file:///bin/sh");
    launch.arguments = vec!["-c".to_string(), "exit 7".to_string()];
    let mut handle = root.create_component(launch).await;
    assert_eq!(
        handle.wait_for_termination().await,
        Some((7, TerminationReason::Exited))
    );
}

#[tokio::test]
async fn test_kill_removes_component_from_active_set() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let mut handle = root.create_component(sleep_launch()).await;
    assert_eq!(tree.component_count(root.id()), 1);

    handle.kill();
    let (code, reason) = handle.wait_for_termination().await.unwrap();
    assert_eq!((code, reason), (KILL_RETURN_CODE, TerminationReason::Exited));

    let tree_ref = Arc::clone(&tree);
    let root_id = root.id();
    wait_until(move || tree_ref.component_count(root_id) == 0).await;
}

#[tokio::test]
async fn test_second_kill_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let mut handle = root.create_component(sleep_launch()).await;
    handle.kill();
    let first = handle.wait_for_termination().await;
    assert!(first.is_some());

    handle.kill();
    // No second terminal event; the stream just ends.
    assert!(handle.next_event().await.is_none());
}

#[tokio::test]
async fn test_introspection_matches_create_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let handle = root.create_component(sleep_launch()).await;
    let info = root.info().unwrap();
    assert_eq!(info.label, "app");
    assert_eq!(info.components.len(), 1);

    let component = &info.components[0];
    assert_eq!(component.url, "file:///bin/sleep");
    assert_eq!(component.label, "sleep");
    assert_eq!(component.instance_id, handle.identity().instance_id);
    assert!(component.pid.is_some());
}

#[tokio::test]
async fn test_container_handle_reflects_liveness() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let container = root.container_handle().unwrap();
    assert!(container.alive());
    assert_eq!(container.label(), "app");

    let info = root.info().unwrap();
    assert_eq!(container.id(), info.container_id);
}

#[tokio::test]
async fn test_destroying_realm_kills_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let mut sys = root
        .create_nested("sys", RealmOptions::default(), Vec::new())
        .unwrap();
    sys.detach();

    let mut handle = tree.create_component(sys.id(), sleep_launch()).await;
    handle.detach();
    assert_eq!(tree.component_count(sys.id()), 1);

    tree.destroy_realm(sys.id()).unwrap();
    assert!(tree.realm_info(sys.id()).is_err());
    // The container cascade reaches the detached component too.
    assert_eq!(
        handle.wait_for_termination().await,
        Some((KILL_RETURN_CODE, TerminationReason::Exited))
    );
}

#[tokio::test]
async fn test_dropping_root_handle_destroys_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let root_id = root.id();

    let mut handle = root.create_component(sleep_launch()).await;
    handle.detach();

    drop(root);
    assert!(tree.realm_info(root_id).is_err());
    assert_eq!(
        handle.wait_for_termination().await,
        Some((KILL_RETURN_CODE, TerminationReason::Exited))
    );
}

#[tokio::test]
async fn test_detach_then_drop_leaves_component_running() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let mut handle = root.create_component(sleep_launch()).await;
    handle.detach();
    drop(handle);

    // The component stays published; nothing killed it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tree.component_count(root.id()), 1);
}

#[tokio::test]
async fn test_drop_without_detach_kills() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let handle = root.create_component(sleep_launch()).await;
    assert_eq!(tree.component_count(root.id()), 1);
    drop(handle);

    let tree_ref = Arc::clone(&tree);
    let root_id = root.id();
    wait_until(move || tree_ref.component_count(root_id) == 0).await;
}

#[tokio::test]
async fn test_directory_ready_precedes_termination() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let export = dir.path().join("export");
    std::fs::create_dir_all(export.join("diagnostics")).unwrap();
    let binary = script(dir.path(), "short_lived", "sleep 0.5");

    let mut launch = LaunchInfo::new(format!("file://{}", binary.display()));
    launch.directory_request = Some(export);
    let mut handle = root.create_component(launch).await;

    let first = handle.next_event().await.unwrap();
    assert_eq!(first, magikrealm::ControllerEvent::DirectoryReady);
    let (code, reason) = handle.wait_for_termination().await.unwrap();
    assert_eq!((code, reason), (0, TerminationReason::Exited));
}
