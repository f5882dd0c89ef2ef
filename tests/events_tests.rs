//! Integration tests for event fan-out and log attribution: one listener
//! slot per realm, nearest-bound-ancestor routing, and Start synthesis on
//! late binding.

use async_trait::async_trait;
use magikrealm::controller::SharedDirectories;
use magikrealm::{
    ComponentRunner, ComponentUrl, Error, EventKind, LaunchInfo, LoaderRegistry, RealmOptions,
    RealmTree, RealmTreeConfig, Result, RunnerConnector, ServiceRequest,
};
use std::path::Path;
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

#[tokio::test]
async fn test_start_event_reaches_bound_listener() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let mut events = root.set_event_listener().unwrap();

    let handle = root.create_component(sleep_launch()).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::Start);
    assert_eq!(event.moniker.url, "file:///bin/sleep");
    assert_eq!(event.moniker.realm_path, vec!["app".to_string()]);
    assert_eq!(event.moniker.instance_id, handle.identity().instance_id);
}

#[tokio::test]
async fn test_stop_event_follows_kill() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let mut events = root.set_event_listener().unwrap();

    let mut handle = root.create_component(sleep_launch()).await;
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Start);

    handle.kill();
    handle.wait_for_termination().await;
    let stop = events.recv().await.unwrap();
    assert_eq!(stop.kind, EventKind::Stop);
    assert_eq!(stop.moniker.realm_path, vec!["app".to_string()]);
}

#[tokio::test]
async fn test_late_bind_synthesizes_start_for_live_components() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let a = root.create_component(sleep_launch()).await;
    let b = root.create_component(sleep_launch()).await;

    let mut events = root.set_event_listener().unwrap();
    let mut seen = vec![
        events.recv().await.unwrap().moniker.instance_id,
        events.recv().await.unwrap().moniker.instance_id,
    ];
    seen.sort();
    let mut expected = vec![a.identity().instance_id, b.identity().instance_id];
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_synthesis_skips_subrealms_with_their_own_listener() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let sys = root
        .create_nested("sys", RealmOptions::default(), Vec::new())
        .unwrap();

    let mut sys_events = sys.set_event_listener().unwrap();
    let _inner = sys.create_component(sleep_launch()).await;
    assert_eq!(sys_events.recv().await.unwrap().kind, EventKind::Start);

    // Binding the root afterwards must not re-announce the component the
    // sub-realm's listener already owns.
    let mut root_events = root.set_event_listener().unwrap();
    let synthesized =
        tokio::time::timeout(Duration::from_millis(200), root_events.recv()).await;
    assert!(synthesized.is_err());
}

#[tokio::test]
async fn test_events_route_to_nearest_bound_ancestor() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let sys = root
        .create_nested("sys", RealmOptions::default(), Vec::new())
        .unwrap();
    let net = sys
        .create_nested("net", RealmOptions::default(), Vec::new())
        .unwrap();

    let mut events = root.set_event_listener().unwrap();
    let _handle = net.create_component(sleep_launch()).await;

    let start = events.recv().await.unwrap();
    assert_eq!(start.kind, EventKind::Start);
    assert_eq!(
        start.moniker.realm_path,
        vec!["app".to_string(), "sys".to_string(), "net".to_string()]
    );
}

#[tokio::test]
async fn test_listener_slot_is_one_shot_until_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let first = root.set_event_listener().unwrap();
    assert!(root.set_event_listener().is_none());

    drop(first);
    assert!(root.set_event_listener().is_some());
}

#[tokio::test]
async fn test_log_sink_is_attributed_to_its_realm() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let sys = root
        .create_nested("sys", RealmOptions::default(), Vec::new())
        .unwrap();

    let mut logs = root.set_log_listener().unwrap();
    assert!(sys.connect_log_sink(ServiceRequest {
        path: "LogSink".to_string(),
    }));

    let sink = logs.recv().await.unwrap();
    // The reserved top segment is stripped for attribution.
    assert_eq!(sink.realm_path, vec!["sys".to_string()]);
    assert_eq!(sink.request.path, "LogSink");
}

#[tokio::test]
async fn test_log_sink_without_any_listener_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree(dir.path());
    let root = tree.create_root(RealmOptions::default()).unwrap();

    assert!(!root.connect_log_sink(ServiceRequest {
        path: "LogSink".to_string(),
    }));
}
