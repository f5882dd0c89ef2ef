//! Integration tests for namespaces as components actually receive them
//! through the creation pipeline: isolated storage on disk, realm-level
//! and per-launch service injection, and the allowlist gate.

use async_trait::async_trait;
use magikrealm::controller::SharedDirectories;
use magikrealm::{
    Capability, ComponentRunner, ComponentUrl, Error, LaunchInfo, LoaderRegistry, Package,
    PackageLoader, RealmOptions, RealmTree, RealmTreeConfig, Result, RunnerConnector,
    ServiceConnector, ServiceInjection, ServiceRoute, TerminationReason, CACHE_PATH, DATA_PATH,
    EVENT_PROVIDER_SERVICE, STARTUP_FAILURE_RETURN_CODE, SVC_PATH,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

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

/// Loader serving `/bin/sleep` under any `pkg` URL, with a configurable
/// manifest.
struct ManifestLoader {
    manifest: Option<Vec<u8>>,
}

#[async_trait]
impl PackageLoader for ManifestLoader {
    async fn load_url(&self, url: &ComponentUrl) -> Result<Package> {
        Ok(Package {
            resolved_url: url.clone(),
            directory: PathBuf::from("/bin"),
            binary: Some(PathBuf::from("/bin/sleep")),
            runner_url: None,
            manifest: self.manifest.clone(),
        })
    }
}

fn tree_with_manifest(base: &Path, manifest: Option<&str>) -> Arc<RealmTree> {
    let loaders = LoaderRegistry::new();
    loaders.register(
        "pkg",
        Arc::new(ManifestLoader {
            manifest: manifest.map(|m| m.as_bytes().to_vec()),
        }),
    );
    RealmTree::new(RealmTreeConfig {
        base_storage: base.to_path_buf(),
        loaders: Arc::new(loaders),
        connector: Arc::new(NoRunners),
    })
}

fn sleep_launch(url: &str) -> LaunchInfo {
    let mut launch = LaunchInfo::new(url);
    launch.arguments = vec!["30".to_string()];
    launch
}

#[tokio::test]
async fn test_component_storage_is_created_under_realm_roots() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree_with_manifest(dir.path(), None);
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let handle = root.create_component(sleep_launch("pkg://host/demo")).await;
    let ns = tree
        .component_namespace(root.id(), handle.identity().instance_id)
        .unwrap();

    let Some(Capability::Storage(data)) = ns.get(DATA_PATH) else {
        panic!("missing data storage entry");
    };
    assert!(data.starts_with(dir.path().join("data")));
    assert!(data.is_dir());

    let Some(Capability::Storage(cache)) = ns.get(CACHE_PATH) else {
        panic!("missing cache storage entry");
    };
    assert!(cache.starts_with(dir.path().join("cache")));
    assert!(cache.is_dir());
}

#[tokio::test]
async fn test_nested_realm_storage_sits_under_the_marker() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree_with_manifest(dir.path(), None);
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let sys = root
        .create_nested("sys", RealmOptions::default(), Vec::new())
        .unwrap();

    let handle = sys.create_component(sleep_launch("pkg://host/demo")).await;
    let ns = tree
        .component_namespace(sys.id(), handle.identity().instance_id)
        .unwrap();

    let Some(Capability::Storage(data)) = ns.get(DATA_PATH) else {
        panic!("missing data storage entry");
    };
    assert!(data.starts_with(dir.path().join("data").join("r#").join("sys")));
    assert!(data.is_dir());
}

#[tokio::test]
async fn test_same_name_different_urls_get_distinct_storage() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree_with_manifest(dir.path(), None);
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let a = root.create_component(sleep_launch("pkg://alpha/demo")).await;
    let b = root.create_component(sleep_launch("pkg://beta/demo")).await;

    let ns_a = tree
        .component_namespace(root.id(), a.identity().instance_id)
        .unwrap();
    let ns_b = tree
        .component_namespace(root.id(), b.identity().instance_id)
        .unwrap();

    let (Some(Capability::Storage(da)), Some(Capability::Storage(db))) =
        (ns_a.get(DATA_PATH), ns_b.get(DATA_PATH))
    else {
        panic!("missing data storage entries");
    };
    assert_ne!(da, db);
}

#[tokio::test]
async fn test_launch_injection_routes_to_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree_with_manifest(dir.path(), None);
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let (connector, mut requests) = ServiceConnector::new();
    let mut launch = sleep_launch("pkg://host/demo");
    launch.additional_services.push(ServiceInjection {
        name: "metrics.Collector".to_string(),
        connector,
    });

    let handle = root.create_component(launch).await;
    let ns = tree
        .component_namespace(root.id(), handle.identity().instance_id)
        .unwrap();

    let entry = ns.get(&format!("{SVC_PATH}/metrics.Collector")).unwrap();
    let Capability::Service(ServiceRoute::Injected(endpoint)) = entry else {
        panic!("injection not routed to the caller endpoint");
    };
    endpoint
        .0
        .send(magikrealm::ServiceRequest {
            path: "metrics.Collector".to_string(),
        })
        .unwrap();
    assert_eq!(requests.recv().await.unwrap().path, "metrics.Collector");
}

#[tokio::test]
async fn test_realm_injection_applies_to_all_members() {
    let dir = tempfile::tempdir().unwrap();
    let tree = tree_with_manifest(dir.path(), None);
    let root = tree.create_root(RealmOptions::default()).unwrap();

    let (connector, _requests) = ServiceConnector::new();
    let sys = root
        .create_nested(
            "sys",
            RealmOptions::default(),
            vec![ServiceInjection {
                name: "time.Source".to_string(),
                connector,
            }],
        )
        .unwrap();

    let handle = sys.create_component(sleep_launch("pkg://host/demo")).await;
    let ns = tree
        .component_namespace(sys.id(), handle.identity().instance_id)
        .unwrap();
    assert!(ns
        .get(&format!("{SVC_PATH}/time.Source"))
        .unwrap()
        .is_injected());
}

#[tokio::test]
async fn test_event_provider_gate_through_the_pipeline() {
    let manifest = r#"{"features": ["component-event-provider"]}"#;
    let dir = tempfile::tempdir().unwrap();
    let tree = tree_with_manifest(dir.path(), Some(manifest));
    let root = tree.create_root(RealmOptions::default()).unwrap();

    // Not allowlisted: namespace construction fails before any spawn.
    let mut denied = root.create_component(sleep_launch("pkg://host/demo")).await;
    assert_eq!(
        denied.wait_for_termination().await,
        Some((
            STARTUP_FAILURE_RETURN_CODE,
            TerminationReason::InternalError
        ))
    );

    let options = RealmOptions {
        event_provider_allowlist: vec!["pkg://host/demo".to_string()],
        ..Default::default()
    };
    let allowed_realm = root
        .create_nested("observers", options, Vec::new())
        .unwrap();
    let handle = allowed_realm
        .create_component(sleep_launch("pkg://host/demo"))
        .await;
    let ns = tree
        .component_namespace(allowed_realm.id(), handle.identity().instance_id)
        .unwrap();
    assert!(ns.contains_key(&format!("{SVC_PATH}/{EVENT_PROVIDER_SERVICE}")));
}
