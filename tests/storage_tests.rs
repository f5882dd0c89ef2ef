//! Integration tests for the storage watchdog against real component
//! storage laid out by the realm tree.

use async_trait::async_trait;
use magikrealm::controller::SharedDirectories;
use magikrealm::{
    CacheControl, Capability, ComponentRunner, ComponentUrl, DiskUsage, Error, LaunchInfo,
    LoaderRegistry, RealmOptions, RealmTree, RealmTreeConfig, Result, RunnerConnector,
    StorageWatchdog, UsageSource, CACHE_PATH, DATA_PATH,
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

struct FixedUsage(DiskUsage);

impl UsageSource for FixedUsage {
    fn usage(&self, _path: &Path) -> Result<DiskUsage> {
        Ok(self.0)
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

/// Lays out real component storage in a nested realm and returns the
/// component's cache and data directories.
async fn populated(base: &Path) -> (Arc<RealmTree>, PathBuf, PathBuf) {
    let tree = tree(base);
    let root = tree.create_root(RealmOptions::default()).unwrap();
    let mut sys = root
        .create_nested("sys", RealmOptions::default(), Vec::new())
        .unwrap();
    sys.detach();
    let mut root = root;
    root.detach();

    let mut handle = tree.create_component(sys.id(), sleep_launch()).await;
    handle.detach();
    let ns = tree
        .component_namespace(sys.id(), handle.identity().instance_id)
        .unwrap();

    let Some(Capability::Storage(cache)) = ns.get(CACHE_PATH) else {
        panic!("missing cache storage entry");
    };
    let Some(Capability::Storage(data)) = ns.get(DATA_PATH) else {
        panic!("missing data storage entry");
    };
    std::fs::write(cache.join("blob.bin"), b"cached").unwrap();
    std::fs::create_dir_all(cache.join("shards")).unwrap();
    std::fs::write(cache.join("shards/0"), b"shard").unwrap();
    std::fs::write(data.join("state.json"), b"{}").unwrap();
    (tree, cache.clone(), data.clone())
}

#[tokio::test]
async fn test_purge_empties_cache_but_keeps_data_and_structure() {
    let dir = tempfile::tempdir().unwrap();
    let (_tree, cache, data) = populated(dir.path()).await;

    let watchdog = StorageWatchdog::new(
        dir.path(),
        dir.path().join("cache"),
        95,
        Arc::new(FixedUsage(DiskUsage {
            used: 96,
            available: 4,
        })),
    );
    assert!(watchdog.check_and_purge().unwrap());

    // Contents gone, component directory and realm markers intact.
    assert!(cache.is_dir());
    assert!(!cache.join("blob.bin").exists());
    assert!(!cache.join("shards").exists());
    assert!(dir.path().join("cache/r#/sys").is_dir());
    // Data storage is out of scope for the watchdog.
    assert!(data.join("state.json").exists());
}

#[tokio::test]
async fn test_below_threshold_leaves_the_cache_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (_tree, cache, _data) = populated(dir.path()).await;

    let watchdog = StorageWatchdog::new(
        dir.path(),
        dir.path().join("cache"),
        95,
        Arc::new(FixedUsage(DiskUsage {
            used: 50,
            available: 50,
        })),
    );
    assert!(!watchdog.check_and_purge().unwrap());
    assert!(cache.join("blob.bin").exists());
}

#[tokio::test]
async fn test_periodic_watchdog_purges_on_its_own() {
    let dir = tempfile::tempdir().unwrap();
    let (_tree, cache, _data) = populated(dir.path()).await;

    let watchdog = Arc::new(StorageWatchdog::new(
        dir.path(),
        dir.path().join("cache"),
        95,
        Arc::new(FixedUsage(DiskUsage {
            used: 99,
            available: 1,
        })),
    ));
    let task = Arc::clone(&watchdog).spawn(Duration::from_millis(20));

    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.join("blob.bin").exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("watchdog never purged");
    task.abort();
}

#[tokio::test]
async fn test_cache_control_clears_unconditionally() {
    let dir = tempfile::tempdir().unwrap();
    let (_tree, cache, _data) = populated(dir.path()).await;

    // Usage far below threshold; the administrative clear ignores it.
    let watchdog = Arc::new(StorageWatchdog::new(
        dir.path(),
        dir.path().join("cache"),
        95,
        Arc::new(FixedUsage(DiskUsage {
            used: 1,
            available: 99,
        })),
    ));
    CacheControl::new(watchdog).clear();
    assert!(!cache.join("blob.bin").exists());
    assert!(cache.is_dir());
}
