//! Runner delegation.
//!
//! A runner is itself a component that hosts other components whose
//! packages name it as their execution environment. The realm launches the
//! runner once per canonical runner URL and shares it: every hosted
//! component gets a [bridge](crate::controller::bridge) wired to a
//! [`RemoteController`] the runner hands back.
//!
//! ```text
//! Realm ──▶ RunnerHolder ──▶ runner ComponentHandle (the runner itself)
//!               │
//!               ├──▶ bridge #1 ─── RemoteController (hosted component)
//!               └──▶ bridge #2 ─── RemoteController
//! ```
//!
//! When the runner terminates, every live bridge is force-terminated with
//! `RUNNER_TERMINATED`. The holder never restarts a runner; a later
//! request under the same URL goes through find-or-create again.

use crate::controller::bridge::{ForceTerminate, RemoteController};
use crate::controller::{ComponentHandle, SharedDirectories};
use crate::error::Result;
use crate::loader::Package;
use crate::namespace::Namespace;
use crate::url::ComponentUrl;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};

// =============================================================================
// Runner Contract
// =============================================================================

/// Per-component startup information handed to the runner alongside the
/// package and namespace.
#[derive(Debug, Clone)]
pub struct StartupInfo {
    /// Resolved component URL (with resource, if any).
    pub url: String,
    /// Component label within its realm.
    pub label: String,
    /// Program arguments.
    pub arguments: Vec<String>,
}

/// A connected runner able to host components.
#[async_trait]
pub trait ComponentRunner: Send + Sync {
    /// Starts one hosted component and returns the controller endpoint the
    /// runner will drive for it.
    async fn start_component(
        &self,
        package: &Package,
        startup: StartupInfo,
        namespace: Namespace,
    ) -> Result<RemoteController>;
}

/// Resolves a started runner component into a [`ComponentRunner`].
///
/// External collaborator: the transport between this process and the
/// runner's service directory lives behind this seam.
#[async_trait]
pub trait RunnerConnector: Send + Sync {
    async fn connect(
        &self,
        runner_url: &ComponentUrl,
        runner_dirs: SharedDirectories,
    ) -> Result<Arc<dyn ComponentRunner>>;
}

/// A launched-and-connected runner, produced by the realm's init closure.
pub(crate) struct ConnectedRunner {
    pub runner: Arc<dyn ComponentRunner>,
    /// The runner component's own controller handle. Dropping it (holder
    /// teardown) kills the runner through the kill-on-drop default.
    pub handle: ComponentHandle,
}

// =============================================================================
// Runner Holder
// =============================================================================

struct BridgeState {
    label: String,
    force: ForceTerminate,
}

/// One shared runner within a realm, keyed by canonical runner URL.
///
/// Find-or-create is idempotent: the underlying connection is established
/// at most once via the init cell, even under interleaved creation calls.
pub(crate) struct RunnerHolder {
    url: String,
    weak: Weak<Self>,
    cell: OnceCell<Arc<dyn ComponentRunner>>,
    bridges: RwLock<HashMap<u64, BridgeState>>,
    next_bridge_id: AtomicU64,
    terminated: AtomicBool,
    shutdown: mpsc::UnboundedSender<()>,
    shutdown_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl RunnerHolder {
    /// Creates an empty holder for `url` (canonical, resource stripped).
    pub fn new(url: String) -> Arc<Self> {
        let (shutdown, shutdown_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| Self {
            url,
            weak: weak.clone(),
            cell: OnceCell::new(),
            bridges: RwLock::new(HashMap::new()),
            next_bridge_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            shutdown,
            shutdown_rx: tokio::sync::Mutex::new(Some(shutdown_rx)),
        })
    }

    /// Canonical runner URL this holder serves.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// True once the runner component has terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Returns the connected runner, launching it through `start` exactly
    /// once. Concurrent callers share the single in-flight launch.
    pub async fn ensure_connected<F, Fut>(&self, start: F) -> Result<Arc<dyn ComponentRunner>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConnectedRunner>>,
    {
        let runner = self
            .cell
            .get_or_try_init(|| async move {
                let connected = start().await?;
                self.watch(connected.handle).await;
                Ok::<_, crate::error::Error>(connected.runner)
            })
            .await?;
        Ok(Arc::clone(runner))
    }

    /// Registers a bridge under this runner. If the runner is already
    /// gone the bridge is force-terminated on the spot.
    pub fn attach_bridge(&self, label: String, force: ForceTerminate) -> u64 {
        let id = self.next_bridge_id.fetch_add(1, Ordering::SeqCst);
        if self.is_terminated() {
            let _ = force.send(());
            return id;
        }
        if let Ok(mut bridges) = self.bridges.write() {
            bridges.insert(id, BridgeState { label, force });
        }
        id
    }

    /// Removes a bridge record once its component has terminated.
    pub fn detach_bridge(&self, id: u64) {
        if let Ok(mut bridges) = self.bridges.write() {
            bridges.remove(&id);
        }
    }

    /// Number of live hosted components.
    pub fn bridge_count(&self) -> usize {
        self.bridges.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Labels of live hosted components, sorted for introspection.
    pub fn hosted_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .bridges
            .read()
            .map(|bridges| bridges.values().map(|state| state.label.clone()).collect())
            .unwrap_or_default();
        labels.sort();
        labels
    }

    /// Arms the watch task owning the runner's own handle.
    async fn watch(&self, mut handle: ComponentHandle) {
        let holder: Weak<Self> = self.weak.clone();
        let mut shutdown_rx = match self.shutdown_rx.lock().await.take() {
            Some(rx) => rx,
            // ensure_connected runs the init at most once.
            None => return,
        };
        tokio::spawn(async move {
            tokio::select! {
                term = handle.wait_for_termination() => {
                    if let Some(holder) = holder.upgrade() {
                        holder.cascade(term.map(|(code, _)| code));
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Holder torn down; dropping the handle kills the
                    // runner through the kill-on-drop default.
                }
            }
        });
    }

    /// Force-terminates every live bridge after the runner died.
    fn cascade(&self, return_code: Option<i64>) {
        self.terminated.store(true, Ordering::SeqCst);
        let drained: Vec<BridgeState> = match self.bridges.write() {
            Ok(mut bridges) => bridges.drain().map(|(_, state)| state).collect(),
            Err(_) => return,
        };
        warn!(
            runner_url = %self.url,
            return_code = ?return_code,
            hosted = drained.len(),
            "runner terminated, cascading to hosted components"
        );
        for state in drained {
            debug!(label = %state.label, "force-terminating hosted component");
            let _ = state.force.send(());
        }
    }
}

impl Drop for RunnerHolder {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
