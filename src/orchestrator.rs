//! Top-level orchestrator.
//!
//! Owns the root realm, arms the storage watchdog, and supervises the
//! managed system component with restart backoff. All retry state lives
//! here, constructed once and threaded through; nothing in this crate
//! keeps mutable state in a file-scope static.

use crate::constants::{
    BACKOFF_CEILING, BACKOFF_FLOOR, BACKOFF_RESET_AFTER, CACHE_SUBDIR, INVALID_ARGS_EXIT_CODE,
    STORAGE_WATCHDOG_PERIOD, STORAGE_WATCHDOG_THRESHOLD_PERCENT,
};
use crate::error::{Result, TerminationReason};
use crate::loader::{LoaderRegistry, Resolved};
use crate::realm::{LaunchInfo, RealmHandle, RealmId, RealmOptions, RealmTree, RealmTreeConfig};
use crate::runner::RunnerConnector;
use crate::storage::{CacheControl, StatvfsSource, StorageWatchdog, UsageSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

// =============================================================================
// Restart Backoff
// =============================================================================

/// Backoff shape for the managed system component.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// First retry delay.
    pub floor: Duration,
    /// Delay cap.
    pub ceiling: Duration,
    /// Uptime after which the next failure restarts from the floor.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: BACKOFF_FLOOR,
            ceiling: BACKOFF_CEILING,
            reset_after: BACKOFF_RESET_AFTER,
        }
    }
}

/// Mutable backoff state, owned by the orchestrator.
#[derive(Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    current: Duration,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.floor,
        }
    }

    /// Records how long the component stayed alive before failing. A
    /// stable run resets the ladder.
    pub fn note_uptime(&mut self, alive: Duration) {
        if alive >= self.policy.reset_after {
            self.current = self.policy.floor;
        }
    }

    /// Delay before the next restart; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.policy.ceiling);
        delay
    }
}

/// A failure that must not be retried: any terminal state other than a
/// process exit, or an invalid-argument-like exit code.
pub fn is_permanent_failure(return_code: i64, reason: TerminationReason) -> bool {
    reason != TerminationReason::Exited || return_code == INVALID_ARGS_EXIT_CODE
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Construction inputs.
pub struct OrchestratorConfig {
    /// Base directory for isolated storage roots.
    pub base_storage: PathBuf,
    /// URL of the managed system component.
    pub system_url: String,
    /// Arguments for the managed system component.
    pub system_arguments: Vec<String>,
    /// Scheme-keyed package loaders.
    pub loaders: Arc<LoaderRegistry>,
    /// Runner connection seam.
    pub connector: Arc<dyn RunnerConnector>,
    /// Options applied to the root realm.
    pub root_options: RealmOptions,
    /// Restart policy for the system component.
    pub backoff: BackoffPolicy,
    /// Storage usage source; defaults to statvfs.
    pub usage_source: Arc<dyn UsageSource>,
    /// Watchdog trigger threshold.
    pub watchdog_threshold_percent: u64,
    /// Watchdog period.
    pub watchdog_period: Duration,
}

impl OrchestratorConfig {
    pub fn new(
        base_storage: impl Into<PathBuf>,
        system_url: impl Into<String>,
        connector: Arc<dyn RunnerConnector>,
    ) -> Self {
        Self {
            base_storage: base_storage.into(),
            system_url: system_url.into(),
            system_arguments: Vec::new(),
            loaders: Arc::new(LoaderRegistry::new()),
            connector,
            root_options: RealmOptions::default(),
            backoff: BackoffPolicy::default(),
            usage_source: Arc::new(StatvfsSource),
            watchdog_threshold_percent: STORAGE_WATCHDOG_THRESHOLD_PERCENT,
            watchdog_period: STORAGE_WATCHDOG_PERIOD,
        }
    }
}

/// The process-level owner of the realm tree.
pub struct Orchestrator {
    tree: Arc<RealmTree>,
    root: RealmHandle,
    loaders: Arc<LoaderRegistry>,
    watchdog: Arc<StorageWatchdog>,
    watchdog_period: Duration,
    system_url: String,
    system_arguments: Vec<String>,
    backoff: BackoffState,
}

impl Orchestrator {
    /// Builds the tree and the root realm. Nothing runs yet.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let tree = RealmTree::new(RealmTreeConfig {
            base_storage: config.base_storage.clone(),
            loaders: Arc::clone(&config.loaders),
            connector: config.connector,
        });
        let root = tree.create_root(config.root_options)?;
        let watchdog = Arc::new(StorageWatchdog::new(
            config.base_storage.clone(),
            config.base_storage.join(CACHE_SUBDIR),
            config.watchdog_threshold_percent,
            config.usage_source,
        ));
        Ok(Self {
            tree,
            root,
            loaders: config.loaders,
            watchdog,
            watchdog_period: config.watchdog_period,
            system_url: config.system_url,
            system_arguments: config.system_arguments,
            backoff: BackoffState::new(config.backoff),
        })
    }

    /// The realm tree, for capability surfaces layered on top.
    pub fn tree(&self) -> &Arc<RealmTree> {
        &self.tree
    }

    /// The root realm handle. Dropping the orchestrator tears the whole
    /// tree down through it.
    pub fn root(&self) -> &RealmHandle {
        &self.root
    }

    pub fn root_id(&self) -> RealmId {
        self.root.id()
    }

    /// Arms the storage watchdog's periodic task.
    pub fn arm_watchdog(&self) -> tokio::task::JoinHandle<()> {
        info!(period = ?self.watchdog_period, "arming storage watchdog");
        Arc::clone(&self.watchdog).spawn(self.watchdog_period)
    }

    /// Administrative synchronous purge hook.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::new(Arc::clone(&self.watchdog))
    }

    /// The `Resolve` capability surface. Never errors.
    pub async fn resolve(&self, name: &str) -> Resolved {
        self.loaders.resolve(name).await
    }

    /// Runs the managed system component until it fails permanently.
    ///
    /// Each crash restarts it after the backoff delay; a non-exit
    /// termination or an invalid-argument exit stops the loop and returns
    /// the final `(return_code, reason)`.
    pub async fn run_system_component(&mut self) -> (i64, TerminationReason) {
        loop {
            let mut launch = LaunchInfo::new(self.system_url.clone());
            launch.arguments = self.system_arguments.clone();

            info!(url = %self.system_url, "starting system component");
            let started = Instant::now();
            let mut handle = self.tree.create_component(self.root.id(), launch).await;
            let (return_code, reason) = handle
                .wait_for_termination()
                .await
                .unwrap_or((-1, TerminationReason::Unknown));
            let alive = started.elapsed();

            if is_permanent_failure(return_code, reason) {
                warn!(
                    url = %self.system_url,
                    return_code,
                    reason = %reason,
                    "system component failed permanently"
                );
                return (return_code, reason);
            }

            self.backoff.note_uptime(alive);
            let delay = self.backoff.next_delay();
            warn!(
                url = %self.system_url,
                return_code,
                alive_secs = alive.as_secs(),
                delay_ms = delay.as_millis() as u64,
                "system component exited, restarting after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
