//! Storage-eviction watchdog.
//!
//! Bounds cache storage growth: on a fixed period the watchdog measures
//! disk usage for the watched path and, at or above the threshold, purges
//! the *contents* of every per-component cache directory under the
//! cleaned root. Realm nesting markers (`r#`) are recursed through, never
//! deleted as leaves; the label charset guarantees no component directory
//! ever carries the marker name.
//!
//! ```text
//! <cache root>/
//! ├── observer-3f1a2b4c5d6e7f80/      contents deleted
//! └── r#/                             recursed, kept
//!     └── sys/                        recursed, kept
//!         └── netstack-001122334455/  contents deleted
//! ```
//!
//! Deletion is best-effort: a missing top directory is not an error, an
//! unreadable entry is skipped and the sweep continues.

use crate::constants::REALM_STORAGE_MARKER;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Disk Usage
// =============================================================================

/// One disk usage measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes in use on the filesystem.
    pub used: u64,
    /// Bytes still available to unprivileged writers.
    pub available: u64,
}

impl DiskUsage {
    /// Usage as a percentage of `used + available`. An empty filesystem
    /// reports zero.
    pub fn usage_percent(&self) -> u64 {
        // Widened so used * 100 cannot overflow on very large filesystems.
        let used = u128::from(self.used);
        let total = used + u128::from(self.available);
        if total == 0 {
            return 0;
        }
        (used * 100 / total) as u64
    }
}

/// Measures filesystem usage for a path. Tests inject fixed numbers.
pub trait UsageSource: Send + Sync {
    fn usage(&self, path: &Path) -> Result<DiskUsage>;
}

/// Default source backed by `statvfs(2)`.
pub struct StatvfsSource;

impl UsageSource for StatvfsSource {
    fn usage(&self, path: &Path) -> Result<DiskUsage> {
        use std::os::unix::ffi::OsStrExt;

        let raw = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            Error::UsageUnavailable {
                path: path.to_path_buf(),
                reason: "path contains an interior NUL".to_string(),
            }
        })?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(raw.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(Error::UsageUnavailable {
                path: path.to_path_buf(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }

        let frsize = stats.f_frsize as u64;
        let used = (stats.f_blocks as u64).saturating_sub(stats.f_bfree as u64) * frsize;
        let available = stats.f_bavail as u64 * frsize;
        Ok(DiskUsage { used, available })
    }
}

// =============================================================================
// Storage Watchdog
// =============================================================================

/// Periodic cache evictor for one storage tree.
pub struct StorageWatchdog {
    path_to_watch: PathBuf,
    path_to_clean: PathBuf,
    threshold_percent: u64,
    source: Arc<dyn UsageSource>,
}

impl StorageWatchdog {
    pub fn new(
        path_to_watch: impl Into<PathBuf>,
        path_to_clean: impl Into<PathBuf>,
        threshold_percent: u64,
        source: Arc<dyn UsageSource>,
    ) -> Self {
        Self {
            path_to_watch: path_to_watch.into(),
            path_to_clean: path_to_clean.into(),
            threshold_percent,
            source,
        }
    }

    /// Current usage of the watched path.
    pub fn usage(&self) -> Result<DiskUsage> {
        self.source.usage(&self.path_to_watch)
    }

    /// One watchdog iteration. Returns whether a purge ran.
    pub fn check_and_purge(&self) -> Result<bool> {
        let usage = self.usage()?;
        let percent = usage.usage_percent();
        if percent < self.threshold_percent {
            debug!(percent, threshold = self.threshold_percent, "storage below threshold");
            return Ok(false);
        }
        info!(
            percent,
            threshold = self.threshold_percent,
            path = %self.path_to_clean.display(),
            "storage threshold reached, purging cache"
        );
        self.purge_cache();
        Ok(true)
    }

    /// Empties every per-component cache directory under the cleaned root.
    ///
    /// The root itself and the realm-nesting structure survive; only
    /// component directory contents go.
    pub fn purge_cache(&self) {
        purge_tree(&self.path_to_clean);
    }

    /// Arms the periodic task. Runs until the watchdog is dropped by way
    /// of the returned handle being aborted, or forever otherwise.
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so an arm-time
            // purge does not race root realm setup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.check_and_purge() {
                    warn!(error = %e, "storage watchdog iteration failed");
                }
            }
        })
    }
}

/// Recursive sweep of one cache level: component directories are emptied,
/// realm markers are descended into.
fn purge_tree(root: &Path) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        // Missing or unreadable top directory: nothing to purge.
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name() == REALM_STORAGE_MARKER {
            // One marker level holds per-child-realm directories, each of
            // which is itself a cache level.
            if let Ok(realm_dirs) = std::fs::read_dir(&path) {
                for realm_dir in realm_dirs.flatten() {
                    purge_tree(&realm_dir.path());
                }
            }
        } else {
            clear_contents(&path);
        }
    }
}

/// Removes the contents of a component cache directory, keeping the
/// directory node itself.
fn clear_contents(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to evict cache entry");
        }
    }
}

// =============================================================================
// Cache Control
// =============================================================================

/// Administrative hook running the purge synchronously. Test and ops use
/// only.
pub struct CacheControl {
    watchdog: Arc<StorageWatchdog>,
}

impl CacheControl {
    pub fn new(watchdog: Arc<StorageWatchdog>) -> Self {
        Self { watchdog }
    }

    /// Purges the cache tree immediately, regardless of usage.
    pub fn clear(&self) {
        info!("cache clear requested");
        self.watchdog.purge_cache();
    }
}
