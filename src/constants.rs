//! # Realm Manager Constants
//!
//! Defines all resource limits, timeouts, and reserved names for the
//! component lifecycle layer. These constants are the **single source of
//! truth** for security-critical bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion while allowing
//! legitimate workloads. Each constant includes the bounded value and the
//! attack vector it mitigates.
//!
//! ## Cross-References
//!
//! - [`crate::realm`]: Uses label validation and realm/component limits
//! - [`crate::namespace`]: Uses the storage marker and path constants
//! - [`crate::storage`]: Uses the watchdog period and threshold defaults
//! - [`crate::orchestrator`]: Uses the backoff bounds

use std::time::Duration;

// =============================================================================
// Labels and Reserved Names
// =============================================================================
//
// Realm labels become filesystem path components for isolated storage, so
// the charset is allowlist-based and deliberately excludes everything the
// reserved marker name uses.
// =============================================================================

/// Valid characters for realm and component labels.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes `/`, `#`, and other characters usable for path
/// traversal when labels are used in filesystem paths. The exclusion of `#`
/// also guarantees no label can ever collide with [`REALM_STORAGE_MARKER`].
pub const LABEL_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum label length.
///
/// **Rationale**: 100 characters accommodates descriptive names while
/// keeping derived storage paths well under filesystem limits.
pub const MAX_LABEL_LEN: usize = 100;

/// Directory name marking a nested realm inside an isolated storage tree.
///
/// Storage for a child realm lives under `<parent-root>/r#/<child-label>/`.
/// Because `#` is outside [`LABEL_VALID_CHARS`], no component or realm can
/// ever be named `r#`, so the storage sweeper can distinguish realm nesting
/// from per-component directories by name alone.
pub const REALM_STORAGE_MARKER: &str = "r#";

/// Reserved top realm segment stripped from log attribution paths.
///
/// The root realm appears as `app` in event monikers but log sinks
/// attribute output relative to it, so the leading segment is dropped when
/// resolving log attribution. See [`crate::events::LogConnector`].
pub const ROOT_REALM_SEGMENT: &str = "app";

/// Label given to the root realm.
pub const ROOT_REALM_LABEL: &str = "app";

/// Subdirectory of the storage base holding persistent data roots.
pub const DATA_SUBDIR: &str = "data";

/// Subdirectory of the storage base holding cache roots. The watchdog
/// sweeps this tree.
pub const CACHE_SUBDIR: &str = "cache";

/// Subdirectory of the storage base holding temporary roots.
pub const TMP_SUBDIR: &str = "tmp";

// =============================================================================
// Tree Limits
// =============================================================================

/// Maximum live components per realm.
///
/// **Security**: Prevents unbounded memory growth from component tracking.
pub const MAX_COMPONENTS_PER_REALM: usize = 1024;

/// Maximum child realms per realm.
///
/// **Security**: Bounds the fanout of the realm tree; combined with
/// [`MAX_REALM_DEPTH`] this bounds total tree size.
pub const MAX_CHILD_REALMS: usize = 256;

/// Maximum nesting depth of the realm tree.
///
/// **Rationale**: Storage paths gain two components per level
/// (`r#/<label>`); 32 levels stays far below `PATH_MAX` on every platform.
pub const MAX_REALM_DEPTH: usize = 32;

// =============================================================================
// Controller Timing
// =============================================================================

/// Maximum delayed attempts to observe a component's diagnostics sub-entry.
///
/// Components may advertise their export directory before populating
/// subdirectories, so the directory-ready poll retries a bounded number of
/// times before abandoning the diagnostics entry.
pub const MAX_DIRECTORY_READY_ATTEMPTS: u32 = 10;

/// Delay between directory-ready poll attempts.
pub const DIRECTORY_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Return code delivered when a component is terminated via `kill()`.
///
/// Distinguishable from any exit status the process could produce on its
/// own, matching the task-kill return code convention.
pub const KILL_RETURN_CODE: i64 = -1024;

/// Return code delivered for creation-time failures (the component is born
/// already terminated).
pub const STARTUP_FAILURE_RETURN_CODE: i64 = -1;

// =============================================================================
// Storage Watchdog
// =============================================================================

/// Period between storage watchdog sweeps.
///
/// **Rationale**: Cache growth is gradual; a one-minute cadence bounds the
/// overshoot past the threshold without measurable idle cost.
pub const STORAGE_WATCHDOG_PERIOD: Duration = Duration::from_secs(60);

/// Default disk usage percentage at which cache purging begins.
pub const STORAGE_WATCHDOG_THRESHOLD_PERCENT: u64 = 95;

// =============================================================================
// Restart Backoff
// =============================================================================
//
// Only the top-level managed system component is auto-restarted. Backoff
// state is per-orchestrator, never global.
// =============================================================================

/// Minimum delay before restarting the managed system component.
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Maximum delay between restarts of the managed system component.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Uptime after which the restart backoff resets to the floor.
pub const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(30);

/// Exit code treated as an invalid-argument failure.
///
/// A managed component exiting with this code is classified permanently
/// failed and is not restarted (conventional `EX_USAGE` from sysexits).
pub const INVALID_ARGS_EXIT_CODE: i64 = 64;

// =============================================================================
// Namespace Paths
// =============================================================================

/// Namespace path of the package directory capability.
pub const PKG_PATH: &str = "/pkg";

/// Namespace path of the isolated persistent storage capability.
pub const DATA_PATH: &str = "/data";

/// Namespace path of the isolated cache storage capability.
pub const CACHE_PATH: &str = "/cache";

/// Namespace path of the isolated temporary storage capability.
pub const TMP_PATH: &str = "/tmp";

/// Namespace directory under which services are exposed.
pub const SVC_PATH: &str = "/svc";

/// Service name of the nested-environment capability.
pub const ENVIRONMENT_SERVICE: &str = "magikrealm.Environment";

/// Service name of the component launcher capability.
pub const LAUNCHER_SERVICE: &str = "magikrealm.Launcher";

/// Service name of the package resolver capability.
pub const RESOLVER_SERVICE: &str = "magikrealm.Resolver";

/// Service name of the component event provider capability.
///
/// Gated by [`EVENT_PROVIDER_FEATURE`] plus an explicit per-realm allowlist.
pub const EVENT_PROVIDER_SERVICE: &str = "magikrealm.ComponentEventProvider";

/// Sandbox feature requesting the component event provider capability.
pub const EVENT_PROVIDER_FEATURE: &str = "component-event-provider";

// =============================================================================
// Label Validation Helper
// =============================================================================

/// Validates a realm or component label for safety.
///
/// # Security
///
/// Labels become filesystem path components, so this ensures they:
/// - Are non-empty
/// - Don't exceed [`MAX_LABEL_LEN`]
/// - Only contain characters from [`LABEL_VALID_CHARS`]
/// - Are not `.` or `..`
#[inline]
#[must_use = "validation result must be checked before using the label in a path"]
pub fn validate_label(label: &str) -> std::result::Result<(), &'static str> {
    if label.is_empty() {
        return Err("label cannot be empty");
    }
    if label.len() > MAX_LABEL_LEN {
        return Err("label exceeds maximum length");
    }
    if label == "." || label == ".." {
        return Err("label cannot be a relative path component");
    }
    if !label.chars().all(|c| LABEL_VALID_CHARS.contains(c)) {
        return Err("label contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_labels() {
        assert!(validate_label("sys").is_ok());
        assert!(validate_label("my-component_v1.2").is_ok());
    }

    #[test]
    fn test_invalid_labels() {
        assert!(validate_label("").is_err());
        assert!(validate_label("a/b").is_err());
        assert!(validate_label("..").is_err());
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn test_storage_marker_is_not_a_valid_label() {
        // The sweeper relies on this: no real component can occupy the
        // marker name inside a storage tree.
        assert!(validate_label(REALM_STORAGE_MARKER).is_err());
    }
}
