//! Error types for the component lifecycle layer.
//!
//! Creation-time failures are never surfaced through these errors to the
//! component's caller: `create_component` models failure as a component born
//! already terminated, delivering a [`TerminationReason`] over the caller's
//! controller channel instead. The [`Error`] enum covers everything else --
//! realm management, namespace construction, storage, and internal faults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the component lifecycle layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Realm Errors
    // =========================================================================
    /// Realm not found in the tree.
    #[error("realm not found: {0}")]
    RealmNotFound(u64),

    /// A sibling realm with the same label already exists.
    #[error("realm label already in use: {0}")]
    DuplicateLabel(String),

    /// Invalid realm or component label.
    #[error("invalid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    /// Realm tree limit exceeded.
    #[error("realm limit exceeded: {0}")]
    RealmLimitExceeded(String),

    // =========================================================================
    // Component Errors
    // =========================================================================
    /// Component not found.
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    /// Component URL failed to parse.
    #[error("invalid component URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No loader registered for the URL scheme.
    #[error("no loader for scheme '{0}'")]
    SchemeNotSupported(String),

    /// Package resolution failed.
    #[error("failed to load package '{url}': {reason}")]
    PackageLoadFailed { url: String, reason: String },

    /// Component process could not be spawned.
    #[error("failed to start component '{url}': {reason}")]
    StartFailed { url: String, reason: String },

    // =========================================================================
    // Namespace Errors
    // =========================================================================
    /// The same namespace path was declared twice.
    ///
    /// Duplicate declarations are a hard construction error, never
    /// last-writer-wins.
    #[error("duplicate namespace path: {0}")]
    DuplicateNamespacePath(String),

    /// A sandbox path escapes the package directory.
    #[error("sandbox path escapes package root: {0}")]
    PathTraversal(String),

    /// A manifest requested a restricted feature without authorization.
    #[error("feature '{feature}' not allowed for '{url}'")]
    FeatureNotAllowed { feature: String, url: String },

    /// Sandbox manifest failed validation.
    #[error("invalid sandbox manifest: {0}")]
    ManifestInvalid(String),

    // =========================================================================
    // Runner Errors
    // =========================================================================
    /// Runner component could not be started or connected.
    #[error("runner '{url}' unavailable: {reason}")]
    RunnerUnavailable { url: String, reason: String },

    /// Runner rejected a start-component request.
    #[error("runner failed to start component '{url}': {reason}")]
    RunnerStartFailed { url: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Isolated storage could not be initialized.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Disk usage measurement failed.
    #[error("failed to measure disk usage for {path}: {reason}")]
    UsageUnavailable { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Termination Reason
// =============================================================================

/// Why a component controller reached its terminal state.
///
/// Closed set: every terminal event carries exactly one of these, and at
/// most one terminal event is ever delivered per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// The component process exited; the return code is its real exit code
    /// (or the kill return code if terminated via `kill()`).
    Exited,
    /// The component URL failed to parse; nothing was started.
    UrlInvalid,
    /// No package could be resolved for the URL.
    PackageNotFound,
    /// A failure inside the creation pipeline (namespace construction,
    /// container allocation, process spawn) after the URL resolved.
    InternalError,
    /// The runner hosting this component terminated; overrides any prior
    /// per-component state.
    RunnerTerminated,
    /// The peer closed its control endpoint without a recorded reason.
    Unknown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited => write!(f, "EXITED"),
            Self::UrlInvalid => write!(f, "URL_INVALID"),
            Self::PackageNotFound => write!(f, "PACKAGE_NOT_FOUND"),
            Self::InternalError => write!(f, "INTERNAL_ERROR"),
            Self::RunnerTerminated => write!(f, "RUNNER_TERMINATED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}
