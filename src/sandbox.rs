//! Sandbox manifest types.
//!
//! A sandbox manifest is the declarative list of filesystem and service
//! capabilities a component may request. Parsing package metadata into this
//! structured form is an external concern; the lifecycle core consumes the
//! structured request and validates it during namespace construction.
//!
//! ```json
//! {
//!   "dirs": ["lib", "config"],
//!   "services": ["metrics.Collector"],
//!   "features": ["isolated-temp"]
//! }
//! ```

use crate::constants::EVENT_PROVIDER_FEATURE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum manifest size accepted (64 KiB).
///
/// **Security**: Prevents memory exhaustion from malformed package
/// metadata. Real manifests are a few hundred bytes.
pub const MAX_SANDBOX_MANIFEST_SIZE: usize = 64 * 1024;

/// Sandbox features the lifecycle core understands.
///
/// Everything else in a manifest's `features` list fails validation rather
/// than silently degrading.
pub const KNOWN_FEATURES: &[&str] = &["isolated-temp", EVENT_PROVIDER_FEATURE];

/// Features that additionally require a per-realm allowlist entry.
pub const RESTRICTED_FEATURES: &[&str] = &[EVENT_PROVIDER_FEATURE];

/// Structured sandbox request for one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxManifest {
    /// Package-relative read-only directories to map into the namespace.
    #[serde(default)]
    pub dirs: Vec<String>,

    /// Service names the component may connect to under `/svc`.
    #[serde(default)]
    pub services: Vec<String>,

    /// Optional privileged flags.
    #[serde(default)]
    pub features: Vec<String>,
}

impl SandboxManifest {
    /// Parses a manifest from raw package metadata bytes.
    ///
    /// # Errors
    ///
    /// [`Error::ManifestInvalid`] for oversized or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_SANDBOX_MANIFEST_SIZE {
            return Err(Error::ManifestInvalid(format!(
                "manifest exceeds {MAX_SANDBOX_MANIFEST_SIZE} bytes"
            )));
        }
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validates declared paths and features.
    ///
    /// Directory declarations must stay package-relative: absolute paths
    /// and `..` components are rejected, never resolved. Unknown features
    /// fail here; restricted features are checked against the realm
    /// allowlist later, when the requesting URL is known.
    pub fn validate(&self) -> Result<()> {
        for dir in &self.dirs {
            if dir.is_empty() {
                return Err(Error::ManifestInvalid("empty dir declaration".to_string()));
            }
            if dir.starts_with('/') {
                return Err(Error::PathTraversal(dir.clone()));
            }
            if dir.split('/').any(|seg| seg == ".." || seg.is_empty()) {
                return Err(Error::PathTraversal(dir.clone()));
            }
        }
        for service in &self.services {
            if service.is_empty() || service.contains('/') {
                return Err(Error::ManifestInvalid(format!(
                    "invalid service name: '{service}'"
                )));
            }
        }
        for feature in &self.features {
            if !KNOWN_FEATURES.contains(&feature.as_str()) {
                return Err(Error::ManifestInvalid(format!(
                    "unknown feature: '{feature}'"
                )));
            }
        }
        Ok(())
    }

    /// True if the manifest requests the given feature.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}
