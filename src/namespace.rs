//! # Namespace Construction
//!
//! Deterministically computes the flat `{path -> capability}` set a
//! component process will see. Inputs, in merge order:
//!
//! 1. The sandbox manifest: package-relative read-only directories,
//!    declared service names, optional privileged features
//! 2. Per-component isolated storage paths for data/cache/temp, namespaced
//!    by a path injectively derived from package identity
//! 3. The realm's default capabilities (environment/launcher/resolver, and
//!    the event provider when explicitly allowlisted)
//! 4. Caller-injected services, which shadow identically named defaults
//!
//! ## Invariants
//!
//! - Every sandboxed path resolves under the package's own directory or an
//!   explicitly isolated storage root; no arbitrary traversal
//! - The output set contains no duplicate paths; a duplicate declaration is
//!   a hard construction error, never last-writer-wins
//! - Isolated-storage derivation never collides across distinct package
//!   identities (label prefix for readability, content hash for injectivity)
//! - A manifest requesting a restricted feature without authorization fails
//!   construction with a typed error rather than silently degrading
//!
//! ## Storage Layout
//!
//! ```text
//! <base>/data/
//! ├── observer-3f1a2b4c5d6e7f80/        per-component isolated storage
//! └── r#/                               realm-nesting marker
//!     └── sys/
//!         └── netstack-0011223344556677/
//! ```

use crate::constants::{
    CACHE_PATH, DATA_PATH, ENVIRONMENT_SERVICE, EVENT_PROVIDER_FEATURE, EVENT_PROVIDER_SERVICE,
    LAUNCHER_SERVICE, PKG_PATH, RESOLVER_SERVICE, SVC_PATH, TMP_PATH,
};
use crate::error::{Error, Result};
use crate::loader::Package;
use crate::sandbox::SandboxManifest;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

// =============================================================================
// Capabilities
// =============================================================================

/// A request to open a service endpoint from inside a component namespace.
#[derive(Debug)]
pub struct ServiceRequest {
    /// Path the component opened, relative to the service root.
    pub path: String,
}

/// Caller-side endpoint a namespace service routes open requests to.
#[derive(Debug, Clone)]
pub struct ServiceConnector(pub mpsc::UnboundedSender<ServiceRequest>);

impl ServiceConnector {
    /// Creates a connector plus the receiving half for the service owner.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

/// How a namespace service entry is served.
#[derive(Debug, Clone)]
pub enum ServiceRoute {
    /// Served by the owning realm's default service provider.
    Realm,
    /// Connected directly to a caller-supplied endpoint.
    Injected(ServiceConnector),
}

/// One capability in a component namespace.
#[derive(Debug, Clone)]
pub enum Capability {
    /// Read-only package-relative directory.
    Directory(PathBuf),
    /// Isolated mutable storage root, exclusive to this component.
    Storage(PathBuf),
    /// Named service endpoint.
    Service(ServiceRoute),
    /// Nested-environment creation capability.
    Environment,
    /// Component launcher capability.
    Launcher,
    /// Package resolver capability.
    Resolver,
    /// Component event provider capability (allowlist gated).
    EventProvider,
}

impl Capability {
    /// True for injected service entries (used to verify shadowing).
    pub fn is_injected(&self) -> bool {
        matches!(self, Capability::Service(ServiceRoute::Injected(_)))
    }
}

/// A caller-injected service, merged last into the namespace.
#[derive(Debug, Clone)]
pub struct ServiceInjection {
    /// Service name, exposed as `/svc/<name>`.
    pub name: String,
    /// Endpoint open requests are routed to.
    pub connector: ServiceConnector,
}

/// Flat `{path -> capability}` set for one component.
///
/// `BTreeMap` keeps iteration deterministic, so two builds from identical
/// inputs produce identical namespaces.
pub type Namespace = BTreeMap<String, Capability>;

// =============================================================================
// Storage Derivation
// =============================================================================

/// Per-realm isolated storage roots.
#[derive(Debug, Clone)]
pub struct StorageRoots {
    /// Persistent storage root for this realm.
    pub data: PathBuf,
    /// Cache storage root for this realm (subject to the watchdog).
    pub cache: PathBuf,
    /// Temporary storage root for this realm.
    pub temp: PathBuf,
}

/// Derives the per-component storage directory name from package identity.
///
/// The sanitized package name keeps paths readable; the hash of the
/// canonical URL (resource fragment excluded) guarantees injectivity: two
/// distinct package identities never share a directory even if their names
/// sanitize identically.
pub fn storage_index(canonical_url: &str, name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect();
    let digest = Sha256::digest(canonical_url.as_bytes());
    format!("{}-{}", sanitized, hex::encode(&digest[..8]))
}

// =============================================================================
// Namespace Builder
// =============================================================================

/// Realm-scoped inputs to namespace construction.
#[derive(Debug, Clone)]
pub struct RealmDefaults {
    /// The realm's isolated storage roots.
    pub storage: StorageRoots,
    /// Component URLs allowed to request the event provider capability.
    pub event_provider_allowlist: Vec<String>,
}

/// Builds component namespaces. Pure: no filesystem access; storage
/// directories are created separately by [`ensure_storage_dirs`].
pub struct NamespaceBuilder;

impl NamespaceBuilder {
    /// Computes the namespace for one component.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateNamespacePath`] for any duplicate declaration
    /// - [`Error::PathTraversal`] when a sandbox dir escapes the package
    /// - [`Error::FeatureNotAllowed`] for unauthorized restricted features
    pub fn build(
        package: &Package,
        manifest: &SandboxManifest,
        defaults: &RealmDefaults,
        injected: &[ServiceInjection],
    ) -> Result<Namespace> {
        manifest.validate()?;

        let url = package.resolved_url.without_resource();
        let index = storage_index(&url, package.resolved_url.name());

        let mut ns = Namespace::new();

        // Package directory plus declared package-relative directories.
        insert_unique(&mut ns, PKG_PATH.to_string(), Capability::Directory(package.directory.clone()))?;
        for dir in &manifest.dirs {
            let source = resolve_under(&package.directory, dir)?;
            insert_unique(&mut ns, format!("/{dir}"), Capability::Directory(source))?;
        }

        // Isolated storage, namespaced by package identity.
        insert_unique(
            &mut ns,
            DATA_PATH.to_string(),
            Capability::Storage(defaults.storage.data.join(&index)),
        )?;
        insert_unique(
            &mut ns,
            CACHE_PATH.to_string(),
            Capability::Storage(defaults.storage.cache.join(&index)),
        )?;
        if manifest.has_feature("isolated-temp") {
            insert_unique(
                &mut ns,
                TMP_PATH.to_string(),
                Capability::Storage(defaults.storage.temp.join(&index)),
            )?;
        }

        // Declared services.
        for service in &manifest.services {
            insert_unique(
                &mut ns,
                format!("{SVC_PATH}/{service}"),
                Capability::Service(ServiceRoute::Realm),
            )?;
        }

        // Realm defaults. Declared services may not squat on these names.
        insert_unique(&mut ns, format!("{SVC_PATH}/{ENVIRONMENT_SERVICE}"), Capability::Environment)?;
        insert_unique(&mut ns, format!("{SVC_PATH}/{LAUNCHER_SERVICE}"), Capability::Launcher)?;
        insert_unique(&mut ns, format!("{SVC_PATH}/{RESOLVER_SERVICE}"), Capability::Resolver)?;

        if manifest.has_feature(EVENT_PROVIDER_FEATURE) {
            if !defaults.event_provider_allowlist.iter().any(|allowed| allowed == &url) {
                return Err(Error::FeatureNotAllowed {
                    feature: EVENT_PROVIDER_FEATURE.to_string(),
                    url,
                });
            }
            insert_unique(
                &mut ns,
                format!("{SVC_PATH}/{EVENT_PROVIDER_SERVICE}"),
                Capability::EventProvider,
            )?;
        }

        // Caller-injected services shadow identically named defaults, but
        // duplicates among the injections themselves are still hard errors.
        let mut seen_injected = std::collections::HashSet::new();
        for injection in injected {
            if !seen_injected.insert(injection.name.clone()) {
                return Err(Error::DuplicateNamespacePath(format!(
                    "{SVC_PATH}/{}",
                    injection.name
                )));
            }
            ns.insert(
                format!("{SVC_PATH}/{}", injection.name),
                Capability::Service(ServiceRoute::Injected(injection.connector.clone())),
            );
        }

        debug!(url = %package.resolved_url, entries = ns.len(), "built component namespace");
        Ok(ns)
    }
}

/// Inserts an entry, failing on a duplicate path.
fn insert_unique(ns: &mut Namespace, path: String, capability: Capability) -> Result<()> {
    if ns.contains_key(&path) {
        return Err(Error::DuplicateNamespacePath(path));
    }
    ns.insert(path, capability);
    Ok(())
}

/// Resolves a package-relative directory, rejecting escapes.
fn resolve_under(package_dir: &Path, relative: &str) -> Result<PathBuf> {
    if relative.starts_with('/') || relative.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return Err(Error::PathTraversal(relative.to_string()));
    }
    Ok(package_dir.join(relative))
}

/// Creates the isolated storage directories a namespace references.
///
/// # Errors
///
/// [`Error::StorageInitFailed`] when a directory cannot be created; the
/// creation pipeline unwinds this to an `INTERNAL_ERROR` termination.
pub fn ensure_storage_dirs(ns: &Namespace) -> Result<()> {
    for capability in ns.values() {
        if let Capability::Storage(path) = capability {
            std::fs::create_dir_all(path).map_err(|e| Error::StorageInitFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(())
}

/// Removes a realm's isolated storage subtree.
///
/// Used when a realm configured with `delete_storage_on_death` reaches zero
/// components. Best-effort: a subtree that is already gone is not an error.
pub fn delete_storage_roots(roots: &StorageRoots) {
    for root in [&roots.data, &roots.cache, &roots.temp] {
        if root.exists() {
            if let Err(e) = std::fs::remove_dir_all(root) {
                tracing::warn!(path = %root.display(), error = %e, "failed to delete isolated storage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::ComponentUrl;

    fn test_package(url: &str) -> Package {
        Package {
            resolved_url: ComponentUrl::parse(url).unwrap(),
            directory: PathBuf::from("/packages/demo"),
            binary: Some(PathBuf::from("/packages/demo/bin/app")),
            runner_url: None,
            manifest: None,
        }
    }

    fn test_defaults() -> RealmDefaults {
        RealmDefaults {
            storage: StorageRoots {
                data: PathBuf::from("/store/data"),
                cache: PathBuf::from("/store/cache"),
                temp: PathBuf::from("/store/tmp"),
            },
            event_provider_allowlist: Vec::new(),
        }
    }

    #[test]
    fn test_build_contains_defaults_and_storage() {
        let ns = NamespaceBuilder::build(
            &test_package("pkg://host/demo"),
            &SandboxManifest::default(),
            &test_defaults(),
            &[],
        )
        .unwrap();

        assert!(matches!(ns.get(PKG_PATH), Some(Capability::Directory(_))));
        assert!(matches!(ns.get(DATA_PATH), Some(Capability::Storage(_))));
        assert!(matches!(ns.get(CACHE_PATH), Some(Capability::Storage(_))));
        // No isolated-temp feature, no /tmp.
        assert!(!ns.contains_key(TMP_PATH));
        assert!(ns.contains_key(&format!("{SVC_PATH}/{LAUNCHER_SERVICE}")));
    }

    #[test]
    fn test_storage_index_is_injective() {
        let a = storage_index("pkg://host/demo", "demo");
        let b = storage_index("pkg://other/demo", "demo");
        assert_ne!(a, b);
        assert!(a.starts_with("demo-"));
    }

    #[test]
    fn test_duplicate_dir_is_hard_error() {
        let manifest = SandboxManifest {
            dirs: vec!["lib".to_string(), "lib".to_string()],
            ..Default::default()
        };
        let result = NamespaceBuilder::build(
            &test_package("pkg://host/demo"),
            &manifest,
            &test_defaults(),
            &[],
        );
        assert!(matches!(result, Err(Error::DuplicateNamespacePath(_))));
    }

    #[test]
    fn test_injected_service_shadows_declared() {
        let manifest = SandboxManifest {
            services: vec!["metrics.Collector".to_string()],
            ..Default::default()
        };
        let (connector, _rx) = ServiceConnector::new();
        let ns = NamespaceBuilder::build(
            &test_package("pkg://host/demo"),
            &manifest,
            &test_defaults(),
            &[ServiceInjection {
                name: "metrics.Collector".to_string(),
                connector,
            }],
        )
        .unwrap();
        assert!(ns.get("/svc/metrics.Collector").unwrap().is_injected());
    }

    #[test]
    fn test_event_provider_requires_allowlist() {
        let manifest = SandboxManifest {
            features: vec![EVENT_PROVIDER_FEATURE.to_string()],
            ..Default::default()
        };
        let result = NamespaceBuilder::build(
            &test_package("pkg://host/demo"),
            &manifest,
            &test_defaults(),
            &[],
        );
        assert!(matches!(result, Err(Error::FeatureNotAllowed { .. })));

        let mut defaults = test_defaults();
        defaults.event_provider_allowlist.push("pkg://host/demo".to_string());
        let ns = NamespaceBuilder::build(
            &test_package("pkg://host/demo"),
            &manifest,
            &defaults,
            &[],
        )
        .unwrap();
        assert!(ns.contains_key(&format!("{SVC_PATH}/{EVENT_PROVIDER_SERVICE}")));
    }
}
