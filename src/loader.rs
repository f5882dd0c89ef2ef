//! Package loading interfaces.
//!
//! Package resolution and fetching live outside the lifecycle core; this
//! module defines the seam. A [`PackageLoader`] turns a parsed
//! [`ComponentUrl`] into a [`Package`] -- the resolved URL, a read-only
//! package directory, the binary to execute (for native components), an
//! optional runner URL (for runner-hosted components), and the raw sandbox
//! manifest bytes.
//!
//! The [`LoaderRegistry`] dispatches by URL scheme, mirroring the runtime
//! registry pattern: one loader per scheme, queried at component creation.
//! A built-in `file` scheme loader is always registered so plain binaries
//! can be launched without any package infrastructure.

use crate::error::{Error, Result};
use crate::url::ComponentUrl;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

// =============================================================================
// Package
// =============================================================================

/// A resolved package, ready for namespace construction and launch.
#[derive(Debug, Clone)]
pub struct Package {
    /// Canonical URL after resolution (redirects collapsed).
    pub resolved_url: ComponentUrl,
    /// Read-only package directory. Sandbox directory declarations resolve
    /// under this root.
    pub directory: PathBuf,
    /// Binary to execute for natively spawned components.
    pub binary: Option<PathBuf>,
    /// Runner URL when execution is delegated; `Some` classifies the
    /// component as runner-hosted.
    pub runner_url: Option<String>,
    /// Raw sandbox manifest bytes, if the package carries one.
    pub manifest: Option<Vec<u8>>,
}

impl Package {
    /// True if this package must be executed by a delegate runner.
    pub fn is_runner_hosted(&self) -> bool {
        self.runner_url.is_some()
    }
}

// =============================================================================
// PackageLoader Trait
// =============================================================================

/// Resolves component URLs to packages.
///
/// Implementations fetch from a content store, a local package set, or (for
/// tests) an in-memory map. The lifecycle core calls `load_url` exactly
/// once per component creation, before namespace construction.
#[async_trait]
pub trait PackageLoader: Send + Sync {
    /// Loads the package named by `url`.
    ///
    /// # Errors
    ///
    /// [`Error::PackageLoadFailed`] when the URL is well-formed but no
    /// package exists for it; the creation pipeline maps this to a
    /// `PACKAGE_NOT_FOUND` termination.
    async fn load_url(&self, url: &ComponentUrl) -> Result<Package>;
}

// =============================================================================
// Resolve Surface
// =============================================================================

/// Status of a [`LoaderRegistry::resolve`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The name resolved to a binary image.
    Ok,
    /// No package or binary matched the name.
    NotFound,
    /// The name was malformed.
    InvalidName,
}

/// Result of resolving a name to an executable image.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Resolution status.
    pub status: ResolveStatus,
    /// Path to the binary image, when found.
    pub binary: Option<PathBuf>,
    /// Path to the dynamic linker the image requests, when found.
    pub dynamic_linker: Option<PathBuf>,
}

impl Resolved {
    fn not_found() -> Self {
        Self {
            status: ResolveStatus::NotFound,
            binary: None,
            dynamic_linker: None,
        }
    }
}

// =============================================================================
// Loader Registry
// =============================================================================

/// Scheme-keyed registry of package loaders.
///
/// ## Thread Safety
///
/// Registration happens at orchestrator construction; lookups are
/// lock-cheap reads afterwards.
pub struct LoaderRegistry {
    loaders: RwLock<HashMap<String, Arc<dyn PackageLoader>>>,
}

impl LoaderRegistry {
    /// Creates a registry with the built-in `file` scheme loader.
    pub fn new() -> Self {
        let registry = Self {
            loaders: RwLock::new(HashMap::new()),
        };
        registry.register("file", Arc::new(FileLoader));
        registry
    }

    /// Registers a loader for a URL scheme, replacing any previous one.
    pub fn register(&self, scheme: &str, loader: Arc<dyn PackageLoader>) {
        if let Ok(mut loaders) = self.loaders.write() {
            debug!(scheme, "registered package loader");
            loaders.insert(scheme.to_string(), loader);
        }
    }

    /// Returns the loader for a scheme.
    ///
    /// # Errors
    ///
    /// [`Error::SchemeNotSupported`] when no loader is registered; the
    /// creation pipeline maps this to a `URL_INVALID` termination.
    pub fn loader_for(&self, scheme: &str) -> Result<Arc<dyn PackageLoader>> {
        self.loaders
            .read()
            .map_err(|_| Error::Internal("loader registry lock poisoned".to_string()))?
            .get(scheme)
            .cloned()
            .ok_or_else(|| Error::SchemeNotSupported(scheme.to_string()))
    }

    /// Resolves a name to `(status, binary image, dynamic linker)`.
    ///
    /// Accepts either a component URL or a bare filesystem path. This is
    /// the `Resolve` capability surface; it never errors, reporting failure
    /// through [`ResolveStatus`] instead.
    pub async fn resolve(&self, name: &str) -> Resolved {
        let url = if name.starts_with('/') {
            format!("file://{name}")
        } else {
            name.to_string()
        };

        let parsed = match ComponentUrl::parse(&url) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Resolved {
                    status: ResolveStatus::InvalidName,
                    binary: None,
                    dynamic_linker: None,
                }
            }
        };

        let loader = match self.loader_for(parsed.scheme()) {
            Ok(loader) => loader,
            Err(_) => return Resolved::not_found(),
        };

        match loader.load_url(&parsed).await {
            Ok(package) => match package.binary {
                Some(binary) => Resolved {
                    status: ResolveStatus::Ok,
                    dynamic_linker: interpreter_of(&binary),
                    binary: Some(binary),
                },
                None => Resolved::not_found(),
            },
            Err(_) => Resolved::not_found(),
        }
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the dynamic linker (ELF interpreter) a binary requests, if any.
///
/// Best-effort: a binary without a PT_INTERP entry, or one that cannot be
/// read, simply yields `None`.
fn interpreter_of(binary: &Path) -> Option<PathBuf> {
    let data = std::fs::read(binary).ok()?;
    // ELF magic + 64-bit class only; everything else is served statically.
    if data.len() < 64 || &data[..4] != b"\x7fELF" || data[4] != 2 {
        return None;
    }
    let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
    let u64_at = |off: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[off..off + 8]);
        u64::from_le_bytes(buf)
    };
    let phoff = u64_at(0x20) as usize;
    let phentsize = u16_at(0x36) as usize;
    let phnum = u16_at(0x38) as usize;
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        if base + 0x30 > data.len() {
            return None;
        }
        let p_type = u32::from_le_bytes([data[base], data[base + 1], data[base + 2], data[base + 3]]);
        if p_type == 3 {
            // PT_INTERP
            let offset = u64_at(base + 0x08) as usize;
            let size = u64_at(base + 0x20) as usize;
            if offset + size > data.len() || size == 0 {
                return None;
            }
            let raw = &data[offset..offset + size - 1]; // trailing NUL
            return Some(PathBuf::from(String::from_utf8_lossy(raw).to_string()));
        }
    }
    None
}

// =============================================================================
// File Loader
// =============================================================================

/// Loads `file://` URLs as bare binaries with no package or manifest.
///
/// The package directory is the binary's parent directory, exposed
/// read-only. Useful for bootstrap components and tests.
struct FileLoader;

#[async_trait]
impl PackageLoader for FileLoader {
    async fn load_url(&self, url: &ComponentUrl) -> Result<Package> {
        let binary = PathBuf::from(url.path());
        if !binary.is_file() {
            return Err(Error::PackageLoadFailed {
                url: url.to_string(),
                reason: "no such file".to_string(),
            });
        }
        let directory = binary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Package {
            resolved_url: url.clone(),
            directory,
            binary: Some(binary),
            runner_url: None,
            manifest: None,
        })
    }
}
