//! # magikrealm
//!
//! **Component and Realm Lifecycle Manager**
//!
//! This crate is the orchestration heart of a capability-based component
//! system: given a request to start a packaged program, it resolves the
//! package, builds an isolated filesystem/service namespace, starts the
//! program inside a freshly created resource container, and supervises it
//! until termination, fanning structured start/stop/ready events out to
//! observers. Running programs are organized into a tree of realms,
//! nested administrative domains each owning its own container, storage,
//! and locally scoped services.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magikrealm                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                        Orchestrator                         │    │
//! │  │   root realm │ restart backoff │ watchdog │ Resolve surface │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │                        RealmTree (arena)                    │    │
//! │  │  "app" ── "sys" ── "net" ...   parent as plain id, no cycles│    │
//! │  │  per realm: container │ storage roots │ components │ runners│    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────┐  ┌────────────┴───┐  ┌─────────────────────┐      │
//! │  │ NamespaceBuilder│ │  Controllers  │  │   Event Fan-Out     │      │
//! │  │ {path→capability}│ │ native/bridge │  │ nearest-ancestor    │      │
//! │  │  + storage derivation│ one Terminated│ │ listener routing  │      │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Controller Lifecycle
//!
//! Every component, native or runner-hosted, presents the same contract:
//!
//! ```text
//!   ┌──────────────┐          ┌─────────┐              ┌────────────┐
//!   │ Constructing │ ───────► │ Running │ ───────────► │ Terminated │
//!   └──────────────┘          └────┬────┘   exit/kill  └────────────┘
//!                                  │                    (absorbing,
//!                                  ▼                     at most one)
//!                          DirectoryReady
//!                     (orthogonal, at most once,
//!                      always before Terminated)
//! ```
//!
//! Creation itself never fails synchronously: `create_component` answers
//! with a [`ComponentHandle`] even when the URL is garbage or the package
//! is missing, and the failure arrives as a component born already
//! terminated with a [`TerminationReason`] classifying the cause.
//!
//! # Key Properties
//!
//! - **Kill cascade**: a realm's resource container nests every
//!   descendant's container; destroying a realm is the single
//!   authoritative cancellation primitive for its whole subtree.
//! - **Sandbox construction is pure**: [`NamespaceBuilder`] computes the
//!   `{path -> capability}` set with no filesystem access; duplicate
//!   paths are a hard error, and isolated-storage derivation is injective
//!   across package identities.
//! - **Runner sharing**: components hosted by the same runner URL share
//!   one runner process; runner death cascades `RUNNER_TERMINATED` to
//!   every hosted component.
//! - **Bounded cache growth**: the [`StorageWatchdog`] purges component
//!   cache directory contents once disk usage crosses its threshold,
//!   recursing through realm markers and never deleting structure.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikrealm::{LaunchInfo, Orchestrator, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> magikrealm::Result<()> {
//!     let config = OrchestratorConfig::new("/var/lib/realms", "file:///system/bin/sysmgr", connector);
//!     let mut orchestrator = Orchestrator::new(config)?;
//!     orchestrator.arm_watchdog();
//!
//!     let handle = orchestrator
//!         .root()
//!         .create_component(LaunchInfo::new("realm-pkg://packages.local/observer"))
//!         .await;
//!     // ... supervise through the handle
//!     Ok(())
//! }
//! ```

pub mod constants;
pub mod container;
pub mod controller;
pub mod error;
pub mod events;
pub mod loader;
pub mod namespace;
pub mod orchestrator;
pub mod realm;
pub mod runner;
pub mod sandbox;
pub mod storage;
pub mod url;

// Re-exports
pub use constants::*;
pub use container::{ContainerHandle, ResourceContainer};
pub use controller::bridge::{RemoteController, RemoteControllerDriver};
pub use controller::native::OutputSink;
pub use controller::{
    ComponentHandle, ComponentIdentity, ControllerEvent, DiagnosticsSource, DirectoryReadyState,
    SharedDirectories,
};
pub use error::{Error, Result, TerminationReason};
pub use events::{AttributedLogSink, ComponentEvent, EventKind, EventMoniker, EventStream};
pub use loader::{LoaderRegistry, Package, PackageLoader, Resolved, ResolveStatus};
pub use namespace::{
    Capability, Namespace, NamespaceBuilder, RealmDefaults, ServiceConnector, ServiceInjection,
    ServiceRequest, ServiceRoute, StorageRoots,
};
pub use orchestrator::{
    is_permanent_failure, BackoffPolicy, BackoffState, Orchestrator, OrchestratorConfig,
};
pub use realm::{
    ComponentInfo, LaunchInfo, RealmHandle, RealmId, RealmInfo, RealmOptions, RealmTree,
    RealmTreeConfig, RunnerInfo,
};
pub use runner::{ComponentRunner, RunnerConnector, StartupInfo};
pub use sandbox::SandboxManifest;
pub use storage::{CacheControl, DiskUsage, StatvfsSource, StorageWatchdog, UsageSource};
pub use url::ComponentUrl;
