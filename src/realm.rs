//! Realm tree and component creation pipeline.
//!
//! Realms are nested administrative domains. Each owns a resource
//! container, isolated storage roots, its local components and runners,
//! and the listener slots event/log fan-out binds to. The tree is an
//! arena: realms live in one id-keyed map, a node stores its parent as a
//! plain id and owns its children's ids, so there are no reference cycles
//! and teardown is an arena removal.
//!
//! ```text
//! RealmTree
//! └── "app" (root)
//!     ├── components: {observer, netstack}
//!     ├── runners: {"pkg://host/dart_runner" -> RunnerHolder}
//!     └── "sys"
//!         └── components: {updater}
//! ```
//!
//! # Creation Pipeline
//!
//! `create_component` never returns an error. Every failure binds the
//! caller's handle to a component born already terminated, carrying the
//! [`TerminationReason`] that classifies where the pipeline stopped:
//!
//! 1. Parse the URL (`URL_INVALID`)
//! 2. Load the package (`URL_INVALID` for unknown schemes,
//!    `PACKAGE_NOT_FOUND` for load failures)
//! 3. Parse the sandbox manifest, build the namespace, create storage
//!    (`INTERNAL_ERROR`)
//! 4. Classify native vs runner-hosted and start the matching controller
//!    (`INTERNAL_ERROR`); partially created resources are rolled back by
//!    dropping the component's container before the terminal event

use crate::constants::{
    validate_label, CACHE_SUBDIR, DATA_SUBDIR, MAX_CHILD_REALMS, MAX_COMPONENTS_PER_REALM,
    MAX_REALM_DEPTH, REALM_STORAGE_MARKER, ROOT_REALM_LABEL, STARTUP_FAILURE_RETURN_CODE,
    TMP_SUBDIR,
};
use crate::container::{ContainerHandle, ResourceContainer};
use crate::controller::native::{NativeLaunch, OutputSink};
use crate::controller::{
    born_terminated, bridge, controller_pair, native, ComponentHandle, ComponentIdentity,
    ControllerHooks, SharedDirectories,
};
use crate::error::{Error, Result, TerminationReason};
use crate::events::{
    ComponentEvent, EventKind, EventMoniker, EventSink, EventStream, LogConnector, LogSinkStream,
};
use crate::loader::LoaderRegistry;
use crate::namespace::{
    delete_storage_roots, ensure_storage_dirs, Namespace, NamespaceBuilder, RealmDefaults,
    ServiceInjection, ServiceRequest, StorageRoots,
};
use crate::runner::{ConnectedRunner, RunnerConnector, RunnerHolder, StartupInfo};
use crate::sandbox::SandboxManifest;
use crate::url::ComponentUrl;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Arena index of one realm.
pub type RealmId = u64;

// =============================================================================
// Launch and Realm Options
// =============================================================================

/// Per-realm policy fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct RealmOptions {
    /// Delete the realm's isolated storage subtree when the realm dies.
    pub delete_storage_on_death: bool,
    /// Share runners with the parent realm instead of hosting them here.
    pub use_parent_runners: bool,
    /// Component URLs allowed the event provider capability.
    pub event_provider_allowlist: Vec<String>,
}

/// Everything a caller supplies to `create_component`.
#[derive(Debug)]
pub struct LaunchInfo {
    /// Component URL to resolve and start.
    pub url: String,
    /// Program arguments.
    pub arguments: Vec<String>,
    /// Where the component's stdout goes.
    pub out: OutputSink,
    /// Where the component's stderr goes.
    pub err: OutputSink,
    /// Directory the component exports its services into, if the caller
    /// wants readiness observation.
    pub directory_request: Option<PathBuf>,
    /// Caller-injected services; shadow identically named defaults.
    pub additional_services: Vec<ServiceInjection>,
}

impl LaunchInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            arguments: Vec::new(),
            out: OutputSink::Inherit,
            err: OutputSink::Inherit,
            directory_request: None,
            additional_services: Vec::new(),
        }
    }
}

// =============================================================================
// Introspection Snapshots
// =============================================================================

/// Introspection entry for one live component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub url: String,
    pub label: String,
    pub instance_id: Uuid,
    /// Process id, for native components.
    pub pid: Option<u32>,
    /// Canonical runner URL, for runner-hosted components.
    pub runner_url: Option<String>,
}

/// Introspection entry for one shared runner and the components it hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerInfo {
    /// Canonical runner URL.
    pub url: String,
    /// Labels of live hosted components, sorted.
    pub hosted: Vec<String>,
}

/// Introspection snapshot of one realm.
#[derive(Debug, Clone)]
pub struct RealmInfo {
    pub label: String,
    pub container_id: u64,
    /// Realm labels from the root down to this realm.
    pub path: Vec<String>,
    /// Labels of live child realms.
    pub children: Vec<String>,
    /// Live components, creation order not guaranteed.
    pub components: Vec<ComponentInfo>,
    /// Shared runners held by this realm, sorted by URL.
    pub runners: Vec<RunnerInfo>,
}

// =============================================================================
// Realm Node (arena entry)
// =============================================================================

struct ComponentRecord {
    identity: ComponentIdentity,
    pid: Option<u32>,
    runner_url: Option<String>,
    dirs: SharedDirectories,
    namespace: Namespace,
}

struct RealmNode {
    label: String,
    parent: Option<RealmId>,
    path: Vec<String>,
    container: ResourceContainer,
    storage: StorageRoots,
    options: RealmOptions,
    children: BTreeMap<String, RealmId>,
    components: HashMap<Uuid, ComponentRecord>,
    runners: HashMap<String, Arc<RunnerHolder>>,
    /// Realm-scoped injected services, merged into every component
    /// namespace built here.
    injected: Vec<ServiceInjection>,
    events: Arc<EventSink>,
    logs: Arc<LogConnector>,
}

impl RealmNode {
    fn component_info(record: &ComponentRecord) -> ComponentInfo {
        ComponentInfo {
            url: record.identity.url.clone(),
            label: record.identity.label.clone(),
            instance_id: record.identity.instance_id,
            pid: record.pid,
            runner_url: record.runner_url.clone(),
        }
    }
}

// =============================================================================
// Realm Tree
// =============================================================================

/// External collaborators the tree is constructed over.
pub struct RealmTreeConfig {
    /// Base directory isolated storage roots live under.
    pub base_storage: PathBuf,
    /// Scheme-keyed package loaders.
    pub loaders: Arc<LoaderRegistry>,
    /// Resolves started runner components into runner connections.
    pub connector: Arc<dyn RunnerConnector>,
}

/// The arena of realms.
///
/// ## Thread Safety
///
/// One `RwLock` guards the arena map; it is never held across an await.
/// Async pipeline stages snapshot what they need, run unlocked, and
/// re-acquire to publish.
pub struct RealmTree {
    weak: Weak<Self>,
    realms: RwLock<HashMap<RealmId, RealmNode>>,
    next_id: AtomicU64,
    loaders: Arc<LoaderRegistry>,
    connector: Arc<dyn RunnerConnector>,
    base_storage: PathBuf,
}

impl RealmTree {
    pub fn new(config: RealmTreeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            realms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            loaders: config.loaders,
            connector: config.connector,
            base_storage: config.base_storage,
        })
    }

    // =========================================================================
    // Realm Lifecycle
    // =========================================================================

    /// Creates the root realm. The root carries the reserved label.
    pub fn create_root(&self, options: RealmOptions) -> Result<RealmHandle> {
        let mut realms = self.lock_write()?;
        if realms.values().any(|node| node.parent.is_none()) {
            return Err(Error::DuplicateLabel(ROOT_REALM_LABEL.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let storage = StorageRoots {
            data: self.base_storage.join(DATA_SUBDIR),
            cache: self.base_storage.join(CACHE_SUBDIR),
            temp: self.base_storage.join(TMP_SUBDIR),
        };
        realms.insert(
            id,
            RealmNode {
                label: ROOT_REALM_LABEL.to_string(),
                parent: None,
                path: vec![ROOT_REALM_LABEL.to_string()],
                container: ResourceContainer::new_root(ROOT_REALM_LABEL),
                storage,
                options,
                children: BTreeMap::new(),
                components: HashMap::new(),
                runners: HashMap::new(),
                injected: Vec::new(),
                events: Arc::new(EventSink::default()),
                logs: Arc::new(LogConnector::default()),
            },
        );
        info!(realm = id, "created root realm");
        Ok(self.handle_for(id))
    }

    /// Creates a nested realm under `parent`.
    ///
    /// Label validity and sibling uniqueness are enforced here, at
    /// creation, never retroactively.
    pub fn create_nested(
        &self,
        parent: RealmId,
        label: &str,
        options: RealmOptions,
        additional_services: Vec<ServiceInjection>,
    ) -> Result<RealmHandle> {
        validate_label(label).map_err(|reason| Error::InvalidLabel {
            label: label.to_string(),
            reason: reason.to_string(),
        })?;

        let mut realms = self.lock_write()?;
        let parent_node = realms.get(&parent).ok_or(Error::RealmNotFound(parent))?;
        if parent_node.children.contains_key(label) {
            return Err(Error::DuplicateLabel(label.to_string()));
        }
        if parent_node.children.len() >= MAX_CHILD_REALMS {
            return Err(Error::RealmLimitExceeded(format!(
                "realm has {MAX_CHILD_REALMS} children"
            )));
        }
        if parent_node.path.len() >= MAX_REALM_DEPTH {
            return Err(Error::RealmLimitExceeded(format!(
                "realm tree depth {MAX_REALM_DEPTH} reached"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let container = parent_node.container.create_child(label);
        let storage = StorageRoots {
            data: parent_node.storage.data.join(REALM_STORAGE_MARKER).join(label),
            cache: parent_node.storage.cache.join(REALM_STORAGE_MARKER).join(label),
            temp: parent_node.storage.temp.join(REALM_STORAGE_MARKER).join(label),
        };
        let mut path = parent_node.path.clone();
        path.push(label.to_string());

        let node = RealmNode {
            label: label.to_string(),
            parent: Some(parent),
            path,
            container,
            storage,
            options,
            children: BTreeMap::new(),
            components: HashMap::new(),
            runners: HashMap::new(),
            injected: additional_services,
            events: Arc::new(EventSink::default()),
            logs: Arc::new(LogConnector::default()),
        };
        realms.insert(id, node);
        if let Some(parent_node) = realms.get_mut(&parent) {
            parent_node.children.insert(label.to_string(), id);
        }
        info!(realm = id, parent, label, "created nested realm");
        Ok(self.handle_for(id))
    }

    /// Destroys a realm and its whole subtree.
    ///
    /// The container kill cascade is the single authoritative cancellation
    /// primitive: every descendant component's container nests inside the
    /// realm's, so killing the realm container reaches all of them.
    pub fn destroy_realm(&self, id: RealmId) -> Result<()> {
        let removed = {
            let mut realms = self.lock_write()?;
            let node = realms.get(&id).ok_or(Error::RealmNotFound(id))?;
            if let Some(parent) = node.parent {
                let label = node.label.clone();
                if let Some(parent_node) = realms.get_mut(&parent) {
                    parent_node.children.remove(&label);
                }
            }

            // Collect the subtree, then remove leaves first.
            let mut subtree = vec![id];
            let mut cursor = 0;
            while cursor < subtree.len() {
                if let Some(node) = realms.get(&subtree[cursor]) {
                    subtree.extend(node.children.values().copied());
                }
                cursor += 1;
            }
            let mut removed = Vec::with_capacity(subtree.len());
            for realm_id in subtree.into_iter().rev() {
                if let Some(node) = realms.remove(&realm_id) {
                    removed.push(node);
                }
            }
            removed
        };

        for node in &removed {
            node.container.kill_all();
        }
        for node in removed {
            info!(label = %node.label, components = node.components.len(), "destroyed realm");
            if node.options.delete_storage_on_death {
                delete_storage_roots(&node.storage);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Component Creation Pipeline
    // =========================================================================

    /// Starts a component in `realm`.
    ///
    /// Never returns an error: every failure is delivered as an
    /// already-terminated component over the returned handle.
    pub async fn create_component(&self, realm: RealmId, launch: LaunchInfo) -> ComponentHandle {
        self.create_erased(realm, launch, false).await
    }

    /// Type-erased creation entry. The runner launch recurses into the
    /// pipeline through this boxed form only, which keeps the future's
    /// auto-trait obligations finite.
    fn create_erased(
        &self,
        realm: RealmId,
        launch: LaunchInfo,
        for_runner: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ComponentHandle> + Send + '_>> {
        Box::pin(self.create_component_impl(realm, launch, for_runner))
    }

    async fn create_component_impl(
        &self,
        realm: RealmId,
        mut launch: LaunchInfo,
        for_runner: bool,
    ) -> ComponentHandle {
        let instance_id = Uuid::now_v7();

        // 1. Parse.
        let url = match ComponentUrl::parse(&launch.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %launch.url, error = %e, "rejected component URL");
                return born_terminated(
                    ComponentIdentity {
                        label: launch.url.clone(),
                        url: launch.url,
                        instance_id,
                    },
                    STARTUP_FAILURE_RETURN_CODE,
                    TerminationReason::UrlInvalid,
                );
            }
        };
        let identity = ComponentIdentity {
            url: url.to_string(),
            label: url.name().to_string(),
            instance_id,
        };

        // 2. Load the package.
        let loader = match self.loaders.loader_for(url.scheme()) {
            Ok(loader) => loader,
            Err(e) => {
                warn!(url = %url, error = %e, "no loader for component URL");
                return self.stillborn(identity, TerminationReason::UrlInvalid);
            }
        };
        let package = match loader.load_url(&url).await {
            Ok(package) => package,
            Err(e) => {
                warn!(url = %url, error = %e, "package load failed");
                return self.stillborn(identity, TerminationReason::PackageNotFound);
            }
        };

        // 3. Manifest, namespace, storage.
        let manifest = match &package.manifest {
            Some(bytes) => match SandboxManifest::from_bytes(bytes) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(url = %url, error = %e, "invalid sandbox manifest");
                    return self.stillborn(identity, TerminationReason::InternalError);
                }
            },
            None => SandboxManifest::default(),
        };

        let (defaults, mut injected) = {
            let realms = match self.lock_read() {
                Ok(realms) => realms,
                Err(_) => return self.stillborn(identity, TerminationReason::InternalError),
            };
            let Some(node) = realms.get(&realm) else {
                warn!(realm, url = %url, "create_component against a dead realm");
                return self.stillborn(identity, TerminationReason::InternalError);
            };
            if node.components.len() >= MAX_COMPONENTS_PER_REALM {
                warn!(realm, url = %url, "component limit reached");
                return self.stillborn(identity, TerminationReason::InternalError);
            }
            let defaults = RealmDefaults {
                storage: node.storage.clone(),
                event_provider_allowlist: node.options.event_provider_allowlist.clone(),
            };
            (defaults, node.injected.clone())
        };
        injected.extend(std::mem::take(&mut launch.additional_services));

        let namespace = match NamespaceBuilder::build(&package, &manifest, &defaults, &injected) {
            Ok(namespace) => namespace,
            Err(e) => {
                warn!(url = %url, error = %e, "namespace construction failed");
                return self.stillborn(identity, TerminationReason::InternalError);
            }
        };
        if let Err(e) = ensure_storage_dirs(&namespace) {
            warn!(url = %url, error = %e, "storage initialization failed");
            return self.stillborn(identity, TerminationReason::InternalError);
        }

        // 4. Classify and start.
        if package.is_runner_hosted() {
            // A runner must be a native component. Letting a runner-hosted
            // runner through would re-enter the holder's in-flight launch
            // and wait on itself forever.
            if for_runner {
                warn!(url = %url, "runner package is itself runner-hosted");
                return self.stillborn(identity, TerminationReason::InternalError);
            }
            self.start_bridged(realm, identity, launch.arguments, package, namespace)
                .await
        } else {
            self.start_native(realm, identity, launch, package, namespace)
        }
    }

    fn start_native(
        &self,
        realm: RealmId,
        identity: ComponentIdentity,
        launch: LaunchInfo,
        package: crate::loader::Package,
        namespace: Namespace,
    ) -> ComponentHandle {
        let Some(binary) = package.binary else {
            warn!(url = %identity.url, "package carries no binary");
            return self.stillborn(identity, TerminationReason::InternalError);
        };

        // The component's own container nests inside the realm's.
        let container = {
            let realms = match self.lock_read() {
                Ok(realms) => realms,
                Err(_) => return self.stillborn(identity, TerminationReason::InternalError),
            };
            match realms.get(&realm) {
                Some(node) => node.container.create_child(&identity.label),
                None => return self.stillborn(identity, TerminationReason::InternalError),
            }
        };

        let (handle, endpoints) = controller_pair(identity.clone());
        let dirs = SharedDirectories::default();
        let hooks = self.controller_hooks(realm, identity.clone(), None);
        let native_launch = NativeLaunch {
            binary,
            args: launch.arguments,
            out: launch.out,
            err: launch.err,
            export_dir: launch.directory_request,
        };

        match native::spawn(native_launch, container, identity.clone(), endpoints, dirs.clone(), hooks) {
            Ok(pid) => {
                self.publish(
                    realm,
                    ComponentRecord {
                        identity,
                        pid: Some(pid),
                        runner_url: None,
                        dirs,
                        namespace,
                    },
                );
                handle
            }
            // The spawn already delivered the terminal event and the
            // dropped container rolled back the process group.
            Err(_) => handle,
        }
    }

    async fn start_bridged(
        &self,
        realm: RealmId,
        identity: ComponentIdentity,
        arguments: Vec<String>,
        package: crate::loader::Package,
        namespace: Namespace,
    ) -> ComponentHandle {
        let runner_url = match package.runner_url.as_deref().map(ComponentUrl::parse) {
            Some(Ok(url)) => url,
            _ => {
                warn!(url = %identity.url, "package names an unparseable runner URL");
                return self.stillborn(identity, TerminationReason::InternalError);
            }
        };
        let canonical = runner_url.without_resource();

        // Find-or-create the holder in this realm or the designated
        // ancestor.
        let holder_realm = match self.runner_realm(realm) {
            Some(holder_realm) => holder_realm,
            None => return self.stillborn(identity, TerminationReason::InternalError),
        };
        let holder = {
            let mut realms = match self.lock_write() {
                Ok(realms) => realms,
                Err(_) => return self.stillborn(identity, TerminationReason::InternalError),
            };
            let Some(node) = realms.get_mut(&holder_realm) else {
                return self.stillborn(identity, TerminationReason::InternalError);
            };
            Arc::clone(
                node.runners
                    .entry(canonical.clone())
                    .or_insert_with(|| RunnerHolder::new(canonical.clone())),
            )
        };

        let runner = match holder
            .ensure_connected(|| self.launch_runner(holder_realm, runner_url.clone()))
            .await
        {
            Ok(runner) => runner,
            Err(e) => {
                warn!(url = %identity.url, runner = %canonical, error = %e, "runner unavailable");
                return self.stillborn(identity, TerminationReason::InternalError);
            }
        };

        let startup = StartupInfo {
            url: identity.url.clone(),
            label: identity.label.clone(),
            arguments,
        };
        let remote = match runner.start_component(&package, startup, namespace.clone()).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(url = %identity.url, runner = %canonical, error = %e, "runner rejected component");
                return self.stillborn(identity, TerminationReason::InternalError);
            }
        };

        let (handle, endpoints) = controller_pair(identity.clone());
        let (force_tx, force_rx) = mpsc::unbounded_channel();
        let bridge_id = holder.attach_bridge(identity.label.clone(), force_tx);
        let hooks =
            self.controller_hooks(realm, identity.clone(), Some((Arc::clone(&holder), bridge_id)));
        bridge::spawn(remote, identity.clone(), endpoints, force_rx, hooks);

        self.publish(
            realm,
            ComponentRecord {
                identity,
                pid: None,
                runner_url: Some(canonical),
                dirs: SharedDirectories::default(),
                namespace,
            },
        );
        handle
    }

    /// Starts the runner itself as an ordinary component and resolves its
    /// start-component capability.
    async fn launch_runner(&self, realm: RealmId, runner_url: ComponentUrl) -> Result<ConnectedRunner> {
        debug!(runner = %runner_url, realm, "launching runner component");
        let launch = LaunchInfo::new(runner_url.to_string());
        let handle = self.create_erased(realm, launch, true).await;

        // A runner that failed creation was never published.
        let dirs = self
            .component_dirs(realm, handle.identity().instance_id)
            .ok_or_else(|| Error::RunnerUnavailable {
                url: runner_url.to_string(),
                reason: "runner component failed to start".to_string(),
            })?;
        let runner = self.connector.connect(&runner_url, dirs).await?;
        Ok(ConnectedRunner { runner, handle })
    }

    /// Emits the Stop-free failure terminal: nothing was published, so
    /// only the caller's channel observes it.
    fn stillborn(
        &self,
        identity: ComponentIdentity,
        reason: TerminationReason,
    ) -> ComponentHandle {
        born_terminated(identity, STARTUP_FAILURE_RETURN_CODE, reason)
    }

    fn publish(&self, realm: RealmId, record: ComponentRecord) {
        let identity = record.identity.clone();
        if let Ok(mut realms) = self.lock_write() {
            if let Some(node) = realms.get_mut(&realm) {
                node.components.insert(record.identity.instance_id, record);
            }
        }
        self.route_event(realm, EventKind::Start, &identity);
    }

    fn controller_hooks(
        &self,
        realm: RealmId,
        identity: ComponentIdentity,
        bridge: Option<(Arc<RunnerHolder>, u64)>,
    ) -> ControllerHooks {
        let tree = self.weak.clone();
        let diag_identity = identity.clone();
        let on_diagnostics_ready = Box::new(move || {
            if let Some(tree) = tree.upgrade() {
                tree.route_event(realm, EventKind::DiagnosticsReady, &diag_identity);
            }
        });

        let tree = self.weak.clone();
        let on_terminated = Box::new(move |_return_code: i64, _reason: TerminationReason| {
            if let Some((holder, bridge_id)) = bridge {
                holder.detach_bridge(bridge_id);
            }
            if let Some(tree) = tree.upgrade() {
                tree.component_terminated(realm, &identity);
            }
        });

        ControllerHooks::new(on_diagnostics_ready, on_terminated)
    }

    /// Termination side effects: unpublish from introspection, then notify
    /// the event fan-out. The record removal is synchronous with the
    /// transition, so observers never see a half-removed entry.
    fn component_terminated(&self, realm: RealmId, identity: &ComponentIdentity) {
        let removed = match self.lock_write() {
            Ok(mut realms) => match realms.get_mut(&realm) {
                Some(node) => node.components.remove(&identity.instance_id).is_some(),
                None => false,
            },
            Err(_) => false,
        };
        // A component that failed before publication gets no Stop event.
        if removed {
            self.route_event(realm, EventKind::Stop, identity);
        }
    }

    /// Walks up from `realm` to the realm that hosts runners for it.
    fn runner_realm(&self, realm: RealmId) -> Option<RealmId> {
        let realms = self.lock_read().ok()?;
        let mut current = realm;
        loop {
            let node = realms.get(&current)?;
            match node.parent {
                Some(parent) if node.options.use_parent_runners => current = parent,
                _ => return Some(current),
            }
        }
    }

    fn component_dirs(&self, realm: RealmId, instance_id: Uuid) -> Option<SharedDirectories> {
        let realms = self.lock_read().ok()?;
        realms
            .get(&realm)?
            .components
            .get(&instance_id)
            .map(|record| Arc::clone(&record.dirs))
    }

    // =========================================================================
    // Event and Log Fan-Out
    // =========================================================================

    /// Binds an event listener on `realm`.
    ///
    /// One-shot until the stream is dropped. On bind, Start events (and
    /// DiagnosticsReady where already observed) are synthesized for every
    /// live component in the subtree, skipping sub-realms that own a bound
    /// listener of their own.
    pub fn set_event_listener(&self, realm: RealmId) -> Option<EventStream> {
        let sink = {
            let realms = self.lock_read().ok()?;
            Arc::clone(&realms.get(&realm)?.events)
        };
        let stream = sink.set_listener()?;

        if let Ok(realms) = self.lock_read() {
            let mut stack = vec![realm];
            while let Some(current) = stack.pop() {
                let Some(node) = realms.get(&current) else {
                    continue;
                };
                // A sub-realm with its own listener covers its subtree.
                if current != realm && node.events.is_bound() {
                    continue;
                }
                for record in node.components.values() {
                    sink.emit(ComponentEvent::now(
                        EventKind::Start,
                        Self::moniker(node, &record.identity),
                    ));
                    let ready = record
                        .dirs
                        .read()
                        .map(|dirs| dirs.diagnostics_dir.is_some())
                        .unwrap_or(false);
                    if ready {
                        sink.emit(ComponentEvent::now(
                            EventKind::DiagnosticsReady,
                            Self::moniker(node, &record.identity),
                        ));
                    }
                }
                stack.extend(node.children.values().copied());
            }
        }
        Some(stream)
    }

    /// Binds a log listener on `realm`. Same one-shot rules, no synthesis.
    pub fn set_log_listener(&self, realm: RealmId) -> Option<LogSinkStream> {
        let connector = {
            let realms = self.lock_read().ok()?;
            Arc::clone(&realms.get(&realm)?.logs)
        };
        connector.set_listener()
    }

    /// Routes a component's log sink request to the nearest ancestor realm
    /// with a bound log listener. Returns whether a listener accepted it.
    pub fn connect_log_sink(&self, realm: RealmId, request: ServiceRequest) -> bool {
        let Ok(realms) = self.lock_read() else {
            return false;
        };
        let Some(origin) = realms.get(&realm) else {
            return false;
        };
        let path = origin.path.clone();
        let mut current = realm;
        loop {
            let Some(node) = realms.get(&current) else {
                return false;
            };
            if node.logs.is_bound() {
                return node.logs.connect(&path, request);
            }
            match node.parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Delivers an event to the nearest bound ancestor listener, if any.
    fn route_event(&self, realm: RealmId, kind: EventKind, identity: &ComponentIdentity) {
        let Ok(realms) = self.lock_read() else {
            return;
        };
        let Some(origin) = realms.get(&realm) else {
            return;
        };
        let moniker = Self::moniker(origin, identity);
        let mut current = realm;
        loop {
            let Some(node) = realms.get(&current) else {
                return;
            };
            if node.events.is_bound() {
                node.events.emit(ComponentEvent::now(kind, moniker));
                return;
            }
            match node.parent {
                Some(parent) => current = parent,
                None => return,
            }
        }
    }

    fn moniker(node: &RealmNode, identity: &ComponentIdentity) -> EventMoniker {
        EventMoniker {
            url: identity.url.clone(),
            realm_path: node.path.clone(),
            instance_id: identity.instance_id,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of one realm's introspection entry.
    pub fn realm_info(&self, realm: RealmId) -> Result<RealmInfo> {
        let realms = self.lock_read()?;
        let node = realms.get(&realm).ok_or(Error::RealmNotFound(realm))?;
        let mut runners: Vec<RunnerInfo> = node
            .runners
            .values()
            .map(|holder| RunnerInfo {
                url: holder.url().to_string(),
                hosted: holder.hosted_labels(),
            })
            .collect();
        runners.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(RealmInfo {
            label: node.label.clone(),
            container_id: node.container.id(),
            path: node.path.clone(),
            children: node.children.keys().cloned().collect(),
            components: node.components.values().map(RealmNode::component_info).collect(),
            runners,
        })
    }

    /// Reduced-rights handle to a realm's resource container.
    pub fn container_handle(&self, realm: RealmId) -> Result<ContainerHandle> {
        let realms = self.lock_read()?;
        let node = realms.get(&realm).ok_or(Error::RealmNotFound(realm))?;
        Ok(node.container.handle())
    }

    /// Looks a live component up by process id.
    pub fn find_component_by_pid(&self, pid: u32) -> Option<ComponentInfo> {
        let realms = self.lock_read().ok()?;
        realms.values().find_map(|node| {
            node.components
                .values()
                .find(|record| record.pid == Some(pid))
                .map(RealmNode::component_info)
        })
    }

    /// Number of live components in one realm.
    pub fn component_count(&self, realm: RealmId) -> usize {
        self.lock_read()
            .ok()
            .and_then(|realms| realms.get(&realm).map(|node| node.components.len()))
            .unwrap_or(0)
    }

    /// Namespace snapshot of a live component, for inspection tooling.
    pub fn component_namespace(&self, realm: RealmId, instance_id: Uuid) -> Option<Namespace> {
        let realms = self.lock_read().ok()?;
        realms
            .get(&realm)?
            .components
            .get(&instance_id)
            .map(|record| record.namespace.clone())
    }

    /// Number of runner holders live in one realm.
    pub fn runner_count(&self, realm: RealmId) -> usize {
        self.lock_read()
            .ok()
            .and_then(|realms| realms.get(&realm).map(|node| node.runners.len()))
            .unwrap_or(0)
    }

    // =========================================================================
    // Lock Plumbing
    // =========================================================================

    fn lock_read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<RealmId, RealmNode>>> {
        self.realms
            .read()
            .map_err(|_| Error::Internal("realm arena lock poisoned".to_string()))
    }

    fn lock_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<RealmId, RealmNode>>> {
        self.realms
            .write()
            .map_err(|_| Error::Internal("realm arena lock poisoned".to_string()))
    }

    fn handle_for(&self, id: RealmId) -> RealmHandle {
        RealmHandle {
            tree: self.weak.clone(),
            id,
            detached: false,
        }
    }
}

// =============================================================================
// Realm Handle
// =============================================================================

/// Owning handle to one realm.
///
/// Dropping an undetached handle destroys the realm and its subtree,
/// killing every descendant component through the container cascade.
pub struct RealmHandle {
    tree: Weak<RealmTree>,
    id: RealmId,
    detached: bool,
}

impl RealmHandle {
    pub fn id(&self) -> RealmId {
        self.id
    }

    /// Disables destroy-on-drop for this handle.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Starts a component in this realm.
    pub async fn create_component(&self, launch: LaunchInfo) -> ComponentHandle {
        match self.tree.upgrade() {
            Some(tree) => tree.create_component(self.id, launch).await,
            None => born_terminated(
                ComponentIdentity {
                    label: launch.url.clone(),
                    url: launch.url,
                    instance_id: Uuid::now_v7(),
                },
                STARTUP_FAILURE_RETURN_CODE,
                TerminationReason::InternalError,
            ),
        }
    }

    /// Creates a child realm.
    pub fn create_nested(
        &self,
        label: &str,
        options: RealmOptions,
        additional_services: Vec<ServiceInjection>,
    ) -> Result<RealmHandle> {
        self.tree
            .upgrade()
            .ok_or_else(|| Error::Internal("realm tree dropped".to_string()))?
            .create_nested(self.id, label, options, additional_services)
    }

    pub fn info(&self) -> Result<RealmInfo> {
        self.tree
            .upgrade()
            .ok_or(Error::RealmNotFound(self.id))?
            .realm_info(self.id)
    }

    pub fn container_handle(&self) -> Result<ContainerHandle> {
        self.tree
            .upgrade()
            .ok_or(Error::RealmNotFound(self.id))?
            .container_handle(self.id)
    }

    pub fn set_event_listener(&self) -> Option<EventStream> {
        self.tree.upgrade()?.set_event_listener(self.id)
    }

    pub fn set_log_listener(&self) -> Option<LogSinkStream> {
        self.tree.upgrade()?.set_log_listener(self.id)
    }

    /// Routes a log sink request originating in this realm.
    pub fn connect_log_sink(&self, request: ServiceRequest) -> bool {
        self.tree
            .upgrade()
            .map(|tree| tree.connect_log_sink(self.id, request))
            .unwrap_or(false)
    }
}

impl Drop for RealmHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(tree) = self.tree.upgrade() {
            let _ = tree.destroy_realm(self.id);
        }
    }
}

impl std::fmt::Debug for RealmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmHandle")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}
