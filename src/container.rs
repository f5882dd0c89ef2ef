//! Resource containers.
//!
//! A resource container is the kill-all grouping of one or more OS
//! processes backing a realm or a single native component. Containers form
//! a tree: a child realm's container is nested inside its parent's, and
//! killing a container cascades to every descendant container and process.
//! This is the single authoritative cancellation primitive for an entire
//! subtree; an individual component `kill()` is a strict subset of it.
//!
//! Memory/process isolation itself is delegated to the OS; this type owns
//! the grouping and the kill cascade, not the sandboxing.
//!
//! ## Ownership
//!
//! [`ResourceContainer`] is the exclusive owning handle: it is not `Clone`,
//! and dropping it kills the subtree. [`ContainerHandle`] is the duplicated
//! reduced-rights view handed to inspection tooling -- it can enumerate but
//! never kill.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Allocator for process-unique container ids.
static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// One registered process: its PID plus the kill signal channel its
/// supervising controller listens on.
struct ProcessEntry {
    pid: u32,
    kill: mpsc::UnboundedSender<()>,
}

struct ContainerInner {
    id: u64,
    label: String,
    killed: AtomicBool,
    processes: Mutex<Vec<ProcessEntry>>,
    // Children are owned by their realms/controllers; the parent only needs
    // to reach live ones for the kill cascade.
    children: Mutex<Vec<Weak<ContainerInner>>>,
}

impl ContainerInner {
    fn kill_cascade(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(container = self.id, label = %self.label, "killing container");

        let processes = match self.processes.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => {
                warn!(container = self.id, "process list lock poisoned during kill");
                Vec::new()
            }
        };
        for entry in processes {
            // The supervising controller owns the process handle and
            // delivers SIGKILL when signalled; if the controller is gone
            // the process has already been reaped.
            let _ = entry.kill.send(());
        }

        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for child in children {
            if let Some(child) = child.upgrade() {
                child.kill_cascade();
            }
        }
    }

    fn find_process(&self, pid: u32) -> bool {
        let own = self
            .processes
            .lock()
            .map(|procs| procs.iter().any(|p| p.pid == pid))
            .unwrap_or(false);
        if own {
            return true;
        }
        let children = self
            .children
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        children
            .iter()
            .filter_map(Weak::upgrade)
            .any(|child| child.find_process(pid))
    }

    fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .lock()
            .map(|procs| procs.iter().map(|p| p.pid).collect())
            .unwrap_or_default();
        let children = self
            .children
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        for child in children.iter().filter_map(Weak::upgrade) {
            pids.extend(child.pids());
        }
        pids
    }
}

/// Exclusive owning handle to a container.
pub struct ResourceContainer {
    inner: Arc<ContainerInner>,
}

impl ResourceContainer {
    /// Creates a root container (no parent).
    pub fn new_root(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                killed: AtomicBool::new(false),
                processes: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a child container nested inside this one.
    ///
    /// The child is owned by the caller; this container only retains the
    /// reach needed for the kill cascade.
    pub fn create_child(&self, label: impl Into<String>) -> ResourceContainer {
        let child = ResourceContainer::new_root(label);
        if let Ok(mut children) = self.inner.children.lock() {
            children.retain(|c| c.upgrade().is_some());
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Process-unique container id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Container label (matches its realm or component).
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Registers a process with this container.
    ///
    /// The kill channel is signalled before SIGKILL delivery, so the
    /// supervising controller can attribute the termination to the kill
    /// cascade. Registration on an already-killed container signals
    /// immediately.
    pub fn register_process(&self, pid: u32, kill: mpsc::UnboundedSender<()>) {
        if self.inner.killed.load(Ordering::SeqCst) {
            let _ = kill.send(());
            return;
        }
        if let Ok(mut processes) = self.inner.processes.lock() {
            processes.push(ProcessEntry { pid, kill });
        }
    }

    /// Removes a process that exited on its own.
    pub fn deregister_process(&self, pid: u32) {
        if let Ok(mut processes) = self.inner.processes.lock() {
            processes.retain(|p| p.pid != pid);
        }
    }

    /// Kills every process in this container and all descendants.
    /// Idempotent.
    pub fn kill_all(&self) {
        self.inner.kill_cascade();
    }

    /// True once the container has been killed.
    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    /// True if `pid` belongs to this container or a descendant.
    pub fn find_process(&self, pid: u32) -> bool {
        self.inner.find_process(pid)
    }

    /// Duplicates a reduced-rights handle for inspection tooling.
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for ResourceContainer {
    fn drop(&mut self) {
        self.inner.kill_cascade();
    }
}

impl std::fmt::Debug for ResourceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContainer")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// Reduced-rights duplicate of a container handle.
///
/// Supports enumeration only; there is deliberately no kill operation, so
/// handing one to external inspection tooling cannot take the subtree down.
#[derive(Clone)]
pub struct ContainerHandle {
    inner: Arc<ContainerInner>,
}

impl ContainerHandle {
    /// Container id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Container label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// True while the container has not been killed.
    pub fn alive(&self) -> bool {
        !self.inner.killed.load(Ordering::SeqCst)
    }

    /// PIDs of every process in the subtree, rooted at this container.
    pub fn pids(&self) -> Vec<u32> {
        self.inner.pids()
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}
