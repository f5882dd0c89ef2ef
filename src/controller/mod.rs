//! Component controllers.
//!
//! A controller is the lifecycle wrapper around one running component. Two
//! variants exist, sharing one externally observed contract:
//!
//! - [`native`]: owns the OS process handle and the component's container
//! - [`bridge`]: holds no process, only a remote controller endpoint whose
//!   events it mirrors (runner-hosted components)
//!
//! # State Machine
//!
//! ```text
//! Constructing ──▶ Running ──▶ Terminated   (absorbing)
//!                    │
//!                    └──▶ DirectoryReady    (orthogonal, at most once,
//!                                            always before Terminated)
//! ```
//!
//! At most one terminal event is ever delivered per controller; `kill()` on
//! an already-terminated controller is a no-op. Exactly one variant backs
//! any controller instance.

pub mod bridge;
pub mod native;

use crate::error::TerminationReason;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

// =============================================================================
// Events and Commands
// =============================================================================

/// Lifecycle event delivered over a component's controller channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The component's export directory was observed open.
    DirectoryReady,
    /// The component reached its terminal state. Delivered at most once.
    Terminated {
        return_code: i64,
        reason: TerminationReason,
    },
}

/// Command sent from a [`ComponentHandle`] to its controller task.
#[derive(Debug)]
pub(crate) enum ControllerCommand {
    Kill,
}

// =============================================================================
// Directory-Ready State Machine
// =============================================================================

/// Export-directory observation state.
///
/// One timer task drives one poll operation per tick. A component may
/// advertise its export directory before populating the diagnostics
/// sub-entry, so population is retried a bounded number of times before
/// the diagnostics handle is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryReadyState {
    /// No poll has observed the export directory yet.
    NotAttempted,
    /// The poll has run `n` times without completing.
    Retrying(u32),
    /// Export directory and diagnostics sub-entry both observed.
    Ready,
    /// Retries exhausted; the diagnostics handle stays unpopulated.
    Abandoned,
}

/// Lazily populated directory handles for one component, shared between the
/// controller task (writer) and realm introspection (reader).
#[derive(Debug, Default)]
pub struct ComponentDirectories {
    /// Export/service directory, populated once observed open.
    pub service_dir: Option<PathBuf>,
    /// Diagnostics sub-entry, populated with bounded retry.
    pub diagnostics_dir: Option<PathBuf>,
    /// Poll progress.
    pub ready_state: DirectoryReadyStateField,
}

/// Newtype so `Default` lands on [`DirectoryReadyState::NotAttempted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryReadyStateField(pub DirectoryReadyState);

impl Default for DirectoryReadyStateField {
    fn default() -> Self {
        Self(DirectoryReadyState::NotAttempted)
    }
}

/// Shared view of a component's directory handles.
pub type SharedDirectories = Arc<RwLock<ComponentDirectories>>;

// =============================================================================
// Diagnostics Sink
// =============================================================================

/// External inspection sink consumed by the core (interface only).
///
/// Implementations populate on demand and must never block beyond a
/// bounded kernel-object-info read. Only the explicit-thread-id dump path
/// exists; an all-threads dump is deliberately not part of this contract.
pub trait DiagnosticsSource: Send + Sync {
    /// Dumps the state of one thread, identified explicitly.
    fn thread_dump(&self, thread_id: u64) -> Option<String>;

    /// Memory breakdown for the component's processes.
    fn memory_breakdown(&self) -> Option<String> {
        None
    }

    /// Handle counts grouped by kernel object type.
    fn handle_counts(&self) -> Option<BTreeMap<String, u64>> {
        None
    }
}

// =============================================================================
// Component Handle (caller side)
// =============================================================================

/// Identity of a component instance, as published in introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentIdentity {
    /// The URL the component was created from.
    pub url: String,
    /// Component label (defaults to the URL's name segment).
    pub label: String,
    /// Unique instance id.
    pub instance_id: Uuid,
}

/// The caller's controller endpoint for one component.
///
/// Dropping the handle without [`detach`](Self::detach) requests `kill()`,
/// matching the disconnect-triggers-kill default. `detach()` permanently
/// disables that default without affecting the component's execution.
pub struct ComponentHandle {
    identity: ComponentIdentity,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    commands: mpsc::UnboundedSender<ControllerCommand>,
    detached: bool,
}

impl ComponentHandle {
    /// This component's identity.
    pub fn identity(&self) -> &ComponentIdentity {
        &self.identity
    }

    /// Requests termination of the component.
    ///
    /// Native components have their container killed (taking all their
    /// processes with it); bridged components forward the kill to the
    /// runner. A no-op once the controller is terminated.
    pub fn kill(&self) {
        let _ = self.commands.send(ControllerCommand::Kill);
    }

    /// Permanently disables the kill-on-disconnect default for this handle.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Receives the next lifecycle event.
    ///
    /// Returns `None` after the terminal event has been consumed and the
    /// controller side has gone away.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        self.events.recv().await
    }

    /// Awaits the terminal event, discarding non-terminal ones.
    ///
    /// Returns `(return_code, reason)`, or `None` if the channel closed
    /// without a terminal event (cannot happen for controllers produced by
    /// this crate).
    pub async fn wait_for_termination(&mut self) -> Option<(i64, TerminationReason)> {
        while let Some(event) = self.events.recv().await {
            if let ControllerEvent::Terminated { return_code, reason } = event {
                return Some((return_code, reason));
            }
        }
        None
    }
}

impl Drop for ComponentHandle {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.commands.send(ControllerCommand::Kill);
        }
    }
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("identity", &self.identity)
            .field("detached", &self.detached)
            .finish()
    }
}

// =============================================================================
// Controller Plumbing (crate internal)
// =============================================================================

/// Callbacks a controller task fires into its owner (Realm or
/// RunnerHolder): diagnostics-ready fan-out, and the termination hook that
/// removes the controller from the owner's active set and notifies the
/// event provider. The reference drop performed by the termination hook,
/// not any direct deletion, is what frees the controller record.
pub(crate) struct ControllerHooks {
    pub on_diagnostics_ready: Box<dyn Fn() + Send + Sync>,
    on_terminated: Option<Box<dyn FnOnce(i64, TerminationReason) + Send>>,
}

impl ControllerHooks {
    pub fn new(
        on_diagnostics_ready: Box<dyn Fn() + Send + Sync>,
        on_terminated: Box<dyn FnOnce(i64, TerminationReason) + Send>,
    ) -> Self {
        Self {
            on_diagnostics_ready,
            on_terminated: Some(on_terminated),
        }
    }

    /// Hooks that do nothing (stub controllers, tests).
    pub fn noop() -> Self {
        Self {
            on_diagnostics_ready: Box::new(|| {}),
            on_terminated: None,
        }
    }

    /// Takes the one-shot termination hook; later calls get a no-op.
    pub fn take_terminated(&mut self) -> Box<dyn FnOnce(i64, TerminationReason) + Send> {
        self.on_terminated.take().unwrap_or_else(|| Box::new(|_, _| {}))
    }
}

/// Controller-side endpoints paired with a [`ComponentHandle`].
pub(crate) struct ControllerEndpoints {
    pub events: EventGate,
    pub commands: mpsc::UnboundedReceiver<ControllerCommand>,
}

/// Creates a connected handle/endpoints pair.
pub(crate) fn controller_pair(identity: ComponentIdentity) -> (ComponentHandle, ControllerEndpoints) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    (
        ComponentHandle {
            identity,
            events: event_rx,
            commands: cmd_tx,
            detached: false,
        },
        ControllerEndpoints {
            events: EventGate::new(event_tx),
            commands: cmd_rx,
        },
    )
}

/// Binds a controller request to a stub that is already terminated.
///
/// Used for creation-time failures: the caller observes a component born
/// terminated instead of a synchronous error.
pub(crate) fn born_terminated(
    identity: ComponentIdentity,
    return_code: i64,
    reason: TerminationReason,
) -> ComponentHandle {
    let (handle, mut endpoints) = controller_pair(identity);
    endpoints.events.terminated(return_code, reason);
    handle
}

/// Event sender enforcing the controller ordering contract:
/// `DirectoryReady` at most once, strictly before the single `Terminated`.
pub(crate) struct EventGate {
    events: mpsc::UnboundedSender<ControllerEvent>,
    directory_ready_sent: bool,
    terminated: bool,
}

impl EventGate {
    fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self {
            events,
            directory_ready_sent: false,
            terminated: false,
        }
    }

    /// Emits `DirectoryReady` unless already emitted or terminated.
    /// Returns true if the event was sent.
    pub fn directory_ready(&mut self) -> bool {
        if self.terminated || self.directory_ready_sent {
            return false;
        }
        self.directory_ready_sent = true;
        let _ = self.events.send(ControllerEvent::DirectoryReady);
        true
    }

    /// Emits the terminal event. Returns true only for the first call;
    /// later calls are swallowed so a second terminal cause (kill racing a
    /// natural exit, runner cascade racing a remote event) cannot produce
    /// a second event.
    pub fn terminated(&mut self, return_code: i64, reason: TerminationReason) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        let _ = self.events.send(ControllerEvent::Terminated { return_code, reason });
        true
    }
}
