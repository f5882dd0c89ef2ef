//! Bridged component controller.
//!
//! Backs a component whose execution was delegated to a runner. The bridge
//! holds no process of its own: it mirrors the remote controller's
//! lifecycle events to the original caller, forwards `Kill()` remotely,
//! and force-terminates with `RUNNER_TERMINATED` when its
//! [`RunnerHolder`](crate::runner::RunnerHolder) reports the runner gone --
//! a cascading rule that overrides any individual bridge state.

use crate::constants::STARTUP_FAILURE_RETURN_CODE;
use crate::controller::{
    ComponentIdentity, ControllerCommand, ControllerEndpoints, ControllerEvent, ControllerHooks,
};
use crate::error::TerminationReason;
use tokio::sync::mpsc;
use tracing::debug;

// =============================================================================
// Remote Controller
// =============================================================================

/// The endpoint a runner hands back for one component it hosts.
///
/// The runner drives `events`; the bridge drives `kill`.
pub struct RemoteController {
    /// Lifecycle events as observed by the runner.
    pub events: mpsc::UnboundedReceiver<ControllerEvent>,
    /// Remote kill request channel.
    pub kill: mpsc::UnboundedSender<()>,
}

impl RemoteController {
    /// Creates a remote controller plus the runner-side driving ends.
    pub fn channel() -> (Self, RemoteControllerDriver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        (
            Self {
                events: event_rx,
                kill: kill_tx,
            },
            RemoteControllerDriver {
                events: event_tx,
                kill: kill_rx,
            },
        )
    }
}

/// Runner-side ends of a [`RemoteController`].
pub struct RemoteControllerDriver {
    /// Lifecycle events the runner emits for the hosted component.
    pub events: mpsc::UnboundedSender<ControllerEvent>,
    /// Kill requests forwarded from the bridge.
    pub kill: mpsc::UnboundedReceiver<()>,
}

// =============================================================================
// Bridge Task
// =============================================================================

/// Control channel the holder uses to force-terminate a bridge when the
/// runner process exits.
pub(crate) type ForceTerminate = mpsc::UnboundedSender<()>;

/// Arms the bridge task mirroring `remote` to the caller's handle.
///
/// The holder keeps the sending half of `force_rx` and signals it when
/// the runner dies.
pub(crate) fn spawn(
    remote: RemoteController,
    identity: ComponentIdentity,
    mut endpoints: ControllerEndpoints,
    mut force_rx: mpsc::UnboundedReceiver<()>,
    hooks: ControllerHooks,
) {
    let mut remote = remote;
    let mut hooks = hooks;

    tokio::spawn(async move {
        let mut commands_open = true;
        let mut force_open = true;

        let (final_code, final_reason) = loop {
            tokio::select! {
                // Runner gone: overrides whatever the remote side was
                // about to report. A closed channel is the holder going
                // away without a cascade, not a termination.
                msg = force_rx.recv(), if force_open => {
                    match msg {
                        Some(()) => {
                            break (STARTUP_FAILURE_RETURN_CODE, TerminationReason::RunnerTerminated);
                        }
                        None => force_open = false,
                    }
                }
                event = remote.events.recv() => {
                    match event {
                        Some(ControllerEvent::DirectoryReady) => {
                            if endpoints.events.directory_ready() {
                                (hooks.on_diagnostics_ready)();
                            }
                        }
                        Some(ControllerEvent::Terminated { return_code, reason }) => {
                            break (return_code, reason);
                        }
                        // Remote endpoint closed without a terminal event.
                        None => break (STARTUP_FAILURE_RETURN_CODE, TerminationReason::Unknown),
                    }
                }
                cmd = endpoints.commands.recv(), if commands_open => {
                    match cmd {
                        Some(ControllerCommand::Kill) => {
                            let _ = remote.kill.send(());
                        }
                        None => commands_open = false,
                    }
                }
            }
        };

        debug!(
            url = %identity.url,
            return_code = final_code,
            reason = %final_reason,
            "bridged component terminated"
        );
        endpoints.events.terminated(final_code, final_reason);
        (hooks.take_terminated())(final_code, final_reason);
    });
}
