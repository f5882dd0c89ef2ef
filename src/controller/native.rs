//! Native component controller.
//!
//! Backs a component with a directly spawned OS process inside its own
//! resource container. The controller task supervises the process until
//! exit, drives the export-directory poll, and reacts to kill requests from
//! the caller's handle, the container kill cascade, or handle disconnect.
//!
//! ## Termination Paths
//!
//! | Cause                         | Return code           | Reason   |
//! |-------------------------------|-----------------------|----------|
//! | Process exits on its own      | real exit code        | `EXITED` |
//! | Killed by signal (not ours)   | 128 + signal number   | `EXITED` |
//! | `kill()` / container cascade  | [`KILL_RETURN_CODE`]  | `EXITED` |
//! | Wait failure                  | -1                    | `INTERNAL_ERROR` |
//!
//! [`KILL_RETURN_CODE`]: crate::constants::KILL_RETURN_CODE

use crate::constants::{
    DIRECTORY_READY_POLL_INTERVAL, KILL_RETURN_CODE, MAX_DIRECTORY_READY_ATTEMPTS,
    STARTUP_FAILURE_RETURN_CODE,
};
use crate::container::ResourceContainer;
use crate::controller::{
    ComponentIdentity, ControllerCommand, ControllerEndpoints, ControllerHooks,
    DirectoryReadyState, DirectoryReadyStateField, SharedDirectories,
};
use crate::error::{Error, Result, TerminationReason};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Launch Inputs
// =============================================================================

/// Where a spawned component's stdout/stderr goes.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Inherit the manager's own stream.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Append to a file (created if absent).
    File(PathBuf),
}

impl OutputSink {
    fn to_stdio(&self) -> std::io::Result<Stdio> {
        match self {
            OutputSink::Inherit => Ok(Stdio::inherit()),
            OutputSink::Null => Ok(Stdio::null()),
            OutputSink::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Ok(Stdio::from(file))
            }
        }
    }
}

/// Inputs for spawning a native component process.
#[derive(Debug)]
pub(crate) struct NativeLaunch {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub out: OutputSink,
    pub err: OutputSink,
    /// Path the component exports its directory at, polled for readiness.
    pub export_dir: Option<PathBuf>,
}

// =============================================================================
// Spawn
// =============================================================================

/// Spawns the process and arms the supervising controller task.
///
/// The task owns the component's container; when the task finishes the
/// container drops and any straggler processes die with it. On spawn
/// failure the terminal event is emitted through `endpoints` (the caller
/// observes a component born terminated) and the error is returned so the
/// creation pipeline can roll back.
pub(crate) fn spawn(
    launch: NativeLaunch,
    container: ResourceContainer,
    identity: ComponentIdentity,
    mut endpoints: ControllerEndpoints,
    dirs: SharedDirectories,
    hooks: ControllerHooks,
) -> Result<u32> {
    let mut hooks = hooks;
    let mut command = tokio::process::Command::new(&launch.binary);
    command.args(&launch.args).stdin(Stdio::null());

    let spawn_result = launch
        .out
        .to_stdio()
        .and_then(|out| Ok((out, launch.err.to_stdio()?)))
        .and_then(|(out, err)| {
            command.stdout(out).stderr(err).kill_on_drop(true);
            command.spawn()
        });

    let mut child = match spawn_result {
        Ok(child) => child,
        Err(e) => {
            warn!(url = %identity.url, error = %e, "failed to spawn component process");
            endpoints
                .events
                .terminated(STARTUP_FAILURE_RETURN_CODE, TerminationReason::InternalError);
            (hooks.take_terminated())(STARTUP_FAILURE_RETURN_CODE, TerminationReason::InternalError);
            return Err(Error::StartFailed {
                url: identity.url.clone(),
                reason: e.to_string(),
            });
        }
    };

    let pid = child.id().unwrap_or_default();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
    container.register_process(pid, kill_tx);

    info!(url = %identity.url, pid, container = container.id(), "started native component");

    tokio::spawn(async move {
        let mut poll = tokio::time::interval(DIRECTORY_READY_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut commands_open = true;
        let mut kill_channel_open = true;
        let mut kill_requested = false;
        let mut polling = launch.export_dir.is_some();
        let mut attempts: u32 = 0;

        let (final_code, final_reason) = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        _ if kill_requested => (KILL_RETURN_CODE, TerminationReason::Exited),
                        Ok(status) => (exit_code_of(status), TerminationReason::Exited),
                        Err(e) => {
                            warn!(url = %identity.url, error = %e, "wait failed for component process");
                            (STARTUP_FAILURE_RETURN_CODE, TerminationReason::InternalError)
                        }
                    };
                }
                cmd = endpoints.commands.recv(), if commands_open => {
                    match cmd {
                        Some(ControllerCommand::Kill) => {
                            kill_requested = true;
                            // Container cascade reaches any processes the
                            // component spawned into it, then our own child.
                            container.kill_all();
                            let _ = child.start_kill();
                        }
                        // Caller detached and dropped its handle;
                        // fire-and-forget from here on.
                        None => commands_open = false,
                    }
                }
                msg = kill_rx.recv(), if kill_channel_open => {
                    match msg {
                        Some(()) => {
                            kill_requested = true;
                            let _ = child.start_kill();
                        }
                        None => kill_channel_open = false,
                    }
                }
                _ = poll.tick(), if polling => {
                    polling = poll_directories(
                        &launch.export_dir,
                        &dirs,
                        &mut endpoints,
                        &hooks,
                        &mut attempts,
                    );
                }
            }
        };

        debug!(
            url = %identity.url,
            return_code = final_code,
            reason = %final_reason,
            "native component terminated"
        );
        endpoints.events.terminated(final_code, final_reason);
        // Our own process is reaped; only stragglers it spawned into the
        // container are left for the cascade.
        container.deregister_process(pid);
        container.kill_all();
        (hooks.take_terminated())(final_code, final_reason);
    });

    Ok(pid)
}

/// Maps an exit status to the controller return code.
fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    // Killed by a signal we didn't send: 128 + signal number, the shell
    // convention.
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    -1
}

/// One poll of the export directory. Returns false once polling is done.
fn poll_directories(
    export_dir: &Option<PathBuf>,
    dirs: &SharedDirectories,
    endpoints: &mut ControllerEndpoints,
    hooks: &ControllerHooks,
    attempts: &mut u32,
) -> bool {
    let Some(export_dir) = export_dir else {
        return false;
    };
    *attempts += 1;

    if export_dir.is_dir() {
        if endpoints.events.directory_ready() {
            if let Ok(mut state) = dirs.write() {
                state.service_dir = Some(export_dir.clone());
            }
        }
        let diagnostics = export_dir.join("diagnostics");
        if diagnostics.is_dir() {
            if let Ok(mut state) = dirs.write() {
                state.diagnostics_dir = Some(diagnostics);
                state.ready_state = DirectoryReadyStateField(DirectoryReadyState::Ready);
            }
            (hooks.on_diagnostics_ready)();
            return false;
        }
    }

    if *attempts >= MAX_DIRECTORY_READY_ATTEMPTS {
        if let Ok(mut state) = dirs.write() {
            state.ready_state = DirectoryReadyStateField(DirectoryReadyState::Abandoned);
        }
        false
    } else {
        if let Ok(mut state) = dirs.write() {
            state.ready_state = DirectoryReadyStateField(DirectoryReadyState::Retrying(*attempts));
        }
        true
    }
}
