//! Process handles.
//!
//! A [`LinuxProcess`] is one process of a container (init or exec) as seen
//! from the host. Creating a handle allocates the guest-side process and
//! wires its stdio; everything after that is a small state machine driven
//! by RPCs on the shared session:
//!
//! ```text
//! Created ──start──▶ Running ──exit──▶ Exited(code) ──delete──▶ Deleted
//!    │                                     ▲
//!    └──────────────kill───────────────────┘
//! ```
//!
//! The exit code is published once through a watch channel, so any number
//! of concurrent `wait()` callers observe the same result.

mod config;
mod state;
mod stdio;

pub use config::{ConsoleSize, ProcessConfig, User};
pub use state::ProcessState;
pub use stdio::Stdio;

use std::io::Read;
use std::sync::{Arc, Weak};

use capsule_shared::constants::process::SIGKILL;
use capsule_shared::CreateProcessRequest;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::env::{self, IdentityLookup};
use crate::error::{CapsuleError, CapsuleResult, ProcessError, SinkError};
use crate::portal::interfaces::ProcessInterface;
use crate::portal::GuestSession;
use stdio::OutputReport;

/// What a process needs from its container.
#[derive(Clone)]
pub(crate) struct ProcessContext {
    pub session: GuestSession,
    pub container_id: String,
    pub identity: Arc<dyn IdentityLookup>,
    pub stdio_buffer: usize,
}

type ExitSlot = Option<Result<i32, CapsuleError>>;

struct Shared {
    id: String,
    container_id: String,
    terminal: bool,
    api: ProcessInterface,
    state: Mutex<ProcessState>,
    /// Handed to the stdin pump on start.
    stdin: Mutex<Option<Box<dyn Read + Send>>>,
    exit: watch::Sender<ExitSlot>,
    last_error: Mutex<Option<CapsuleError>>,
    stdio_error: Mutex<Option<SinkError>>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Publish the final result. Returns false if one was already published.
    ///
    /// The state lock is held across the publish so a caller woken by
    /// `wait()` always finds the handle in `Exited`.
    fn publish(&self, result: Result<i32, CapsuleError>) -> bool {
        let mut state = self.state.lock();
        let code = result.as_ref().ok().copied();
        let published = self.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        if let (true, Some(code)) = (published, code) {
            if *state != ProcessState::Deleted {
                *state = ProcessState::Exited(code);
            }
        }
        published
    }

    fn stop_waiter(&self) {
        if let Some(waiter) = self.waiter.lock().take() {
            waiter.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.get_mut().take() {
            waiter.abort();
        }
    }
}

/// Handle to one process inside a container.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LinuxProcess {
    shared: Arc<Shared>,
}

impl LinuxProcess {
    /// Validate `config`, resolve its identity and environment, and allocate
    /// the process in the guest.
    pub(crate) async fn create(
        ctx: &ProcessContext,
        id: &str,
        config: ProcessConfig,
        stdio: Stdio,
    ) -> CapsuleResult<Self> {
        config.validate()?;
        let identity = ctx.identity.as_ref();
        let user = env::resolve_user(&config.user, identity).await?;
        let environment =
            env::resolve_environment(&config.env, &user, config.terminal, identity).await?;

        tracing::debug!(
            container_id = %ctx.container_id,
            process_id = %id,
            args = ?config.args,
            uid = user.uid,
            gid = user.gid,
            terminal = config.terminal,
            "Creating process"
        );

        let mut api = ctx.session.process();
        api.create(CreateProcessRequest {
            container_id: ctx.container_id.clone(),
            process_id: id.to_string(),
            args: config.args.clone(),
            env: environment,
            cwd: config.cwd_or_default(),
            user: Some((&user).into()),
            terminal: config.terminal_size(),
            stdin: stdio.stdin.is_some(),
        })
        .await?;

        // Attach before start so no output is missed.
        let output = match api.attach(&ctx.container_id, id).await {
            Ok(output) => output,
            Err(e) => {
                if let Err(cleanup) = api.delete(&ctx.container_id, id).await {
                    tracing::debug!(process_id = %id, error = %cleanup, "Cleanup after failed attach");
                }
                return Err(e);
            }
        };

        let Stdio {
            stdin,
            stdout,
            stderr,
        } = stdio;
        let (exit, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id: id.to_string(),
            container_id: ctx.container_id.clone(),
            terminal: config.terminal,
            api: api.clone(),
            state: Mutex::new(ProcessState::Created),
            stdin: Mutex::new(stdin),
            exit,
            last_error: Mutex::new(None),
            stdio_error: Mutex::new(None),
            waiter: Mutex::new(None),
        });

        let output = stdio::spawn_output(id.to_string(), output, stdout, stderr, ctx.stdio_buffer);
        let waiter = tokio::spawn(watch_exit(
            Arc::downgrade(&shared),
            api,
            ctx.container_id.clone(),
            id.to_string(),
            output,
        ));
        *shared.waiter.lock() = Some(waiter);

        tracing::info!(container_id = %ctx.container_id, process_id = %id, "Process created");
        Ok(Self { shared })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn container_id(&self) -> &str {
        &self.shared.container_id
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.terminal
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.lock()
    }

    /// Exit code, if the process has exited. Does not block.
    pub fn exit_code(&self) -> Option<i32> {
        match &*self.shared.exit.borrow() {
            Some(Ok(code)) => Some(*code),
            _ => None,
        }
    }

    /// Why the last `start()` failed.
    pub fn last_error(&self) -> Option<CapsuleError> {
        self.shared.last_error.lock().clone()
    }

    /// First failure of an output sink. Output after it was dropped.
    pub fn stdio_error(&self) -> Option<SinkError> {
        self.shared.stdio_error.lock().clone()
    }

    /// Exec the process. Returns its pid inside the guest.
    ///
    /// A failed start leaves the process `Created` and records the error.
    pub async fn start(&self) -> CapsuleResult<u32> {
        match self.state() {
            ProcessState::Created => {}
            ProcessState::Deleted => return Err(self.not_found()),
            other => {
                return Err(ProcessError::StartFailed {
                    id: self.shared.id.clone(),
                    reason: format!("process is {}", other),
                }
                .into())
            }
        }

        let result = self
            .shared
            .api
            .clone()
            .start(&self.shared.container_id, &self.shared.id)
            .await;
        let pid = match result {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(
                    container_id = %self.shared.container_id,
                    process_id = %self.shared.id,
                    error = %e,
                    "Process failed to start"
                );
                *self.shared.last_error.lock() = Some(e.clone());
                return Err(e);
            }
        };

        {
            // A fast process may already have been reported as exited.
            let mut state = self.shared.state.lock();
            if *state == ProcessState::Created {
                *state = ProcessState::Running { pid };
            }
        }

        if let Some(reader) = self.shared.stdin.lock().take() {
            stdio::spawn_input(
                self.shared.api.clone(),
                self.shared.container_id.clone(),
                self.shared.id.clone(),
                reader,
            );
        }

        tracing::info!(
            container_id = %self.shared.container_id,
            process_id = %self.shared.id,
            pid,
            "Process started"
        );
        Ok(pid)
    }

    /// Wait for the exit code.
    ///
    /// Output has been fully delivered to the sinks when this returns. Fails
    /// with `ConnectionClosed` if the transport goes away first, and with
    /// `NotFound` if the process is deleted without ever running.
    pub async fn wait(&self) -> CapsuleResult<i32> {
        let mut rx = self.shared.exit.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CapsuleError::Internal("exit channel closed".to_string()))?;
        match &*slot {
            Some(Ok(code)) => Ok(*code),
            Some(Err(e)) => Err(e.clone()),
            None => Err(CapsuleError::Internal("exit result missing".to_string())),
        }
    }

    /// Deliver `signal`. Does not wait for the process to exit.
    ///
    /// Killing an exited process succeeds and does nothing. A created
    /// process exits with `128 + signal` without ever running.
    pub async fn kill(&self, signal: i32) -> CapsuleResult<()> {
        match self.state() {
            ProcessState::Deleted => return Err(self.not_found()),
            ProcessState::Exited(_) => return Ok(()),
            ProcessState::Created | ProcessState::Running { .. } => {}
        }

        let result = self
            .shared
            .api
            .clone()
            .kill(&self.shared.container_id, &self.shared.id, signal)
            .await;
        match result {
            Ok(delivered) => {
                tracing::debug!(
                    container_id = %self.shared.container_id,
                    process_id = %self.shared.id,
                    signal,
                    delivered,
                    "Signal sent"
                );
                Ok(())
            }
            // Lost a race with exit or teardown.
            Err(_) if self.exit_code().is_some() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resize the terminal of a terminal process.
    pub async fn resize(&self, rows: u32, cols: u32) -> CapsuleResult<()> {
        if !self.shared.terminal {
            return Err(ProcessError::InvalidConfig(format!(
                "process {} has no terminal",
                self.shared.id
            ))
            .into());
        }
        if self.state() == ProcessState::Deleted {
            return Err(self.not_found());
        }
        self.shared
            .api
            .clone()
            .resize(&self.shared.container_id, &self.shared.id, rows, cols)
            .await
    }

    /// Release the process in the guest.
    ///
    /// Only `Created` and `Exited` processes can be deleted; a running one
    /// fails with `NotExited` (see [`force_delete`](Self::force_delete)).
    pub async fn delete(&self) -> CapsuleResult<()> {
        match self.state() {
            ProcessState::Deleted => return Err(self.not_found()),
            ProcessState::Running { .. } => {
                return Err(ProcessError::NotExited(self.shared.id.clone()).into())
            }
            ProcessState::Created | ProcessState::Exited(_) => {}
        }

        let result = self
            .shared
            .api
            .clone()
            .delete(&self.shared.container_id, &self.shared.id)
            .await;
        match result {
            Ok(()) => {}
            // Guest-side state went away with the transport.
            Err(e) if e.is_connection_closed() && self.exit_code().is_some() => {
                tracing::debug!(process_id = %self.shared.id, "Deleting process of a closed session");
            }
            Err(e) => return Err(e),
        }

        let previous = {
            let mut state = self.shared.state.lock();
            if *state == ProcessState::Deleted {
                return Err(self.not_found());
            }
            std::mem::replace(&mut *state, ProcessState::Deleted)
        };
        // Waiters of a process that never ran see NotFound; an exit whose
        // output was still draining is published as is.
        let final_result = match previous {
            ProcessState::Exited(code) => Ok(code),
            _ => Err(self.not_found()),
        };
        self.shared.publish(final_result);
        self.shared.stop_waiter();

        tracing::debug!(
            container_id = %self.shared.container_id,
            process_id = %self.shared.id,
            "Process deleted"
        );
        Ok(())
    }

    /// SIGKILL the process if needed, wait for it, then delete it.
    pub async fn force_delete(&self) -> CapsuleResult<()> {
        if matches!(
            self.state(),
            ProcessState::Created | ProcessState::Running { .. }
        ) {
            self.kill(SIGKILL).await?;
            self.wait().await?;
        }
        self.delete().await
    }

    /// Mark the process exited with `code` unless it already has a result.
    ///
    /// Used at container teardown. Returns whether the handle changed.
    pub(crate) fn invalidate(&self, code: i32) -> bool {
        let changed = self.shared.publish(Ok(code));
        if changed {
            self.shared.stop_waiter();
        }
        changed
    }

    /// Fail pending and future waits with `err` unless a result exists.
    pub(crate) fn fail(&self, err: CapsuleError) -> bool {
        let changed = self.shared.publish(Err(err));
        if changed {
            self.shared.stop_waiter();
        }
        changed
    }

    fn not_found(&self) -> CapsuleError {
        ProcessError::NotFound(self.shared.id.clone()).into()
    }
}

impl std::fmt::Debug for LinuxProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxProcess")
            .field("container_id", &self.shared.container_id)
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait for the guest to report the exit, mark the handle exited, then
/// publish once the output has drained.
async fn watch_exit(
    shared: Weak<Shared>,
    mut api: ProcessInterface,
    container_id: String,
    process_id: String,
    output: JoinHandle<OutputReport>,
) {
    let result = api
        .wait(&container_id, &process_id)
        .await
        .map(|status| status.posix_code());

    // Kill and delete act on the exit right away; waiters still get the
    // code only after the output has reached the sinks.
    if let (Ok(code), Some(shared)) = (&result, shared.upgrade()) {
        let mut state = shared.state.lock();
        if matches!(*state, ProcessState::Created | ProcessState::Running { .. }) {
            *state = ProcessState::Exited(*code);
        }
    }

    // The attach stream ends once the guest has forwarded all output, or
    // shortly after the exit if a leftover child keeps the pipes open.
    let report = match output.await {
        Ok(report) => report,
        Err(e) => OutputReport {
            sink_error: Some(SinkError::Io(format!("output task failed: {}", e))),
            transport_error: None,
        },
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };
    if let Some(e) = report.sink_error {
        tracing::warn!(
            container_id = %container_id,
            process_id = %process_id,
            error = %e,
            "Output sink failed, later output dropped"
        );
        shared.stdio_error.lock().get_or_insert(e);
    }
    if let (Ok(_), Some(e)) = (&result, report.transport_error) {
        tracing::warn!(process_id = %process_id, error = %e, "Output stream ended early");
        shared.last_error.lock().get_or_insert(e);
    }

    match &result {
        Ok(code) => tracing::info!(
            container_id = %container_id,
            process_id = %process_id,
            exit_code = code,
            "Process exited"
        ),
        Err(e) => tracing::debug!(
            container_id = %container_id,
            process_id = %process_id,
            error = %e,
            "Wait failed"
        ),
    }
    shared.publish(result);
}
