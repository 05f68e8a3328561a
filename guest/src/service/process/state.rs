use std::sync::Arc;

use capsule_shared::constants::agent::OUTPUT_EXIT_GRACE;
use capsule_shared::{OutputChunk, StreamKind, TerminalSize};
use futures::StreamExt;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tonic::Status;
use tracing::{debug, info, warn};

use super::exec_handle::{self, ExecStdio, ExitStatus, FdReader};
use super::executor::{self, PendingSpawn};
use crate::error::{GuestError, GuestResult};

enum Phase {
    Created(Box<PendingSpawn>),
    Running { pid: Pid },
    Exited(ExitStatus),
}

/// Inner state that requires synchronization.
struct Inner {
    phase: Phase,
    /// Parent ends of the process stdio
    stdio: ExecStdio,
    attached: bool,
}

/// One process known to the agent.
///
/// Created processes hold their spawn spec and pre-allocated stdio; the
/// exit status is published once through a watch channel.
#[derive(Clone)]
pub(crate) struct ProcessState {
    id: Arc<str>,
    chunk_size: usize,
    inner: Arc<Mutex<Inner>>,
    exit: Arc<watch::Sender<Option<ExitStatus>>>,
}

impl ProcessState {
    pub(super) fn new(id: &str, pending: PendingSpawn, stdio: ExecStdio, chunk_size: usize) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            id: Arc::from(id),
            chunk_size,
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Created(Box::new(pending)),
                stdio,
                attached: false,
            })),
            exit: Arc::new(exit),
        }
    }

    /// Whether the process is currently running.
    pub async fn is_running(&self) -> bool {
        matches!(self.inner.lock().await.phase, Phase::Running { .. })
    }

    /// Spawn the process. A failed spawn leaves it created.
    pub async fn start(&self) -> GuestResult<u32> {
        let mut inner = self.inner.lock().await;
        let pending = match &inner.phase {
            Phase::Created(pending) => pending,
            Phase::Running { .. } => {
                return Err(GuestError::FailedPrecondition(format!(
                    "process {} already started",
                    self.id
                )))
            }
            Phase::Exited(_) => {
                return Err(GuestError::FailedPrecondition(format!(
                    "process {} already exited",
                    self.id
                )))
            }
        };

        let mut child = executor::spawn(pending)?;
        let pid = child
            .id()
            .ok_or_else(|| GuestError::Internal("spawned child has no pid".to_string()))?;

        // Dropping the pending spawn closes the child ends of the stdio in the agent.
        inner.phase = Phase::Running {
            pid: Pid::from_raw(pid as i32),
        };
        let drains = self.take_unattached_outputs(&mut inner);
        drop(inner);

        for (kind, reader) in drains {
            let id = Arc::clone(&self.id);
            let chunk_size = self.chunk_size;
            tokio::spawn(async move {
                let mut output = exec_handle::output_stream(reader, chunk_size);
                let mut dropped = 0usize;
                while let Some(Ok(chunk)) = output.next().await {
                    dropped += chunk.len();
                }
                debug!(process_id = %id, stream = ?kind, bytes = dropped, "Drained unattached output");
            });
        }

        let state = self.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(process_id = %state.id, error = %e, "Failed to reap process");
                    ExitStatus::Code(255)
                }
            };
            state.mark_exited(status).await;
        });

        info!(process_id = %self.id, pid, "Process started");
        Ok(pid)
    }

    fn take_unattached_outputs(&self, inner: &mut Inner) -> Vec<(StreamKind, FdReader)> {
        if inner.attached {
            return Vec::new();
        }
        let mut drains = Vec::new();
        if let Some(reader) = inner.stdio.stdout.take() {
            drains.push((StreamKind::Stdout, reader));
        }
        if let Some(reader) = inner.stdio.stderr.take() {
            drains.push((StreamKind::Stderr, reader));
        }
        drains
    }

    async fn mark_exited(&self, status: ExitStatus) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.phase, Phase::Exited(_)) {
            return;
        }
        inner.phase = Phase::Exited(status);
        // Stdin of an exited process is useless.
        inner.stdio.stdin = None;
        drop(inner);

        info!(process_id = %self.id, status = ?status, "Process exited");
        self.exit.send_replace(Some(status));
    }

    /// Attach to the process output.
    ///
    /// Takes stdout/stderr and starts forwarding tasks. Chunks of one
    /// stream are delivered in order. The stream ends once both outputs
    /// reach EOF, or once the process has exited and its outputs have gone
    /// quiet for [`OUTPUT_EXIT_GRACE`].
    pub async fn attach(&self) -> GuestResult<mpsc::Receiver<Result<OutputChunk, Status>>> {
        let (stdout, stderr) = {
            let mut inner = self.inner.lock().await;
            if inner.attached {
                return Err(GuestError::FailedPrecondition(format!(
                    "process {} already attached",
                    self.id
                )));
            }
            if matches!(inner.phase, Phase::Running { .. }) && inner.stdio.stdout.is_none() {
                return Err(GuestError::FailedPrecondition(format!(
                    "output of process {} is already being drained",
                    self.id
                )));
            }
            inner.attached = true;
            (inner.stdio.stdout.take(), inner.stdio.stderr.take())
        };

        let (tx, rx) = mpsc::channel(capsule_shared::constants::agent::OUTPUT_BUFFER);
        for (kind, reader) in [(StreamKind::Stdout, stdout), (StreamKind::Stderr, stderr)] {
            let Some(reader) = reader else { continue };
            tokio::spawn(forward_output(
                Arc::clone(&self.id),
                kind,
                reader,
                self.chunk_size,
                tx.clone(),
                self.exit.subscribe(),
            ));
        }
        Ok(rx)
    }

    /// Forward a stdin stream into the process.
    ///
    /// Stdin is closed when a chunk carries `close` or the stream ends.
    pub async fn send_input(
        &self,
        first: capsule_shared::InputChunk,
        mut stream: tonic::Streaming<capsule_shared::InputChunk>,
    ) -> GuestResult<()> {
        let mut stdin = self.inner.lock().await.stdio.stdin.take().ok_or_else(|| {
            GuestError::FailedPrecondition(format!("stdin of process {} is not available", self.id))
        })?;

        let mut chunk = Some(first);
        while let Some(msg) = chunk {
            if !msg.data.is_empty() {
                if let Err(e) = stdin.write_all(&msg.data).await {
                    // The process closed its stdin or exited; the rest is moot.
                    debug!(process_id = %self.id, error = %e, "Stdin write failed");
                    return Ok(());
                }
            }
            if msg.close {
                break;
            }
            chunk = stream
                .message()
                .await
                .map_err(|e| GuestError::Internal(format!("stdin stream failed: {}", e)))?;
        }
        debug!(process_id = %self.id, "Stdin closed");
        Ok(())
    }

    /// Wait for the exit status.
    pub async fn wait(&self) -> GuestResult<ExitStatus> {
        let mut rx = self.exit.subscribe();
        let status = rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| GuestError::Internal("exit channel closed".to_string()))?;
        (*status).ok_or_else(|| GuestError::Internal("exit status missing".to_string()))
    }

    /// Deliver a signal.
    ///
    /// A created process never runs and exits as if killed. Returns false
    /// when the process had already exited.
    pub async fn kill(&self, signal: Signal) -> GuestResult<bool> {
        let mut inner = self.inner.lock().await;
        let pid = match &inner.phase {
            Phase::Running { pid } => *pid,
            Phase::Exited(_) => return Ok(false),
            Phase::Created(_) => {
                let status = ExitStatus::Signal(signal as i32);
                inner.phase = Phase::Exited(status);
                inner.stdio.stdin = None;
                drop(inner);
                info!(process_id = %self.id, signal = %signal, "Killed process before start");
                self.exit.send_replace(Some(status));
                return Ok(true);
            }
        };
        drop(inner);

        match nix::sys::signal::kill(pid, signal) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Resize the PTY window.
    pub async fn resize(&self, size: &TerminalSize) -> GuestResult<()> {
        let inner = self.inner.lock().await;
        let controller = inner.stdio.pty.as_ref().ok_or_else(|| {
            GuestError::FailedPrecondition(format!("process {} has no terminal", self.id))
        })?;
        exec_handle::resize(controller, size)?;
        Ok(())
    }

    /// Check that the process can be forgotten.
    pub async fn ensure_deletable(&self) -> GuestResult<()> {
        if self.is_running().await {
            return Err(GuestError::FailedPrecondition(format!(
                "process {} is still running",
                self.id
            )));
        }
        Ok(())
    }
}

async fn forward_output(
    id: Arc<str>,
    kind: StreamKind,
    reader: FdReader,
    chunk_size: usize,
    tx: mpsc::Sender<Result<OutputChunk, Status>>,
    mut exit: watch::Receiver<Option<ExitStatus>>,
) {
    let mut output = exec_handle::output_stream(reader, chunk_size);
    let mut tx = Some(tx);
    let mut exited = exit.borrow().is_some();
    loop {
        let next = if exited {
            match tokio::time::timeout(OUTPUT_EXIT_GRACE, output.next()).await {
                Ok(next) => next,
                Err(_) => {
                    // A child of the exited process still holds the pipe.
                    debug!(process_id = %id, stream = ?kind, "Output idle after exit, detaching");
                    break;
                }
            }
        } else {
            tokio::select! {
                next = output.next() => next,
                changed = exit.changed() => {
                    exited = changed.is_err() || exit.borrow().is_some();
                    continue;
                }
            }
        };
        let Some(chunk) = next else { break };
        let data = match chunk {
            Ok(data) => data,
            Err(e) => {
                warn!(process_id = %id, stream = ?kind, error = %e, "Output read failed");
                break;
            }
        };
        if let Some(sender) = &tx {
            let msg = OutputChunk {
                stream: kind as i32,
                data,
            };
            if sender.send(Ok(msg)).await.is_err() {
                // Host went away; keep draining so the process never blocks.
                debug!(process_id = %id, stream = ?kind, "Attach stream closed by host");
                tx = None;
            }
        }
    }
    debug!(process_id = %id, stream = ?kind, "Output forwarding task ended");
}
