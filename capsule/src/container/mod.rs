//! Container lifecycle engine.
//!
//! A [`LinuxContainer`] owns the session to one guest agent, the init
//! process and every exec'd process. All of them share the container's
//! rootfs and hostname and are multiplexed over one connection.

mod lifecycle;
mod registry;
mod state;

pub use state::ContainerState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use capsule_shared::constants::container::DEFAULT_HOSTNAME;
use capsule_shared::constants::process::{SIGKILL, TEARDOWN_EXIT_CODE};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::env::{GuestIdentity, IdentityLookup};
use crate::error::{CapsuleError, CapsuleResult, ContainerError, ProcessError};
use crate::options::ContainerOptions;
use crate::portal::GuestSession;
use crate::process::{LinuxProcess, ProcessConfig, ProcessContext, Stdio};
use crate::vm::{Rootfs, VmHandle};
use registry::ProcessRegistry;

/// Resources that exist once `create()` succeeded.
struct Live {
    session: GuestSession,
    ctx: ProcessContext,
    init: LinuxProcess,
}

/// A container running inside a VM.
///
/// ```text
/// let container = LinuxContainer::new("web", rootfs, vm, ProcessConfig::new(["nginx"]));
/// container.create().await?;
/// container.start().await?;
/// let probe = container.exec("probe", ProcessConfig::new(["true"]), Stdio::new()).await?;
/// probe.start().await?;
/// probe.wait().await?;
/// container.kill(15).await?;
/// container.wait().await?;
/// container.stop().await?;
/// ```
pub struct LinuxContainer {
    id: String,
    rootfs: Rootfs,
    hostname: String,
    vm: Arc<dyn VmHandle>,
    options: ContainerOptions,
    identity: Option<Arc<dyn IdentityLookup>>,
    /// Init spec, consumed by `create()`.
    init_spec: Mutex<Option<(ProcessConfig, Stdio)>>,

    state: Mutex<ContainerState>,
    /// Serializes create/start/stop. Never held by exec or wait.
    transition: tokio::sync::Mutex<()>,
    live: OnceLock<Live>,
    registry: Arc<ProcessRegistry>,
    torn_down: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LinuxContainer {
    /// Describe a container. Nothing happens until [`create`](Self::create).
    pub fn new(
        id: impl Into<String>,
        rootfs: impl Into<Rootfs>,
        vm: Arc<dyn VmHandle>,
        config: ProcessConfig,
    ) -> Self {
        Self {
            id: id.into(),
            rootfs: rootfs.into(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            vm,
            options: ContainerOptions::default(),
            identity: None,
            init_spec: Mutex::new(Some((config, Stdio::default()))),
            state: Mutex::new(ContainerState::Initialized),
            transition: tokio::sync::Mutex::new(()),
            live: OnceLock::new(),
            registry: Arc::new(ProcessRegistry::new()),
            torn_down: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Stdio of the init process.
    pub fn with_stdio(self, stdio: Stdio) -> Self {
        if let Some((_, slot)) = self.init_spec.lock().as_mut() {
            *slot = stdio;
        }
        self
    }

    /// Resolve identities from `identity` instead of the guest's passwd.
    pub fn with_identity(mut self, identity: Arc<dyn IdentityLookup>) -> Self {
        self.identity = Some(identity);
        self
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rootfs(&self) -> &Rootfs {
        &self.rootfs
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    /// The init process, once created.
    pub fn init(&self) -> Option<LinuxProcess> {
        self.live.get().map(|live| live.init.clone())
    }

    /// A process that has not been deleted, init included.
    pub fn process(&self, id: &str) -> Option<LinuxProcess> {
        self.registry.get(id)
    }

    /// Ids of exec'd processes that have not been deleted.
    pub fn exec_ids(&self) -> Vec<String> {
        self.registry
            .live_ids()
            .into_iter()
            .filter(|id| *id != self.id)
            .collect()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Wait for the guest, connect to it, register the container and
    /// allocate init.
    ///
    /// On failure the container is `Failed` and everything opened along the
    /// way has been closed.
    pub async fn create(&self) -> CapsuleResult<()> {
        let _transition = self.transition.lock().await;
        if self.state() != ContainerState::Initialized {
            return Err(ContainerError::AlreadyCreated(self.id.clone()).into());
        }

        tracing::info!(container_id = %self.id, rootfs = %self.rootfs, "Creating container");
        let live = match self.provision().await {
            Ok(live) => live,
            Err(e) => {
                tracing::error!(container_id = %self.id, error = %e, "Container create failed");
                *self.state.lock() = ContainerState::Failed;
                return Err(e);
            }
        };

        lifecycle::spawn_vm_watcher(
            self.id.clone(),
            Arc::clone(&self.vm),
            live.session.clone(),
            Arc::clone(&self.registry),
            self.cancel.clone(),
        );
        if self.live.set(live).is_err() {
            return Err(CapsuleError::Internal("container provisioned twice".to_string()));
        }
        *self.state.lock() = ContainerState::Created;
        tracing::info!(container_id = %self.id, "Container created");
        Ok(())
    }

    async fn provision(&self) -> CapsuleResult<Live> {
        let (config, stdio) = self
            .init_spec
            .lock()
            .take()
            .ok_or_else(|| CapsuleError::Internal("init spec already consumed".to_string()))?;
        config.validate()?;

        lifecycle::await_guest_ready(&self.id, self.vm.as_ref(), self.options.ready_timeout)
            .await?;
        let session =
            GuestSession::connect(self.vm.agent_socket(), self.options.connect_timeout).await?;

        if let Err(e) = session
            .container()
            .create(&self.id, &self.rootfs, &self.hostname)
            .await
        {
            session.close();
            return Err(e);
        }

        let identity = match &self.identity {
            Some(identity) => Arc::clone(identity),
            None => Arc::new(GuestIdentity::new(session.agent(), self.id.clone())),
        };
        let ctx = ProcessContext {
            session: session.clone(),
            container_id: self.id.clone(),
            identity,
            stdio_buffer: self.options.stdio_buffer,
        };

        let reservation = self.registry.reserve(&self.id)?;
        let init = match LinuxProcess::create(&ctx, &self.id, config, stdio).await {
            Ok(init) => init,
            Err(e) => {
                if let Err(cleanup) = session.container().delete(&self.id).await {
                    tracing::debug!(container_id = %self.id, error = %cleanup, "Cleanup after failed init");
                }
                session.close();
                return Err(e);
            }
        };
        reservation.commit(init.clone());

        Ok(Live { session, ctx, init })
    }

    /// Start the init process.
    ///
    /// If init fails to start the container stays `Created` and the error
    /// is kept on the init handle.
    pub async fn start(&self) -> CapsuleResult<()> {
        let _transition = self.transition.lock().await;
        match self.state() {
            ContainerState::Created => {}
            ContainerState::Started => {
                return Err(ContainerError::AlreadyStarted(self.id.clone()).into())
            }
            ContainerState::Stopped => {
                return Err(ContainerError::AlreadyStopped(self.id.clone()).into())
            }
            ContainerState::Initialized | ContainerState::Failed => {
                return Err(ContainerError::NotStarted(self.id.clone()).into())
            }
        }

        let live = self.live()?;
        live.init.start().await?;
        *self.state.lock() = ContainerState::Started;
        tracing::info!(container_id = %self.id, "Container started");
        Ok(())
    }

    /// Allocate a process in the running container. The caller starts it.
    ///
    /// Each id can be used once for the container's lifetime; reusing one,
    /// even after delete, fails with `AlreadyExists`.
    ///
    /// Registration runs to completion even if this future is dropped; a
    /// process nobody received is deleted again and its id stays used.
    pub async fn exec(
        &self,
        id: &str,
        config: ProcessConfig,
        stdio: Stdio,
    ) -> CapsuleResult<LinuxProcess> {
        match self.state() {
            ContainerState::Started => {}
            ContainerState::Stopped => {
                return Err(ContainerError::AlreadyStopped(self.id.clone()).into())
            }
            _ => return Err(ContainerError::NotStarted(self.id.clone()).into()),
        }
        if id.is_empty() {
            return Err(ProcessError::InvalidConfig("process id must not be empty".into()).into());
        }
        let ctx = self.live()?.ctx.clone();
        let registry = Arc::clone(&self.registry);
        let torn_down = Arc::clone(&self.torn_down);
        let id = id.to_string();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = register_exec(&ctx, &registry, &torn_down, &id, config, stdio).await;
            if let Err(Ok(orphan)) = tx.send(result) {
                tracing::debug!(
                    container_id = %ctx.container_id,
                    process_id = %id,
                    "Exec caller went away, deleting process"
                );
                if let Err(e) = orphan.delete().await {
                    tracing::debug!(process_id = %id, error = %e, "Failed to delete abandoned process");
                }
            }
        });
        rx.await
            .map_err(|_| CapsuleError::Internal("exec task ended without a result".to_string()))?
    }

    /// Exit code of init. Does not wait for exec'd processes.
    pub async fn wait(&self) -> CapsuleResult<i32> {
        self.live()?.init.wait().await
    }

    /// Signal init. Exec'd processes are not affected.
    pub async fn kill(&self, signal: i32) -> CapsuleResult<()> {
        self.live()?.init.kill(signal).await
    }

    /// Tear the container down once init has exited.
    ///
    /// Fails with `NotExited` while init runs. Exec'd processes still alive
    /// are killed and their handles report exit code 137. Stopping again
    /// is a no-op.
    pub async fn stop(&self) -> CapsuleResult<()> {
        let _transition = self.transition.lock().await;
        if self.state() == ContainerState::Stopped {
            return Ok(());
        }
        if let Some(live) = self.live.get() {
            if live.init.state().is_running() {
                return Err(ProcessError::NotExited(self.id.clone()).into());
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// SIGKILL init, give it `stop_timeout` to die, then tear down.
    pub async fn force_stop(&self) -> CapsuleResult<()> {
        let _transition = self.transition.lock().await;
        if self.state() == ContainerState::Stopped {
            return Ok(());
        }
        if let Some(live) = self.live.get() {
            if let Err(e) = live.init.kill(SIGKILL).await {
                tracing::warn!(container_id = %self.id, error = %e, "Failed to kill init");
            }
            match tokio::time::timeout(self.options.stop_timeout, live.init.wait()).await {
                Ok(Ok(code)) => tracing::debug!(container_id = %self.id, exit_code = code, "Init exited"),
                Ok(Err(e)) => tracing::warn!(container_id = %self.id, error = %e, "Init wait failed"),
                Err(_) => tracing::warn!(
                    container_id = %self.id,
                    timeout_ms = self.options.stop_timeout.as_millis() as u64,
                    "Init did not exit in time"
                ),
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// Release the transport and invalidate every process. Runs once.
    async fn teardown(&self) {
        if self
            .torn_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.cancel.cancel();

        if let Some(live) = self.live.get() {
            let invalidated = self
                .registry
                .processes()
                .into_iter()
                .filter(|process| process.invalidate(TEARDOWN_EXIT_CODE))
                .count();

            match live.session.container().delete(&self.id).await {
                Ok(killed) => tracing::debug!(
                    container_id = %self.id,
                    invalidated,
                    killed,
                    "Guest container deleted"
                ),
                Err(e) => tracing::warn!(
                    container_id = %self.id,
                    error = %e,
                    "Failed to delete guest container"
                ),
            }
            live.session.close();
        }

        *self.state.lock() = ContainerState::Stopped;
        tracing::info!(container_id = %self.id, "Container stopped");
    }

    fn live(&self) -> CapsuleResult<&Live> {
        self.live
            .get()
            .ok_or_else(|| ContainerError::NotStarted(self.id.clone()).into())
    }
}

async fn register_exec(
    ctx: &ProcessContext,
    registry: &ProcessRegistry,
    torn_down: &AtomicBool,
    id: &str,
    config: ProcessConfig,
    stdio: Stdio,
) -> CapsuleResult<LinuxProcess> {
    let reservation = registry.reserve(id)?;
    let process = LinuxProcess::create(ctx, id, config, stdio).await?;
    reservation.commit(process.clone());

    // Lost a race with stop(): the process never belonged to a live container.
    if torn_down.load(Ordering::SeqCst) {
        process.invalidate(TEARDOWN_EXIT_CODE);
    }
    Ok(process)
}

impl Drop for LinuxContainer {
    fn drop(&mut self) {
        if self.state().is_live() && !self.torn_down.load(Ordering::SeqCst) {
            tracing::warn!(
                container_id = %self.id,
                "LinuxContainer dropped without stop(), closing transport"
            );
            self.cancel.cancel();
            if let Some(live) = self.live.get() {
                live.session.close();
            }
        }
    }
}
