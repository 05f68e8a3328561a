//! Test harness for capsule integration tests.
//!
//! [`LocalVm`] stands in for a VM: it runs the guest agent in-process on
//! Unix sockets in a temp dir, so containers can be driven end to end
//! without a hypervisor. Containers use `/` as their rootfs, which makes
//! the agent run processes in the host's own root.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capsule::{
    CapsuleResult, ContainerOptions, LinuxContainer, ProcessConfig, SocketType, Stdio, User,
    VmHandle,
};
use capsule_guest::{AgentOptions, GuestServer};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Install a test-friendly tracing subscriber. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Guest agent running in the test process.
pub struct LocalVm {
    _dir: TempDir,
    agent: SocketType,
    ready: SocketType,
    /// Stops the agent.
    agent_shutdown: CancellationToken,
    /// Fires once the "VM" is gone.
    terminated: CancellationToken,
}

impl LocalVm {
    /// Boot an agent with default options. Must run inside a Tokio runtime.
    pub fn boot() -> io::Result<Arc<Self>> {
        Self::boot_with(AgentOptions::default())
    }

    pub fn boot_with(options: AgentOptions) -> io::Result<Arc<Self>> {
        let dir = tempfile::Builder::new().prefix("capsule-vm-").tempdir()?;
        let agent = SocketType::unix(dir.path().join("agent.sock"));
        let ready = SocketType::unix(dir.path().join("ready.sock"));

        let server = GuestServer::new(options);
        let agent_shutdown = server.shutdown_token();
        let terminated = CancellationToken::new();

        {
            let listen = agent.clone();
            let notify = ready.clone();
            let terminated = terminated.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(listen, Some(notify)).await {
                    tracing::warn!(error = %e, "Local guest agent failed");
                }
                terminated.cancel();
            });
        }

        Ok(Arc::new(Self {
            _dir: dir,
            agent,
            ready,
            agent_shutdown,
            terminated,
        }))
    }

    /// Kill the "VM": stop the agent and report termination right away.
    pub fn terminate(&self) {
        self.agent_shutdown.cancel();
        self.terminated.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }
}

#[async_trait]
impl VmHandle for LocalVm {
    fn agent_socket(&self) -> SocketType {
        self.agent.clone()
    }

    fn ready_socket(&self) -> SocketType {
        self.ready.clone()
    }

    async fn terminated(&self) {
        self.terminated.cancelled().await
    }
}

impl Drop for LocalVm {
    fn drop(&mut self) {
        self.agent_shutdown.cancel();
    }
}

/// Options with timeouts short enough for tests.
pub fn test_options() -> ContainerOptions {
    ContainerOptions {
        ready_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(5),
        ..ContainerOptions::default()
    }
}

/// The identity the test process runs as.
///
/// Processes keep it so tests pass without root.
pub fn current_user() -> User {
    // SAFETY: geteuid/getegid cannot fail.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    User::new(uid, gid)
}

/// A process config running as [`current_user`].
pub fn command<I, S>(args: I) -> ProcessConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ProcessConfig::new(args).user(current_user())
}

/// `/bin/sh -c <script>` as [`current_user`].
pub fn shell(script: &str) -> ProcessConfig {
    command(["/bin/sh", "-c", script])
}

pub fn is_root() -> bool {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Boot a VM and create and start a container whose init sleeps until
/// killed.
pub async fn running_container(id: &str) -> CapsuleResult<(Arc<LocalVm>, LinuxContainer)> {
    running_container_with(id, shell("exec sleep 3600"), Stdio::new()).await
}

/// Boot a VM and create and start a container with the given init.
pub async fn running_container_with(
    id: &str,
    init: ProcessConfig,
    stdio: Stdio,
) -> CapsuleResult<(Arc<LocalVm>, LinuxContainer)> {
    let vm = LocalVm::boot().map_err(|e| capsule::CapsuleError::Internal(e.to_string()))?;
    let container = LinuxContainer::new(id, "/", vm.clone(), init)
        .with_options(test_options())
        .with_stdio(stdio);
    container.create().await?;
    container.start().await?;
    Ok((vm, container))
}
