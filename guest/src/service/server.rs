use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use capsule_shared::constants::{agent as agent_const, network};
use capsule_shared::{Socket, SocketType, TransportError};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::error::{GuestError, GuestResult};
use crate::options::AgentOptions;
use crate::service::process::registry::ProcessRegistry;

/// A container registered by `Container.Create`.
#[derive(Debug, Clone)]
pub(crate) struct ContainerRecord {
    pub rootfs: PathBuf,
    pub hostname: String,
}

/// Guest agent server.
///
/// Implements three gRPC services on one listener:
/// - Agent: liveness, identity lookups, shutdown
/// - Container: container registration and teardown
/// - Process: process lifecycle with streaming stdio
pub struct GuestServer {
    pub(crate) options: AgentOptions,

    /// Container registry: container_id -> record
    pub(crate) containers: Arc<Mutex<HashMap<String, ContainerRecord>>>,

    /// Process registry across all containers
    pub(crate) registry: ProcessRegistry,

    pub(crate) shutdown: CancellationToken,
}

impl GuestServer {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            containers: Arc::new(Mutex::new(HashMap::new())),
            registry: ProcessRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled (also cancelled by the
    /// `Agent.Shutdown` RPC).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) async fn container_rootfs(&self, container_id: &str) -> GuestResult<String> {
        self.container_record(container_id)
            .await
            .map(|record| record.rootfs.to_string_lossy().into_owned())
    }

    /// Hostname for a process's own UTS namespace, if the agent can make one.
    pub(crate) fn private_hostname(&self, hostname: String) -> Option<String> {
        // SAFETY: geteuid cannot fail.
        let privileged = unsafe { libc::geteuid() } == 0;
        (self.options.isolate_hostname && privileged).then_some(hostname)
    }

    pub(crate) async fn container_record(&self, container_id: &str) -> GuestResult<ContainerRecord> {
        self.containers
            .lock()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| GuestError::ContainerNotFound(container_id.to_string()))
    }

    /// Bind `listen` and serve until shutdown.
    ///
    /// If `notify` is provided, connects to it once the listener is ready,
    /// signaling readiness to the host.
    pub async fn run(self, listen: SocketType, notify: Option<SocketType>) -> GuestResult<()> {
        info!(listen = %listen, "Binding agent listener");
        let listener = Socket::listen_on(listen, network::LISTEN_BACKLOG)?;
        self.serve(listener, notify).await
    }

    /// Serve all services on an already-listening socket.
    pub async fn serve(self, listener: Socket, notify: Option<SocketType>) -> GuestResult<()> {
        let listener = Arc::new(listener);
        let shutdown = self.shutdown.clone();
        let signal = self.shutdown.clone();
        let server = Arc::new(self);

        let incoming = spawn_acceptor(Arc::clone(&listener))
            .map(Socket::into_stream);

        if let Some(notify) = notify {
            tokio::spawn(async move {
                if let Err(e) = notify_host_ready(notify).await {
                    warn!(error = %e, "Failed to notify host");
                }
            });
        }

        // Releases the acceptor thread once shutdown is requested.
        {
            let listener = Arc::clone(&listener);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                if let Err(e) = listener.shutdown() {
                    debug!(error = %e, "Listener shutdown failed");
                }
            });
        }

        info!("Serving gRPC");
        let result = Server::builder()
            .max_concurrent_streams(Some(agent_const::MAX_CONCURRENT_STREAMS))
            .add_service(capsule_shared::AgentServer::from_arc(Arc::clone(&server)))
            .add_service(capsule_shared::ContainerServer::from_arc(Arc::clone(&server)))
            .add_service(capsule_shared::ProcessServer::from_arc(Arc::clone(&server)))
            .serve_with_incoming_shutdown(incoming, async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        info!("Agent stopped");
        result.map_err(|e| GuestError::Internal(format!("Server error: {}", e)))
    }
}

/// Accept connections on a dedicated thread; `accept` blocks.
///
/// The thread exits once the listener is shut down or the server stops
/// consuming connections.
fn spawn_acceptor(listener: Arc<Socket>) -> ReceiverStream<Socket> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || loop {
        match listener.accept() {
            Ok((socket, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                if tx.blocking_send(socket).is_err() {
                    break;
                }
            }
            Err(TransportError::ConnectionClosed(_)) => break,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                std::thread::sleep(agent_const::NOTIFY_RETRY);
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Notify host that guest is ready by connecting to the notify address.
///
/// The connection itself is the signal - no data needs to be sent. The host
/// may not be listening yet, so connection attempts are retried.
async fn notify_host_ready(notify: SocketType) -> GuestResult<()> {
    let started = Instant::now();
    loop {
        let target = notify.clone();
        let attempt = tokio::task::spawn_blocking(move || Socket::connect_to(target))
            .await
            .map_err(|e| GuestError::Internal(format!("notify task failed: {}", e)))?;
        match attempt {
            Ok(_socket) => {
                info!(notify = %notify, "Host notified");
                return Ok(());
            }
            Err(e) if started.elapsed() < agent_const::NOTIFY_DEADLINE => {
                debug!(notify = %notify, error = %e, "Host not listening yet");
                tokio::time::sleep(agent_const::NOTIFY_RETRY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_hostname_follows_options() {
        let shared = GuestServer::new(AgentOptions {
            isolate_hostname: false,
            ..AgentOptions::default()
        });
        assert_eq!(shared.private_hostname("foo-bar".to_string()), None);

        let isolated = GuestServer::new(AgentOptions::default());
        let expected = (unsafe { libc::geteuid() } == 0).then(|| "foo-bar".to_string());
        assert_eq!(isolated.private_hostname("foo-bar".to_string()), expected);
    }
}
