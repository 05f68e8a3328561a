//! Guest rendezvous and VM supervision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use capsule_shared::constants::network::LISTEN_BACKLOG;
use capsule_shared::{Socket, TransportError};
use tokio_util::sync::CancellationToken;

use super::registry::ProcessRegistry;
use crate::error::{CapsuleError, CapsuleResult, ContainerError};
use crate::portal::GuestSession;
use crate::vm::VmHandle;

/// Wait for the guest agent to connect to the VM's ready socket.
///
/// The connection itself is the signal; nothing is read from it. The
/// listener is closed on every path.
pub(super) async fn await_guest_ready(
    container_id: &str,
    vm: &dyn VmHandle,
    timeout: Duration,
) -> CapsuleResult<()> {
    let ready = vm.ready_socket();
    let listener = Arc::new(Socket::listen_on(ready.clone(), LISTEN_BACKLOG)?);
    tracing::debug!(
        container_id = %container_id,
        socket = %ready,
        "Listening for guest ready notification"
    );

    let started = Instant::now();
    let acceptor = {
        let listener = Arc::clone(&listener);
        tokio::task::spawn_blocking(move || listener.accept())
    };

    let result = tokio::select! {
        accepted = acceptor => match accepted {
            Ok(Ok((_conn, peer))) => {
                tracing::debug!(
                    container_id = %container_id,
                    peer = %peer,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Guest signaled ready"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(CapsuleError::Internal(format!("ready acceptor failed: {}", e))),
        },
        _ = tokio::time::sleep(timeout) => Err(ContainerError::ReadyTimeout {
            id: container_id.to_string(),
            waited_ms: timeout.as_millis() as u64,
        }
        .into()),
        _ = vm.terminated() => Err(TransportError::ConnectionClosed(
            "VM terminated before the guest became ready".to_string(),
        )
        .into()),
    };

    // Unblocks the acceptor thread if it is still parked.
    if let Err(e) = listener.shutdown() {
        tracing::debug!(container_id = %container_id, error = %e, "Ready listener shutdown failed");
    }
    result
}

/// Fail everything pending on the session once the VM goes away.
///
/// Exits quietly when `cancel` fires first (normal teardown).
pub(super) fn spawn_vm_watcher(
    container_id: String,
    vm: Arc<dyn VmHandle>,
    session: GuestSession,
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = vm.terminated() => {
                tracing::warn!(container_id = %container_id, "VM terminated, closing transport");
                session.close();
                let err: CapsuleError =
                    TransportError::ConnectionClosed("VM terminated".to_string()).into();
                let failed = registry
                    .processes()
                    .into_iter()
                    .filter(|process| process.fail(err.clone()))
                    .count();
                tracing::debug!(container_id = %container_id, failed, "Failed pending waits");
            }
        }
    });
}
