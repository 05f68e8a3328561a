//! Connection management.
//!
//! Dials the agent over a Transport Socket and wraps it in a tonic Channel.
//! Every RPC from every process shares this one HTTP/2 connection.

use std::sync::Arc;
use std::time::Duration;

use capsule_shared::{Socket, SocketType, TransportError};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::{CapsuleError, CapsuleResult};

/// Established connection to a guest agent.
#[derive(Clone)]
pub struct Connection {
    socket_type: SocketType,
    channel: Channel,
    control: Arc<Mutex<Control>>,
}

/// Duplicate of the connected socket, kept so the connection can be cut
/// while RPCs still hold the channel. Once closed, the channel may not
/// reconnect.
#[derive(Default)]
struct Control {
    socket: Option<Socket>,
    closed: bool,
}

impl Connection {
    /// Connect to the agent at `socket_type` within `timeout`.
    pub async fn connect(socket_type: SocketType, timeout: Duration) -> CapsuleResult<Self> {
        tracing::debug!(agent = %socket_type, "Connecting to guest agent");

        let control = Arc::new(Mutex::new(Control::default()));
        let target = socket_type.clone();
        let slot = Arc::clone(&control);
        // The authority is never resolved; the connector ignores the URI.
        let endpoint = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| CapsuleError::Internal(format!("invalid endpoint: {}", e)))?
            .connect_timeout(timeout);
        let connecting = endpoint.connect_with_connector(service_fn(move |_: Uri| {
            let target = target.clone();
            let slot = Arc::clone(&slot);
            async move {
                if slot.lock().closed {
                    return Err(session_closed());
                }
                // vsock connects may block until the peer answers.
                let socket = tokio::task::spawn_blocking(move || Socket::connect_to(target))
                    .await
                    .map_err(std::io::Error::other)??;
                let mut control = slot.lock();
                if control.closed {
                    return Err(session_closed());
                }
                control.socket = Some(socket.try_clone()?);
                drop(control);
                Ok::<_, std::io::Error>(TokioIo::new(socket.into_stream()?))
            }
        }));

        let channel = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| {
                TransportError::ConnectionClosed(format!(
                    "connecting to {} timed out after {:?}",
                    socket_type, timeout
                ))
            })??;

        tracing::debug!(agent = %socket_type, "Connected to guest agent");
        Ok(Self {
            socket_type,
            channel,
            control,
        })
    }

    pub fn socket_type(&self) -> &SocketType {
        &self.socket_type
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Cut the connection. In-flight and future RPCs fail as closed.
    ///
    /// Idempotent; the socket is shut down at most once.
    pub fn close(&self) {
        let socket = {
            let mut control = self.control.lock();
            control.closed = true;
            control.socket.take()
        };
        if let Some(socket) = socket {
            if let Err(e) = socket.shutdown() {
                tracing::debug!(agent = %self.socket_type, error = %e, "Socket shutdown failed");
            }
        }
    }
}

fn session_closed() -> std::io::Error {
    TransportError::ConnectionClosed("session closed".to_string()).into()
}
