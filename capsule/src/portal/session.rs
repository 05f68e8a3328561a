//! High-level guest session.
//!
//! Thin facade over service interfaces.

use std::time::Duration;

use capsule_shared::SocketType;

use crate::error::CapsuleResult;
use crate::portal::connection::Connection;
use crate::portal::interfaces::{AgentInterface, ContainerInterface, ProcessInterface};

/// High-level guest session.
///
/// Cloning is cheap; clones multiplex over the same connection.
#[derive(Clone)]
pub struct GuestSession {
    connection: Connection,
}

impl GuestSession {
    /// Connect a session to the agent at `socket_type`.
    pub async fn connect(socket_type: SocketType, timeout: Duration) -> CapsuleResult<Self> {
        Ok(Self {
            connection: Connection::connect(socket_type, timeout).await?,
        })
    }

    pub fn agent_socket(&self) -> &SocketType {
        self.connection.socket_type()
    }

    /// Disconnect from the agent. Every clone of this session is affected.
    pub fn close(&self) {
        self.connection.close();
    }

    /// Get agent interface.
    pub fn agent(&self) -> AgentInterface {
        AgentInterface::new(self.connection.channel())
    }

    /// Get container interface.
    pub fn container(&self) -> ContainerInterface {
        ContainerInterface::new(self.connection.channel())
    }

    /// Get process interface.
    pub fn process(&self) -> ProcessInterface {
        ProcessInterface::new(self.connection.channel())
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

// Compile-time assertions to ensure GuestSession is Send + Sync
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<GuestSession>;
};
