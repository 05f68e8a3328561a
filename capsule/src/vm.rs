//! The VM a container runs in.
//!
//! Provisioning the VM is someone else's job; the container engine only
//! needs to know where the guest agent listens, where it announces
//! readiness, and when the VM goes away.

use async_trait::async_trait;
use capsule_shared::SocketType;
use std::fmt;
use std::path::{Path, PathBuf};

/// Handle to a running VM hosting one guest agent.
#[async_trait]
pub trait VmHandle: Send + Sync + 'static {
    /// Address of the guest agent's gRPC listener, as reachable from the host.
    fn agent_socket(&self) -> SocketType;

    /// Address the host listens on for the guest's ready notification.
    fn ready_socket(&self) -> SocketType;

    /// Resolves once the VM has terminated. Never resolves for a live VM.
    async fn terminated(&self);
}

/// Root filesystem of a container, as a path inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rootfs(PathBuf);

impl Rootfs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for Rootfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for Rootfs {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&str> for Rootfs {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}
