//! Container lifecycle status.

use std::fmt;

/// Lifecycle status of a container.
///
/// ```text
/// new()    → Initialized
/// create() → Created   (guest ready, init allocated)   or Failed
/// start()  → Started   (init running)
/// stop()   → Stopped   (transport torn down)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    Initialized,
    Created,
    Started,
    Stopped,
    /// `create()` failed. Terminal; nothing was left open.
    Failed,
}

impl ContainerState {
    /// Whether the guest session is up.
    pub fn is_live(&self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Initialized => "initialized",
            ContainerState::Created => "created",
            ContainerState::Started => "started",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
