use std::fmt;

/// Lifecycle of a process handle.
///
/// `Created → Running → Exited(code) → Deleted`. A created process may also
/// go straight to `Exited` when killed before it starts, and to `Deleted`
/// when deleted without ever starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Allocated in the guest, not yet exec'd.
    Created,
    Running { pid: u32 },
    /// POSIX exit code; `128 + signal` when killed by a signal.
    Exited(i32),
    /// Released in the guest. Terminal; the id is never reused.
    Deleted,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Created => write!(f, "created"),
            ProcessState::Running { pid } => write!(f, "running (pid {})", pid),
            ProcessState::Exited(code) => write!(f, "exited ({})", code),
            ProcessState::Deleted => write!(f, "deleted"),
        }
    }
}
