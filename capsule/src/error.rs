//! Hierarchical error types for the host runtime.
//!
//! Errors are grouped by the component that raises them:
//! - [`TransportError`]: the host-guest socket and session
//! - [`ProcessError`]: process configuration and lifecycle
//! - [`ContainerError`]: container lifecycle
//! - [`SinkError`]: output sinks

use capsule_shared::TransportError;
use thiserror::Error;
use tonic::{Code, Status};

pub type CapsuleResult<T> = Result<T, CapsuleError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors returned by the capsule runtime.
///
/// Cloneable so a recorded failure can be handed to every observer.
#[derive(Debug, Clone, Error)]
pub enum CapsuleError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("process: {0}")]
    Process(#[from] ProcessError),

    #[error("container: {0}")]
    Container(#[from] ContainerError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),

    /// The guest rejected a call for a reason with no better mapping.
    #[error("rpc failed ({code:?}): {message}")]
    Rpc { code: Code, message: String },

    #[error("internal: {0}")]
    Internal(String),
}

impl CapsuleError {
    /// Whether the transport to the guest is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, CapsuleError::Transport(e) if e.is_connection_closed())
    }
}

// ============================================================================
// Component Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Empty argv, relative cwd, unknown username, ...
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The id is already in use (or retired) in this container.
    #[error("process {0} already exists")]
    AlreadyExists(String),

    #[error("process {id} failed to start: {reason}")]
    StartFailed { id: String, reason: String },

    /// Delete was called on a running process.
    #[error("process {0} has not exited")]
    NotExited(String),

    #[error("process {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("container {0} already created")]
    AlreadyCreated(String),

    #[error("container {0} already started")]
    AlreadyStarted(String),

    #[error("container {0} is not started")]
    NotStarted(String),

    #[error("container {0} already stopped")]
    AlreadyStopped(String),

    /// The guest never connected to the ready socket.
    #[error("container {id} guest not ready after {waited_ms}ms")]
    ReadyTimeout { id: String, waited_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// A bounded sink rejected data past its capacity.
    #[error("sink full (capacity {capacity} bytes)")]
    Full { capacity: usize },

    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err.to_string())
    }
}

// ============================================================================
// gRPC status mapping
// ============================================================================

impl From<Status> for CapsuleError {
    fn from(status: Status) -> Self {
        if is_transport_status(&status) {
            return CapsuleError::Transport(TransportError::ConnectionClosed(
                status.message().to_string(),
            ));
        }
        CapsuleError::Rpc {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for CapsuleError {
    fn from(err: tonic::transport::Error) -> Self {
        CapsuleError::Transport(TransportError::ConnectionClosed(err.to_string()))
    }
}

/// Map a status returned by a process RPC, naming the process.
pub(crate) fn process_status(status: Status, process_id: &str) -> CapsuleError {
    match status.code() {
        Code::AlreadyExists => ProcessError::AlreadyExists(process_id.to_string()).into(),
        Code::NotFound => ProcessError::NotFound(process_id.to_string()).into(),
        Code::InvalidArgument => ProcessError::InvalidConfig(status.message().to_string()).into(),
        _ => status.into(),
    }
}

/// Unavailable and Cancelled come from the channel itself; Unknown with an
/// underlying error is a broken HTTP/2 connection.
fn is_transport_status(status: &Status) -> bool {
    match status.code() {
        Code::Unavailable | Code::Cancelled => true,
        Code::Unknown => std::error::Error::source(status).is_some(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_connection_closed() {
        let err = CapsuleError::from(Status::unavailable("connection refused"));
        assert!(err.is_connection_closed());

        let err = CapsuleError::from(Status::cancelled("dropped"));
        assert!(err.is_connection_closed());
    }

    #[test]
    fn test_process_status_mapping() {
        let err = process_status(Status::already_exists("taken"), "web");
        assert!(matches!(
            err,
            CapsuleError::Process(ProcessError::AlreadyExists(ref id)) if id == "web"
        ));

        let err = process_status(Status::not_found("gone"), "web");
        assert!(matches!(err, CapsuleError::Process(ProcessError::NotFound(_))));

        let err = process_status(Status::invalid_argument("args must not be empty"), "web");
        assert!(matches!(err, CapsuleError::Process(ProcessError::InvalidConfig(_))));

        let err = process_status(Status::failed_precondition("running"), "web");
        assert!(matches!(
            err,
            CapsuleError::Rpc {
                code: Code::FailedPrecondition,
                ..
            }
        ));
    }

    #[test]
    fn test_plain_unknown_status_is_rpc_error() {
        let err = CapsuleError::from(Status::unknown("odd"));
        assert!(!err.is_connection_closed());
    }
}
