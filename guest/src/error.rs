//! Guest agent errors and their gRPC status mapping.

use capsule_shared::TransportError;
use thiserror::Error;
use tonic::Status;

pub type GuestResult<T> = Result<T, GuestError>;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("process already exists: {0}")]
    ProcessExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The process is not in a state that allows the operation.
    #[error("{0}")]
    FailedPrecondition(String),

    /// fork/exec of the process failed.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sys(#[from] nix::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<GuestError> for Status {
    fn from(err: GuestError) -> Self {
        let message = err.to_string();
        match err {
            GuestError::ContainerNotFound(_) | GuestError::ProcessNotFound(_) => {
                Status::not_found(message)
            }
            GuestError::ContainerExists(_) | GuestError::ProcessExists(_) => {
                Status::already_exists(message)
            }
            GuestError::InvalidArgument(_) => Status::invalid_argument(message),
            GuestError::FailedPrecondition(_) => Status::failed_precondition(message),
            GuestError::Transport(TransportError::ConnectionClosed(_)) => {
                Status::unavailable(message)
            }
            GuestError::Spawn { .. }
            | GuestError::Transport(_)
            | GuestError::Io(_)
            | GuestError::Sys(_)
            | GuestError::Internal(_) => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_codes() {
        let cases = [
            (GuestError::ProcessNotFound("p".into()), Code::NotFound),
            (GuestError::ContainerExists("c".into()), Code::AlreadyExists),
            (GuestError::InvalidArgument("args".into()), Code::InvalidArgument),
            (GuestError::FailedPrecondition("running".into()), Code::FailedPrecondition),
            (
                GuestError::Spawn {
                    program: "/nope".into(),
                    source: std::io::Error::from_raw_os_error(libc::ENOENT),
                },
                Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }
}
