//! Transport-level errors shared by host and guest.

use std::io;
use thiserror::Error;

/// Result alias for socket and connection operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures of the host-guest transport.
///
/// Cloneable so a single disconnect can be reported to every pending waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The address family is not available on this platform or kernel.
    #[error("unsupported socket family: {0}")]
    UnsupportedFamily(String),

    /// Another socket is already bound to the address.
    #[error("address in use: {0}")]
    AddressInUse(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Descriptor or buffer limits were hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer went away or the transport was torn down.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Any other OS-level failure.
    #[error("{op}: {message}")]
    Io { op: &'static str, message: String },
}

impl TransportError {
    /// Classify an OS error raised by `op`.
    pub fn from_io(op: &'static str, err: io::Error) -> Self {
        let detail = format!("{}: {}", op, err);
        match err.raw_os_error() {
            Some(libc::EAFNOSUPPORT) | Some(libc::EPROTONOSUPPORT) | Some(libc::ESOCKTNOSUPPORT) => {
                TransportError::UnsupportedFamily(detail)
            }
            Some(libc::EADDRINUSE) => TransportError::AddressInUse(detail),
            Some(libc::EACCES) | Some(libc::EPERM) => TransportError::PermissionDenied(detail),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
                TransportError::ResourceExhausted(detail)
            }
            Some(libc::ECONNRESET)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ECONNABORTED)
            | Some(libc::EPIPE)
            | Some(libc::ENOTCONN) => TransportError::ConnectionClosed(detail),
            // Connecting to a Unix path nobody listens on.
            Some(libc::ENOENT) if op == "connect" => TransportError::ConnectionClosed(detail),
            _ => TransportError::Io {
                op,
                message: err.to_string(),
            },
        }
    }

    /// Whether the error means the peer is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed(_))
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::UnsupportedFamily(_) => io::ErrorKind::Unsupported,
            TransportError::AddressInUse(_) => io::ErrorKind::AddrInUse,
            TransportError::PermissionDenied(_) => io::ErrorKind::PermissionDenied,
            TransportError::ResourceExhausted(_) => io::ErrorKind::OutOfMemory,
            TransportError::ConnectionClosed(_) => io::ErrorKind::ConnectionReset,
            TransportError::Io { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classifies_errno() {
        let err = TransportError::from_io("bind", io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert!(matches!(err, TransportError::AddressInUse(_)));

        let err = TransportError::from_io("socket", io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(err, TransportError::ResourceExhausted(_)));

        let err = TransportError::from_io("socket", io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
        assert!(matches!(err, TransportError::UnsupportedFamily(_)));

        let err = TransportError::from_io("connect", io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert!(err.is_connection_closed());
    }

    #[test]
    fn test_missing_path_is_closed_only_for_connect() {
        let err = TransportError::from_io("connect", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.is_connection_closed());

        for op in ["mkdir", "unlink", "stat", "bind"] {
            let err = TransportError::from_io(op, io::Error::from_raw_os_error(libc::ENOENT));
            assert!(!err.is_connection_closed(), "{} reported as closed", op);
            assert!(matches!(err, TransportError::Io { op: got, .. } if got == op));
        }
    }

    #[test]
    fn test_unclassified_errno_keeps_operation() {
        let err = TransportError::from_io("listen", io::Error::from_raw_os_error(libc::EINVAL));
        match err {
            TransportError::Io { op, .. } => assert_eq!(op, "listen"),
            other => panic!("unexpected classification: {:?}", other),
        }
    }
}
