//! Stream sockets over the families a guest can be reached by.
//!
//! [`SocketType`] names an address (local-domain path or vsock cid/port) and
//! owns the family-specific hooks; [`Socket`] is the descriptor that every
//! family shares. Callers never branch on the family: they open, bind,
//! listen, accept and connect through the same calls.

mod stream;
mod unix;
mod vsock;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{TransportError, TransportResult};

pub use stream::SocketStream;
pub use vsock::{CID_ANY, CID_HOST};

/// Address of one endpoint of a host-guest stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SocketType {
    /// Local-domain socket bound to a filesystem path.
    Unix { path: PathBuf },

    /// VM socket addressed by context id and port (Linux only).
    Vsock { cid: u32, port: u32 },
}

impl SocketType {
    /// Create a local-domain address.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a vsock address.
    pub fn vsock(cid: u32, port: u32) -> Self {
        Self::Vsock { cid, port }
    }

    fn domain(&self) -> TransportResult<libc::c_int> {
        match self {
            SocketType::Unix { .. } => Ok(libc::AF_UNIX),
            SocketType::Vsock { .. } => vsock::domain(),
        }
    }

    /// Prepare the address for `bind`. Local-domain sockets unlink a stale
    /// socket file and create the parent directory.
    pub fn before_bind(&self, _fd: RawFd) -> TransportResult<()> {
        match self {
            SocketType::Unix { path } => unix::before_bind(path),
            SocketType::Vsock { .. } => Ok(()),
        }
    }

    /// Family hook run right before `listen`. No family needs one today.
    pub fn before_listen(&self, _fd: RawFd) -> TransportResult<()> {
        Ok(())
    }

    /// Build the native socket address and hand it to `f`.
    ///
    /// The address lives on the stack for the duration of the closure only.
    pub fn with_sock_addr<R>(
        &self,
        f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
    ) -> TransportResult<R> {
        match self {
            SocketType::Unix { path } => unix::with_sock_addr(path, f),
            SocketType::Vsock { cid, port } => vsock::with_sock_addr(*cid, *port, f),
        }
    }

    /// Decode the peer address filled in by `accept`.
    fn from_peer(&self, storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Self {
        match self {
            SocketType::Unix { .. } => unix::from_peer(storage, len),
            SocketType::Vsock { .. } => vsock::from_peer(storage).unwrap_or_else(|| self.clone()),
        }
    }

    /// Get the URI representation of this address.
    pub fn to_uri(&self) -> String {
        match self {
            SocketType::Unix { path } => format!("unix://{}", path.display()),
            SocketType::Vsock { cid, port } => format!("vsock://{}:{}", cid, port),
        }
    }

    /// Parse an address from a URI string.
    ///
    /// `vsock://<port>` without a cid means "any cid", which is what a
    /// listener inside the guest wants.
    pub fn from_uri(uri: &str) -> Result<Self, String> {
        if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(format!("invalid unix URI '{}': missing path", uri));
            }
            Ok(Self::unix(path))
        } else if let Some(rest) = uri.strip_prefix("vsock://") {
            let (cid, port) = match rest.split_once(':') {
                Some((cid, port)) => (
                    cid.parse::<u32>()
                        .map_err(|e| format!("invalid vsock cid in '{}': {}", uri, e))?,
                    port,
                ),
                None => (CID_ANY, rest),
            };
            let port = port
                .parse::<u32>()
                .map_err(|e| format!("invalid vsock port in '{}': {}", uri, e))?;
            Ok(Self::vsock(cid, port))
        } else {
            Err(format!(
                "invalid socket URI '{}': expected unix:// or vsock://",
                uri
            ))
        }
    }
}

impl std::fmt::Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

impl std::str::FromStr for SocketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s)
    }
}

/// A stream socket of one [`SocketType`] family.
///
/// The descriptor is closed exactly once, when the socket is dropped.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
    ty: SocketType,
    shut: AtomicBool,
}

impl Socket {
    /// Allocate a descriptor for `ty`'s family.
    pub fn open(ty: SocketType) -> TransportResult<Self> {
        let domain = ty.domain()?;
        let fd = sys::socket(domain).map_err(|e| TransportError::from_io("socket", e))?;
        Ok(Self {
            fd,
            ty,
            shut: AtomicBool::new(false),
        })
    }

    /// Open and bind a listener in one go.
    pub fn listen_on(ty: SocketType, backlog: i32) -> TransportResult<Self> {
        let socket = Self::open(ty)?;
        socket.bind()?;
        socket.listen(backlog)?;
        Ok(socket)
    }

    /// Open a socket and connect it to `ty`.
    pub fn connect_to(ty: SocketType) -> TransportResult<Self> {
        let socket = Self::open(ty)?;
        socket.connect()?;
        Ok(socket)
    }

    /// The address this socket was opened for.
    pub fn socket_type(&self) -> &SocketType {
        &self.ty
    }

    /// Duplicate the descriptor. Both handles refer to the same socket, so
    /// shutting one down disconnects the other.
    pub fn try_clone(&self) -> TransportResult<Self> {
        let fd = self
            .fd
            .try_clone()
            .map_err(|e| TransportError::from_io("dup", e))?;
        Ok(Self {
            fd,
            ty: self.ty.clone(),
            shut: AtomicBool::new(false),
        })
    }

    pub fn bind(&self) -> TransportResult<()> {
        self.ty.before_bind(self.as_raw_fd())?;
        let rc = self
            .ty
            .with_sock_addr(|addr, len| unsafe { libc::bind(self.as_raw_fd(), addr, len) })?;
        check(rc, "bind")
    }

    pub fn listen(&self, backlog: i32) -> TransportResult<()> {
        self.ty.before_listen(self.as_raw_fd())?;
        let rc = unsafe { libc::listen(self.as_raw_fd(), backlog) };
        check(rc, "listen")
    }

    pub fn connect(&self) -> TransportResult<()> {
        let rc = self
            .ty
            .with_sock_addr(|addr, len| unsafe { libc::connect(self.as_raw_fd(), addr, len) })?;
        check(rc, "connect")
    }

    /// Block until a peer connects.
    ///
    /// Returns the connection (same family as the listener) and the peer's
    /// address. Fails with `ConnectionClosed` once [`Socket::shutdown`] has
    /// been called on the listener.
    pub fn accept(&self) -> TransportResult<(Socket, SocketType)> {
        loop {
            // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let result = sys::accept(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            );
            match result {
                Ok(fd) => {
                    let peer = self.ty.from_peer(&storage, len);
                    let socket = Socket {
                        fd,
                        ty: self.ty.clone(),
                        shut: AtomicBool::new(false),
                    };
                    return Ok((socket, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if self.shut.load(Ordering::Acquire) => {
                    return Err(TransportError::ConnectionClosed(format!("accept: {}", e)));
                }
                Err(e) => return Err(TransportError::from_io("accept", e)),
            }
        }
    }

    /// Shut both directions down. Unblocks a thread parked in `accept`.
    pub fn shutdown(&self) -> TransportResult<()> {
        self.shut.store(true, Ordering::Release);
        let rc = unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR) };
        match check(rc, "shutdown") {
            // Already-disconnected sockets report ENOTCONN; that is the goal.
            Err(TransportError::ConnectionClosed(_)) => Ok(()),
            other => other,
        }
    }

    /// Convert a connected socket into an async stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_stream(self) -> TransportResult<SocketStream> {
        SocketStream::new(self)
    }

    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                sys::SEND_FLAGS,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        if unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_WR) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn check(rc: libc::c_int, op: &'static str) -> TransportResult<()> {
    if rc < 0 {
        Err(TransportError::from_io(op, io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

mod sys {
    use super::*;

    #[cfg(target_os = "linux")]
    pub const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    pub const SEND_FLAGS: libc::c_int = 0;

    #[cfg(target_os = "linux")]
    pub fn socket(domain: libc::c_int) -> io::Result<OwnedFd> {
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn socket(domain: libc::c_int) -> io::Result<OwnedFd> {
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(fd.as_raw_fd())?;
        set_nosigpipe(fd.as_raw_fd())?;
        Ok(fd)
    }

    #[cfg(target_os = "linux")]
    pub fn accept(
        fd: RawFd,
        addr: *mut libc::sockaddr,
        len: &mut libc::socklen_t,
    ) -> io::Result<OwnedFd> {
        let conn = unsafe { libc::accept4(fd, addr, len, libc::SOCK_CLOEXEC) };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: conn was just returned by accept4(2).
        Ok(unsafe { OwnedFd::from_raw_fd(conn) })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn accept(
        fd: RawFd,
        addr: *mut libc::sockaddr,
        len: &mut libc::socklen_t,
    ) -> io::Result<OwnedFd> {
        let conn = unsafe { libc::accept(fd, addr, len) };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: conn was just returned by accept(2).
        let conn = unsafe { OwnedFd::from_raw_fd(conn) };
        set_cloexec(conn.as_raw_fd())?;
        set_nosigpipe(conn.as_raw_fd())?;
        Ok(conn)
    }

    #[cfg(not(target_os = "linux"))]
    fn set_cloexec(fd: RawFd) -> io::Result<()> {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_uri_roundtrip() {
        let unix = SocketType::unix("/run/capsule/agent.sock");
        assert_eq!(unix.to_uri(), "unix:///run/capsule/agent.sock");
        assert_eq!(unix.to_uri().parse::<SocketType>().unwrap(), unix);

        let vsock = SocketType::vsock(3, 2695);
        assert_eq!(vsock.to_string(), "vsock://3:2695");
        assert_eq!("vsock://3:2695".parse::<SocketType>().unwrap(), vsock);
    }

    #[test]
    fn test_vsock_uri_without_cid_listens_on_any() {
        let ty: SocketType = "vsock://2695".parse().unwrap();
        assert_eq!(ty, SocketType::vsock(CID_ANY, 2695));
    }

    #[test]
    fn test_invalid_uris_rejected() {
        assert!("tcp://127.0.0.1:80".parse::<SocketType>().is_err());
        assert!("unix://".parse::<SocketType>().is_err());
        assert!("vsock://x:1".parse::<SocketType>().is_err());
        assert!("vsock://3:port".parse::<SocketType>().is_err());
    }

    #[test]
    fn test_unix_listen_accept_connect() {
        let dir = tempfile::tempdir().unwrap();
        let ty = SocketType::unix(dir.path().join("nested").join("s.sock"));

        let listener = Socket::listen_on(ty.clone(), 8).unwrap();
        let client = Socket::connect_to(ty.clone()).unwrap();
        let (server, _peer) = listener.accept().unwrap();

        assert_eq!(server.socket_type(), &ty);
        assert_eq!(client.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(server.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_shutdown_through_clone_disconnects_peer() {
        let dir = tempfile::tempdir().unwrap();
        let ty = SocketType::unix(dir.path().join("s.sock"));

        let listener = Socket::listen_on(ty.clone(), 1).unwrap();
        let client = Socket::connect_to(ty).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.try_clone().unwrap().shutdown().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(server.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_rebind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let ty = SocketType::unix(dir.path().join("s.sock"));

        let first = Socket::listen_on(ty.clone(), 1).unwrap();
        drop(first);
        // The path still exists; before_bind must clear it.
        Socket::listen_on(ty, 1).unwrap();
    }

    #[test]
    fn test_bind_refuses_to_clobber_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();

        let err = Socket::listen_on(SocketType::unix(&path), 1).unwrap_err();
        assert!(matches!(err, TransportError::AddressInUse(_)));
        assert!(path.exists());
    }

    #[test]
    fn test_connect_without_listener_is_connection_closed() {
        let dir = tempfile::tempdir().unwrap();
        let err = Socket::connect_to(SocketType::unix(dir.path().join("missing.sock"))).unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[test]
    fn test_shutdown_unblocks_accept() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Arc::new(Socket::listen_on(SocketType::unix(dir.path().join("s.sock")), 1).unwrap());

        let acceptor = {
            let listener = Arc::clone(&listener);
            std::thread::spawn(move || listener.accept().map(|_| ()))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        listener.shutdown().unwrap();

        let result = acceptor.join().unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed(_))));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_vsock_unsupported_off_linux() {
        let err = Socket::open(SocketType::vsock(3, 1024)).unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedFamily(_)));
    }
}
