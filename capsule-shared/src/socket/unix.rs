//! Local-domain family hooks.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use super::SocketType;
use crate::errors::{TransportError, TransportResult};

/// Remove a stale socket file left by a previous listener and make sure the
/// parent directory exists. Anything that is not a socket is left alone.
pub(super) fn before_bind(path: &Path) -> TransportResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).map_err(|e| TransportError::from_io("unlink", e))?;
        }
        Ok(_) => {
            return Err(TransportError::AddressInUse(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(TransportError::from_io("stat", e)),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| TransportError::from_io("mkdir", e))?;
    }
    Ok(())
}

pub(super) fn with_sock_addr<R>(
    path: &Path,
    f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
) -> TransportResult<R> {
    // SAFETY: sockaddr_un is plain old data; all-zero is valid.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the trailing NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(TransportError::Io {
            op: "sockaddr",
            message: format!(
                "socket path {} exceeds {} bytes",
                path.display(),
                addr.sun_path.len() - 1
            ),
        });
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok(f(
        &addr as *const libc::sockaddr_un as *const libc::sockaddr,
        len as libc::socklen_t,
    ))
}

/// Unnamed peers (the usual case for a connecting client) report an empty
/// path.
pub(super) fn from_peer(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> SocketType {
    // SAFETY: sockaddr_storage is large enough and suitably aligned for any
    // socket address, including sockaddr_un.
    let addr = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_un) };
    let header = std::mem::size_of::<libc::sa_family_t>();
    let len = (len as usize).saturating_sub(header).min(addr.sun_path.len());

    let raw: Vec<u8> = addr.sun_path[..len]
        .iter()
        .map(|c| *c as u8)
        .take_while(|b| *b != 0)
        .collect();
    SocketType::Unix {
        path: PathBuf::from(OsStr::from_bytes(&raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sock_addr_length_covers_path_and_nul() {
        let len = with_sock_addr(Path::new("/tmp/a.sock"), |_, len| len).unwrap();
        let expected = std::mem::size_of::<libc::sa_family_t>() + "/tmp/a.sock".len() + 1;
        assert_eq!(len as usize, expected);
    }

    #[test]
    fn test_overlong_path_rejected() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        let err = with_sock_addr(&long, |_, _| ()).unwrap_err();
        assert!(matches!(err, TransportError::Io { op: "sockaddr", .. }));
    }

    #[test]
    fn test_before_bind_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("s.sock");
        before_bind(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
