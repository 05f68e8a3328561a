//! VM socket family hooks. Only Linux has `AF_VSOCK`.

use super::SocketType;
use crate::errors::TransportResult;

/// Wildcard cid for listeners (`VMADDR_CID_ANY`).
pub const CID_ANY: u32 = u32::MAX;

/// Well-known cid of the host (`VMADDR_CID_HOST`).
pub const CID_HOST: u32 = 2;

#[cfg(target_os = "linux")]
pub(super) fn domain() -> TransportResult<libc::c_int> {
    Ok(libc::AF_VSOCK)
}

#[cfg(not(target_os = "linux"))]
pub(super) fn domain() -> TransportResult<libc::c_int> {
    Err(unsupported())
}

#[cfg(target_os = "linux")]
pub(super) fn with_sock_addr<R>(
    cid: u32,
    port: u32,
    f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
) -> TransportResult<R> {
    // SAFETY: sockaddr_vm is plain old data; all-zero is valid.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_cid = cid;
    addr.svm_port = port;
    Ok(f(
        &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
        std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
    ))
}

#[cfg(not(target_os = "linux"))]
pub(super) fn with_sock_addr<R>(
    _cid: u32,
    _port: u32,
    _f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
) -> TransportResult<R> {
    Err(unsupported())
}

#[cfg(target_os = "linux")]
pub(super) fn from_peer(storage: &libc::sockaddr_storage) -> Option<SocketType> {
    if storage.ss_family != libc::AF_VSOCK as libc::sa_family_t {
        return None;
    }
    // SAFETY: the family says this is a sockaddr_vm, and sockaddr_storage is
    // large enough and aligned for it.
    let addr = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_vm) };
    Some(SocketType::vsock(addr.svm_cid, addr.svm_port))
}

#[cfg(not(target_os = "linux"))]
pub(super) fn from_peer(_storage: &libc::sockaddr_storage) -> Option<SocketType> {
    None
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> crate::errors::TransportError {
    crate::errors::TransportError::UnsupportedFamily("vsock is only available on Linux".to_string())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_sock_addr_carries_cid_and_port() {
        let (family, len) = with_sock_addr(3, 2695, |addr, len| {
            let vm = unsafe { &*(addr as *const libc::sockaddr_vm) };
            assert_eq!(vm.svm_cid, 3);
            assert_eq!(vm.svm_port, 2695);
            (vm.svm_family, len)
        })
        .unwrap();
        assert_eq!(family, libc::AF_VSOCK as libc::sa_family_t);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_vm>());
    }
}
