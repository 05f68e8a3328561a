//! Process spawning.
//!
//! Builds a `tokio::process::Command` from a create request: argv, a
//! cleared environment with the resolved entries, working directory, stdio,
//! and a pre-exec hook that enters the rootfs and switches identity.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use capsule_shared::constants::container::DEFAULT_CWD;
use capsule_shared::{CreateProcessRequest, UserSpec};
use tokio::process::{Child, Command};

use super::exec_handle::ChildStdio;
use crate::error::{GuestError, GuestResult};

/// Everything needed to spawn a created process.
#[derive(Debug)]
pub struct PendingSpawn {
    pub request: CreateProcessRequest,
    pub rootfs: PathBuf,
    /// Set when the process gets a UTS namespace of its own.
    pub hostname: Option<String>,
    pub stdio: ChildStdio,
}

/// Identity switch applied in the child. Computed before fork so the hook
/// itself never allocates.
#[derive(Debug, Clone)]
struct Identity {
    uid: libc::uid_t,
    gid: libc::gid_t,
    groups: Vec<libc::gid_t>,
}

impl Identity {
    /// `None` when the process should keep the agent's identity.
    fn from_spec(user: Option<&UserSpec>) -> Option<Self> {
        let user = user?;
        let current_uid = unsafe { libc::geteuid() };
        let current_gid = unsafe { libc::getegid() };
        if user.uid == current_uid && user.gid == current_gid && user.additional_gids.is_empty() {
            return None;
        }
        Some(Self {
            uid: user.uid,
            gid: user.gid,
            groups: user.additional_gids.clone(),
        })
    }
}

/// Spawn the process described by `pending`.
///
/// The child-side descriptors are duplicated, so `pending` stays intact if
/// the spawn fails.
pub fn spawn(pending: &PendingSpawn) -> GuestResult<Child> {
    let req = &pending.request;
    let (program, args) = req
        .args
        .split_first()
        .ok_or_else(|| GuestError::InvalidArgument("args must not be empty".to_string()))?;

    let cwd = if req.cwd.is_empty() {
        DEFAULT_CWD
    } else {
        req.cwd.as_str()
    };
    let chroot = chroot_target(&pending.rootfs)?;
    let identity = Identity::from_spec(req.user.as_ref());
    let stdio = pending.stdio.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args).env_clear();
    for entry in &req.env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                cmd.env(key, value);
            }
            _ => {
                tracing::warn!(entry = %entry, "Skipping malformed environment entry");
            }
        }
    }

    // Inside a chroot the working directory is entered by the hook instead.
    let cwd_in_root = CString::new(cwd)
        .map_err(|_| GuestError::InvalidArgument(format!("cwd contains NUL: {:?}", cwd)))?;
    if chroot.is_none() {
        cmd.current_dir(cwd);
    }

    cmd.stdin(match stdio.stdin {
        Some(fd) => Stdio::from(fd),
        None => Stdio::null(),
    });
    cmd.stdout(Stdio::from(stdio.stdout));
    cmd.stderr(Stdio::from(stdio.stderr));
    cmd.kill_on_drop(false);

    let hooks = ChildSetup {
        hostname: pending.hostname.clone(),
        chroot,
        cwd: cwd_in_root,
        identity,
        terminal: stdio.terminal,
    };
    add_pre_exec_hook(&mut cmd, hooks);

    cmd.spawn().map_err(|source| GuestError::Spawn {
        program: program.clone(),
        source,
    })
}

/// `None` when processes run in the agent's own root.
fn chroot_target(rootfs: &Path) -> GuestResult<Option<CString>> {
    if rootfs.as_os_str().is_empty() || rootfs == Path::new("/") {
        return Ok(None);
    }
    CString::new(rootfs.as_os_str().as_bytes())
        .map(Some)
        .map_err(|_| GuestError::InvalidArgument(format!("rootfs contains NUL: {:?}", rootfs)))
}

/// What the child does to itself between fork() and exec().
struct ChildSetup {
    hostname: Option<String>,
    chroot: Option<CString>,
    cwd: CString,
    identity: Option<Identity>,
    terminal: bool,
}

/// Runs after fork() and before exec() in the child.
///
/// Only async-signal-safe syscalls: no allocation, no locks, no logging.
/// Order matters: the new session and controlling terminal first, then the
/// UTS namespace and root, then groups before gid before uid (dropping uid
/// last keeps the privilege needed for the earlier steps).
fn add_pre_exec_hook(cmd: &mut Command, setup: ChildSetup) {
    let ChildSetup {
        hostname,
        chroot,
        cwd,
        identity,
        terminal,
    } = setup;
    // SAFETY: the hook only calls async-signal-safe syscalls on data
    // prepared before fork.
    unsafe {
        cmd.pre_exec(move || {
            if terminal {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if let Some(ref name) = hostname {
                if libc::unshare(libc::CLONE_NEWUTS) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::sethostname(name.as_ptr().cast(), name.len()) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if let Some(ref root) = chroot {
                if libc::chroot(root.as_ptr()) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::chdir(cwd.as_ptr()) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if let Some(ref id) = identity {
                if libc::setgroups(id.groups.len() as _, id.groups.as_ptr()) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(id.gid) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(id.uid) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_skipped_for_current_user() {
        let spec = UserSpec {
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            additional_gids: vec![],
        };
        assert!(Identity::from_spec(Some(&spec)).is_none());
        assert!(Identity::from_spec(None).is_none());
    }

    #[test]
    fn test_identity_kept_for_other_user() {
        let spec = UserSpec {
            uid: unsafe { libc::geteuid() }.wrapping_add(1),
            gid: 1,
            additional_gids: vec![1, 2],
        };
        let id = Identity::from_spec(Some(&spec)).unwrap();
        assert_eq!(id.groups, vec![1, 2]);
    }

    #[test]
    fn test_chroot_only_for_real_rootfs() {
        assert!(chroot_target(Path::new("/")).unwrap().is_none());
        assert!(chroot_target(Path::new("")).unwrap().is_none());
        assert!(chroot_target(Path::new("/var/lib/rootfs")).unwrap().is_some());
    }
}
