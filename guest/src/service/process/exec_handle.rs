//! Process stdio plumbing.
//!
//! Pipes (or a PTY) are allocated when a process is created so that the host
//! can attach to its output before the process starts. The parent ends are
//! registered with the tokio reactor; the child ends are handed to the
//! executor at spawn time.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use capsule_shared::TerminalSize;
use futures::stream::Stream;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::Winsize;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::GuestResult;

/// Process exit status
///
/// Either normal exit with code or termination by signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process exited normally with exit code
    Code(i32),

    /// Process was terminated by signal
    Signal(i32),
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(signal)) => ExitStatus::Signal(signal),
            (None, None) => ExitStatus::Code(255),
        }
    }
}

impl From<ExitStatus> for capsule_shared::WaitResponse {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Code(exit_code) => Self {
                exit_code,
                signal: 0,
            },
            ExitStatus::Signal(signal) => Self {
                exit_code: 0,
                signal,
            },
        }
    }
}

/// Non-blocking reader over a pipe or PTY controller.
pub struct FdReader {
    inner: AsyncFd<OwnedFd>,
}

impl FdReader {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }
}

impl AsyncRead for FdReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| read_fd(inner.get_ref(), unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                // A PTY controller reports EIO once the last slave closes.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Poll::Ready(Ok(())),
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Non-blocking writer over a pipe or PTY controller.
pub struct FdWriter {
    inner: AsyncFd<OwnedFd>,
}

impl FdWriter {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }
}

impl AsyncWrite for FdWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| write_fd(inner.get_ref(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Read chunks as they arrive until EOF (works for both PTY and pipes).
pub fn output_stream(
    mut reader: FdReader,
    chunk_size: usize,
) -> Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>> {
    use async_stream::stream;
    use tokio::io::AsyncReadExt;

    Box::pin(stream! {
        let mut buf = vec![0u8; chunk_size];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(buf[..n].to_vec()),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

/// Parent side of a process's stdio.
///
/// Each end is taken exactly once: stdin by `SendInput`, the output readers
/// by `Attach` (or by the drain at start when nobody attached).
pub struct ExecStdio {
    pub stdin: Option<FdWriter>,
    pub stdout: Option<FdReader>,
    pub stderr: Option<FdReader>,
    /// PTY controller, kept for resize.
    pub pty: Option<OwnedFd>,
}

/// Child side of a process's stdio. `None` stdin means `/dev/null`.
#[derive(Debug)]
pub struct ChildStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    pub terminal: bool,
}

impl ChildStdio {
    /// Duplicate the descriptors for one spawn attempt, so a failed spawn
    /// leaves the originals usable for a retry.
    pub fn try_clone(&self) -> io::Result<ChildStdio> {
        Ok(ChildStdio {
            stdin: self.stdin.as_ref().map(|fd| fd.try_clone()).transpose()?,
            stdout: self.stdout.try_clone()?,
            stderr: self.stderr.try_clone()?,
            terminal: self.terminal,
        })
    }
}

/// Allocate pipes, or a PTY when `terminal` is set.
///
/// With a PTY, stdout and stderr are the same stream and only `stdout` is
/// returned on the parent side.
pub fn allocate(stdin: bool, terminal: Option<&TerminalSize>) -> GuestResult<(ExecStdio, ChildStdio)> {
    match terminal {
        Some(size) => allocate_pty(stdin, size),
        None => allocate_pipes(stdin),
    }
}

fn allocate_pipes(stdin: bool) -> GuestResult<(ExecStdio, ChildStdio)> {
    let (stdin_parent, stdin_child) = if stdin {
        let (read, write) = pipe()?;
        (Some(FdWriter::new(write)?), Some(read))
    } else {
        (None, None)
    };
    let (stdout_read, stdout_write) = pipe()?;
    let (stderr_read, stderr_write) = pipe()?;

    Ok((
        ExecStdio {
            stdin: stdin_parent,
            stdout: Some(FdReader::new(stdout_read)?),
            stderr: Some(FdReader::new(stderr_read)?),
            pty: None,
        },
        ChildStdio {
            stdin: stdin_child,
            stdout: stdout_write,
            stderr: stderr_write,
            terminal: false,
        },
    ))
}

fn allocate_pty(stdin: bool, size: &TerminalSize) -> GuestResult<(ExecStdio, ChildStdio)> {
    let winsize = winsize(size);
    let pty = nix::pty::openpty(Some(&winsize), None::<&nix::sys::termios::Termios>)?;
    set_cloexec(&pty.master)?;
    set_cloexec(&pty.slave)?;

    let stdin_parent = if stdin {
        Some(FdWriter::new(pty.master.try_clone()?)?)
    } else {
        None
    };
    let reader = FdReader::new(pty.master.try_clone()?)?;

    Ok((
        ExecStdio {
            stdin: stdin_parent,
            stdout: Some(reader),
            stderr: None,
            pty: Some(pty.master),
        },
        ChildStdio {
            stdin: Some(pty.slave.try_clone()?),
            stdout: pty.slave.try_clone()?,
            stderr: pty.slave,
            terminal: true,
        },
    ))
}

/// Apply a new window size to a PTY controller.
pub fn resize(controller: &OwnedFd, size: &TerminalSize) -> io::Result<()> {
    let winsize = winsize(size);
    // SAFETY: TIOCSWINSZ reads a Winsize from the pointer.
    let rc = unsafe { libc::ioctl(controller.as_raw_fd(), libc::TIOCSWINSZ, &winsize as *const Winsize) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn winsize(size: &TerminalSize) -> Winsize {
    Winsize {
        ws_row: size.rows.min(u16::MAX as u32) as u16,
        ws_col: size.cols.min(u16::MAX as u32) as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn pipe() -> GuestResult<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

fn set_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn read_fd(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd.as_fd().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd.as_fd().as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}
