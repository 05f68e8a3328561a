//! Async byte stream over a connected [`Socket`].

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Socket;
use crate::errors::{TransportError, TransportResult};

/// `AsyncRead + AsyncWrite` over any socket family, registered with the
/// tokio reactor. This is what tonic runs HTTP/2 on, on both sides.
#[derive(Debug)]
pub struct SocketStream {
    inner: AsyncFd<Socket>,
}

impl SocketStream {
    pub(super) fn new(socket: Socket) -> TransportResult<Self> {
        socket
            .set_nonblocking()
            .map_err(|e| TransportError::from_io("fcntl", e))?;
        let inner = AsyncFd::new(socket).map_err(|e| TransportError::from_io("register", e))?;
        Ok(Self { inner })
    }

    pub fn socket(&self) -> &Socket {
        self.inner.get_ref()
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().recv(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().send(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown_write())
    }
}

impl tonic::transport::server::Connected for SocketStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

#[cfg(test)]
mod tests {
    use super::super::SocketType;
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_echo_over_unix() {
        let dir = tempfile::tempdir().unwrap();
        let ty = SocketType::unix(dir.path().join("echo.sock"));
        let listener = Socket::listen_on(ty.clone(), 1).unwrap();

        let server = tokio::task::spawn_blocking(move || listener.accept().unwrap().0);
        let client = Socket::connect_to(ty).unwrap().into_stream().unwrap();
        let server = server.await.unwrap().into_stream().unwrap();

        let (mut client, mut server) = (client, server);
        client.write_all(b"hello over a socket").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello over a socket");
    }
}
