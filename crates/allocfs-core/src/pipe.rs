//! In-process duplex pipe standing in for a network connection.
//!
//! [`open`] returns two linked [`PipeEnd`]s: bytes written to one are read
//! from the other. Each end implements `AsyncRead + AsyncWrite`, so code
//! driving a streaming RPC cannot tell it apart from a socket.
//!
//! Closing the pipe (through either end or a detached [`PipeCloser`]) fails
//! every pending and future read or write on *both* ends with a
//! [`PipeClosed`] error. Dropping one end is an orderly half-close instead:
//! the peer can still read whatever was already buffered, then sees
//! end-of-stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Marker error carried inside the `io::Error` returned once a pipe is closed.
#[derive(Debug, thiserror::Error)]
#[error("io: read/write on closed pipe")]
pub struct PipeClosed;

/// Returns true if the I/O error was produced by a closed [`PipeEnd`].
pub fn is_pipe_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<PipeClosed>())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, PipeClosed)
}

/// Open a connected pair of pipe ends, each buffering up to `capacity` bytes
/// per direction.
pub fn open(capacity: usize) -> (PipeEnd, PipeEnd) {
    let (a, b) = tokio::io::duplex(capacity);
    let token = CancellationToken::new();
    (PipeEnd::new(a, token.clone()), PipeEnd::new(b, token))
}

/// One end of an in-process pipe.
pub struct PipeEnd {
    stream: DuplexStream,
    token: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl PipeEnd {
    fn new(stream: DuplexStream, token: CancellationToken) -> Self {
        let closed = Box::pin(token.clone().cancelled_owned());
        Self {
            stream,
            token,
            closed,
        }
    }

    /// A handle that can close this pipe from another task.
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            token: self.token.clone(),
        }
    }

    /// Close both ends of the pipe.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the pipe has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    /// Registers the waker for close notification; ready once closed.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        // The close future must not be polled again after completing.
        if self.token.is_cancelled() {
            return Poll::Ready(closed_error());
        }
        self.closed.as_mut().poll(cx).map(|()| closed_error())
    }
}

impl std::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for PipeEnd {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeEnd {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Detached handle that closes a pipe.
#[derive(Debug, Clone)]
pub struct PipeCloser {
    token: CancellationToken,
}

impl PipeCloser {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut a, mut b) = open(64);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read_on_both_ends() {
        let (mut a, mut b) = open(64);
        let closer = a.closer();

        let reader_a = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            a.read(&mut buf).await
        });
        let reader_b = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            b.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();

        let err_a = tokio::time::timeout(Duration::from_secs(1), reader_a)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        let err_b = tokio::time::timeout(Duration::from_secs(1), reader_b)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(is_pipe_closed(&err_a));
        assert!(is_pipe_closed(&err_b));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_write() {
        // Tiny buffer so the second write blocks on the unread peer.
        let (mut a, b) = open(4);
        let closer = b.closer();

        let writer = tokio::spawn(async move { a.write_all(b"more than four bytes").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();

        let err = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(is_pipe_closed(&err));
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn test_drop_is_half_close() {
        let (mut a, mut b) = open(64);

        a.write_all(b"tail").await.unwrap();
        drop(a);

        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (a, b) = open(8);
        let waiter = tokio::spawn(async move { b.closed().await });
        a.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_other_errors_are_not_pipe_closed() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "socket");
        assert!(!is_pipe_closed(&err));
    }
}
