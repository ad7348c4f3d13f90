//! Streaming response bodies.
//!
//! [`BodyWriter`] is the `AsyncWrite` the log bridge writes into. Each write
//! becomes one chunk on a bounded channel; the receiving half is turned into
//! the response body by [`streaming_body`]. An `Err` item aborts the body.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use axum::body::Body;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::error::CodedError;

/// One item of a streaming body.
pub type BodyChunk = Result<Bytes, CodedError>;

/// Writes chunks into a streaming response body.
pub struct BodyWriter {
    tx: PollSender<BodyChunk>,
}

impl BodyWriter {
    pub fn new(tx: mpsc::Sender<BodyChunk>) -> Self {
        Self {
            tx: PollSender::new(tx),
        }
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "http client went away")
}

impl AsyncWrite for BodyWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.tx.poll_reserve(cx)).map_err(|_| client_gone())?;
        this.tx
            .send_item(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| client_gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Chunks are handed over on write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx.close();
        Poll::Ready(Ok(()))
    }
}

/// A body yielding `first` (if any) followed by everything left in `rx`.
pub fn streaming_body(first: Option<Bytes>, rx: mpsc::Receiver<BodyChunk>) -> Body {
    let rest = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let head = stream::iter(first.map(Ok));
    Body::from_stream(head.chain(rest))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_writes_become_chunks() {
        let (tx, rx) = mpsc::channel(4);
        let mut writer = BodyWriter::new(tx);
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        drop(writer);

        let body = streaming_body(Some(Bytes::from_static(b">> ")), rx);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b">> hello world");
    }

    #[tokio::test]
    async fn test_write_after_receiver_dropped_is_broken_pipe() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut writer = BodyWriter::new(tx);
        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_error_chunk_aborts_body() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
        tx.send(Err(CodedError::new(500, "boom"))).await.unwrap();
        drop(tx);

        let body = streaming_body(None, rx);
        assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
    }
}
