//! Frame codec for streaming RPCs.
//!
//! Each message is a JSON document behind a 4-byte big-endian length prefix:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! [`FrameChannel`] drives a transport with this framing: the bridge side
//! encodes a `LogsRequest` and decodes `StreamResult`s, the handler side does
//! the reverse. Decode failures are terminal; the codec never retries.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use super::types::{LogsRequest, StreamResult};
use crate::pipe;

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Coarse classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The transport was closed or reached end-of-stream.
    Closed,
    /// The peer reset or broke the connection.
    Reset,
    /// Anything else: malformed frames, unexpected I/O faults.
    Other,
}

/// Errors from encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport closed")]
    Closed,

    #[error("connection reset by peer: {0}")]
    Reset(io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Io(io::Error),
}

impl FrameError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            FrameError::Closed => TransportErrorKind::Closed,
            FrameError::Reset(_) => TransportErrorKind::Reset,
            FrameError::Encode(_) | FrameError::Decode(_) | FrameError::Io(_) => {
                TransportErrorKind::Other
            }
        }
    }

    /// Whether this failure means the peer has gone away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind(),
            TransportErrorKind::Closed | TransportErrorKind::Reset
        )
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        if pipe::is_pipe_closed(&err) {
            return FrameError::Closed;
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::Closed,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => FrameError::Reset(err),
            _ => FrameError::Io(err),
        }
    }
}

/// Length-delimited JSON codec decoding `In` and encoding `Out`.
pub struct JsonFrameCodec<In, Out> {
    framing: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> JsonFrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_MESSAGE_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for JsonFrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for JsonFrameCodec<In, Out> {
    type Item = In;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, FrameError> {
        match self.framing.decode(src)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(FrameError::Decode),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonFrameCodec<In, Out> {
    type Error = FrameError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&item).map_err(FrameError::Encode)?;
        self.framing.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

/// A transport framed with [`JsonFrameCodec`].
pub struct FrameChannel<T, In, Out> {
    framed: Framed<T, JsonFrameCodec<In, Out>>,
}

/// Bridge side: sends the request, receives results.
pub type ResultChannel<T> = FrameChannel<T, StreamResult, LogsRequest>;

/// Handler side: receives the request, sends results.
pub type RequestChannel<T> = FrameChannel<T, LogsRequest, StreamResult>;

impl<T, In, Out> FrameChannel<T, In, Out>
where
    T: AsyncRead + AsyncWrite + Unpin,
    In: DeserializeOwned,
    Out: Serialize,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, JsonFrameCodec::new()),
        }
    }

    /// Write one message and flush it to the transport.
    pub async fn encode(&mut self, item: Out) -> Result<(), FrameError> {
        self.framed.send(item).await
    }

    /// Block until the next complete message arrives.
    ///
    /// A clean end-of-stream is reported as [`FrameError::Closed`].
    pub async fn decode(&mut self) -> Result<In, FrameError> {
        match self.framed.next().await {
            Some(item) => item,
            None => Err(FrameError::Closed),
        }
    }

    pub fn get_ref(&self) -> &T {
        self.framed.get_ref()
    }

    /// The underlying transport, for writing outside the framing.
    pub fn get_mut(&mut self) -> &mut T {
        self.framed.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.framed.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::rpc::types::{LogType, StreamResult};

    #[tokio::test]
    async fn test_request_and_results_cross_the_pipe() {
        let (local, remote) = pipe::open(1024);
        let mut bridge: ResultChannel<_> = FrameChannel::new(local);
        let mut handler: RequestChannel<_> = FrameChannel::new(remote);

        let req = LogsRequest::new("alloc-1", "web", LogType::Stderr);
        bridge.encode(req.clone()).await.unwrap();
        assert_eq!(handler.decode().await.unwrap(), req);

        handler
            .encode(StreamResult::payload(b"hello".to_vec()))
            .await
            .unwrap();
        handler
            .encode(StreamResult::failure(404, "gone"))
            .await
            .unwrap();

        assert_eq!(bridge.decode().await.unwrap().payload, b"hello");
        let last = bridge.decode().await.unwrap();
        assert_eq!(last.error.unwrap().code, Some(404));
    }

    #[tokio::test]
    async fn test_decode_after_peer_drop_is_closed() {
        let (local, remote) = pipe::open(1024);
        let mut bridge: ResultChannel<_> = FrameChannel::new(local);
        drop(remote);

        let err = bridge.decode().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_decode_after_close_is_closed() {
        let (local, _remote) = pipe::open(1024);
        local.close();
        let mut bridge: ResultChannel<_> = FrameChannel::new(local);

        let err = bridge.decode().await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[tokio::test]
    async fn test_encode_after_close_is_closed() {
        let (local, _remote) = pipe::open(1024);
        let closer = local.closer();
        let mut bridge: ResultChannel<_> = FrameChannel::new(local);
        closer.close();

        let err = bridge
            .encode(LogsRequest::new("a", "t", LogType::Stdout))
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_garbage_payload_is_decode_error() {
        let (local, mut remote) = pipe::open(1024);
        let mut bridge: ResultChannel<_> = FrameChannel::new(local);

        remote.write_all(&[0, 0, 0, 3]).await.unwrap();
        remote.write_all(b"{{{").await.unwrap();

        let err = bridge.decode().await.unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
        assert_eq!(err.kind(), TransportErrorKind::Other);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_not_clean_close() {
        let (local, mut remote) = pipe::open(1024);
        let mut bridge: ResultChannel<_> = FrameChannel::new(local);

        remote.write_all(&[0, 0, 0, 10, b'{']).await.unwrap();
        drop(remote);

        let err = bridge.decode().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Other);
    }

    #[test]
    fn test_io_error_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(FrameError::from(reset).kind(), TransportErrorKind::Reset);

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(FrameError::from(eof).kind(), TransportErrorKind::Closed);

        let other = io::Error::other("disk on fire");
        assert_eq!(FrameError::from(other).kind(), TransportErrorKind::Other);
    }
}
