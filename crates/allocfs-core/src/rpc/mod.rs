//! Streaming RPC plumbing: handler trait, registry, wire types, and codec.
//!
//! A streaming handler is handed a bidirectional byte transport and owns it
//! for the lifetime of the call. It does not know whether the transport is a
//! socket or the in-process [`pipe`](crate::pipe) used by the HTTP bridge.
//!
//! ```text
//! ┌────────────┐   LogsRequest    ┌──────────────────┐
//! │ LogBridge  │────────────────▶│ StreamingHandler │
//! │ (HTTP)     │◀────────────────│ "FileSystem.Logs"│
//! └────────────┘  StreamResult*   └──────────────────┘
//! ```

pub mod codec;
pub mod types;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::BoxFuture;
use crate::error::CodedError;

pub use codec::{FrameChannel, FrameError, RequestChannel, ResultChannel, TransportErrorKind};
pub use types::{LogType, LogsRequest, Origin, StreamError, StreamResult};

/// Name under which the log streaming handler is registered.
pub const LOGS_HANDLER: &str = "FileSystem.Logs";

/// A byte transport a streaming handler can drive.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Owned, type-erased transport.
pub type BoxTransport = Box<dyn Transport>;

/// A handler for one streaming RPC method.
///
/// The returned future runs for the whole life of the stream. It is expected
/// to return on its own once the transport reports it has been closed.
pub trait StreamingHandler: Send + Sync {
    fn handle(&self, conn: BoxTransport) -> BoxFuture<'_, ()>;
}

impl<F, Fut> StreamingHandler for F
where
    F: Fn(BoxTransport) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, conn: BoxTransport) -> BoxFuture<'_, ()> {
        Box::pin(self(conn))
    }
}

/// Errors from handler lookup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown streaming rpc handler: {0}")]
    UnknownHandler(String),
}

impl From<RegistryError> for CodedError {
    fn from(err: RegistryError) -> Self {
        CodedError::new(500, err.to_string())
    }
}

/// Registry of streaming RPC handlers by method name.
pub struct StreamingRpc {
    handlers: HashMap<String, Arc<dyn StreamingHandler>>,
}

impl StreamingRpc {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StreamingHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Look up the handler for a method.
    pub fn streaming_handler(&self, name: &str) -> Result<Arc<dyn StreamingHandler>, RegistryError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHandler(name.to_string()))
    }

    /// List all registered method names.
    pub fn methods(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for StreamingRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pipe;

    #[test]
    fn test_unknown_handler() {
        let rpc = StreamingRpc::new();
        let err = rpc.streaming_handler(LOGS_HANDLER).err().unwrap();
        assert_eq!(
            err.to_string(),
            "unknown streaming rpc handler: FileSystem.Logs"
        );
        assert_eq!(CodedError::from(err).code(), 500);
    }

    #[tokio::test]
    async fn test_closure_handler_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut rpc = StreamingRpc::new();
        rpc.register(
            LOGS_HANDLER,
            Arc::new(move |_conn: BoxTransport| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            }),
        );
        assert_eq!(rpc.methods(), vec![LOGS_HANDLER]);

        let handler = rpc.streaming_handler(LOGS_HANDLER).unwrap();
        let (_local, remote) = pipe::open(16);
        handler.handle(Box::new(remote)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
