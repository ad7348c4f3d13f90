#![deny(unsafe_code)]

//! allocfs core agent runtime.
//!
//! Serves an allocation's filesystem over HTTP and streams task logs through
//! an in-process streaming RPC. The log path is the interesting one: an HTTP
//! request is bridged onto a synthetic duplex pipe whose far end is driven by
//! the `FileSystem.Logs` handler, exactly as if the handler sat across a
//! network connection.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, the return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Agent runtime: listener, handler registry, graceful shutdown.
pub mod agent;
/// HTTP-to-RPC log stream bridge.
pub mod bridge;
/// Errors carrying an HTTP status across boundaries.
pub mod error;
/// Batching and heartbeat framing for file streams.
pub mod framer;
/// Allocation directory access.
pub mod fs;
/// Agent HTTP API: router, validators, client.
pub mod http;
/// Local `FileSystem.Logs` handler.
pub mod logs;
/// In-process duplex pipe.
pub mod pipe;
/// Streaming RPC handlers, wire types and codec.
pub mod rpc;
/// Rotated log file tailing.
pub mod tail;

pub use agent::{Agent, AgentError};
pub use bridge::LogBridge;
pub use error::{CodedError, HttpCoded};
pub use fs::{AllocDirs, AllocFs, AllocFsProvider, FileInfo};
pub use http::{AgentClient, ClientError};
pub use logs::LocalLogs;
pub use rpc::{LogType, LogsRequest, Origin, StreamingHandler, StreamingRpc};
