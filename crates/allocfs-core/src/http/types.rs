//! Shared request/response types for the agent HTTP API.
//!
//! Both the router and [`AgentClient`](super::client::AgentClient) use
//! these. File metadata is [`FileInfo`](crate::fs::FileInfo), returned as is.

use serde::{Deserialize, Serialize};

/// Path prefix of every filesystem endpoint.
pub const FS_PREFIX: &str = "/v1/client/fs";

/// Header carrying the caller's auth token.
pub const TOKEN_HEADER: &str = "x-allocfs-token";

/// Content type of a framed (non-plain) log stream.
pub const FRAMED_CONTENT_TYPE: &str = "application/x-ndjson";

/// Content type of a plain log stream.
pub const PLAIN_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Content type of raw file reads.
pub const FILE_CONTENT_TYPE: &str = "application/octet-stream";

/// Generic error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// The endpoints under [`FS_PREFIX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEndpoint {
    List,
    Stat,
    ReadAt,
    Cat,
    Logs,
}

impl FsEndpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            FsEndpoint::List => "ls",
            FsEndpoint::Stat => "stat",
            FsEndpoint::ReadAt => "readat",
            FsEndpoint::Cat => "cat",
            FsEndpoint::Logs => "logs",
        }
    }

    /// Split `<endpoint>/<alloc id>` as it appears after [`FS_PREFIX`].
    pub fn split(rest: &str) -> Option<(Self, &str)> {
        let (name, alloc_id) = rest.split_once('/')?;
        let endpoint = match name {
            "ls" => FsEndpoint::List,
            "stat" => FsEndpoint::Stat,
            "readat" => FsEndpoint::ReadAt,
            "cat" => FsEndpoint::Cat,
            "logs" => FsEndpoint::Logs,
            _ => return None,
        };
        Some((endpoint, alloc_id))
    }

    /// Request path for this endpoint and allocation.
    pub fn path(self, alloc_id: &str) -> String {
        format!(
            "{FS_PREFIX}/{}/{}",
            self.as_str(),
            urlencoding::encode(alloc_id)
        )
    }
}
