//! HTTP client for a running agent.
//!
//! Speaks HTTP/1.1 over TCP with `hyper`, one connection per request.
//! JSON endpoints are decoded into typed responses; file and log endpoints
//! stream the response body into any `AsyncWrite`.

use std::fmt::Write as _;

use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::types::*;
use crate::fs::FileInfo;
use crate::rpc::LogsRequest;

/// Errors from the agent client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to agent at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("agent returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("response stream aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client for the agent's filesystem API.
pub struct AgentClient {
    addr: String,
    token: Option<String>,
}

impl AgentClient {
    /// Create a client for the agent listening at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: None,
        }
    }

    /// Send `token` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issue a GET and return the response once its status is known.
    ///
    /// Non-success statuses are turned into [`ClientError::Api`].
    async fn get(&self, path_and_query: &str) -> Result<Response<Incoming>, ClientError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ClientError::Connect {
                addr: self.addr.clone(),
                source: e,
            })?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(io)
            .await
            .map_err(|e| ClientError::Request(format!("HTTP handshake failed: {e}")))?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "agent connection closed with error");
            }
        });

        debug!(path = path_and_query, "agent request");

        let mut builder = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(path_and_query)
            .header(hyper::header::HOST, self.addr.as_str());
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token.as_str());
        }
        let req = builder
            .body(Empty::new())
            .map_err(|e| ClientError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClientError::Request(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();
        let message = match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(err) => err.error,
            Err(_) => String::from_utf8_lossy(&body).into_owned(),
        };
        Err(ClientError::Api { status, message })
    }

    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, ClientError> {
        let body = self
            .get(path_and_query)
            .await?
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| ClientError::Parse(e.to_string()))
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// List a directory in an allocation.
    pub async fn list(&self, alloc_id: &str, path: &str) -> Result<Vec<FileInfo>, ClientError> {
        let uri = with_query(FsEndpoint::List.path(alloc_id), &[("path", path)]);
        self.get_json(&uri).await
    }

    /// Metadata for one path in an allocation.
    pub async fn stat(&self, alloc_id: &str, path: &str) -> Result<FileInfo, ClientError> {
        let uri = with_query(FsEndpoint::Stat.path(alloc_id), &[("path", path)]);
        self.get_json(&uri).await
    }

    /// Stream a whole file into `out`.
    pub async fn cat<W>(&self, alloc_id: &str, path: &str, out: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let uri = with_query(FsEndpoint::Cat.path(alloc_id), &[("path", path)]);
        let resp = self.get(&uri).await?;
        copy_body(resp, out).await
    }

    /// Stream up to `limit` bytes of a file starting at `offset` into `out`.
    pub async fn read_at<W>(
        &self,
        alloc_id: &str,
        path: &str,
        offset: u64,
        limit: Option<u64>,
        out: &mut W,
    ) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let offset = offset.to_string();
        let limit = limit.map(|l| l.to_string());
        let mut pairs = vec![("path", path), ("offset", offset.as_str())];
        if let Some(limit) = &limit {
            pairs.push(("limit", limit.as_str()));
        }
        let uri = with_query(FsEndpoint::ReadAt.path(alloc_id), &pairs);
        let resp = self.get(&uri).await?;
        copy_body(resp, out).await
    }

    /// Stream a task log into `out` until the agent ends the stream.
    ///
    /// The request's auth token is ignored; the client's own token is sent.
    pub async fn logs<W>(&self, request: &LogsRequest, out: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let offset = request.offset.to_string();
        let pairs = [
            ("task", request.task.as_str()),
            ("type", request.log_type.as_str()),
            ("origin", request.origin.as_str()),
            ("offset", offset.as_str()),
            ("follow", bool_str(request.follow)),
            ("plain", bool_str(request.plain_text)),
        ];
        let uri = with_query(FsEndpoint::Logs.path(&request.alloc_id), &pairs);
        let resp = self.get(&uri).await?;
        copy_body(resp, out).await
    }
}

/// Copy a response body to `out`, returning the number of bytes written.
async fn copy_body<W>(resp: Response<Incoming>, out: &mut W) -> Result<u64, ClientError>
where
    W: AsyncWrite + Unpin,
{
    let mut body = resp.into_body();
    let mut written = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ClientError::Aborted(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            out.write_all(&data).await?;
            out.flush().await?;
            written += data.len() as u64;
        }
    }
    Ok(written)
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn with_query(mut path: String, pairs: &[(&str, &str)]) -> String {
    for (i, (key, value)) in pairs.iter().enumerate() {
        let sep = if i == 0 { '?' } else { '&' };
        let _ = write!(path, "{sep}{key}={}", urlencoding::encode(value));
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_encoding() {
        let uri = with_query(
            FsEndpoint::List.path("a1"),
            &[("path", "/alloc/my logs"), ("x", "a&b")],
        );
        assert_eq!(uri, "/v1/client/fs/ls/a1?path=%2Falloc%2Fmy%20logs&x=a%26b");
    }

    #[tokio::test]
    async fn test_connect_error() {
        // Port 9 (discard) on localhost is almost never listening.
        let client = AgentClient::new("127.0.0.1:9");
        let err = client.stat("a1", "/").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
