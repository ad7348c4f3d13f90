//! HTTP router for the allocation filesystem API.
//!
//! Every endpoint lives under [`FS_PREFIX`] and is dispatched on its first
//! path segment: `ls`, `stat`, `readat`, `cat` or `logs`, followed by the
//! allocation id. Anything else is a 404 `Invalid method`.
//!
//! Parameters are fully validated before any filesystem access or stream is
//! opened. The `logs` endpoint hands the validated request to a
//! [`LogBridge`] and streams its output as a chunked body.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use allocfs_config::StreamConfig;

use super::body::{BodyChunk, BodyWriter, streaming_body};
use super::params::{self, QueryParams, ReadAtParams};
use super::types::*;
use crate::bridge::LogBridge;
use crate::error::CodedError;
use crate::fs::{AllocFsProvider, BoxReader, FsError};
use crate::rpc::{LOGS_HANDLER, StreamingRpc};

/// Chunks buffered between the log bridge and the response body.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Shared state accessible to all route handlers.
pub struct HttpState {
    pub allocs: Arc<dyn AllocFsProvider>,
    pub rpc: Arc<StreamingRpc>,
    pub stream: StreamConfig,
    /// Cancelled on shutdown; every log stream runs in a child of it.
    pub shutdown: CancellationToken,
}

/// Build the axum router with all filesystem routes.
pub fn router(state: Arc<HttpState>) -> axum::Router {
    axum::Router::new()
        .route(&format!("{FS_PREFIX}/{{*rest}}"), get(handle_fs))
        .fallback(handle_invalid_method)
        .with_state(state)
}

/// The caller's token from `X-Allocfs-Token` or `Authorization: Bearer`.
pub fn auth_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(token);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn invalid_method() -> CodedError {
    CodedError::new(404, "Invalid method")
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_invalid_method() -> Response {
    invalid_method().into_response()
}

async fn handle_fs(
    State(state): State<Arc<HttpState>>,
    Path(rest): Path<String>,
    Query(query): Query<QueryParams>,
    headers: HeaderMap,
) -> Response {
    let Some((endpoint, alloc)) = FsEndpoint::split(&rest) else {
        return invalid_method().into_response();
    };
    debug!(endpoint = endpoint.as_str(), alloc_id = alloc, "fs request");

    let result = match endpoint {
        FsEndpoint::List => list(&state, alloc, &query).await,
        FsEndpoint::Stat => stat(&state, alloc, &query).await,
        FsEndpoint::ReadAt => read_at(&state, alloc, &query).await,
        FsEndpoint::Cat => cat(&state, alloc, &query).await,
        FsEndpoint::Logs => return logs(&state, alloc, &query, auth_token(&headers)).await,
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn list(state: &HttpState, alloc: &str, query: &QueryParams) -> Result<Response, CodedError> {
    let alloc_id = params::alloc_id(alloc)?;
    let path = params::list_path(query);
    let fs = state.allocs.get_alloc_fs(&alloc_id)?;
    let entries = fs.list(&path).await?;
    Ok(Json(entries).into_response())
}

async fn stat(state: &HttpState, alloc: &str, query: &QueryParams) -> Result<Response, CodedError> {
    let alloc_id = params::alloc_id(alloc)?;
    let path = params::file_path(query)?;
    let fs = state.allocs.get_alloc_fs(&alloc_id)?;
    let info = fs.stat(&path).await?;
    Ok(Json(info).into_response())
}

async fn read_at(
    state: &HttpState,
    alloc: &str,
    query: &QueryParams,
) -> Result<Response, CodedError> {
    let alloc_id = params::alloc_id(alloc)?;
    let req = ReadAtParams::parse(query)?;
    let fs = state.allocs.get_alloc_fs(&alloc_id)?;
    let reader = fs.read_at(&req.path, req.offset).await?;
    let reader: BoxReader = match req.limit {
        Some(limit) => Box::new(reader.take(limit)),
        None => reader,
    };
    Ok(file_response(reader))
}

async fn cat(state: &HttpState, alloc: &str, query: &QueryParams) -> Result<Response, CodedError> {
    let alloc_id = params::alloc_id(alloc)?;
    let path = params::file_path(query)?;
    let fs = state.allocs.get_alloc_fs(&alloc_id)?;
    if fs.stat(&path).await?.is_dir {
        return Err(FsError::IsDirectory(path).into());
    }
    let reader = fs.read_at(&path, 0).await?;
    Ok(file_response(reader))
}

fn file_response(reader: BoxReader) -> Response {
    (
        [(CONTENT_TYPE, FILE_CONTENT_TYPE)],
        axum::body::Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}

async fn logs(
    state: &HttpState,
    alloc: &str,
    query: &QueryParams,
    token: Option<&str>,
) -> Response {
    let request = match params::logs_request(alloc, query, token) {
        Ok(request) => request,
        Err(e) => return CodedError::from(e).into_response(),
    };
    let handler = match state.rpc.streaming_handler(LOGS_HANDLER) {
        Ok(handler) => handler,
        Err(e) => return CodedError::from(e).into_response(),
    };
    info!(
        alloc_id = %request.alloc_id,
        task = %request.task,
        log_type = %request.log_type,
        follow = request.follow,
        "log stream requested"
    );

    let content_type = if request.plain_text {
        PLAIN_CONTENT_TYPE
    } else {
        FRAMED_CONTENT_TYPE
    };
    let bridge = LogBridge::new(handler, &state.stream);
    let scope = state.shutdown.child_token();
    let (tx, mut rx) = mpsc::channel::<BodyChunk>(BODY_CHANNEL_CAPACITY);

    // The response body owns `rx`; once hyper drops it the client is gone.
    tokio::spawn({
        let tx = tx.clone();
        let scope = scope.clone();
        async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("log stream client went away");
                    scope.cancel();
                }
                _ = scope.cancelled() => {}
            }
        }
    });

    tokio::spawn({
        let writer = BodyWriter::new(tx.clone());
        async move {
            if let Err(err) = bridge.stream(request, writer, &scope).await
                && tx.send(Err(err)).await.is_err()
            {
                debug!("log stream error dropped, client already gone");
            }
            scope.cancel();
        }
    });

    // Hold the status line until the first chunk or the commit timeout, so an
    // error reported before any data still becomes the response status.
    match tokio::time::timeout(state.stream.commit_timeout(), rx.recv()).await {
        Ok(Some(Err(err))) => err.into_response(),
        Ok(Some(Ok(first))) => stream_response(content_type, Some(first), rx),
        Ok(None) | Err(_) => stream_response(content_type, None, rx),
    }
}

fn stream_response(
    content_type: &'static str,
    first: Option<bytes::Bytes>,
    rx: mpsc::Receiver<BodyChunk>,
) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, content_type)],
        streaming_body(first, rx),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::fs::AllocDirs;

    fn test_state() -> Arc<HttpState> {
        Arc::new(HttpState {
            allocs: Arc::new(AllocDirs::new("/nonexistent")),
            rpc: Arc::new(StreamingRpc::new()),
            stream: StreamConfig::default(),
            shutdown: CancellationToken::new(),
        })
    }

    async fn error_of(resp: Response) -> ErrorResponse {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_invalid_method() {
        for uri in ["/v1/client/fs/rm/a1", "/v1/client/fs/logs", "/v1/other"] {
            let req = Request::get(uri).body(Body::empty()).unwrap();
            let resp = router(test_state()).oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(error_of(resp).await.error, "Invalid method");
        }
    }

    #[tokio::test]
    async fn test_missing_log_type_is_rejected() {
        let req = Request::get("/v1/client/fs/logs/a1?task=web")
            .body(Body::empty())
            .unwrap();
        let resp = router(test_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            error_of(resp).await.error,
            "must provide log type (stdout/stderr)"
        );
    }

    #[tokio::test]
    async fn test_logs_without_handler_is_500() {
        let req = Request::get("/v1/client/fs/logs/a1?task=web&type=stdout")
            .body(Body::empty())
            .unwrap();
        let resp = router(test_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_stat_requires_path() {
        let req = Request::get("/v1/client/fs/stat/a1")
            .body(Body::empty())
            .unwrap();
        let resp = router(test_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(resp).await.error, "must provide a file name");
    }

    #[test]
    fn test_auth_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(auth_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(auth_token(&headers), Some("abc"));

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(auth_token(&headers), Some("xyz"));
    }
}
