//! The local `FileSystem.Logs` streaming handler.
//!
//! Reads one [`LogsRequest`] from the transport, then tails the requested
//! task log out of the allocation directory, sending each frame as a
//! [`StreamResult`]. With `plain_text` the payload is the raw log bytes;
//! otherwise it is one JSON-encoded [`StreamFrame`] per line.

use tracing::{debug, info, warn};

use allocfs_config::StreamConfig;

use crate::BoxFuture;
use crate::error::CodedError;
use crate::framer::{FrameSink, FramerConfig, StreamFrame, StreamFramer};
use crate::fs::{AllocDir, AllocDirs};
use crate::rpc::{
    BoxTransport, FrameChannel, FrameError, LogsRequest, RequestChannel, StreamResult,
    StreamingHandler,
};
use crate::tail::{self, LogTail, TailError};

/// Sends frames back to the bridge as stream results.
struct ResultSink {
    channel: RequestChannel<BoxTransport>,
    plain: bool,
}

impl ResultSink {
    async fn fail(&mut self, err: &CodedError) {
        let result = StreamResult::failure(i64::from(err.code()), err.message());
        if let Err(e) = self.channel.encode(result).await {
            debug!(error = %e, "could not report log stream failure");
        }
    }
}

impl FrameSink for ResultSink {
    fn send_frame(&mut self, frame: StreamFrame) -> BoxFuture<'_, Result<(), FrameError>> {
        Box::pin(async move {
            let payload = if self.plain {
                frame.data
            } else {
                let mut line = serde_json::to_vec(&frame).map_err(FrameError::Encode)?;
                line.push(b'\n');
                line
            };
            self.channel.encode(StreamResult::payload(payload)).await
        })
    }
}

/// Serves task logs from allocation directories on this host.
#[derive(Debug, Clone)]
pub struct LocalLogs {
    allocs: AllocDirs,
    config: StreamConfig,
}

impl LocalLogs {
    pub fn new(allocs: AllocDirs, config: StreamConfig) -> Self {
        Self { allocs, config }
    }

    async fn serve(&self, conn: BoxTransport) {
        let mut channel: RequestChannel<BoxTransport> = FrameChannel::new(conn);
        let request = match channel.decode().await {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "log stream closed before a request arrived");
                return;
            }
        };
        info!(
            alloc_id = %request.alloc_id,
            task = %request.task,
            log_type = %request.log_type,
            follow = request.follow,
            "streaming task logs"
        );

        let mut sink = ResultSink {
            channel,
            plain: request.plain_text,
        };
        let (dir, start) = match self.locate(&request).await {
            Ok(located) => located,
            Err(err) => {
                sink.fail(&err).await;
                return;
            }
        };

        let tail = LogTail::new(&dir, &request.task, request.log_type)
            .follow(request.follow)
            .poll_interval(self.config.log_poll());
        let mut framer = StreamFramer::new(sink, FramerConfig::from(&self.config));

        match tail.run(&mut framer, start).await {
            Ok(()) => debug!(task = %request.task, "log stream complete"),
            Err(e) if e.is_disconnect() => {
                debug!(task = %request.task, "log stream reader disconnected");
            }
            Err(e) => {
                warn!(task = %request.task, error = %e, "log stream failed");
                let coded = match e {
                    TailError::Fs(fs) => CodedError::from(fs),
                    other => CodedError::new(500, other.to_string()),
                };
                framer.into_inner().fail(&coded).await;
            }
        }
    }

    /// Find the allocation directory and the first byte to stream.
    async fn locate(
        &self,
        request: &LogsRequest,
    ) -> Result<(AllocDir, tail::StartPosition), CodedError> {
        let dir = self.allocs.alloc_dir(&request.alloc_id)?;
        let files = dir.log_files(&request.task, request.log_type).await?;
        let start = tail::start_position(&files, request.origin, request.offset).ok_or_else(|| {
            CodedError::new(
                404,
                format!(
                    "no {} logs found for task {:?}",
                    request.log_type, request.task
                ),
            )
        })?;
        Ok((dir, start))
    }
}

impl StreamingHandler for LocalLogs {
    fn handle(&self, conn: BoxTransport) -> BoxFuture<'_, ()> {
        Box::pin(self.serve(conn))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::fs::LOG_DIR;
    use crate::pipe;
    use crate::rpc::{LogType, ResultChannel};

    async fn alloc_with_log(body: &[u8]) -> (TempDir, LocalLogs) {
        let tmp = TempDir::new().unwrap();
        let logs = tmp.path().join("a1").join(LOG_DIR);
        tokio::fs::create_dir_all(&logs).await.unwrap();
        tokio::fs::write(logs.join("web.stdout.0"), body).await.unwrap();
        let handler = LocalLogs::new(AllocDirs::new(tmp.path()), StreamConfig::default());
        (tmp, handler)
    }

    async fn collect(handler: LocalLogs, request: LogsRequest) -> Vec<StreamResult> {
        let (local, remote) = pipe::open(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(Box::new(remote)).await });

        let mut bridge: ResultChannel<_> = FrameChannel::new(local);
        bridge.encode(request).await.unwrap();
        let mut results = Vec::new();
        while let Ok(result) = bridge.decode().await {
            results.push(result);
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        results
    }

    #[tokio::test]
    async fn test_plain_stream_without_follow() {
        let (_tmp, handler) = alloc_with_log(b"hello\nworld\n").await;
        let mut request = LogsRequest::new("a1", "web", LogType::Stdout);
        request.plain_text = true;

        let results = collect(handler, request).await;
        let body: Vec<u8> = results.into_iter().flat_map(|r| r.payload).collect();
        assert_eq!(body, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_framed_payload_is_json_lines() {
        let (_tmp, handler) = alloc_with_log(b"abc").await;
        let request = LogsRequest::new("a1", "web", LogType::Stdout);

        let results = collect(handler, request).await;
        assert_eq!(results.len(), 1);
        let line = &results[0].payload;
        assert_eq!(line.last(), Some(&b'\n'));
        let frame: StreamFrame = serde_json::from_slice(line).unwrap();
        assert_eq!(frame.data, b"abc");
        assert_eq!(frame.offset, 3);
        assert_eq!(frame.file, "alloc/logs/web.stdout.0");
    }

    #[tokio::test]
    async fn test_missing_task_reports_not_found() {
        let (_tmp, handler) = alloc_with_log(b"abc").await;
        let request = LogsRequest::new("a1", "db", LogType::Stderr);

        let results = collect(handler, request).await;
        assert_eq!(results.len(), 1);
        let err = results[0].error.as_ref().unwrap().to_coded();
        assert_eq!(err.code(), 404);
        assert!(err.message().contains("\"db\""));
    }

    #[tokio::test]
    async fn test_unknown_alloc_reports_not_found() {
        let (_tmp, handler) = alloc_with_log(b"abc").await;
        let request = LogsRequest::new("other", "web", LogType::Stdout);

        let results = collect(handler, request).await;
        let err = results[0].error.as_ref().unwrap().to_coded();
        assert_eq!(err.code(), 404);
    }
}
