//! The streaming log bridge.
//!
//! [`LogBridge::stream`] connects an HTTP response to a `FileSystem.Logs`
//! handler through an in-process [`pipe`]. Three tasks cooperate for the
//! life of one request:
//!
//! - the **copier** encodes the [`LogsRequest`] onto the local end, then
//!   decodes [`StreamResult`]s and writes their payloads to the output,
//!   flushing after every write;
//! - the **handler** is invoked with the remote end and runs until it has
//!   nothing more to send or sees the pipe close;
//! - the **supervisor** waits for the request scope to be cancelled and then
//!   closes the pipe, which is what unblocks a copier or handler stuck in a
//!   read or write.
//!
//! The scope is a child of the caller's cancellation token, so a client
//! disconnect or agent shutdown tears the stream down. The copier cancels the
//! scope itself when it terminates, so a failure on the HTTP side also stops
//! the handler.
//!
//! Exactly one outcome is produced. Cancellation is checked before any
//! transport error is classified: once the scope is cancelled every failure
//! is a clean stop.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use allocfs_config::StreamConfig;

use crate::error::CodedError;
use crate::pipe::{self, PipeEnd};
use crate::rpc::{
    FrameChannel, FrameError, LogsRequest, ResultChannel, StreamResult, StreamingHandler,
};

/// Code for a request that could not be sent to the handler.
pub const CODE_ENCODE: u16 = 500;
/// Code for a stream result that could not be decoded.
pub const CODE_DECODE: u16 = 501;
/// Code for a payload that could not be written to the output.
pub const CODE_WRITE: u16 = 502;

/// Relays one log stream from a streaming handler to a writer.
pub struct LogBridge {
    handler: Arc<dyn StreamingHandler>,
    pipe_capacity: usize,
    drain_timeout: Duration,
}

impl LogBridge {
    pub fn new(handler: Arc<dyn StreamingHandler>, config: &StreamConfig) -> Self {
        Self {
            handler,
            pipe_capacity: config.pipe_capacity,
            drain_timeout: config.drain_timeout(),
        }
    }

    /// Stream the logs described by `request` into `output`.
    ///
    /// Returns once both the handler and the copier have finished. A clean
    /// end-of-stream and cancellation through `cancel` both yield `Ok(())`.
    /// Once the handler returns, the copier has the configured drain timeout
    /// to finish writing; running out of it is a [`CODE_WRITE`] error.
    pub async fn stream<W>(
        &self,
        request: LogsRequest,
        output: W,
        cancel: &CancellationToken,
    ) -> Result<(), CodedError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (local, remote) = pipe::open(self.pipe_capacity);
        let scope = cancel.child_token();

        let supervisor = tokio::spawn({
            let scope = scope.clone();
            let closer = local.closer();
            async move {
                scope.cancelled().await;
                closer.close();
                debug!("log stream scope cancelled, pipe closed");
            }
        });

        let mut copier = tokio::spawn(copy_frames(
            FrameChannel::new(local),
            request,
            output,
            scope.clone(),
        ));

        self.handler.handle(Box::new(remote)).await;
        debug!("log stream handler returned");

        // The handler dropping its end is a half-close: let the copier drain
        // what was already written before tearing the pipe down. A drain cut
        // short by the bound is an error unless the caller cancelled.
        let mut drained = true;
        let joined = match tokio::time::timeout(self.drain_timeout, &mut copier).await {
            Ok(joined) => joined,
            Err(_) => {
                drained = false;
                scope.cancel();
                copier.await
            }
        };

        scope.cancel();
        if let Err(e) = supervisor.await {
            warn!(error = %e, "log stream supervisor failed");
        }

        match joined {
            Ok(Ok(())) if !drained && !cancel.is_cancelled() => {
                warn!(timeout = ?self.drain_timeout, "log stream did not drain in time");
                Err(CodedError::new(
                    CODE_WRITE,
                    format!("log stream did not drain within {:?}", self.drain_timeout),
                ))
            }
            Ok(outcome) => outcome,
            Err(e) => Err(CodedError::new(
                500,
                format!("log stream copier failed: {e}"),
            )),
        }
    }
}

async fn copy_frames<W>(
    mut channel: ResultChannel<PipeEnd>,
    request: LogsRequest,
    mut output: W,
    scope: CancellationToken,
) -> Result<(), CodedError>
where
    W: AsyncWrite + Unpin,
{
    let outcome = copy_loop(&mut channel, request, &mut output, &scope).await;
    scope.cancel();
    match &outcome {
        Ok(()) => debug!("log stream copier finished"),
        Err(e) => warn!(code = e.code(), error = %e, "log stream terminated with error"),
    }
    outcome
}

async fn copy_loop<W>(
    channel: &mut ResultChannel<PipeEnd>,
    request: LogsRequest,
    output: &mut W,
    scope: &CancellationToken,
) -> Result<(), CodedError>
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = channel.encode(request).await {
        if scope.is_cancelled() {
            return Ok(());
        }
        return Err(CodedError::new(
            CODE_ENCODE,
            format!("failed to send logs request: {e}"),
        ));
    }

    loop {
        if scope.is_cancelled() {
            debug!("log stream cancelled");
            return Ok(());
        }

        let result: StreamResult = match channel.decode().await {
            Ok(result) => result,
            Err(_) if scope.is_cancelled() => {
                debug!("log stream cancelled during decode");
                return Ok(());
            }
            Err(FrameError::Closed) => return Ok(()),
            Err(e) => {
                return Err(CodedError::new(
                    CODE_DECODE,
                    format!("failed to decode log stream result: {e}"),
                ));
            }
        };

        if let Some(err) = &result.error {
            return Err(err.to_coded());
        }
        if result.payload.is_empty() {
            continue;
        }

        trace!(bytes = result.payload.len(), "copying log payload");
        let written = async {
            output.write_all(&result.payload).await?;
            output.flush().await
        }
        .await;
        if let Err(e) = written {
            if scope.is_cancelled() {
                return Ok(());
            }
            debug!(error = %e, "log stream output went away");
            return Err(CodedError::new(
                CODE_WRITE,
                format!("failed to write log payload: {e}"),
            ));
        }
    }
}
