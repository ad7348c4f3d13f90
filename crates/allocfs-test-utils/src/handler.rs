//! Scripted streaming handlers.
//!
//! [`ScriptedHandler`] stands in for a `FileSystem.Logs` implementation: it
//! reads the request, then plays back a fixed list of [`Step`]s onto the
//! transport. It records every request it receives and how often it was
//! invoked, so tests can assert that validation failures never reach it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use allocfs_core::BoxFuture;
use allocfs_core::rpc::{
    BoxTransport, FrameChannel, LogsRequest, RequestChannel, StreamError, StreamResult,
    StreamingHandler,
};

/// How often [`Step::HoldOpen`] sends an empty keepalive.
const HOLD_OPEN_INTERVAL: Duration = Duration::from_millis(10);

/// One action of a scripted handler.
#[derive(Debug, Clone)]
pub enum Step {
    /// Send a result carrying these payload bytes.
    Payload(Vec<u8>),
    /// Send a result carrying an error.
    Error { code: Option<i64>, message: String },
    /// Write raw bytes to the transport, bypassing the codec.
    Raw(Vec<u8>),
    /// Send empty results until the transport is closed.
    HoldOpen,
    /// Pause before the next step.
    Delay(Duration),
}

impl Step {
    pub fn payload(data: impl AsRef<[u8]>) -> Self {
        Step::Payload(data.as_ref().to_vec())
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Step::Error {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// A streaming handler that plays back a script.
pub struct ScriptedHandler {
    steps: Vec<Step>,
    requests: Mutex<Vec<LogsRequest>>,
    invocations: AtomicUsize,
    completions: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            requests: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        }
    }

    /// A handler sending one payload per item, then ending the stream.
    pub fn payloads<I, T>(payloads: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self::new(payloads.into_iter().map(Step::payload).collect())
    }

    /// Number of times the handler has been invoked.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of invocations that have returned.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<LogsRequest> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }

    async fn play(&self, conn: BoxTransport) {
        let mut channel: RequestChannel<BoxTransport> = FrameChannel::new(conn);
        let Ok(request) = channel.decode().await else {
            return;
        };
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .push(request);

        for step in &self.steps {
            let sent = match step {
                Step::Payload(data) => channel.encode(StreamResult::payload(data.clone())).await,
                Step::Error { code, message } => {
                    let result = StreamResult {
                        payload: Vec::new(),
                        error: Some(StreamError {
                            code: *code,
                            message: message.clone(),
                        }),
                    };
                    channel.encode(result).await
                }
                Step::Raw(bytes) => {
                    let io = channel.get_mut();
                    let written = async {
                        io.write_all(bytes).await?;
                        io.flush().await
                    };
                    written.await.map_err(Into::into)
                }
                Step::HoldOpen => loop {
                    if let Err(e) = channel.encode(StreamResult::default()).await {
                        break Err(e);
                    }
                    tokio::time::sleep(HOLD_OPEN_INTERVAL).await;
                },
                Step::Delay(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(())
                }
            };
            if let Err(e) = sent {
                debug!(error = %e, "scripted handler stopped early");
                break;
            }
        }
    }
}

impl StreamingHandler for ScriptedHandler {
    fn handle(&self, conn: BoxTransport) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.play(conn).await;
            self.completions.fetch_add(1, Ordering::SeqCst);
        })
    }
}
