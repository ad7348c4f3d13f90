//! Stream framer: batches file data into bounded frames with heartbeats.
//!
//! Data handed to [`StreamFramer::send`] is accumulated and emitted when
//! either the pending payload reaches the frame size or the batch window
//! has elapsed since it started pending. When nothing has been emitted for
//! a heartbeat interval an empty frame is sent, so a reader can tell an idle
//! stream from a dead one. File events (truncate/delete) are never delayed.
//!
//! The framer is driven from a single task: the caller waits on
//! [`StreamFramer::next_deadline`] alongside its own work and calls
//! [`StreamFramer::tick`] when the deadline passes.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use allocfs_config::StreamConfig;

use crate::BoxFuture;
use crate::rpc::FrameError;
use crate::rpc::types::base64_bytes;

/// Lifecycle event attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEvent {
    #[serde(rename = "file deleted")]
    Deleted,
    #[serde(rename = "file truncated")]
    Truncated,
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileEvent::Deleted => f.write_str("file deleted"),
            FileEvent::Truncated => f.write_str("file truncated"),
        }
    }
}

/// One unit of a file stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Absolute offset in `file` after this frame is applied.
    pub offset: i64,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_event: Option<FileEvent>,
}

impl StreamFrame {
    /// True for the empty keepalive frame.
    pub fn is_heartbeat(&self) -> bool {
        self.data.is_empty() && self.file_event.is_none() && self.file.is_empty()
    }
}

/// Where the framer sends finished frames.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: StreamFrame) -> BoxFuture<'_, Result<(), FrameError>>;
}

/// Framing limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramerConfig {
    pub frame_size: usize,
    pub heartbeat: Duration,
    pub batch_window: Duration,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for FramerConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            frame_size: config.frame_size,
            heartbeat: config.heartbeat(),
            batch_window: config.batch_window(),
        }
    }
}

/// Data waiting to be emitted.
struct Pending {
    file: String,
    data: Vec<u8>,
    end_offset: i64,
    event: Option<FileEvent>,
    since: Instant,
}

pub struct StreamFramer<S> {
    sink: S,
    config: FramerConfig,
    pending: Option<Pending>,
    last_sent: Instant,
}

impl<S: FrameSink> StreamFramer<S> {
    pub fn new(sink: S, config: FramerConfig) -> Self {
        Self {
            sink,
            config,
            pending: None,
            last_sent: Instant::now(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    /// Queue `data` read from `file`; `offset` is the file offset after it.
    pub async fn send(
        &mut self,
        file: &str,
        event: Option<FileEvent>,
        data: &[u8],
        offset: i64,
    ) -> Result<(), FrameError> {
        let switch = self
            .pending
            .as_ref()
            .is_some_and(|p| p.file != file || p.event.is_some());
        if switch || event.is_some() {
            self.flush().await?;
        }

        let pending = self.pending.get_or_insert_with(|| Pending {
            file: file.to_string(),
            data: Vec::new(),
            end_offset: offset,
            event: None,
            since: Instant::now(),
        });
        pending.data.extend_from_slice(data);
        pending.end_offset = offset;
        pending.event = event;

        if event.is_some() {
            return self.flush().await;
        }
        while self
            .pending
            .as_ref()
            .is_some_and(|p| p.data.len() >= self.config.frame_size)
        {
            self.emit_chunk().await?;
        }
        Ok(())
    }

    /// Emit everything pending, regardless of the batch window.
    pub async fn flush(&mut self) -> Result<(), FrameError> {
        while self.pending.is_some() {
            self.emit_chunk().await?;
        }
        Ok(())
    }

    /// When [`tick`](Self::tick) next has work to do.
    pub fn next_deadline(&self) -> Instant {
        let heartbeat = self.last_sent + self.config.heartbeat;
        match &self.pending {
            Some(p) => (p.since + self.config.batch_window).min(heartbeat),
            None => heartbeat,
        }
    }

    /// Flush data whose batch window expired, or send a heartbeat if idle.
    pub async fn tick(&mut self) -> Result<(), FrameError> {
        let now = Instant::now();
        if let Some(pending) = &self.pending {
            if now >= pending.since + self.config.batch_window
                || now >= self.last_sent + self.config.heartbeat
            {
                return self.flush().await;
            }
            return Ok(());
        }
        if now >= self.last_sent + self.config.heartbeat {
            self.emit(StreamFrame::default()).await?;
        }
        Ok(())
    }

    /// Give back the sink.
    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Emit up to one frame's worth of pending data.
    async fn emit_chunk(&mut self) -> Result<(), FrameError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(());
        };

        let frame = if pending.data.len() > self.config.frame_size {
            let rest = pending.data.split_off(self.config.frame_size);
            let chunk = std::mem::replace(&mut pending.data, rest);
            let offset = pending.end_offset - pending.data.len() as i64;
            let frame = StreamFrame {
                offset,
                data: chunk,
                file: pending.file.clone(),
                file_event: pending.event.take(),
            };
            self.pending = Some(pending);
            frame
        } else {
            StreamFrame {
                offset: pending.end_offset,
                data: pending.data,
                file: pending.file,
                file_event: pending.event,
            }
        };
        self.emit(frame).await
    }

    async fn emit(&mut self, frame: StreamFrame) -> Result<(), FrameError> {
        self.sink.send_frame(frame).await?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<StreamFrame>>>);

    impl Collect {
        fn frames(&self) -> Vec<StreamFrame> {
            self.0.lock().unwrap().clone()
        }
    }

    impl FrameSink for Collect {
        fn send_frame(&mut self, frame: StreamFrame) -> BoxFuture<'_, Result<(), FrameError>> {
            self.0.lock().unwrap().push(frame);
            Box::pin(async { Ok(()) })
        }
    }

    struct Disconnected;

    impl FrameSink for Disconnected {
        fn send_frame(&mut self, _frame: StreamFrame) -> BoxFuture<'_, Result<(), FrameError>> {
            Box::pin(async { Err(FrameError::Closed) })
        }
    }

    fn config() -> FramerConfig {
        FramerConfig {
            frame_size: 8,
            heartbeat: Duration::from_secs(1),
            batch_window: Duration::from_millis(200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_writes_wait_for_batch_window() {
        let sink = Collect::default();
        let mut framer = StreamFramer::new(sink.clone(), config());

        framer.send("out.0", None, b"ab", 2).await.unwrap();
        framer.send("out.0", None, b"cd", 4).await.unwrap();
        assert!(sink.frames().is_empty());

        tokio::time::sleep_until(framer.next_deadline()).await;
        framer.tick().await.unwrap();

        assert_eq!(
            sink.frames(),
            vec![StreamFrame {
                offset: 4,
                data: b"abcd".to_vec(),
                file: "out.0".to_string(),
                file_event: None,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_frames_are_split_with_offsets() {
        let sink = Collect::default();
        let mut framer = StreamFramer::new(sink.clone(), config());

        framer.send("out.0", None, b"0123456789ab", 112).await.unwrap();
        // One full frame goes out immediately, the remainder waits.
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, b"01234567");
        assert_eq!(frames[0].offset, 108);

        framer.flush().await.unwrap();
        let frames = sink.frames();
        assert_eq!(frames[1].data, b"89ab");
        assert_eq!(frames[1].offset, 112);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_when_idle() {
        let sink = Collect::default();
        let mut framer = StreamFramer::new(sink.clone(), config());

        tokio::time::sleep(Duration::from_millis(500)).await;
        framer.tick().await.unwrap();
        assert!(sink.frames().is_empty(), "no heartbeat before the interval");

        tokio::time::sleep_until(framer.next_deadline()).await;
        framer.tick().await.unwrap();
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_flush_immediately() {
        let sink = Collect::default();
        let mut framer = StreamFramer::new(sink.clone(), config());

        framer.send("out.0", None, b"old", 3).await.unwrap();
        framer
            .send("out.0", Some(FileEvent::Truncated), b"new", 3)
            .await
            .unwrap();

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, b"old");
        assert_eq!(frames[0].file_event, None);
        assert_eq!(frames[1].data, b"new");
        assert_eq!(frames[1].file_event, Some(FileEvent::Truncated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_switch_flushes_previous_file() {
        let sink = Collect::default();
        let mut framer = StreamFramer::new(sink.clone(), config());

        framer.send("out.0", None, b"a", 1).await.unwrap();
        framer.send("out.1", None, b"b", 1).await.unwrap();
        framer.flush().await.unwrap();

        let files: Vec<_> = sink.frames().into_iter().map(|f| f.file).collect();
        assert_eq!(files, vec!["out.0".to_string(), "out.1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_propagates() {
        let mut framer = StreamFramer::new(Disconnected, config());
        let err = framer
            .send("out.0", Some(FileEvent::Deleted), &[], 0)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_frame_json_uses_event_names() {
        let frame = StreamFrame {
            offset: 10,
            data: Vec::new(),
            file: "alloc/logs/web.stdout.0".to_string(),
            file_event: Some(FileEvent::Deleted),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "offset": 10,
                "file": "alloc/logs/web.stdout.0",
                "file_event": "file deleted",
            })
        );
    }
}
