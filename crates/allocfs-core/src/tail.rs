//! Log file tailing across rotated files.
//!
//! A task's log is a sequence of files `<task>.<type>.<index>` with
//! increasing indices. [`LogTail`] reads them in order through a
//! [`StreamFramer`]. In follow mode it keeps watching the current file after
//! end-of-file by polling its size and the directory listing:
//!
//! | Observation           | Action                                        |
//! |-----------------------|-----------------------------------------------|
//! | file grew             | resume reading                                |
//! | higher index appeared | continue with the next file at offset 0       |
//! | file shrank           | reopen at 0, emit [`FileEvent::Truncated`]    |
//! | file removed          | emit [`FileEvent::Deleted`], end the stream   |

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::framer::{FileEvent, FrameSink, StreamFramer};
use crate::fs::{self, AllocDir, FsError, LOG_DIR, LogFile};
use crate::rpc::{FrameError, LogType, Origin};

/// Errors that end a tail.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TailError {
    /// The reader of the stream went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TailError::Frame(e) if e.is_disconnect())
    }
}

/// Position in the rotated file set where streaming begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPosition {
    pub index: u64,
    pub offset: u64,
}

/// Resolve `offset` relative to `origin` across `files`.
///
/// Offsets past either end are clamped to the available data. Returns `None`
/// when there are no files.
pub fn start_position(files: &[LogFile], origin: Origin, offset: i64) -> Option<StartPosition> {
    let first = files.first()?;
    let last = files.last()?;
    let mut remaining = offset.max(0).unsigned_abs();

    match origin {
        Origin::Start => {
            for file in files {
                if remaining < file.size {
                    return Some(StartPosition {
                        index: file.index,
                        offset: remaining,
                    });
                }
                remaining -= file.size;
            }
            Some(StartPosition {
                index: last.index,
                offset: last.size,
            })
        }
        Origin::End => {
            for file in files.iter().rev() {
                if remaining <= file.size {
                    return Some(StartPosition {
                        index: file.index,
                        offset: file.size - remaining,
                    });
                }
                remaining -= file.size;
            }
            Some(StartPosition {
                index: first.index,
                offset: 0,
            })
        }
    }
}

/// Change observed on a file at end-of-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    None,
    Grew,
    Truncated,
    Deleted,
}

async fn observe(path: &Path, position: u64) -> io::Result<Change> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > position => Ok(Change::Grew),
        Ok(meta) if meta.len() < position => Ok(Change::Truncated),
        Ok(_) => Ok(Change::None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Change::Deleted),
        Err(e) => Err(e),
    }
}

/// Read from `reader` into the framer until end-of-file, advancing
/// `position`. The batch window is enforced between reads so a file that
/// never stops growing still produces frames.
async fn read_available<R, S>(
    reader: &mut R,
    framer: &mut StreamFramer<S>,
    label: &str,
    buf: &mut [u8],
    position: &mut u64,
) -> Result<(), TailError>
where
    R: AsyncRead + Unpin,
    S: FrameSink,
{
    loop {
        let n = reader.read(buf).await.map_err(|source| TailError::Read {
            path: label.to_string(),
            source,
        })?;
        if n == 0 {
            return Ok(());
        }
        *position += n as u64;
        trace!(file = %label, bytes = n, "read log data");
        framer.send(label, None, &buf[..n], *position as i64).await?;
        framer.tick().await?;
    }
}

/// Streams one task log from an allocation directory.
pub struct LogTail<'a> {
    dir: &'a AllocDir,
    task: &'a str,
    log_type: LogType,
    follow: bool,
    poll: Duration,
}

impl<'a> LogTail<'a> {
    pub fn new(dir: &'a AllocDir, task: &'a str, log_type: LogType) -> Self {
        Self {
            dir,
            task,
            log_type,
            follow: false,
            poll: Duration::from_millis(100),
        }
    }

    /// Keep watching for new data after the last file is exhausted.
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn label(&self, index: u64) -> String {
        format!("{LOG_DIR}/{}.{}.{index}", self.task, self.log_type)
    }

    async fn next_index(&self, after: u64) -> Result<Option<u64>, FsError> {
        let files = self.dir.log_files(self.task, self.log_type).await?;
        Ok(files.into_iter().map(|f| f.index).find(|&i| i > after))
    }

    /// Stream from `start` until the data runs out (or, when following,
    /// until the file is deleted or the sink fails).
    pub async fn run<S: FrameSink>(
        &self,
        framer: &mut StreamFramer<S>,
        start: StartPosition,
    ) -> Result<(), TailError> {
        let mut index = start.index;
        let mut position = start.offset;
        let mut buf = vec![0u8; framer.frame_size()];

        'files: loop {
            let path = self.dir.log_path(self.task, self.log_type, index);
            let label = self.label(index);
            let read_err = |source| TailError::Read {
                path: label.clone(),
                source,
            };
            debug!(file = %label, offset = position, "tailing log file");
            let mut file = fs::open_file_at(&path, position).await.map_err(read_err)?;

            loop {
                read_available(&mut file, framer, &label, &mut buf, &mut position).await?;

                // End of file.
                if !self.follow {
                    match self.next_index(index).await? {
                        Some(next) => {
                            index = next;
                            position = 0;
                            continue 'files;
                        }
                        None => {
                            framer.flush().await?;
                            return Ok(());
                        }
                    }
                }

                let wake = framer.next_deadline().min(Instant::now() + self.poll);
                tokio::time::sleep_until(wake).await;
                framer.tick().await?;

                match observe(&path, position).await.map_err(read_err)? {
                    Change::Grew => {}
                    Change::None => {
                        if let Some(next) = self.next_index(index).await? {
                            debug!(file = %label, next, "log file rotated");
                            index = next;
                            position = 0;
                            continue 'files;
                        }
                    }
                    Change::Truncated => {
                        debug!(file = %label, "log file truncated");
                        file = fs::open_file_at(&path, 0).await.map_err(read_err)?;
                        position = 0;
                        framer
                            .send(&label, Some(FileEvent::Truncated), &[], 0)
                            .await?;
                    }
                    Change::Deleted => {
                        debug!(file = %label, "log file deleted");
                        framer
                            .send(&label, Some(FileEvent::Deleted), &[], position as i64)
                            .await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::BoxFuture;
    use crate::framer::{FramerConfig, StreamFrame};

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<StreamFrame>>>);

    impl FrameSink for Collect {
        fn send_frame(&mut self, frame: StreamFrame) -> BoxFuture<'_, Result<(), FrameError>> {
            self.0.lock().unwrap().push(frame);
            Box::pin(async { Ok(()) })
        }
    }

    fn files(sizes: &[(u64, u64)]) -> Vec<LogFile> {
        sizes
            .iter()
            .map(|&(index, size)| LogFile {
                index,
                path: PathBuf::from(format!("web.stdout.{index}")),
                size,
            })
            .collect()
    }

    #[test]
    fn test_start_position_from_start() {
        let set = files(&[(0, 10), (1, 5), (2, 7)]);
        let at = |offset| start_position(&set, Origin::Start, offset).unwrap();

        assert_eq!(at(0), StartPosition { index: 0, offset: 0 });
        assert_eq!(at(9), StartPosition { index: 0, offset: 9 });
        assert_eq!(at(10), StartPosition { index: 1, offset: 0 });
        assert_eq!(at(16), StartPosition { index: 2, offset: 1 });
        // Clamped to the end of the newest file.
        assert_eq!(at(500), StartPosition { index: 2, offset: 7 });
        assert_eq!(at(-3), StartPosition { index: 0, offset: 0 });
    }

    #[test]
    fn test_start_position_from_end() {
        let set = files(&[(0, 10), (1, 5), (2, 7)]);
        let at = |offset| start_position(&set, Origin::End, offset).unwrap();

        assert_eq!(at(0), StartPosition { index: 2, offset: 7 });
        assert_eq!(at(7), StartPosition { index: 2, offset: 0 });
        assert_eq!(at(8), StartPosition { index: 1, offset: 4 });
        assert_eq!(at(20), StartPosition { index: 0, offset: 2 });
        assert_eq!(at(999), StartPosition { index: 0, offset: 0 });
    }

    #[test]
    fn test_start_position_without_files() {
        assert_eq!(start_position(&[], Origin::Start, 0), None);
        assert_eq!(start_position(&[], Origin::End, 4), None);
    }

    #[tokio::test]
    async fn test_batch_window_applies_while_data_keeps_arriving() {
        let sink = Collect::default();
        let mut framer = StreamFramer::new(
            sink.clone(),
            FramerConfig {
                frame_size: 1024,
                heartbeat: Duration::from_secs(10),
                batch_window: Duration::from_millis(40),
            },
        );
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for _ in 0..12 {
                writer.write_all(b"x").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let mut buf = vec![0u8; 1024];
        let mut position = 0;
        read_available(&mut reader, &mut framer, "web.stdout.0", &mut buf, &mut position)
            .await
            .unwrap();
        writer.await.unwrap();

        // Nothing was flushed at end-of-file, so every frame came from the
        // batch window expiring mid-read.
        let frames = sink.0.lock().unwrap().clone();
        assert!(frames.len() >= 2, "got {} frames", frames.len());
        let sent: usize = frames.iter().map(|f| f.data.len()).sum();
        assert_eq!(position, 12);
        assert_eq!(frames.last().unwrap().offset, sent as i64);
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(TailError::from(FrameError::Closed).is_disconnect());
        let err = TailError::Read {
            path: "x".into(),
            source: io::Error::other("boom"),
        };
        assert!(!err.is_disconnect());
    }
}
