//! Temporary allocation directories.
//!
//! [`TestAllocDir`] lays out `<root>/<alloc_id>/alloc/logs` in a temp
//! directory and offers helpers to write, append, truncate and rotate task
//! logs while a stream is running.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use allocfs_core::fs::{AllocDirs, LOG_DIR};
use allocfs_core::rpc::LogType;

/// A throwaway allocation root holding a single allocation.
///
/// The temp directory is deleted when this value is dropped.
pub struct TestAllocDir {
    alloc_id: String,
    temp_dir: TempDir,
}

impl TestAllocDir {
    /// Create an allocation with an empty log directory.
    pub async fn new(alloc_id: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        tokio::fs::create_dir_all(temp_dir.path().join(alloc_id).join(LOG_DIR))
            .await
            .expect("failed to create log dir");
        Self {
            alloc_id: alloc_id.to_string(),
            temp_dir,
        }
    }

    pub fn alloc_id(&self) -> &str {
        &self.alloc_id
    }

    /// The allocation root (parent of the allocation directory).
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A provider serving this root.
    pub fn allocs(&self) -> AllocDirs {
        AllocDirs::new(self.root())
    }

    /// Absolute path of a file inside the allocation.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(&self.alloc_id).join(relative)
    }

    pub fn log_path(&self, task: &str, log_type: LogType, index: u64) -> PathBuf {
        self.path(&format!("{LOG_DIR}/{task}.{log_type}.{index}"))
    }

    /// Write (or overwrite) a file inside the allocation, creating parents.
    pub async fn write_file(&self, relative: &str, data: impl AsRef<[u8]>) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .expect("failed to create parent dir");
        }
        tokio::fs::write(&path, data)
            .await
            .expect("failed to write file");
    }

    /// Replace the contents of a log file. Writing empty data truncates it.
    pub async fn write_log(&self, task: &str, log_type: LogType, index: u64, data: &[u8]) {
        tokio::fs::write(self.log_path(task, log_type, index), data)
            .await
            .expect("failed to write log");
    }

    /// Append to a log file, creating it if needed.
    pub async fn append_log(&self, task: &str, log_type: LogType, index: u64, data: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(task, log_type, index))
            .await
            .expect("failed to open log");
        file.write_all(data).await.expect("failed to append log");
        file.flush().await.expect("failed to flush log");
    }

    pub async fn remove_log(&self, task: &str, log_type: LogType, index: u64) {
        tokio::fs::remove_file(self.log_path(task, log_type, index))
            .await
            .expect("failed to remove log");
    }
}
