//! Allocation filesystem access.
//!
//! [`AllocFsProvider`] resolves an allocation id to an [`AllocFs`], the
//! accessor behind the `ls`, `stat`, `readat` and `cat` endpoints. The
//! shipped provider, [`AllocDirs`], serves allocations from directories under
//! a single root and confines every path to the allocation's directory.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeekExt};

use crate::BoxFuture;
use crate::error::CodedError;
use crate::rpc::LogType;

/// Directory (relative to the allocation) holding task logs.
pub const LOG_DIR: &str = "alloc/logs";

/// Metadata for one file or directory in an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub file_mode: String,
    pub mod_time: DateTime<Utc>,
}

/// Errors from allocation filesystem access.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("invalid alloc id {0:?}")]
    InvalidAllocId(String),

    #[error("unknown allocation {0:?}")]
    UnknownAlloc(String),

    #[error("path {0:?} escapes the allocation directory")]
    Escape(String),

    #[error("file {0:?} not found")]
    NotFound(String),

    #[error("file {0:?} is a directory")]
    IsDirectory(String),

    #[error("{path}: {source}")]
    Io { path: String, source: io::Error },
}

impl FsError {
    fn io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            return FsError::NotFound(path.to_string());
        }
        FsError::Io {
            path: path.to_string(),
            source,
        }
    }
}

impl From<FsError> for CodedError {
    fn from(err: FsError) -> Self {
        let code = match &err {
            FsError::InvalidAllocId(_) | FsError::IsDirectory(_) => 400,
            FsError::Escape(_) => 403,
            FsError::UnknownAlloc(_) | FsError::NotFound(_) => 404,
            FsError::Io { .. } => 500,
        };
        CodedError::new(code, err.to_string())
    }
}

/// A readable stream of file bytes.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Filesystem operations within one allocation.
pub trait AllocFs: Send + Sync {
    /// List a directory, sorted by name.
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<FileInfo>, FsError>>;

    /// Metadata for a single path.
    fn stat<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<FileInfo, FsError>>;

    /// Open a file positioned at `offset`.
    fn read_at<'a>(&'a self, path: &'a str, offset: u64)
    -> BoxFuture<'a, Result<BoxReader, FsError>>;
}

/// Resolves allocation ids to their filesystem.
pub trait AllocFsProvider: Send + Sync {
    fn get_alloc_fs(&self, alloc_id: &str) -> Result<Arc<dyn AllocFs>, FsError>;
}

/// Allocations stored as `<root>/<alloc_id>` directories.
#[derive(Debug, Clone)]
pub struct AllocDirs {
    root: PathBuf,
}

impl AllocDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory of one allocation. Existence is checked lazily.
    pub fn alloc_dir(&self, alloc_id: &str) -> Result<AllocDir, FsError> {
        let valid = !alloc_id.is_empty()
            && alloc_id != "."
            && alloc_id != ".."
            && !alloc_id.contains(['/', '\\']);
        if !valid {
            return Err(FsError::InvalidAllocId(alloc_id.to_string()));
        }
        Ok(AllocDir {
            alloc_id: alloc_id.to_string(),
            dir: self.root.join(alloc_id),
        })
    }
}

impl AllocFsProvider for AllocDirs {
    fn get_alloc_fs(&self, alloc_id: &str) -> Result<Arc<dyn AllocFs>, FsError> {
        Ok(Arc::new(self.alloc_dir(alloc_id)?))
    }
}

/// One rotated log file of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub index: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// A single allocation directory.
#[derive(Debug, Clone)]
pub struct AllocDir {
    alloc_id: String,
    dir: PathBuf,
}

impl AllocDir {
    pub fn alloc_id(&self) -> &str {
        &self.alloc_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Map a request path onto the allocation directory.
    ///
    /// Absolute paths are taken relative to the allocation; `..` is rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut resolved = self.dir.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(FsError::Escape(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve `path` and follow symlinks, rejecting targets that land
    /// outside the allocation directory.
    pub async fn confine(&self, path: &str) -> Result<PathBuf, FsError> {
        let resolved = self.resolve(path)?;
        let root = tokio::fs::canonicalize(&self.dir)
            .await
            .map_err(|e| FsError::io(&self.alloc_id, e))?;
        let target = tokio::fs::canonicalize(&resolved)
            .await
            .map_err(|e| FsError::io(path, e))?;
        if !target.starts_with(&root) {
            return Err(FsError::Escape(path.to_string()));
        }
        Ok(target)
    }

    async fn ensure_exists(&self) -> Result<(), FsError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(FsError::UnknownAlloc(self.alloc_id.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FsError::UnknownAlloc(self.alloc_id.clone()))
            }
            Err(e) => Err(FsError::io(&self.alloc_id, e)),
        }
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>, FsError> {
        self.ensure_exists().await?;
        let dir = self.confine(path).await?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| FsError::io(path, e))?;

        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| FsError::io(path, e))? {
            let meta = entry.metadata().await.map_err(|e| FsError::io(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            infos.push(file_info(name, &meta));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    pub async fn stat_path(&self, path: &str) -> Result<FileInfo, FsError> {
        self.ensure_exists().await?;
        let target = self.confine(path).await?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| FsError::io(path, e))?;
        let name = self
            .resolve(path)?
            .strip_prefix(&self.dir)
            .ok()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        Ok(file_info(name, &meta))
    }

    pub async fn open_at(&self, path: &str, offset: u64) -> Result<tokio::fs::File, FsError> {
        self.ensure_exists().await?;
        let target = self.confine(path).await?;
        open_file_at(&target, offset)
            .await
            .map_err(|e| FsError::io(path, e))
    }

    /// All rotated log files for a task, ordered by index.
    pub async fn log_files(&self, task: &str, log_type: LogType) -> Result<Vec<LogFile>, FsError> {
        self.ensure_exists().await?;
        let dir = self.dir.join(LOG_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::io(LOG_DIR, e)),
        };

        let prefix = format!("{task}.{log_type}.");
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::io(LOG_DIR, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<u64>().ok())
            else {
                continue;
            };
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FsError::io(LOG_DIR, e))?;
            if meta.is_file() {
                files.push(LogFile {
                    index,
                    path: entry.path(),
                    size: meta.len(),
                });
            }
        }
        files.sort_by_key(|f| f.index);
        Ok(files)
    }

    /// Path of the log file with the given rotation index.
    pub fn log_path(&self, task: &str, log_type: LogType, index: u64) -> PathBuf {
        self.dir.join(LOG_DIR).join(format!("{task}.{log_type}.{index}"))
    }
}

impl AllocFs for AllocDir {
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<FileInfo>, FsError>> {
        Box::pin(self.list_dir(path))
    }

    fn stat<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<FileInfo, FsError>> {
        Box::pin(self.stat_path(path))
    }

    fn read_at<'a>(
        &'a self,
        path: &'a str,
        offset: u64,
    ) -> BoxFuture<'a, Result<BoxReader, FsError>> {
        Box::pin(async move {
            let file = self.open_at(path, offset).await?;
            Ok(Box::new(file) as BoxReader)
        })
    }
}

/// Open `path` and seek to `offset`.
pub async fn open_file_at(path: &Path, offset: u64) -> io::Result<tokio::fs::File> {
    let mut file = tokio::fs::File::open(path).await?;
    if offset > 0 {
        file.seek(io::SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

fn file_info(name: String, meta: &std::fs::Metadata) -> FileInfo {
    let mod_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();
    FileInfo {
        name,
        is_dir: meta.is_dir(),
        size: meta.len(),
        file_mode: mode_string(meta),
        mod_time,
    }
}

#[cfg(unix)]
fn mode_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode();
    let mut out = String::with_capacity(10);
    out.push(if meta.is_dir() { 'd' } else { '-' });
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
fn mode_string(meta: &std::fs::Metadata) -> String {
    let kind = if meta.is_dir() { 'd' } else { '-' };
    let write = if meta.permissions().readonly() { '-' } else { 'w' };
    format!("{kind}r{write}-r--r--")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn fixture() -> (TempDir, AllocDirs) {
        let tmp = TempDir::new().unwrap();
        let alloc = tmp.path().join("a1");
        tokio::fs::create_dir_all(alloc.join(LOG_DIR)).await.unwrap();
        tokio::fs::write(alloc.join("alloc/hello.txt"), b"hello world")
            .await
            .unwrap();
        for (name, body) in [
            ("web.stdout.0", "zero"),
            ("web.stdout.1", "one"),
            ("web.stdout.10", "ten"),
            ("web.stderr.0", "err"),
            ("db.stdout.0", "db"),
        ] {
            tokio::fs::write(alloc.join(LOG_DIR).join(name), body)
                .await
                .unwrap();
        }
        let dirs = AllocDirs::new(tmp.path());
        (tmp, dirs)
    }

    #[test]
    fn test_alloc_id_validation() {
        let dirs = AllocDirs::new("/srv");
        assert!(dirs.alloc_dir("ok-123").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(
                matches!(dirs.alloc_dir(bad), Err(FsError::InvalidAllocId(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_confines_paths() {
        let dir = AllocDirs::new("/srv").alloc_dir("a1").unwrap();
        assert_eq!(
            dir.resolve("/alloc/logs").unwrap(),
            PathBuf::from("/srv/a1/alloc/logs")
        );
        assert_eq!(dir.resolve("/").unwrap(), PathBuf::from("/srv/a1"));
        assert!(matches!(
            dir.resolve("alloc/../../etc/passwd"),
            Err(FsError::Escape(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (_tmp, dirs) = fixture().await;
        let fs = dirs.get_alloc_fs("a1").unwrap();
        let names: Vec<_> = fs
            .list("/alloc")
            .await
            .unwrap()
            .into_iter()
            .map(|f| (f.name, f.is_dir))
            .collect();
        assert_eq!(
            names,
            vec![("hello.txt".to_string(), false), ("logs".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_stat_and_read_at() {
        let (_tmp, dirs) = fixture().await;
        let fs = dirs.get_alloc_fs("a1").unwrap();

        let info = fs.stat("alloc/hello.txt").await.unwrap();
        assert_eq!(info.name, "hello.txt");
        assert_eq!(info.size, 11);
        assert!(!info.is_dir);
        assert_eq!(info.file_mode.len(), 10);

        let mut reader = fs.read_at("alloc/hello.txt", 6).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
    }

    #[tokio::test]
    async fn test_unknown_alloc_and_missing_file() {
        let (_tmp, dirs) = fixture().await;

        let missing = dirs.get_alloc_fs("nope").unwrap();
        let err = missing.stat("/").await.unwrap_err();
        assert!(matches!(err, FsError::UnknownAlloc(_)));
        assert_eq!(CodedError::from(err).code(), 404);

        let fs = dirs.get_alloc_fs("a1").unwrap();
        let err = fs.stat("alloc/missing.txt").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_log_files_by_index() {
        let (_tmp, dirs) = fixture().await;
        let dir = dirs.alloc_dir("a1").unwrap();

        let logs = dir.log_files("web", LogType::Stdout).await.unwrap();
        let indices: Vec<_> = logs.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 10]);
        assert_eq!(logs[2].size, 3);

        let stderr = dir.log_files("web", LogType::Stderr).await.unwrap();
        assert_eq!(stderr.len(), 1);

        let none = dir.log_files("api", LogType::Stdout).await.unwrap();
        assert!(none.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_cannot_leave_the_alloc_dir() {
        let (tmp, dirs) = fixture().await;
        let outside = TempDir::new().unwrap();
        tokio::fs::write(outside.path().join("secret"), b"host-secret")
            .await
            .unwrap();
        let alloc = tmp.path().join("a1");
        std::os::unix::fs::symlink(outside.path(), alloc.join("link")).unwrap();
        std::os::unix::fs::symlink(alloc.join("alloc/hello.txt"), alloc.join("hello-link"))
            .unwrap();

        let dir = dirs.alloc_dir("a1").unwrap();
        for path in ["/link/secret", "link"] {
            assert!(
                matches!(dir.confine(path).await, Err(FsError::Escape(_))),
                "{path} should be rejected"
            );
        }
        assert!(matches!(
            dir.open_at("/link/secret", 0).await,
            Err(FsError::Escape(_))
        ));
        assert!(matches!(dir.list_dir("link").await, Err(FsError::Escape(_))));
        assert!(matches!(dir.stat_path("link/secret").await, Err(FsError::Escape(_))));

        // Links that stay inside the allocation still work.
        let info = dir.stat_path("hello-link").await.unwrap();
        assert_eq!(info.name, "hello-link");
        assert_eq!(info.size, 11);
    }

    #[test]
    fn test_coded_error_mapping() {
        assert_eq!(
            CodedError::from(FsError::Escape("..".into())).code(),
            403
        );
        assert_eq!(
            CodedError::from(FsError::IsDirectory("/alloc".into())).to_string(),
            "file \"/alloc\" is a directory"
        );
    }
}
