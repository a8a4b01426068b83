//! Open file streams
//!
//! Every successful `FsProvider::open` hands out a `BlockStream`. The variant
//! decides where bytes come from and what closing it means:
//!
//! - `ReadOnly`: small-file cache copy, possibly still downloading
//! - `ReadWrite`: small-file cache copy that becomes an overwrite when dirty
//! - `New`: upload staging file of a new or truncated file
//! - `Remote`: block-cached ranged reads of a large remote file
//! - `Dummy`: directories

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

use super::FsNode;
use crate::cache::{BlockReader, CachedFile, DownloadTracker};
use crate::error::{FsError, Result};
use crate::upload::StagingFile;

/// Local file behind a stream
pub struct LocalFile {
    node: Arc<FsNode>,
    path: PathBuf,
    tracker: Option<Arc<DownloadTracker>>,
    /// `None` once the stream is closed
    file: Mutex<Option<File>>,
    dirty: AtomicBool,
    /// Staging file replaces an existing node rather than creating one
    overwrite: bool,
}

impl LocalFile {
    fn from_cached(cached: CachedFile, writable: bool) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&cached.path)?;
        Ok(Self {
            node: cached.node,
            path: cached.path,
            tracker: Some(cached.tracker),
            file: Mutex::new(Some(File::from_std(file))),
            dirty: AtomicBool::new(false),
            overwrite: false,
        })
    }

    fn from_staging(node: Arc<FsNode>, staging: StagingFile, overwrite: bool) -> Self {
        Self {
            node,
            path: staging.path,
            tracker: None,
            file: Mutex::new(Some(File::from_std(staging.file))),
            dirty: AtomicBool::new(false),
            overwrite,
        }
    }

    async fn lock(&self, timeout: Duration) -> Result<tokio::sync::MutexGuard<'_, Option<File>>> {
        tokio::time::timeout(timeout, self.file.lock())
            .await
            .map_err(|_| FsError::Timeout(format!("stream lock on {}", self.node.path())))
    }

    async fn read(&self, offset: u64, length: usize, timeout: Duration) -> Result<Bytes> {
        let file_len = self.node.length();
        if length == 0 || offset >= file_len {
            return Ok(Bytes::new());
        }
        let end = (offset + length as u64).min(file_len);
        if let Some(tracker) = &self.tracker {
            if !tracker.is_complete() {
                tracker.wait_until(end - 1, timeout).await?;
            }
        }

        let mut guard = self.lock(timeout).await?;
        let file = guard.as_mut().ok_or(FsError::StreamClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; (end - offset) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.node.touch_accessed();
        Ok(Bytes::from(buf))
    }

    /// Writes into a cache copy must not race the download appending to it
    async fn wait_downloaded(&self, timeout: Duration) -> Result<()> {
        match &self.tracker {
            Some(tracker) => tracker.wait_to_end(timeout).await,
            None => Ok(()),
        }
    }

    async fn write(&self, offset: u64, data: &[u8], timeout: Duration) -> Result<usize> {
        self.wait_downloaded(timeout).await?;
        let mut guard = self.lock(timeout).await?;
        let file = guard.as_mut().ok_or(FsError::StreamClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        let end = offset + data.len() as u64;
        if end > self.node.length() {
            self.node.set_length(end);
        } else {
            self.node.touch_modified();
        }
        self.dirty.store(true, Ordering::Release);
        trace!(path = %self.node.path(), offset = offset, size = data.len(), "Wrote to stream");
        Ok(data.len())
    }

    async fn set_length(&self, length: u64, timeout: Duration) -> Result<()> {
        self.wait_downloaded(timeout).await?;
        let mut guard = self.lock(timeout).await?;
        let file = guard.as_mut().ok_or(FsError::StreamClosed)?;
        file.set_len(length).await?;
        self.node.set_length(length);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Flush and drop the handle; false if it was already closed
    async fn close(&self, sync: bool) -> Result<bool> {
        let mut guard = self.file.lock().await;
        let Some(mut file) = guard.take() else {
            return Ok(false);
        };
        file.flush().await?;
        if sync {
            file.sync_all().await?;
        }
        trace!(path = %self.node.path(), file = %self.path.display(), "Closed stream");
        Ok(true)
    }
}

pub struct RemoteFile {
    reader: BlockReader,
    closed: AtomicBool,
}

pub enum BlockStream {
    ReadOnly(LocalFile),
    ReadWrite(LocalFile),
    New(LocalFile),
    Remote(RemoteFile),
    Dummy(Arc<FsNode>),
}

impl BlockStream {
    pub(crate) fn read_only(cached: CachedFile) -> std::io::Result<Self> {
        Ok(BlockStream::ReadOnly(LocalFile::from_cached(cached, false)?))
    }

    pub(crate) fn read_write(cached: CachedFile) -> std::io::Result<Self> {
        Ok(BlockStream::ReadWrite(LocalFile::from_cached(cached, true)?))
    }

    pub(crate) fn new_file(node: Arc<FsNode>, staging: StagingFile, overwrite: bool) -> Self {
        BlockStream::New(LocalFile::from_staging(node, staging, overwrite))
    }

    pub(crate) fn remote(reader: BlockReader) -> Self {
        BlockStream::Remote(RemoteFile {
            reader,
            closed: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> &Arc<FsNode> {
        match self {
            BlockStream::ReadOnly(f) | BlockStream::ReadWrite(f) | BlockStream::New(f) => &f.node,
            BlockStream::Remote(r) => r.reader.node(),
            BlockStream::Dummy(node) => node,
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            BlockStream::ReadWrite(f) | BlockStream::New(f) => f.dirty.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Whether a `New` stream replaces an existing node
    pub fn is_overwrite(&self) -> bool {
        matches!(self, BlockStream::New(f) if f.overwrite)
    }

    /// Read up to `length` bytes at `offset`; an empty result means EOF
    pub async fn read(&self, offset: u64, length: usize, timeout: Duration) -> Result<Bytes> {
        match self {
            BlockStream::ReadOnly(f) | BlockStream::ReadWrite(f) | BlockStream::New(f) => {
                f.read(offset, length, timeout).await
            }
            BlockStream::Remote(r) => {
                if r.closed.load(Ordering::Acquire) {
                    return Err(FsError::StreamClosed);
                }
                r.reader.read(offset, length, timeout).await
            }
            BlockStream::Dummy(_) => Ok(Bytes::new()),
        }
    }

    pub async fn write(&self, offset: u64, data: &[u8], timeout: Duration) -> Result<usize> {
        match self {
            BlockStream::ReadWrite(f) | BlockStream::New(f) => f.write(offset, data, timeout).await,
            BlockStream::Dummy(node) => Err(FsError::IsADirectory(node.path())),
            _ => Err(FsError::AccessDenied(format!(
                "{} is open read-only",
                self.node().path()
            ))),
        }
    }

    pub async fn set_length(&self, length: u64, timeout: Duration) -> Result<()> {
        match self {
            BlockStream::ReadWrite(f) | BlockStream::New(f) => f.set_length(length, timeout).await,
            BlockStream::Dummy(node) => Err(FsError::IsADirectory(node.path())),
            _ => Err(FsError::AccessDenied(format!(
                "{} is open read-only",
                self.node().path()
            ))),
        }
    }

    pub async fn flush(&self) -> Result<()> {
        match self {
            BlockStream::ReadWrite(f) | BlockStream::New(f) => f.flush().await,
            _ => Ok(()),
        }
    }

    /// Release the underlying handle. Returns false when the stream was
    /// already closed.
    pub(crate) async fn close_handle(&self) -> Result<bool> {
        match self {
            BlockStream::ReadOnly(f) => f.close(false).await,
            BlockStream::ReadWrite(f) | BlockStream::New(f) => f.close(true).await,
            BlockStream::Remote(r) => Ok(!r.closed.swap(true, Ordering::AcqRel)),
            BlockStream::Dummy(_) => Ok(true),
        }
    }
}
