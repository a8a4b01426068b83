//! Download progress tracking
//!
//! A `DownloadTracker` is shared between the single task writing a file into
//! the small-file cache and every reader of that file. Readers block in
//! `wait_until` until the bytes they need are on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

use crate::error::{FsError, Result};
use crate::fs::FsNode;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    downloaded: u64,
    failed: bool,
}

pub struct DownloadTracker {
    node: Arc<FsNode>,
    path: PathBuf,
    expected: u64,
    progress: watch::Sender<Progress>,
}

impl DownloadTracker {
    /// Tracker for a download that has not written anything yet
    pub fn new(node: Arc<FsNode>, path: PathBuf) -> Self {
        let expected = node.length();
        let (progress, _) = watch::channel(Progress::default());
        Self {
            node,
            path,
            expected,
            progress,
        }
    }

    /// Tracker for a file that is already fully on disk
    pub fn completed(node: Arc<FsNode>, path: PathBuf) -> Self {
        let tracker = Self::new(node, path);
        tracker.advance(tracker.expected);
        tracker
    }

    pub fn node(&self) -> &Arc<FsNode> {
        &self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expected_length(&self) -> u64 {
        self.expected
    }

    pub fn downloaded(&self) -> u64 {
        self.progress.borrow().downloaded
    }

    pub fn is_failed(&self) -> bool {
        self.progress.borrow().failed
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded() >= self.expected
    }

    /// Publish a new downloaded byte count; values that do not grow are ignored
    pub fn advance(&self, downloaded: u64) {
        let changed = self.progress.send_if_modified(|p| {
            if p.failed || downloaded <= p.downloaded {
                return false;
            }
            p.downloaded = downloaded;
            true
        });
        if changed {
            trace!(id = %self.node.id(), downloaded = downloaded, "Download progress");
        }
    }

    /// Mark the download as failed and release every waiter
    pub fn fail(&self) {
        self.progress.send_if_modified(|p| {
            if p.failed {
                return false;
            }
            p.failed = true;
            true
        });
    }

    /// Wait until the byte at `offset` is on disk, or the file is complete
    pub async fn wait_until(&self, offset: u64, timeout: Duration) -> Result<()> {
        let expected = self.expected;
        self.wait(timeout, move |p| p.downloaded > offset || p.downloaded >= expected)
            .await
    }

    /// Wait until the whole file is on disk
    pub async fn wait_to_end(&self, timeout: Duration) -> Result<()> {
        let expected = self.expected;
        self.wait(timeout, move |p| p.downloaded >= expected).await
    }

    async fn wait<F>(&self, timeout: Duration, reached: F) -> Result<()>
    where
        F: Fn(&Progress) -> bool,
    {
        let mut rx = self.progress.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|p| p.failed || reached(p))).await;
        let progress = match outcome {
            Err(_) => {
                return Err(FsError::Timeout(format!(
                    "waiting for download of {}",
                    self.node.path()
                )))
            }
            // The sender is owned by self, so the channel cannot close here
            Ok(Err(_)) => return Err(FsError::DownloadFailed(self.node.path())),
            Ok(Ok(progress)) => *progress,
        };
        if reached(&progress) {
            Ok(())
        } else {
            Err(FsError::DownloadFailed(self.node.path()))
        }
    }
}
