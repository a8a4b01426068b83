//! Small-File Disk Cache
//!
//! Keeps whole copies of small remote files under `<cache>/SmallFiles/<id>`.
//! Opening a file that is not on disk yet starts a background download, and
//! readers follow its progress through a shared `DownloadTracker`.
//! Uses LRU eviction when the cache exceeds its byte budget.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::Context;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::downloader::DownloadTracker;
use crate::cloud::CloudBackend;
use crate::error::{FsError, Result};
use crate::fs::FsNode;

/// Default maximum cache size: 1 GB
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

/// Bytes written between two progress publications
const COMMIT_SIZE: u64 = 512 * 1024;

/// Progress notifications for downloads into the cache
#[derive(Debug, Clone)]
pub enum CacheEvent {
    DownloadStarted(Arc<FsNode>),
    DownloadFinished(Arc<FsNode>),
    DownloadFailed(Arc<FsNode>),
}

/// Tracks a cached file's metadata for LRU eviction
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Size accounted for this file
    size: u64,
    /// Last access time (updated on each open)
    last_accessed: Instant,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, CacheEntry>,
    total: u64,
}

/// A cached (or downloading) file handed to a stream
pub struct CachedFile {
    pub node: Arc<FsNode>,
    pub path: PathBuf,
    pub tracker: Arc<DownloadTracker>,
}

pub struct SmallFileCache {
    /// `<cache>/SmallFiles`
    dir: PathBuf,
    /// Maximum total cache size in bytes
    max_size: u64,
    backend: Arc<dyn CloudBackend>,
    /// In-flight downloads by node id
    downloaders: Mutex<HashMap<String, Arc<DownloadTracker>>>,
    registry: Mutex<Registry>,
    /// Open stream count by node id; such files are never evicted
    open_handles: Mutex<HashMap<String, usize>>,
    evicting: AtomicBool,
    events: mpsc::UnboundedSender<CacheEvent>,
}

impl SmallFileCache {
    /// Create the cache under `cache_root/SmallFiles` and account for the
    /// files already there
    pub fn new(
        cache_root: &Path,
        max_size: u64,
        backend: Arc<dyn CloudBackend>,
        events: mpsc::UnboundedSender<CacheEvent>,
    ) -> anyhow::Result<Self> {
        let dir = cache_root.join("SmallFiles");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", dir))?;

        let cache = Self {
            dir,
            max_size,
            backend,
            downloaders: Mutex::new(HashMap::new()),
            registry: Mutex::new(Registry::default()),
            open_handles: Mutex::new(HashMap::new()),
            evicting: AtomicBool::new(false),
            events,
        };
        cache.recalculate();

        info!(
            cache_dir = %cache.dir.display(),
            max_size_mb = max_size / (1024 * 1024),
            total_size = cache.total_size(),
            "Small file cache initialized"
        );
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn total_size(&self) -> u64 {
        self.registry.lock().total
    }

    pub fn entry_count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Open a file for reading, starting (or joining) its download
    pub fn open_read_with_download(self: &Arc<Self>, node: &Arc<FsNode>) -> Result<CachedFile> {
        let tracker = self.start_download(node)?;
        if !self.touch(node.id()) && tracker.is_complete() {
            self.add_existing(node);
        }
        Ok(self.open_with_tracker(node, tracker))
    }

    /// Open a file only if a complete local copy exists (or the node is a
    /// local upload whose bytes are all here)
    pub fn open_read_cached_only(self: &Arc<Self>, node: &Arc<FsNode>) -> Option<CachedFile> {
        let path = self.file_path(node.id());
        let on_disk = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                self.forget(node.id());
                return None;
            }
        };
        if on_disk != node.length() && !node.is_uploading() {
            return None;
        }

        if !self.touch(node.id()) {
            self.add_existing(node);
        }
        trace!(id = %node.id(), "Opened cached file");
        let tracker = Arc::new(DownloadTracker::completed(node.clone(), path));
        Some(self.open_with_tracker(node, tracker))
    }

    /// Open a file for read-write; writes wait for the download to finish
    pub fn open_read_write(self: &Arc<Self>, node: &Arc<FsNode>) -> Result<CachedFile> {
        let tracker = self.start_download(node)?;
        if !self.touch(node.id()) && tracker.is_complete() {
            self.add_existing(node);
        }
        trace!(id = %node.id(), "Opened read-write cached file");
        Ok(self.open_with_tracker(node, tracker))
    }

    fn open_with_tracker(&self, node: &Arc<FsNode>, tracker: Arc<DownloadTracker>) -> CachedFile {
        *self
            .open_handles
            .lock()
            .entry(node.id().to_string())
            .or_insert(0) += 1;
        CachedFile {
            node: node.clone(),
            path: tracker.path().to_path_buf(),
            tracker,
        }
    }

    /// Give back a handle obtained from one of the `open_*` calls
    pub fn release(&self, id: &str) {
        let mut handles = self.open_handles.lock();
        if let Some(count) = handles.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                handles.remove(id);
            }
        }
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.open_handles.lock().contains_key(id)
    }

    /// Return the in-flight tracker for `node`, or register and spawn a new
    /// download. Registration is a single insert-if-absent under one lock.
    fn start_download(self: &Arc<Self>, node: &Arc<FsNode>) -> Result<Arc<DownloadTracker>> {
        let id = node.id().to_string();
        let path = self.file_path(&id);

        let mut downloaders = self.downloaders.lock();
        if let Some(tracker) = downloaders.get(&id) {
            trace!(id = %id, "Joining running download");
            return Ok(tracker.clone());
        }

        let existing = fs::metadata(&path).map(|m| m.len()).ok();
        if existing == Some(node.length()) {
            return Ok(Arc::new(DownloadTracker::completed(node.clone(), path)));
        }

        // Created here so readers can open it before the task runs
        fs::create_dir_all(&self.dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let tracker = Arc::new(DownloadTracker::new(node.clone(), path));
        downloaders.insert(id, tracker.clone());
        drop(downloaders);

        let _ = self.events.send(CacheEvent::DownloadStarted(node.clone()));
        let cache = self.clone();
        let task_tracker = tracker.clone();
        let task_node = node.clone();
        tokio::spawn(async move {
            cache
                .run_download(task_node, tokio::fs::File::from_std(file), task_tracker)
                .await;
        });
        Ok(tracker)
    }

    async fn run_download(
        self: Arc<Self>,
        node: Arc<FsNode>,
        file: tokio::fs::File,
        tracker: Arc<DownloadTracker>,
    ) {
        let started = Instant::now();
        debug!(path = %node.path(), id = %node.id(), "Started download");

        match self.download_into(&node, file, &tracker).await {
            Ok(()) => {
                debug!(
                    path = %node.path(),
                    size = tracker.downloaded(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Finished download"
                );
                self.add_existing(&node);
                let _ = self.events.send(CacheEvent::DownloadFinished(node.clone()));
            }
            Err(e) => {
                error!(path = %node.path(), id = %node.id(), error = %e, "Download failed");
                tracker.fail();
                let _ = self.events.send(CacheEvent::DownloadFailed(node.clone()));
            }
        }

        self.downloaders.lock().remove(node.id());
    }

    /// Append the missing tail of the file, resuming from what is on disk
    async fn download_into(
        &self,
        node: &FsNode,
        mut file: tokio::fs::File,
        tracker: &DownloadTracker,
    ) -> Result<()> {
        let length = node.length();
        let mut written = file.metadata().await?.len();
        if written > length {
            warn!(id = %node.id(), on_disk = written, length = length, "Cached file longer than node, restarting");
            file.set_len(0).await?;
            written = 0;
        }
        if written > 0 {
            debug!(id = %node.id(), offset = written, "Resuming download");
        }
        tracker.advance(written);

        while written < length {
            let pass_start = written;
            let mut stream = self.backend.download(node.id(), written, None).await?;
            let mut uncommitted = 0u64;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let take = (chunk.len() as u64).min(length - written) as usize;
                file.write_all(&chunk[..take]).await?;
                written += take as u64;
                uncommitted += take as u64;
                if uncommitted >= COMMIT_SIZE {
                    file.flush().await?;
                    tracker.advance(written);
                    uncommitted = 0;
                }
                if written == length {
                    break;
                }
            }
            file.flush().await?;
            tracker.advance(written);

            if written == pass_start {
                return Err(FsError::DownloadFailed(format!(
                    "no bytes received for {} at offset {}",
                    node.path(),
                    written
                )));
            }
        }
        Ok(())
    }

    /// Put a file written by an upload stream into the cache as a hard link
    pub fn add_as_link(self: &Arc<Self>, node: &Arc<FsNode>, source: &Path) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let target = self.file_path(node.id());
        if let Err(e) = fs::hard_link(source, &target) {
            debug!(error = %e, "Hard link failed, copying instead");
            fs::copy(source, &target)?;
        }
        self.add_existing(node);
        Ok(())
    }

    /// Account for a file that is already in the cache directory
    pub fn add_existing(self: &Arc<Self>, node: &FsNode) {
        let over_budget = {
            let mut registry = self.registry.lock();
            if registry.entries.contains_key(node.id()) {
                return;
            }
            let size = node.length();
            registry.entries.insert(
                node.id().to_string(),
                CacheEntry {
                    size,
                    last_accessed: Instant::now(),
                },
            );
            registry.total += size;
            registry.total > self.max_size
        };
        if over_budget {
            self.evict_in_background();
        }
    }

    /// Re-read the on-disk size of a file after it was modified in place
    pub fn refresh(&self, id: &str) {
        let size = match fs::metadata(self.file_path(id)) {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        let mut registry = self.registry.lock();
        let old = match registry.entries.get_mut(id) {
            Some(entry) => std::mem::replace(&mut entry.size, size),
            None => return,
        };
        match registry.total.checked_sub(old) {
            Some(rest) => registry.total = rest + size,
            None => {
                drop(registry);
                error!(id = id, "Small file cache accounting underflow on refresh");
                self.recalculate();
            }
        }
    }

    /// Move the staging file of a finished upload into the cache under the
    /// backend id
    pub fn move_to_cache(self: &Arc<Self>, staging: &Path, node: &FsNode) {
        let target = self.file_path(node.id());
        let result = if target.exists() {
            fs::remove_file(staging)
        } else {
            fs::rename(staging, &target).map(|_| self.add_existing(node))
        };
        if let Err(e) = result {
            error!(id = %node.id(), staging = %staging.display(), error = %e, "Failed to move upload into cache");
        }
    }

    pub fn delete(&self, node: &FsNode) {
        self.delete_id(node.id());
    }

    pub fn delete_id(&self, id: &str) {
        let path = self.file_path(id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id = id, error = %e, "Could not delete small file in cache");
                return;
            }
        }
        self.forget(id);
    }

    /// Drop the registry entry of `id` and subtract its size
    fn forget(&self, id: &str) {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.entries.remove(id) else {
            return;
        };
        match registry.total.checked_sub(entry.size) {
            Some(total) => registry.total = total,
            None => {
                drop(registry);
                let err = FsError::CacheCorruption(format!(
                    "total size underflow removing {} ({} bytes)",
                    id, entry.size
                ));
                error!(error = %err, "Recalculating small file cache");
                self.recalculate();
            }
        }
    }

    fn touch(&self, id: &str) -> bool {
        match self.registry.lock().entries.get_mut(id) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Rebuild the registry from the files in the cache directory
    pub fn recalculate(&self) {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot scan small file cache");
                return;
            }
        };

        let mut registry = self.registry.lock();
        let mut fresh = Registry::default();
        for entry in read_dir.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let last_accessed = registry
                .entries
                .get(&id)
                .map(|e| e.last_accessed)
                .unwrap_or_else(|| age_as_instant(meta.accessed().ok()));
            fresh.total += meta.len();
            fresh.entries.insert(
                id,
                CacheEntry {
                    size: meta.len(),
                    last_accessed,
                },
            );
        }
        *registry = fresh;
        debug!(files = registry.entries.len(), total = registry.total, "Recalculated small file cache");
    }

    /// Delete every cached file that is not open, best effort
    pub fn clear(&self) -> Result<()> {
        let mut failed = 0;
        if let Ok(read_dir) = fs::read_dir(&self.dir) {
            for entry in read_dir.flatten() {
                let id = entry.file_name().to_string_lossy().into_owned();
                if self.is_open(&id) || self.downloaders.lock().contains_key(&id) {
                    failed += 1;
                    continue;
                }
                if let Err(e) = fs::remove_file(entry.path()) {
                    debug!(path = %entry.path().display(), error = %e, "Could not delete cached file");
                    failed += 1;
                }
            }
        }
        self.recalculate();

        if failed > 0 {
            warn!(failed = failed, "Can not delete all cached files, some are still in use");
            return Err(FsError::CacheClearIncomplete { failed });
        }
        info!("Cleared small file cache");
        Ok(())
    }

    fn evict_in_background(self: &Arc<Self>) {
        if self.evicting.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = self.clone();
        let job = move || {
            cache.evict();
            cache.evicting.store(false, Ordering::Release);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    /// Evict least recently used files until the cache fits its budget.
    /// Returns the number of bytes freed.
    pub fn evict(&self) -> u64 {
        let mut sorted: Vec<(String, CacheEntry)> = {
            let registry = self.registry.lock();
            if registry.total <= self.max_size {
                return 0;
            }
            info!(
                total_mb = registry.total / (1024 * 1024),
                max_mb = self.max_size / (1024 * 1024),
                "Cache exceeds max size, evicting LRU entries"
            );
            registry
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        sorted.sort_by(|a, b| a.1.last_accessed.cmp(&b.1.last_accessed));

        let mut freed = 0;
        for (id, entry) in sorted {
            if self.total_size() <= self.max_size {
                break;
            }
            if self.is_open(&id) {
                trace!(id = %id, "Skipping open file during eviction");
                continue;
            }
            match fs::remove_file(self.file_path(&id)) {
                Ok(()) => {
                    debug!(id = %id, size = entry.size, "Evicted cached file");
                    freed += entry.size;
                    self.forget(&id);
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to evict cached file");
                }
            }
        }
        freed
    }
}

/// Map a file's last access time onto the monotonic clock
fn age_as_instant(accessed: Option<SystemTime>) -> Instant {
    let now = Instant::now();
    accessed
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .and_then(|age| now.checked_sub(age))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MemoryCloud, NodeInfo};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(max: u64) -> (TempDir, Arc<MemoryCloud>, Arc<SmallFileCache>, mpsc::UnboundedReceiver<CacheEvent>) {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new("mem"));
        let (tx, rx) = mpsc::unbounded_channel();
        let cache = SmallFileCache::new(dir.path(), max, cloud.clone(), tx).unwrap();
        (dir, cloud, Arc::new(cache), rx)
    }

    fn node_for(info: &NodeInfo) -> Arc<FsNode> {
        Arc::new(FsNode::from_info(info, "/"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_fills_cache() {
        let (_dir, cloud, cache, mut rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let data: Vec<u8> = (0..1_300_000u32).map(|i| (i % 241) as u8).collect();
        let info = cloud.add_file(cloud.root_id(), "f.bin", &data);
        let node = node_for(&info);

        let file = cache.open_read_with_download(&node).unwrap();
        file.tracker
            .wait_to_end(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(fs::read(&file.path).unwrap(), data);
        assert!(matches!(rx.recv().await, Some(CacheEvent::DownloadStarted(_))));
        assert!(matches!(rx.recv().await, Some(CacheEvent::DownloadFinished(_))));
        assert_eq!(cache.total_size(), data.len() as u64);
        cache.release(node.id());

        // Second open is served from disk without a download
        let again = cache.open_read_cached_only(&node).unwrap();
        assert!(again.tracker.is_complete());
        assert_eq!(cloud.call_count("download"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_opens_share_one_download() {
        let (_dir, cloud, cache, _rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let info = cloud.add_file(cloud.root_id(), "f", &vec![7u8; 100_000]);
        let node = node_for(&info);

        let a = cache.open_read_with_download(&node).unwrap();
        let b = cache.open_read_with_download(&node).unwrap();
        a.tracker.wait_to_end(Duration::from_secs(10)).await.unwrap();
        b.tracker.wait_to_end(Duration::from_secs(10)).await.unwrap();
        assert_eq!(cloud.call_count("download"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_file_resumes() {
        let (_dir, cloud, cache, _rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
        let info = cloud.add_file(cloud.root_id(), "f", &data);
        let node = node_for(&info);
        fs::write(cache.file_path(node.id()), &data[..20_000]).unwrap();

        let file = cache.open_read_with_download(&node).unwrap();
        file.tracker.wait_to_end(Duration::from_secs(10)).await.unwrap();
        assert_eq!(fs::read(&file.path).unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_download_releases_readers() {
        let (_dir, cloud, cache, mut rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let mut info = cloud.add_file(cloud.root_id(), "f", b"abc");
        info.length = 10;
        let node = node_for(&info);

        let file = cache.open_read_with_download(&node).unwrap();
        let err = file
            .tracker
            .wait_to_end(Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::DownloadFailed(_)));
        rx.recv().await;
        assert!(matches!(rx.recv().await, Some(CacheEvent::DownloadFailed(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cached_only_requires_full_length() {
        let (_dir, cloud, cache, _rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let info = cloud.add_file(cloud.root_id(), "f", b"0123456789");
        let node = node_for(&info);
        assert!(cache.open_read_cached_only(&node).is_none());

        fs::write(cache.file_path(node.id()), b"01234").unwrap();
        assert!(cache.open_read_cached_only(&node).is_none());

        fs::write(cache.file_path(node.id()), b"0123456789").unwrap();
        assert!(cache.open_read_cached_only(&node).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eviction_skips_open_files() {
        let (_dir, cloud, cache, _rx) = setup(250);
        let mut nodes = Vec::new();
        for name in ["a", "b", "c"] {
            let info = cloud.add_file(cloud.root_id(), name, &[1u8; 100]);
            let node = node_for(&info);
            fs::write(cache.file_path(node.id()), [1u8; 100]).unwrap();
            nodes.push(node);
        }

        // "a" is the oldest but stays open
        let open = cache.open_read_cached_only(&nodes[0]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.open_read_cached_only(&nodes[1]).unwrap();
        cache.release(nodes[1].id());
        std::thread::sleep(Duration::from_millis(5));
        cache.open_read_cached_only(&nodes[2]).unwrap();
        cache.release(nodes[2].id());

        // Background eviction may already have run
        cache.evict();
        assert!(cache.total_size() <= 250);
        assert!(open.path.exists());
        assert!(!cache.file_path(nodes[1].id()).exists());
        assert!(cache.file_path(nodes[2].id()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_clear_reports_files_in_use() {
        let (_dir, cloud, cache, _rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let a = node_for(&cloud.add_file(cloud.root_id(), "a", b"aa"));
        let b = node_for(&cloud.add_file(cloud.root_id(), "b", b"bb"));
        fs::write(cache.file_path(a.id()), b"aa").unwrap();
        fs::write(cache.file_path(b.id()), b"bb").unwrap();
        let _held = cache.open_read_cached_only(&a).unwrap();

        let err = cache.clear().unwrap_err();
        assert!(matches!(err, FsError::CacheClearIncomplete { failed: 1 }));
        assert_eq!(cache.total_size(), 2);

        cache.release(a.id());
        cache.clear().unwrap();
        assert_eq!(cache.total_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_to_cache_and_delete() {
        let (dir, cloud, cache, _rx) = setup(DEFAULT_MAX_CACHE_SIZE);
        let node = node_for(&cloud.add_file(cloud.root_id(), "a", b"hello"));
        let staging = dir.path().join("staging");
        fs::write(&staging, b"hello").unwrap();

        cache.move_to_cache(&staging, &node);
        assert!(!staging.exists());
        assert_eq!(fs::read(cache.file_path(node.id())).unwrap(), b"hello");
        assert_eq!(cache.total_size(), 5);

        cache.delete(&node);
        assert_eq!(cache.total_size(), 0);
        assert!(!cache.file_path(node.id()).exists());
    }
}
