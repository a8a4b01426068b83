//! Filesystem provider
//!
//! `FsProvider` turns the node API of a `CloudBackend` into path-based
//! filesystem operations. Metadata goes through the `TreeCache`, file bytes
//! through the small-file cache, block readers or upload staging files, and
//! every write ends up as a background upload.
//!
//! A driver binding calls these async methods and maps `FsError` to OS status
//! codes with `FsError::class()` / `FsError::to_errno()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::path;
use super::stream::BlockStream;
use super::FsNode;
use crate::cache::{BlockReader, CacheEvent, CachedFile, SmallFileCache, TreeCache};
use crate::cloud::{CloudBackend, SpaceInfo};
use crate::config::ProviderConfig;
use crate::error::{FsError, Result, UploadFailure};
use crate::upload::{UploadEvent, UploadRecord, UploadService};

/// Poll interval while waiting for an uploading node to become real
const WAIT_FOR_REAL_POLL: Duration = Duration::from_millis(200);

/// How an open call treats an existing or missing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the file exists
    CreateNew,
    /// Create or truncate
    Create,
    /// Truncate an existing file
    Truncate,
    Open,
    OpenOrCreate,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// Snapshot of the provider's caches and pipelines
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub tree_hits: u64,
    pub tree_misses: u64,
    pub tree_hit_rate: f64,
    pub cached_nodes: u64,
    pub cached_dirs: u64,
    pub small_files_size: u64,
    pub small_files_count: usize,
    pub uploads_pending: usize,
    pub uploads_running: usize,
    pub uploads_finished: u64,
    pub uploads_failed: u64,
    pub downloads_started: u64,
    pub downloads_finished: u64,
    pub downloads_failed: u64,
}

#[derive(Default)]
struct Counters {
    uploads_finished: AtomicU64,
    uploads_failed: AtomicU64,
    downloads_started: AtomicU64,
    downloads_finished: AtomicU64,
    downloads_failed: AtomicU64,
}

pub struct FsProvider {
    config: ProviderConfig,
    backend: Arc<dyn CloudBackend>,
    tree: Arc<TreeCache>,
    small_files: Arc<SmallFileCache>,
    uploads: Arc<UploadService>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl FsProvider {
    /// Build the caches and the upload service, resume uploads left by a
    /// previous run and start the background tasks. Must be called within a
    /// Tokio runtime.
    pub fn new(config: ProviderConfig, backend: Arc<dyn CloudBackend>) -> anyhow::Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_path)
            .with_context(|| format!("Failed to create cache path: {:?}", config.cache_path))?;

        let shutdown = CancellationToken::new();
        let (cache_tx, cache_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        let tree = Arc::new(TreeCache::with_ttls(config.node_ttl(), config.dir_ttl()));
        let small_files = Arc::new(SmallFileCache::new(
            &config.cache_path,
            config.small_files_cache_size,
            backend.clone(),
            cache_tx,
        )?);
        let uploads = UploadService::start(
            &config.cache_path,
            backend.clone(),
            config.upload_concurrency,
            config.reupload_delay(),
            upload_tx,
            shutdown.child_token(),
        )?;
        let counters = Arc::new(Counters::default());

        let recovered = uploads
            .recover()
            .context("Failed to scan pending uploads")?;
        let mut records = Vec::with_capacity(recovered.len());
        for (record, node) in recovered {
            debug!(path = %record.path, id = %record.id, "Registering resumed upload");
            tree.put_node(node);
            records.push(record);
        }
        uploads.enqueue_recovered(records);

        let events = EventHandler {
            tree: tree.clone(),
            small_files: small_files.clone(),
            counters: counters.clone(),
        };
        tokio::spawn(events.run(upload_rx, cache_rx, shutdown.clone()));
        tokio::spawn(sweep(tree.clone(), config.sweep_interval(), shutdown.clone()));

        info!(
            backend = backend.id(),
            cache_path = %config.cache_path.display(),
            "Filesystem provider initialized"
        );
        Ok(Self {
            config,
            backend,
            tree,
            small_files,
            uploads,
            counters,
            shutdown,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Resolve a path to its node, `None` if nothing exists there
    pub async fn fetch_node(&self, path: &str) -> Result<Option<Arc<FsNode>>> {
        let path = path::normalize(path);
        if path::is_root(&path) {
            let info = self.backend.get_root().await?;
            return Ok(Some(Arc::new(FsNode::at_path(&info, path))));
        }
        if let Some(node) = self.tree.get_node(&path) {
            return Ok((!node.is_not_existing()).then_some(node));
        }

        // Walk up to the nearest cached ancestor
        let mut names = Vec::new();
        let mut current = path.as_str();
        let mut base = None;
        loop {
            names.push(path::name(current).to_string());
            current = path::parent(current);
            if path::is_root(current) {
                break;
            }
            if let Some(node) = self.tree.get_node(current) {
                base = Some(node);
                break;
            }
        }
        let mut item = match base {
            Some(node) if node.is_not_existing() || !node.is_dir() => return Ok(None),
            Some(node) => node,
            None => {
                let info = self.backend.get_root().await?;
                Arc::new(FsNode::at_path(&info, path::ROOT.to_string()))
            }
        };

        // And back down, one lookup per missing level
        let mut dir = current.to_string();
        for name in names.iter().rev() {
            let child_path = path::join(&dir, name);
            match self.backend.get_child(item.id(), name).await? {
                Some(info) => {
                    let node = Arc::new(FsNode::from_info(&info, &dir));
                    self.tree.put_node(node.clone());
                    item = node;
                    dir = child_path;
                }
                None => {
                    debug!(path = %child_path, "Caching missing path");
                    self.tree
                        .put_node_only(Arc::new(FsNode::not_existing(child_path)));
                    return Ok(None);
                }
            }
        }
        Ok(Some(item))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.fetch_node(path).await?.is_some())
    }

    /// Children of a directory, sorted by path
    pub async fn list_dir(&self, path: &str) -> Result<Vec<Arc<FsNode>>> {
        let path = path::normalize(path);
        if let Some(children) = self.tree.get_dir(&path) {
            let fetched = join_all(children.iter().map(|child| self.fetch_node(child))).await;
            let mut nodes = Vec::with_capacity(fetched.len());
            for node in fetched {
                if let Some(node) = node? {
                    nodes.push(node);
                }
            }
            return Ok(nodes);
        }

        let dir = self
            .fetch_node(&path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path));
        }

        let infos = self.backend.get_children(dir.id()).await?;
        let mut nodes: Vec<Arc<FsNode>> = infos
            .iter()
            .map(|info| {
                let child = path::join(&path, &info.name);
                // Keep nodes with an upload in flight; the backend copy is stale
                match self.tree.get_node(&child) {
                    Some(node) if node.is_uploading() => node,
                    _ => Arc::new(FsNode::from_info(info, &path)),
                }
            })
            .collect();
        for pending in self.tree.uploading_children(&path) {
            if !nodes.iter().any(|n| n.path() == pending.path()) {
                nodes.push(pending);
            }
        }
        self.tree.put_dir_listing(&path, nodes.clone());

        let mut sorted = nodes;
        sorted.sort_by_key(|n| n.path());
        Ok(sorted)
    }

    pub async fn create_dir(&self, path: &str) -> Result<Arc<FsNode>> {
        let path = path::normalize(path);
        if path::is_root(&path) || self.fetch_node(&path).await?.is_some() {
            return Err(FsError::AlreadyExists(path));
        }
        let parent_path = path::parent(&path);
        let parent = self.require_dir(parent_path).await?;

        let info = self
            .backend
            .create_folder(parent.id(), path::name(&path))
            .await?;
        let node = Arc::new(FsNode::from_info(&info, parent_path));
        self.tree.put_node(node.clone());
        info!(path = %path, id = %node.id(), "Created directory");
        Ok(node)
    }

    pub async fn open(&self, path: &str, mode: OpenMode, access: Access) -> Result<BlockStream> {
        let path = path::normalize(path);
        let node = self.fetch_node(&path).await?;

        if access == Access::Read {
            let node = node.ok_or_else(|| FsError::NotFound(path.clone()))?;
            return self.open_read(node).await;
        }

        if let Some(node) = &node {
            if node.is_dir() {
                return Err(FsError::IsADirectory(path));
            }
            if mode == OpenMode::CreateNew {
                return Err(FsError::AlreadyExists(path));
            }
        }

        let node = match node {
            // Empty local leftovers are replaced by a fresh upload
            Some(node) if node.length() > 0 || !node.is_local() => node,
            leftover => {
                if let Some(old) = leftover {
                    self.small_files.delete(&old);
                }
                return self.open_new(&path).await;
            }
        };

        let node = self.wait_for_real(node).await?;
        if node.length() == 0 || matches!(mode, OpenMode::Create | OpenMode::Truncate) {
            return self.open_truncate(node).await;
        }
        if node.length() >= self.config.small_file_size_limit {
            return Err(FsError::AccessDenied(format!(
                "{} is too big to be opened for writing",
                path
            )));
        }
        let cached = self.small_files.open_read_write(&node)?;
        let id = node.id().to_string();
        BlockStream::read_write(cached).map_err(|e| {
            self.small_files.release(&id);
            e.into()
        })
    }

    async fn open_read(&self, node: Arc<FsNode>) -> Result<BlockStream> {
        if node.is_dir() {
            return Ok(BlockStream::Dummy(node));
        }
        if !node.is_uploading() && node.length() < self.config.small_file_size_limit {
            debug!(path = %node.path(), "Opening small file");
            let cached = self.small_files.open_read_with_download(&node)?;
            return self.read_only(node.id(), cached);
        }
        if let Some(cached) = self.small_files.open_read_cached_only(&node) {
            debug!(path = %node.path(), "Opening cached copy");
            return self.read_only(node.id(), cached);
        }

        let node = self.wait_for_real(node).await?;
        debug!(path = %node.path(), size = node.length(), "Opening remote stream");
        Ok(BlockStream::remote(BlockReader::new(
            node,
            self.backend.clone(),
            self.config.block_size,
            self.config.block_cache_blocks,
            self.config.read_lock_timeout(),
        )))
    }

    fn read_only(&self, id: &str, cached: CachedFile) -> Result<BlockStream> {
        BlockStream::read_only(cached).map_err(|e| {
            self.small_files.release(id);
            e.into()
        })
    }

    /// Stream for a file that does not exist on the backend yet
    async fn open_new(&self, path: &str) -> Result<BlockStream> {
        let parent = self.require_dir(path::parent(path)).await?;
        let node = Arc::new(FsNode::uploading(path.to_string(), parent.id(), 0));
        let staging = self.uploads.open_new(&node)?;
        self.small_files.add_as_link(&node, &staging.path)?;
        self.tree.put_node(node.clone());
        info!(path = %path, id = %node.id(), "Created new file");
        Ok(BlockStream::new_file(node, staging, false))
    }

    /// Stream that replaces the whole content of an existing backend file
    async fn open_truncate(&self, node: Arc<FsNode>) -> Result<BlockStream> {
        node.set_length(0);
        self.small_files.delete(&node);
        node.set_uploading(true);
        self.tree.update_node(node.clone());

        let staging = self.uploads.open_truncate(&node)?;
        self.small_files.add_as_link(&node, &staging.path)?;
        debug!(path = %node.path(), id = %node.id(), "Truncated file for overwrite");
        Ok(BlockStream::new_file(node, staging, true))
    }

    /// Finish a stream. Written content is queued for upload. Closing a
    /// stream twice is a no-op.
    pub async fn close(&self, stream: &BlockStream) -> Result<()> {
        if !stream.close_handle().await? {
            return Ok(());
        }
        let node = stream.node();
        match stream {
            BlockStream::New(_) => {
                self.small_files.refresh(node.id());
                if stream.is_overwrite() {
                    self.uploads.enqueue_overwrite(node)?;
                } else {
                    self.uploads.enqueue_new(node)?;
                }
            }
            BlockStream::ReadWrite(_) => {
                self.small_files.release(node.id());
                if stream.is_dirty() {
                    self.small_files.refresh(node.id());
                    node.set_uploading(true);
                    self.tree.update_node(node.clone());
                    self.uploads
                        .stage_existing(node.id(), &self.small_files.file_path(node.id()))?;
                    self.uploads.enqueue_overwrite(node)?;
                }
            }
            BlockStream::ReadOnly(_) => self.small_files.release(node.id()),
            BlockStream::Remote(_) | BlockStream::Dummy(_) => {}
        }
        debug!(path = %node.path(), "Closed stream");
        Ok(())
    }

    /// Rename and/or move a file or directory
    pub async fn move_path(&self, old_path: &str, new_path: &str, replace: bool) -> Result<()> {
        let old_path = path::normalize(old_path);
        let new_path = path::normalize(new_path);
        if old_path == new_path {
            return Ok(());
        }
        if path::is_root(&old_path) || path::is_descendant(&new_path, &old_path) {
            return Err(FsError::AccessDenied(format!(
                "cannot move {} to {}",
                old_path, new_path
            )));
        }

        let node = self
            .fetch_node(&old_path)
            .await?
            .ok_or_else(|| FsError::NotFound(old_path.clone()))?;
        let existing = self.fetch_node(&new_path).await?;
        if existing.is_some() && !replace {
            return Err(FsError::AlreadyExists(new_path));
        }
        let node = self.wait_for_real(node).await?;

        let old_dir = path::parent(&old_path).to_string();
        let new_dir = path::parent(&new_path).to_string();
        let new_name = path::name(&new_path);
        let target = self.require_dir(&new_dir).await?;
        let source = if old_dir != new_dir {
            Some(self.require_dir(&old_dir).await?)
        } else {
            None
        };

        // The destination goes only once the source is ready to take its place
        if let Some(existing) = existing {
            if existing.is_dir() {
                self.delete_dir(&new_path).await?;
            } else {
                self.delete_file(&new_path).await?;
            }
        }

        let moved = if node.is_local() {
            // Never reached the backend
            node.set_path(new_path.clone());
            node.set_parent_ids(vec![target.id().to_string()]);
            node
        } else {
            let mut moved = node.clone();
            if path::name(&old_path) != new_name {
                let info = self.backend.rename(node.id(), new_name).await?;
                moved = Arc::new(FsNode::from_info(&info, &old_dir));
            }
            if let Some(source) = source {
                let info = self
                    .backend
                    .move_node(node.id(), source.id(), target.id())
                    .await?;
                moved = Arc::new(FsNode::from_info(&info, &new_dir));
            }
            moved
        };

        if moved.is_dir() {
            self.tree.move_dir(&old_path, moved);
        } else {
            self.tree.move_file(&old_path, moved);
        }
        info!(from = %old_path, to = %new_path, "Moved");
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let path = path::normalize(path);
        let node = self
            .fetch_node(&path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(path));
        }
        self.delete_item(&path, &node).await?;
        self.tree.delete_file(&path);
        self.small_files.delete(&node);
        info!(path = %path, "Deleted file");
        Ok(())
    }

    pub async fn delete_dir(&self, path: &str) -> Result<()> {
        let path = path::normalize(path);
        if path::is_root(&path) {
            return Err(FsError::AccessDenied("cannot delete the root".to_string()));
        }
        let node = self
            .fetch_node(&path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(path));
        }
        self.delete_item(&path, &node).await?;
        self.tree.delete_dir_subtree(&path);
        info!(path = %path, "Deleted directory");
        Ok(())
    }

    /// Trash a node, or unlink it from this path's parent when it lives in
    /// several folders
    async fn delete_item(&self, path: &str, node: &FsNode) -> Result<()> {
        if node.is_uploading() {
            self.uploads.cancel(node.id());
        }
        if node.is_local() {
            return Ok(());
        }

        let mut parents = node.parent_ids();
        if parents.len() > 1 {
            // Another cached path of this node may have dropped a link since
            match self.backend.get_node(node.id()).await {
                Ok(Some(info)) => {
                    node.set_parent_ids(info.parent_ids.clone());
                    parents = info.parent_ids;
                }
                Ok(None) => {
                    warn!(path = path, "Node already gone on the backend");
                    return Ok(());
                }
                Err(e) if e.is_already_satisfied() => {
                    warn!(path = path, error = %e, "Node already gone on the backend");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        let result = if parents.len() > 1 {
            let parent = self.require_dir(path::parent(path)).await?;
            debug!(path = path, parent = %parent.id(), "Removing one link of multi-parent node");
            self.backend.remove(parent.id(), node.id()).await
        } else {
            self.backend.trash(node.id()).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_satisfied() => {
                warn!(path = path, error = %e, "Node already gone on the backend");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Backend-specific metadata of a node, fetched once per node
    pub async fn extended_info(&self, path: &str) -> Result<serde_json::Value> {
        let path = path::normalize(path);
        let node = self
            .fetch_node(&path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if let Some(info) = node.extended_info() {
            return Ok(info);
        }
        if node.is_local() {
            return Err(FsError::NotFound(format!("{} is not uploaded yet", path)));
        }
        let info = self.backend.get_extended_info(node.id()).await?;
        node.set_extended_info(info.clone());
        Ok(info)
    }

    /// Drop a pending upload; false if there was none for `id`
    pub fn cancel_upload(&self, id: &str) -> bool {
        self.uploads.cancel(id)
    }

    /// Remove every small-file cache entry that is not in use
    pub fn clear_small_files_cache(&self) -> Result<()> {
        self.small_files.clear()
    }

    /// Quota and usage of the backend account, for disk-free-space queries
    pub async fn space(&self) -> Result<SpaceInfo> {
        let space = self.backend.space().await?;
        debug!(total = space.total, used = space.used, free = space.free, "Fetched quota");
        Ok(space)
    }

    pub fn stats(&self) -> ProviderStats {
        let (tree_hits, tree_misses, tree_hit_rate) = self.tree.stats();
        let (cached_nodes, cached_dirs) = self.tree.entry_counts();
        ProviderStats {
            tree_hits,
            tree_misses,
            tree_hit_rate,
            cached_nodes,
            cached_dirs,
            small_files_size: self.small_files.total_size(),
            small_files_count: self.small_files.entry_count(),
            uploads_pending: self.uploads.pending(),
            uploads_running: self.uploads.running(),
            uploads_finished: self.counters.uploads_finished.load(Ordering::Relaxed),
            uploads_failed: self.counters.uploads_failed.load(Ordering::Relaxed),
            downloads_started: self.counters.downloads_started.load(Ordering::Relaxed),
            downloads_finished: self.counters.downloads_finished.load(Ordering::Relaxed),
            downloads_failed: self.counters.downloads_failed.load(Ordering::Relaxed),
        }
    }

    pub async fn wait_for_uploads_to_finish(&self) {
        self.uploads.wait_for_uploads_to_finish().await;
    }

    /// Stop background work. Pending uploads stay on disk and resume with
    /// the next provider on the same cache path.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down filesystem provider");
            self.shutdown.cancel();
        }
    }

    async fn require_dir(&self, path: &str) -> Result<Arc<FsNode>> {
        let dir = self
            .fetch_node(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok(dir)
    }

    /// Wait until an uploading node has been replaced by its backend node
    async fn wait_for_real(&self, node: Arc<FsNode>) -> Result<Arc<FsNode>> {
        if !node.is_uploading() {
            return Ok(node);
        }
        let path = node.path();
        let deadline = Instant::now() + self.config.wait_for_real();
        debug!(path = %path, "Waiting for upload to finish");

        let mut node = node;
        while node.is_uploading() {
            if Instant::now() >= deadline {
                return Err(FsError::Timeout(format!("upload of {}", path)));
            }
            tokio::time::sleep(WAIT_FOR_REAL_POLL).await;
            node = self
                .fetch_node(&path)
                .await?
                .ok_or_else(|| FsError::NotFound(path.clone()))?;
        }
        Ok(node)
    }
}

impl Drop for FsProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Applies upload and download notifications to the caches
struct EventHandler {
    tree: Arc<TreeCache>,
    small_files: Arc<SmallFileCache>,
    counters: Arc<Counters>,
}

impl EventHandler {
    async fn run(
        self,
        mut uploads: mpsc::UnboundedReceiver<UploadEvent>,
        mut downloads: mpsc::UnboundedReceiver<CacheEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = uploads.recv() => self.on_upload(event),
                Some(event) = downloads.recv() => self.on_download(event),
                else => break,
            }
        }
        debug!("Provider event loop stopped");
    }

    /// Tree node still standing for this upload, if any
    fn current_node(&self, record: &UploadRecord) -> Option<Arc<FsNode>> {
        self.tree
            .get_node(&record.path)
            .filter(|node| node.id() == record.id && !node.is_not_existing())
    }

    fn on_upload(&self, event: UploadEvent) {
        match event {
            UploadEvent::Added(record) => {
                debug!(path = %record.path, id = %record.id, "Upload added");
            }
            UploadEvent::Finished {
                record,
                node: info,
                staging,
            } => {
                self.counters.uploads_finished.fetch_add(1, Ordering::Relaxed);
                let current = self.current_node(&record);
                let node = Arc::new(FsNode::at_path(&info, record.path.clone()));
                self.small_files.move_to_cache(&staging, &node);
                if node.id() != record.id {
                    self.small_files.delete_id(&record.id);
                }
                match current {
                    Some(_) => {
                        self.tree.put_node(node);
                        debug!(path = %record.path, id = %info.id, "Replaced uploaded node");
                    }
                    None => {
                        debug!(path = %record.path, "Uploaded node no longer in tree");
                    }
                }
            }
            UploadEvent::Failed { record, reason } => {
                self.counters.uploads_failed.fetch_add(1, Ordering::Relaxed);
                let drop_node = !record.overwrite && reason != UploadFailure::ZeroLength;
                if reason != UploadFailure::ZeroLength && reason != UploadFailure::Cancelled {
                    error!(path = %record.path, reason = %reason, "Upload failed");
                }
                let Some(node) = self.current_node(&record) else {
                    if drop_node {
                        self.small_files.delete_id(&record.id);
                    }
                    return;
                };
                if drop_node {
                    self.tree.delete_file(&record.path);
                    self.small_files.delete(&node);
                } else {
                    node.set_uploading(false);
                    self.tree.update_node(node);
                }
            }
        }
    }

    fn on_download(&self, event: CacheEvent) {
        match event {
            CacheEvent::DownloadStarted(node) => {
                self.counters.downloads_started.fetch_add(1, Ordering::Relaxed);
                debug!(path = %node.path(), "Download started");
            }
            CacheEvent::DownloadFinished(node) => {
                self.counters.downloads_finished.fetch_add(1, Ordering::Relaxed);
                debug!(path = %node.path(), "Download finished");
            }
            CacheEvent::DownloadFailed(node) => {
                self.counters.downloads_failed.fetch_add(1, Ordering::Relaxed);
                warn!(path = %node.path(), "Download failed");
            }
        }
    }
}

/// Periodically purge expired tree cache entries
async fn sweep(tree: Arc<TreeCache>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                tree.sweep();
                tree.log_metrics();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, MemoryCloud};
    use crate::error::ErrorClass;
    use tempfile::TempDir;

    const T: Duration = Duration::from_secs(5);

    fn config(dir: &TempDir) -> ProviderConfig {
        let mut config = ProviderConfig::with_cache_path(dir.path());
        config.reupload_delay_ms = 20;
        config
    }

    fn setup() -> (TempDir, Arc<MemoryCloud>, ProviderConfig) {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        (dir, Arc::new(MemoryCloud::new("mem")), config)
    }

    async fn read_all(stream: &BlockStream) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = stream.read(out.len() as u64, 64 * 1024, T).await.unwrap();
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    async fn write_file(provider: &FsProvider, path: &str, mode: OpenMode, data: &[u8]) {
        let stream = provider.open(path, mode, Access::Write).await.unwrap();
        for (i, chunk) in data.chunks(100_000).enumerate() {
            stream.write((i * 100_000) as u64, chunk, T).await.unwrap();
        }
        provider.close(&stream).await.unwrap();
    }

    async fn read_file(provider: &FsProvider, path: &str) -> Vec<u8> {
        let stream = provider.open(path, OpenMode::Open, Access::Read).await.unwrap();
        let data = read_all(&stream).await;
        provider.close(&stream).await.unwrap();
        data
    }

    /// Wait for uploads and for the tree to show the backend node
    async fn settled(provider: &FsProvider, path: &str) -> Arc<FsNode> {
        provider.wait_for_uploads_to_finish().await;
        let node = provider.fetch_node(path).await.unwrap().unwrap();
        provider.wait_for_real(node).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nodes_served_from_cache_until_ttl() {
        let (_dir, cloud, mut config) = setup();
        config.node_ttl_ms = 100;
        cloud.add_file(cloud.root_id(), "a.txt", b"abc");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        assert_eq!(provider.fetch_node("/a.txt").await.unwrap().unwrap().length(), 3);
        assert!(provider.exists("/a.txt").await.unwrap());
        assert_eq!(cloud.call_count("get_child"), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(provider.exists("/a.txt").await.unwrap());
        assert_eq!(cloud.call_count("get_child"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listing_refetched_after_dir_ttl() {
        let (_dir, cloud, mut config) = setup();
        config.dir_ttl_ms = 100;
        cloud.add_file(cloud.root_id(), "a.txt", b"abc");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        assert_eq!(provider.list_dir("/").await.unwrap().len(), 1);
        assert_eq!(provider.list_dir("/").await.unwrap().len(), 1);
        assert_eq!(cloud.call_count("get_children"), 1);

        cloud.add_file(cloud.root_id(), "b.txt", b"new");
        tokio::time::sleep(Duration::from_millis(250)).await;
        let names: Vec<String> = provider
            .list_dir("/")
            .await
            .unwrap()
            .iter()
            .map(|n| n.path())
            .collect();
        assert_eq!(names, vec!["/a.txt".to_string(), "/b.txt".to_string()]);
        assert_eq!(cloud.call_count("get_children"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_path_is_cached() {
        let (_dir, cloud, config) = setup();
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        assert!(!provider.exists("/nope/deeper").await.unwrap());
        assert!(!provider.exists("/nope").await.unwrap());
        assert!(!provider.exists("/nope/other").await.unwrap());
        assert_eq!(cloud.call_count("get_child"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_close_reread_small_file() {
        let (_dir, cloud, config) = setup();
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        write_file(&provider, "/ten.txt", OpenMode::CreateNew, b"0123456789").await;
        assert_eq!(read_file(&provider, "/ten.txt").await, b"0123456789");

        let node = settled(&provider, "/ten.txt").await;
        assert_eq!(cloud.content(node.id()).unwrap(), b"0123456789");
        assert_eq!(read_file(&provider, "/ten.txt").await, b"0123456789");
        assert_eq!(provider.stats().uploads_finished, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_large_file_round_trip_before_and_after_upload() {
        let (_dir, cloud, mut config) = setup();
        config.small_file_size_limit = 1024 * 1024;
        config.block_size = 256 * 1024;
        let provider = FsProvider::new(config, cloud.clone()).unwrap();
        let data: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();

        write_file(&provider, "/big.bin", OpenMode::Create, &data).await;
        assert!(read_file(&provider, "/big.bin").await == data);

        let node = settled(&provider, "/big.bin").await;
        assert_eq!(node.length(), data.len() as u64);
        assert!(cloud.content(node.id()).unwrap() == data);
        assert!(read_file(&provider, "/big.bin").await == data);

        // Without the local copy reads stream from the backend
        provider.clear_small_files_cache().unwrap();
        let stream = provider
            .open("/big.bin", OpenMode::Open, Access::Read)
            .await
            .unwrap();
        assert!(matches!(stream, BlockStream::Remote(_)));
        assert!(read_all(&stream).await == data);
        provider.close(&stream).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_with_two_parents_removes_one_link() {
        let (_dir, cloud, config) = setup();
        let a = cloud.add_folder(cloud.root_id(), "a");
        let b = cloud.add_folder(cloud.root_id(), "b");
        let file = cloud.add_file(&a.id, "x", b"shared");
        cloud.link(&file.id, &b.id);
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        provider.delete_file("/a/x").await.unwrap();
        assert!(cloud.peek_child(&a.id, "x").is_none());
        assert!(cloud.peek_child(&b.id, "x").is_some());
        assert!(!cloud.is_trashed(&file.id));
        assert_eq!(cloud.call_count("trash"), 0);
        assert!(!provider.exists("/a/x").await.unwrap());
        assert_eq!(read_file(&provider, "/b/x").await, b"shared");

        provider.delete_file("/b/x").await.unwrap();
        assert!(cloud.is_trashed(&file.id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_both_links_of_cached_shared_node() {
        let (_dir, cloud, config) = setup();
        let a = cloud.add_folder(cloud.root_id(), "a");
        let b = cloud.add_folder(cloud.root_id(), "b");
        let file = cloud.add_file(&a.id, "x", b"shared");
        cloud.link(&file.id, &b.id);
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        // Both paths cached with two parents before either delete
        assert_eq!(provider.fetch_node("/a/x").await.unwrap().unwrap().parent_ids().len(), 2);
        assert_eq!(provider.fetch_node("/b/x").await.unwrap().unwrap().parent_ids().len(), 2);

        provider.delete_file("/a/x").await.unwrap();
        assert_eq!(cloud.call_count("remove"), 1);
        assert!(!cloud.is_trashed(&file.id));

        provider.delete_file("/b/x").await.unwrap();
        assert!(cloud.is_trashed(&file.id));
        assert_eq!(cloud.call_count("trash"), 1);
        assert_eq!(cloud.call_count("remove"), 1);
        assert!(!provider.exists("/b/x").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_already_deleted_on_backend_is_success() {
        let (_dir, cloud, config) = setup();
        cloud.add_file(cloud.root_id(), "gone", b"x");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        assert!(provider.exists("/gone").await.unwrap());
        cloud.fail_next_calls(1, CloudError::NotFound("gone".into()));
        provider.delete_file("/gone").await.unwrap();
        assert!(!provider.exists("/gone").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_upload_survives_restart() {
        let (dir, cloud, config) = setup();
        cloud.pause_uploads();

        let first = FsProvider::new(config.clone(), cloud.clone()).unwrap();
        write_file(&first, "/crash.txt", OpenMode::CreateNew, b"durable").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.shutdown();
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cloud.resume_uploads();

        let second = FsProvider::new(config, cloud.clone()).unwrap();
        assert!(second.exists("/crash.txt").await.unwrap());
        let node = settled(&second, "/crash.txt").await;
        assert_eq!(cloud.count_named(cloud.root_id(), "crash.txt"), 1);
        assert_eq!(cloud.content(node.id()).unwrap(), b"durable");
        assert_eq!(read_file(&second, "/crash.txt").await, b"durable");
        drop(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_directories() {
        let (_dir, cloud, config) = setup();
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        let docs = provider.create_dir("/docs").await.unwrap();
        assert!(docs.is_dir());
        assert!(matches!(
            provider.create_dir("/docs").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            provider.create_dir("/missing/sub").await,
            Err(FsError::NotFound(_))
        ));

        cloud.pause_uploads();
        cloud.add_file(docs.id(), "old.txt", b"old");
        write_file(&provider, "/docs/new.txt", OpenMode::CreateNew, b"new").await;
        let names: Vec<String> = provider
            .list_dir("/docs")
            .await
            .unwrap()
            .iter()
            .map(|n| n.name())
            .collect();
        assert_eq!(names, vec!["new.txt".to_string(), "old.txt".to_string()]);
        assert!(matches!(
            provider.list_dir("/docs/old.txt").await,
            Err(FsError::NotADirectory(_))
        ));

        cloud.resume_uploads();
        settled(&provider, "/docs/new.txt").await;
        assert_eq!(provider.list_dir("/docs").await.unwrap().len(), 2);

        provider.delete_dir("/docs").await.unwrap();
        assert!(!provider.exists("/docs").await.unwrap());
        assert!(!provider.exists("/docs/new.txt").await.unwrap());
        assert!(cloud.is_trashed(docs.id()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_and_replace() {
        let (_dir, cloud, config) = setup();
        cloud.add_file(cloud.root_id(), "m.txt", b"move me");
        let dst = cloud.add_folder(cloud.root_id(), "dst");
        cloud.add_file(cloud.root_id(), "a", b"1");
        cloud.add_file(cloud.root_id(), "b", b"2");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        provider.move_path("/m.txt", "/dst/r.txt", false).await.unwrap();
        assert!(cloud.peek_child(&dst.id, "r.txt").is_some());
        assert!(!provider.exists("/m.txt").await.unwrap());
        assert_eq!(read_file(&provider, "/dst/r.txt").await, b"move me");

        assert!(matches!(
            provider.move_path("/a", "/b", false).await,
            Err(FsError::AlreadyExists(_))
        ));
        provider.move_path("/a", "/b", true).await.unwrap();
        assert_eq!(read_file(&provider, "/b").await, b"1");
        assert!(!provider.exists("/a").await.unwrap());
        assert_eq!(cloud.count_named(cloud.root_id(), "b"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_replace_keeps_destination() {
        let (_dir, cloud, mut config) = setup();
        config.wait_for_real_ms = 300;
        let dst = cloud.add_file(cloud.root_id(), "dst", b"keep me");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        cloud.pause_uploads();
        write_file(&provider, "/src", OpenMode::CreateNew, b"pending").await;
        assert!(matches!(
            provider.move_path("/src", "/dst", true).await,
            Err(FsError::Timeout(_))
        ));
        assert!(!cloud.is_trashed(&dst.id));
        assert_eq!(cloud.call_count("trash"), 0);
        assert!(provider.exists("/src").await.unwrap());
        assert_eq!(read_file(&provider, "/dst").await, b"keep me");

        cloud.resume_uploads();
        settled(&provider, "/src").await;
        provider.move_path("/src", "/dst", true).await.unwrap();
        assert!(cloud.is_trashed(&dst.id));
        assert_eq!(read_file(&provider, "/dst").await, b"pending");
        assert!(!provider.exists("/src").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stalled_remote_read_times_out() {
        let (_dir, cloud, mut config) = setup();
        config.small_file_size_limit = 4;
        cloud.add_file(cloud.root_id(), "big", b"larger than the limit");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        let stream = provider.open("/big", OpenMode::Open, Access::Read).await.unwrap();
        assert!(matches!(stream, BlockStream::Remote(_)));
        cloud.stall_downloads(true);
        let res = tokio::time::timeout(
            Duration::from_secs(2),
            stream.read(0, 5, Duration::from_millis(100)),
        )
        .await
        .expect("read ignored its timeout");
        assert!(matches!(res, Err(FsError::Timeout(_))));

        cloud.stall_downloads(false);
        assert_eq!(&stream.read(0, 6, T).await.unwrap()[..], b"larger");
        provider.close(&stream).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_space_reports_backend_quota() {
        let (_dir, cloud, config) = setup();
        cloud.set_quota(1000);
        cloud.add_file(cloud.root_id(), "f", &[1u8; 300]);
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        let space = provider.space().await.unwrap();
        assert_eq!(space.total, 1000);
        assert_eq!(space.used, 300);
        assert_eq!(space.free, 700);

        cloud.fail_next_calls(1, CloudError::Forbidden("quota".into()));
        assert_eq!(
            provider.space().await.unwrap_err().class(),
            ErrorClass::AccessDenied
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_errors() {
        let (_dir, cloud, mut config) = setup();
        config.small_file_size_limit = 4;
        cloud.add_file(cloud.root_id(), "big", b"too big for rw");
        cloud.add_folder(cloud.root_id(), "dir");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        assert!(matches!(
            provider.open("/none", OpenMode::Open, Access::Read).await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            provider.open("/big", OpenMode::CreateNew, Access::Write).await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            provider.open("/big", OpenMode::Open, Access::ReadWrite).await,
            Err(FsError::AccessDenied(_))
        ));
        assert!(matches!(
            provider.open("/dir", OpenMode::Open, Access::Write).await,
            Err(FsError::IsADirectory(_))
        ));

        let dir = provider.open("/dir", OpenMode::Open, Access::Read).await.unwrap();
        assert!(matches!(dir, BlockStream::Dummy(_)));

        let stream = provider.open("/big", OpenMode::Open, Access::Read).await.unwrap();
        assert!(matches!(
            stream.write(0, b"x", T).await,
            Err(FsError::AccessDenied(_))
        ));
        provider.close(&stream).await.unwrap();
        provider.close(&stream).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_write_overwrites_backend_file() {
        let (_dir, cloud, config) = setup();
        let file = cloud.add_file(cloud.root_id(), "rw.txt", b"hello world");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        let stream = provider
            .open("/rw.txt", OpenMode::Open, Access::ReadWrite)
            .await
            .unwrap();
        stream.write(0, b"HELLO", T).await.unwrap();
        provider.close(&stream).await.unwrap();
        assert_eq!(read_file(&provider, "/rw.txt").await, b"HELLO world");

        let node = settled(&provider, "/rw.txt").await;
        assert_eq!(node.id(), file.id);
        assert_eq!(cloud.content(&file.id).unwrap(), b"HELLO world");
        assert_eq!(cloud.call_count("overwrite"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_truncate_existing_file() {
        let (_dir, cloud, config) = setup();
        let file = cloud.add_file(cloud.root_id(), "t.txt", b"old content");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        write_file(&provider, "/t.txt", OpenMode::Create, b"new").await;
        assert_eq!(read_file(&provider, "/t.txt").await, b"new");

        settled(&provider, "/t.txt").await;
        assert_eq!(cloud.content(&file.id).unwrap(), b"new");
        assert_eq!(cloud.count_named(cloud.root_id(), "t.txt"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_length_file_stays_local() {
        let (_dir, cloud, config) = setup();
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        write_file(&provider, "/empty", OpenMode::CreateNew, b"").await;
        let node = settled(&provider, "/empty").await;
        assert_eq!(node.length(), 0);
        assert_eq!(cloud.call_count("upload_new"), 0);
        assert!(read_file(&provider, "/empty").await.is_empty());

        write_file(&provider, "/empty", OpenMode::Create, b"abc").await;
        settled(&provider, "/empty").await;
        assert_eq!(cloud.count_named(cloud.root_id(), "empty"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_uploading_file_cancels_upload() {
        let (_dir, cloud, config) = setup();
        let provider = FsProvider::new(config, cloud.clone()).unwrap();
        cloud.pause_uploads();

        write_file(&provider, "/c.txt", OpenMode::CreateNew, b"cancel me").await;
        provider.delete_file("/c.txt").await.unwrap();
        assert!(!provider.exists("/c.txt").await.unwrap());

        cloud.resume_uploads();
        provider.wait_for_uploads_to_finish().await;
        assert_eq!(cloud.count_named(cloud.root_id(), "c.txt"), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_extended_info_is_fetched_once() {
        let (_dir, cloud, config) = setup();
        cloud.add_file(cloud.root_id(), "e", b"x");
        let provider = FsProvider::new(config, cloud.clone()).unwrap();

        let first = provider.extended_info("/e").await.unwrap();
        let second = provider.extended_info("/e").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cloud.call_count("get_extended_info"), 1);
    }
}
