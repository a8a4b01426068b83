//! Upload service
//!
//! Uploads staged files in the background with a bounded number of workers.
//! Records are durable, so a process that dies mid-upload resumes the work on
//! the next start. Transient failures are retried after a delay until the
//! upload succeeds, fails terminally, or is superseded.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::record::{self, UploadRecord};
use crate::cloud::{CloudBackend, CloudError, NodeInfo, StreamFactory};
use crate::error::UploadFailure;
use crate::fs::{path, FsNode};

pub const UPLOAD_FOLDER: &str = "Upload";

/// Notifications from the upload pipeline to the provider
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Added(UploadRecord),
    Finished {
        record: UploadRecord,
        node: NodeInfo,
        /// Staging file with the uploaded bytes, for the provider to move
        /// into the small-file cache
        staging: PathBuf,
    },
    Failed {
        record: UploadRecord,
        reason: UploadFailure,
    },
}

/// Local file backing a new or truncated upload
pub struct StagingFile {
    pub path: PathBuf,
    pub file: fs::File,
}

#[derive(Debug, Clone)]
struct Queued {
    record: UploadRecord,
    generation: u64,
}

struct Active {
    generation: u64,
    record: UploadRecord,
    /// Cancels the running attempt of this generation
    token: CancellationToken,
}

enum Outcome {
    Finished(NodeInfo),
    Failed(UploadFailure),
    Retry(String),
}

pub struct UploadService {
    dir: PathBuf,
    backend: Arc<dyn CloudBackend>,
    limit: usize,
    reupload_delay: Duration,
    semaphore: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<Queued>,
    /// Current generation of every live upload by id
    active: Mutex<HashMap<String, Active>>,
    next_generation: AtomicU64,
    /// Queued, running and waiting-to-retry items
    pending: AtomicUsize,
    idle: Notify,
    events: mpsc::UnboundedSender<UploadEvent>,
    shutdown: CancellationToken,
}

impl UploadService {
    /// Create the staging directory `<cache>/Upload/<backend id>` and start
    /// the dispatch loop. Must be called within a Tokio runtime.
    pub fn start(
        cache_root: &Path,
        backend: Arc<dyn CloudBackend>,
        limit: usize,
        reupload_delay: Duration,
        events: mpsc::UnboundedSender<UploadEvent>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let dir = cache_root.join(UPLOAD_FOLDER).join(backend.id());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create upload directory: {:?}", dir))?;
        record::cleanup_temp_files(&dir);

        let limit = limit.max(1);
        let (queue, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            dir,
            backend,
            limit,
            reupload_delay,
            semaphore: Arc::new(Semaphore::new(limit)),
            queue,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            events,
            shutdown,
        });

        tokio::spawn(service.clone().dispatch(rx));
        info!(dir = %service.dir.display(), limit = limit, "Upload service started");
        Ok(service)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn staging_path(&self, id: &str) -> PathBuf {
        UploadRecord::staging_path(&self.dir, id)
    }

    /// Number of uploads queued, running or waiting to retry
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of uploads currently talking to the backend
    pub fn running(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Create an empty staging file for a new node
    pub fn open_new(&self, node: &FsNode) -> io::Result<StagingFile> {
        self.create_staging(node.id())
    }

    /// Create an empty staging file that will overwrite an existing node
    pub fn open_truncate(&self, node: &FsNode) -> io::Result<StagingFile> {
        self.create_staging(node.id())
    }

    fn create_staging(&self, id: &str) -> io::Result<StagingFile> {
        let path = self.staging_path(id);
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!(id = id, path = %path.display(), "Created staging file");
        Ok(StagingFile { path, file })
    }

    /// Stage an existing local file (hard link, copy as fallback)
    pub fn stage_existing(&self, id: &str, source: &Path) -> io::Result<PathBuf> {
        let target = self.staging_path(id);
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if let Err(e) = fs::hard_link(source, &target) {
            debug!(error = %e, "Hard link failed, copying instead");
            fs::copy(source, &target)?;
        }
        Ok(target)
    }

    pub fn enqueue_new(&self, node: &FsNode) -> io::Result<()> {
        self.enqueue(UploadRecord::from_node(node, false), true)
    }

    pub fn enqueue_overwrite(&self, node: &FsNode) -> io::Result<()> {
        self.enqueue(UploadRecord::from_node(node, true), true)
    }

    /// Scan the staging directory for records left by a previous run and
    /// build an uploading node for each. Nothing is queued until
    /// `enqueue_recovered` is called.
    pub fn recover(&self) -> io::Result<Vec<(UploadRecord, Arc<FsNode>)>> {
        let records = record::scan(&self.dir)?;
        if !records.is_empty() {
            warn!(count = records.len(), "Not uploaded files found, resuming");
        }
        Ok(records
            .into_iter()
            .map(|rec| {
                let node = if rec.overwrite {
                    FsNode::overwriting(rec.path.clone(), rec.id.clone(), &rec.parent_id, rec.length)
                } else {
                    FsNode::uploading_with_id(rec.path.clone(), rec.id.clone(), &rec.parent_id, rec.length)
                };
                (rec, Arc::new(node))
            })
            .collect())
    }

    pub fn enqueue_recovered(&self, records: Vec<UploadRecord>) {
        for rec in records {
            // Already on disk
            if let Err(e) = self.enqueue(rec, false) {
                error!(error = %e, "Failed to resume upload");
            }
        }
    }

    /// Write the record (if asked) and queue a new generation for its id,
    /// superseding any older one
    fn enqueue(&self, rec: UploadRecord, write_record: bool) -> io::Result<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = self.active.lock();
            if write_record {
                rec.write(&self.dir)?;
            }
            let previous = active.insert(
                rec.id.clone(),
                Active {
                    generation,
                    record: rec.clone(),
                    token: self.shutdown.child_token(),
                },
            );
            if let Some(previous) = previous {
                debug!(id = %rec.id, "Superseding queued upload");
                previous.token.cancel();
            }
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        info!(path = %rec.path, id = %rec.id, size = rec.length, overwrite = rec.overwrite, "Upload queued");
        let _ = self.events.send(UploadEvent::Added(rec.clone()));
        if self
            .queue
            .send(Queued {
                record: rec,
                generation,
            })
            .is_err()
        {
            self.finish_pending();
        }
        Ok(())
    }

    /// Cancel an upload: its record and staging file are removed and
    /// `Failed(Cancelled)` is emitted. Returns false if nothing was pending.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = {
            let mut active = self.active.lock();
            let removed = active.remove(id);
            if removed.is_some() {
                UploadRecord::remove(&self.dir, id);
            }
            removed
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.token.cancel();
        let _ = fs::remove_file(self.staging_path(id));
        info!(path = %entry.record.path, id = id, "Upload cancelled");
        let _ = self.events.send(UploadEvent::Failed {
            record: entry.record,
            reason: UploadFailure::Cancelled,
        });
        true
    }

    /// Wait until nothing is pending and every worker permit is back
    pub async fn wait_for_uploads_to_finish(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending() == 0 {
                break;
            }
            tokio::select! {
                _ = idle => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
        let limit = self.limit as u32;
        if let Ok(all) = self.semaphore.acquire_many(limit).await {
            drop(all);
        }
    }

    /// Stop dispatching and abort running attempts; records stay on disk
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Queued>) {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let Some(token) = self.current_token(&item) else {
                debug!(id = %item.record.id, "Dropping superseded upload");
                self.finish_pending();
                continue;
            };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::spawn(self.clone().run(item, token, permit));
        }
        debug!("Upload dispatch loop stopped");
    }

    async fn run(self: Arc<Self>, item: Queued, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            outcome = self.attempt(&item.record) => Some(outcome),
        };
        drop(permit);

        let Some(outcome) = outcome else {
            if !self.shutdown.is_cancelled() {
                self.finish_pending();
            }
            return;
        };

        match outcome {
            Outcome::Finished(node) => {
                if self.retire(&item, false) {
                    info!(path = %item.record.path, id = %node.id, "Finished upload");
                    let _ = self.events.send(UploadEvent::Finished {
                        staging: self.staging_path(&item.record.id),
                        record: item.record,
                        node,
                    });
                }
                self.finish_pending();
            }
            Outcome::Failed(reason) => {
                if self.retire(&item, true) {
                    let _ = self.events.send(UploadEvent::Failed {
                        record: item.record,
                        reason,
                    });
                }
                self.finish_pending();
            }
            Outcome::Retry(cause) => {
                warn!(
                    path = %item.record.path,
                    error = %cause,
                    delay_ms = self.reupload_delay.as_millis() as u64,
                    "Upload failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        if !self.shutdown.is_cancelled() {
                            self.finish_pending();
                        }
                        return;
                    }
                    _ = tokio::time::sleep(self.reupload_delay) => {}
                }
                if self.queue.send(item).is_err() {
                    self.finish_pending();
                }
            }
        }
    }

    /// One attempt against the backend
    async fn attempt(&self, rec: &UploadRecord) -> Outcome {
        if rec.length == 0 {
            debug!(path = %rec.path, "Zero length file, not uploading");
            return Outcome::Failed(UploadFailure::ZeroLength);
        }
        let staging = self.staging_path(&rec.id);
        if !staging.exists() {
            error!(path = %rec.path, "Staging file is gone");
            return Outcome::Failed(UploadFailure::NoNode);
        }
        let source = StreamFactory::new(staging);

        debug!(path = %rec.path, overwrite = rec.overwrite, "Started upload");
        let result = if rec.overwrite {
            match self.backend.get_node(&rec.id).await {
                Ok(Some(_)) => self.backend.overwrite(&rec.id, &source).await,
                Ok(None) => {
                    error!(path = %rec.path, "File does not exist to be overwritten");
                    return Outcome::Failed(UploadFailure::NoOverwriteNode);
                }
                Err(e) => Err(e),
            }
        } else {
            match self.backend.get_node(&rec.parent_id).await {
                Ok(Some(folder)) if folder.is_dir => {
                    self.backend
                        .upload_new(&rec.parent_id, path::name(&rec.path), &source)
                        .await
                }
                Ok(_) => {
                    error!(path = %rec.path, "Folder does not exist to upload file");
                    return Outcome::Failed(UploadFailure::NoFolderNode);
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(Some(node)) => Outcome::Finished(node),
            Ok(None) => {
                error!(path = %rec.path, "Backend returned no node for upload");
                Outcome::Failed(UploadFailure::NoNode)
            }
            Err(CloudError::Conflict(body)) => {
                error!(path = %rec.path, body = %body, "Upload conflict");
                Outcome::Failed(UploadFailure::Conflict)
            }
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }

    fn current_token(&self, item: &Queued) -> Option<CancellationToken> {
        self.active
            .lock()
            .get(&item.record.id)
            .filter(|a| a.generation == item.generation)
            .map(|a| a.token.clone())
    }

    /// Remove the record of a finished generation. Returns false if the item
    /// was superseded meanwhile, in which case nothing is touched.
    fn retire(&self, item: &Queued, drop_staging: bool) -> bool {
        let mut active = self.active.lock();
        let current = active
            .get(&item.record.id)
            .map(|a| a.generation == item.generation)
            .unwrap_or(false);
        if !current {
            return false;
        }
        active.remove(&item.record.id);
        UploadRecord::remove(&self.dir, &item.record.id);
        if drop_staging {
            let _ = fs::remove_file(self.staging_path(&item.record.id));
        }
        true
    }

    fn finish_pending(&self) {
        let before = self.pending.fetch_sub(1, Ordering::AcqRel);
        if before == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use std::io::Write;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        cloud: Arc<MemoryCloud>,
        service: Arc<UploadService>,
        events: mpsc::UnboundedReceiver<UploadEvent>,
    }

    fn harness_in(dir: TempDir, cloud: Arc<MemoryCloud>, delay: Duration) -> Harness {
        let (tx, events) = mpsc::unbounded_channel();
        let service = UploadService::start(
            dir.path(),
            cloud.clone(),
            2,
            delay,
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            cloud,
            service,
            events,
        }
    }

    fn harness() -> Harness {
        harness_in(
            TempDir::new().unwrap(),
            Arc::new(MemoryCloud::new("mem")),
            Duration::from_millis(20),
        )
    }

    fn staged(service: &UploadService, name: &str, data: &[u8]) -> FsNode {
        let node = FsNode::uploading(format!("/{}", name), "root", data.len() as u64);
        let mut staging = service.open_new(&node).unwrap();
        staging.file.write_all(data).unwrap();
        node
    }

    async fn next_final(events: &mut mpsc::UnboundedReceiver<UploadEvent>) -> UploadEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
                Ok(Some(UploadEvent::Added(_))) => continue,
                Ok(Some(event)) => return event,
                other => panic!("no upload event: {:?}", other.ok()),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_new_file() {
        let mut h = harness();
        let node = staged(&h.service, "a.txt", b"hello");
        h.service.enqueue_new(&node).unwrap();
        assert!(UploadRecord::info_path(h.service.dir(), node.id()).exists());

        match next_final(&mut h.events).await {
            UploadEvent::Finished { record, node: info, staging } => {
                assert_eq!(record.path, "/a.txt");
                assert_eq!(h.cloud.content(&info.id).unwrap(), b"hello");
                assert!(staging.exists());
            }
            other => panic!("unexpected {:?}", other),
        }
        h.service.wait_for_uploads_to_finish().await;
        assert!(!UploadRecord::info_path(h.service.dir(), node.id()).exists());
        assert_eq!(h.service.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_length_is_not_sent() {
        let mut h = harness();
        let node = staged(&h.service, "empty", b"");
        h.service.enqueue_new(&node).unwrap();

        match next_final(&mut h.events).await {
            UploadEvent::Failed { reason, .. } => assert_eq!(reason, UploadFailure::ZeroLength),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.cloud.call_count("upload_new"), 0);
        assert!(!UploadRecord::info_path(h.service.dir(), node.id()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_failures_retry_until_success() {
        let mut h = harness();
        h.cloud.fail_next_uploads(2, CloudError::Server(500, "boom".into()));
        let node = staged(&h.service, "r.txt", b"retry");
        h.service.enqueue_new(&node).unwrap();

        assert!(matches!(
            next_final(&mut h.events).await,
            UploadEvent::Finished { .. }
        ));
        assert_eq!(h.cloud.call_count("upload_new"), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_and_missing_folder_are_terminal() {
        let mut h = harness();
        h.cloud.add_file(h.cloud.root_id(), "dup", b"x");
        let dup = staged(&h.service, "dup", b"y");
        h.service.enqueue_new(&dup).unwrap();
        match next_final(&mut h.events).await {
            UploadEvent::Failed { reason, .. } => assert_eq!(reason, UploadFailure::Conflict),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!UploadRecord::info_path(h.service.dir(), dup.id()).exists());

        let orphan = FsNode::uploading("/gone/f".into(), "no-such-folder", 1);
        h.service.open_new(&orphan).unwrap().file.write_all(b"z").unwrap();
        h.service.enqueue_new(&orphan).unwrap();
        match next_final(&mut h.events).await {
            UploadEvent::Failed { reason, .. } => assert_eq!(reason, UploadFailure::NoFolderNode),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_node_discards_staging_file() {
        let mut h = harness();
        h.cloud.set_upload_returns_none(true);
        let node = staged(&h.service, "n", b"abc");
        h.service.enqueue_new(&node).unwrap();
        match next_final(&mut h.events).await {
            UploadEvent::Failed { reason, .. } => assert_eq!(reason, UploadFailure::NoNode),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!h.service.staging_path(node.id()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrency_is_bounded() {
        let h = harness();
        h.cloud.pause_uploads();
        for i in 0..4 {
            let node = staged(&h.service, &format!("f{}", i), b"data");
            h.service.enqueue_new(&node).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.service.running(), 2);
        assert_eq!(h.service.pending(), 4);

        h.cloud.resume_uploads();
        h.service.wait_for_uploads_to_finish().await;
        assert_eq!(h.service.pending(), 0);
        assert_eq!(h.cloud.call_count("upload_new"), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_removes_record_and_emits_cancelled() {
        let mut h = harness();
        h.cloud.pause_uploads();
        let node = staged(&h.service, "c", b"cancel me");
        h.service.enqueue_new(&node).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.service.cancel(node.id()));
        assert!(!h.service.cancel(node.id()));
        match next_final(&mut h.events).await {
            UploadEvent::Failed { reason, .. } => assert_eq!(reason, UploadFailure::Cancelled),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!UploadRecord::info_path(h.service.dir(), node.id()).exists());
        assert!(!h.service.staging_path(node.id()).exists());

        h.cloud.resume_uploads();
        h.service.wait_for_uploads_to_finish().await;
        assert_eq!(h.cloud.peek_child(h.cloud.root_id(), "c"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_records_survive_shutdown_and_upload_once() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let cloud = Arc::new(MemoryCloud::new("mem"));
        cloud.pause_uploads();

        let first = harness_in(dir, cloud.clone(), Duration::from_millis(20));
        let node = staged(&first.service, "crash.txt", b"durable");
        first.service.enqueue_new(&node).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.service.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(UploadRecord::info_path(first.service.dir(), node.id()).exists());
        cloud.resume_uploads();

        let (tx, mut events) = mpsc::unbounded_channel();
        let second = UploadService::start(
            &root,
            cloud.clone(),
            2,
            Duration::from_millis(20),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        let recovered = second.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1.length(), 7);
        assert!(recovered[0].1.is_uploading());
        second.enqueue_recovered(recovered.into_iter().map(|(r, _)| r).collect());

        assert!(matches!(next_final(&mut events).await, UploadEvent::Finished { .. }));
        second.wait_for_uploads_to_finish().await;
        assert_eq!(cloud.count_named(cloud.root_id(), "crash.txt"), 1);
        drop(first);
    }
}
