//! In-memory cloud backend
//!
//! A complete `CloudBackend` kept in process memory. Used by the test suites
//! and for local development without credentials. Besides the node store it
//! offers knobs to pause uploads, inject failures and count calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::{ByteStream, CloudBackend, CloudError, NodeInfo, SpaceInfo, StreamFactory};

/// Id of the root folder
pub const ROOT_ID: &str = "root";

/// Size of the chunks a download stream is cut into
const CHUNK_SIZE: usize = 64 * 1024;

/// Account capacity reported until `set_quota` is called
pub const DEFAULT_QUOTA: u64 = 1 << 40;

struct MemNode {
    info: NodeInfo,
    data: Vec<u8>,
    trashed: bool,
}

#[derive(Default)]
struct FailurePlan {
    calls: usize,
    call_error: Option<CloudError>,
    uploads: usize,
    upload_error: Option<CloudError>,
}

/// Backend that stores every node and its bytes in memory
pub struct MemoryCloud {
    id: String,
    nodes: Mutex<HashMap<String, MemNode>>,
    next_id: AtomicU64,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<FailurePlan>,
    upload_returns_none: AtomicBool,
    uploads_paused: watch::Sender<bool>,
    downloads_stalled: AtomicBool,
    quota: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl MemoryCloud {
    /// Create a backend holding only an empty root folder
    pub fn new(id: &str) -> Self {
        let now = now_ms();
        let root = MemNode {
            info: NodeInfo {
                id: ROOT_ID.to_string(),
                name: String::new(),
                is_dir: true,
                length: 0,
                created_ms: now,
                modified_ms: now,
                parent_ids: Vec::new(),
                content_id: None,
            },
            data: Vec::new(),
            trashed: false,
        };
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID.to_string(), root);
        let (uploads_paused, _) = watch::channel(false);

        Self {
            id: id.to_string(),
            nodes: Mutex::new(nodes),
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(FailurePlan::default()),
            upload_returns_none: AtomicBool::new(false),
            uploads_paused,
            downloads_stalled: AtomicBool::new(false),
            quota: AtomicU64::new(DEFAULT_QUOTA),
        }
    }

    pub fn root_id(&self) -> &'static str {
        ROOT_ID
    }

    /// Create a folder directly in the store (no call accounting)
    pub fn add_folder(&self, parent_id: &str, name: &str) -> NodeInfo {
        self.insert_node(parent_id, name, true, Vec::new())
    }

    /// Create a file directly in the store (no call accounting)
    pub fn add_file(&self, parent_id: &str, name: &str, data: &[u8]) -> NodeInfo {
        self.insert_node(parent_id, name, false, data.to_vec())
    }

    /// Link an existing node into one more folder
    pub fn link(&self, id: &str, parent_id: &str) {
        if let Some(node) = self.nodes.lock().get_mut(id) {
            if !node.info.parent_ids.iter().any(|p| p == parent_id) {
                node.info.parent_ids.push(parent_id.to_string());
            }
        }
    }

    /// Current bytes of a live file
    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        let nodes = self.nodes.lock();
        nodes
            .get(id)
            .filter(|n| !n.trashed)
            .map(|n| n.data.clone())
    }

    /// Look up a live node without counting a call
    pub fn peek_node(&self, id: &str) -> Option<NodeInfo> {
        let nodes = self.nodes.lock();
        nodes
            .get(id)
            .filter(|n| !n.trashed)
            .map(|n| n.info.clone())
    }

    /// Look up a live child by name without counting a call
    pub fn peek_child(&self, parent_id: &str, name: &str) -> Option<NodeInfo> {
        let nodes = self.nodes.lock();
        Self::find_child(&nodes, parent_id, name).map(|n| n.info.clone())
    }

    /// Number of live children called `name` under `parent_id`
    pub fn count_named(&self, parent_id: &str, name: &str) -> usize {
        let nodes = self.nodes.lock();
        nodes
            .values()
            .filter(|n| !n.trashed && n.info.name == name)
            .filter(|n| n.info.parent_ids.iter().any(|p| p == parent_id))
            .count()
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        self.nodes.lock().get(id).map(|n| n.trashed).unwrap_or(false)
    }

    /// How many times an operation was invoked
    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    /// Make the next `count` calls (of any kind) fail with `error`
    pub fn fail_next_calls(&self, count: usize, error: CloudError) {
        let mut failures = self.failures.lock();
        failures.calls = count;
        failures.call_error = Some(error);
    }

    /// Make the next `count` uploads or overwrites fail with `error`
    pub fn fail_next_uploads(&self, count: usize, error: CloudError) {
        let mut failures = self.failures.lock();
        failures.uploads = count;
        failures.upload_error = Some(error);
    }

    /// Make uploads succeed without returning a node
    pub fn set_upload_returns_none(&self, value: bool) {
        self.upload_returns_none.store(value, Ordering::SeqCst);
    }

    /// Hold every upload until `resume_uploads` is called
    pub fn pause_uploads(&self) {
        self.uploads_paused.send_replace(true);
    }

    pub fn resume_uploads(&self) {
        self.uploads_paused.send_replace(false);
    }

    /// Make download streams open but never yield a chunk
    pub fn stall_downloads(&self, value: bool) {
        self.downloads_stalled.store(value, Ordering::SeqCst);
    }

    pub fn set_quota(&self, total: u64) {
        self.quota.store(total, Ordering::SeqCst);
    }

    fn insert_node(&self, parent_id: &str, name: &str, is_dir: bool, data: Vec<u8>) -> NodeInfo {
        let id = format!("n{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = now_ms();
        let info = NodeInfo {
            id: id.clone(),
            name: name.to_string(),
            is_dir,
            length: data.len() as u64,
            created_ms: now,
            modified_ms: now,
            parent_ids: vec![parent_id.to_string()],
            content_id: None,
        };
        self.nodes.lock().insert(
            id,
            MemNode {
                info: info.clone(),
                data,
                trashed: false,
            },
        );
        info
    }

    fn find_child<'a>(
        nodes: &'a HashMap<String, MemNode>,
        parent_id: &str,
        name: &str,
    ) -> Option<&'a MemNode> {
        nodes.values().find(|n| {
            !n.trashed && n.info.name == name && n.info.parent_ids.iter().any(|p| p == parent_id)
        })
    }

    /// Count the call and apply any planned failure
    fn enter(&self, op: &'static str) -> Result<(), CloudError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let mut failures = self.failures.lock();
        if failures.calls > 0 {
            failures.calls -= 1;
            if let Some(err) = failures.call_error.clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn enter_upload(&self, op: &'static str) -> Result<(), CloudError> {
        self.enter(op)?;
        let mut paused = self.uploads_paused.subscribe();
        // The sender lives in self, so this only fails if self is gone
        let _ = paused.wait_for(|p| !*p).await;

        let mut failures = self.failures.lock();
        if failures.uploads > 0 {
            failures.uploads -= 1;
            if let Some(err) = failures.upload_error.clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn live_mut<'a>(
        nodes: &'a mut HashMap<String, MemNode>,
        id: &str,
    ) -> Result<&'a mut MemNode, CloudError> {
        nodes
            .get_mut(id)
            .filter(|n| !n.trashed)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl CloudBackend for MemoryCloud {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_root(&self) -> Result<NodeInfo, CloudError> {
        self.enter("get_root")?;
        self.peek_node(ROOT_ID)
            .ok_or_else(|| CloudError::NotFound(ROOT_ID.to_string()))
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>, CloudError> {
        self.enter("get_node")?;
        Ok(self.peek_node(id))
    }

    async fn get_child(&self, parent_id: &str, name: &str) -> Result<Option<NodeInfo>, CloudError> {
        self.enter("get_child")?;
        Ok(self.peek_child(parent_id, name))
    }

    async fn get_children(&self, id: &str) -> Result<Vec<NodeInfo>, CloudError> {
        self.enter("get_children")?;
        let nodes = self.nodes.lock();
        let mut children: Vec<NodeInfo> = nodes
            .values()
            .filter(|n| !n.trashed && n.info.parent_ids.iter().any(|p| p == id))
            .map(|n| n.info.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<NodeInfo, CloudError> {
        self.enter("create_folder")?;
        if self.peek_child(parent_id, name).is_some() {
            return Err(CloudError::Conflict(name.to_string()));
        }
        Ok(self.add_folder(parent_id, name))
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<NodeInfo, CloudError> {
        self.enter("rename")?;
        let mut nodes = self.nodes.lock();
        let parents = Self::live_mut(&mut nodes, id)?.info.parent_ids.clone();
        if parents
            .iter()
            .any(|p| Self::find_child(&nodes, p, new_name).is_some())
        {
            return Err(CloudError::Conflict(new_name.to_string()));
        }
        let node = Self::live_mut(&mut nodes, id)?;
        node.info.name = new_name.to_string();
        node.info.modified_ms = now_ms();
        Ok(node.info.clone())
    }

    async fn move_node(
        &self,
        id: &str,
        old_parent_id: &str,
        new_parent_id: &str,
    ) -> Result<NodeInfo, CloudError> {
        self.enter("move")?;
        let mut nodes = self.nodes.lock();
        let name = Self::live_mut(&mut nodes, id)?.info.name.clone();
        if Self::find_child(&nodes, new_parent_id, &name).is_some() {
            return Err(CloudError::Conflict(name));
        }
        let node = Self::live_mut(&mut nodes, id)?;
        let slot = node
            .info
            .parent_ids
            .iter()
            .position(|p| p == old_parent_id)
            .ok_or_else(|| CloudError::NotFound(old_parent_id.to_string()))?;
        node.info.parent_ids[slot] = new_parent_id.to_string();
        Ok(node.info.clone())
    }

    async fn trash(&self, id: &str) -> Result<(), CloudError> {
        self.enter("trash")?;
        let mut nodes = self.nodes.lock();
        Self::live_mut(&mut nodes, id)?.trashed = true;
        debug!(id = id, "Trashed node");
        Ok(())
    }

    async fn remove(&self, parent_id: &str, id: &str) -> Result<(), CloudError> {
        self.enter("remove")?;
        let mut nodes = self.nodes.lock();
        let node = Self::live_mut(&mut nodes, id)?;
        let before = node.info.parent_ids.len();
        node.info.parent_ids.retain(|p| p != parent_id);
        if node.info.parent_ids.len() == before {
            return Err(CloudError::NotFound(format!("{} not in {}", id, parent_id)));
        }
        Ok(())
    }

    async fn get_extended_info(&self, id: &str) -> Result<serde_json::Value, CloudError> {
        self.enter("get_extended_info")?;
        let info = self
            .peek_node(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        Ok(serde_json::json!({
            "id": info.id,
            "name": info.name,
            "isDir": info.is_dir,
            "length": info.length,
            "parentIds": info.parent_ids,
        }))
    }

    async fn space(&self) -> Result<SpaceInfo, CloudError> {
        self.enter("space")?;
        let used: u64 = self
            .nodes
            .lock()
            .values()
            .filter(|n| !n.trashed && !n.info.is_dir)
            .map(|n| n.data.len() as u64)
            .sum();
        let total = self.quota.load(Ordering::SeqCst);
        let free = total.saturating_sub(used);
        Ok(SpaceInfo {
            total,
            used,
            free,
            available: free,
        })
    }

    async fn download(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, CloudError> {
        self.enter("download")?;
        let data = self
            .content(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        if self.downloads_stalled.load(Ordering::SeqCst) {
            return Ok(Box::pin(stream::pending::<Result<Bytes, CloudError>>()));
        }
        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(len) => (start + len as usize).min(data.len()),
            None => data.len(),
        };
        let chunks: Vec<Result<Bytes, CloudError>> = data[start..end]
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn upload_new(
        &self,
        parent_id: &str,
        name: &str,
        source: &StreamFactory,
    ) -> Result<Option<NodeInfo>, CloudError> {
        self.enter_upload("upload_new").await?;
        let data = source
            .read_all()
            .await
            .map_err(|e| CloudError::Request(e.to_string()))?;
        if self.peek_child(parent_id, name).is_some() {
            return Err(CloudError::Conflict(name.to_string()));
        }
        let info = self.add_file(parent_id, name, &data);
        if self.upload_returns_none.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(info))
    }

    async fn overwrite(
        &self,
        id: &str,
        source: &StreamFactory,
    ) -> Result<Option<NodeInfo>, CloudError> {
        self.enter_upload("overwrite").await?;
        let data = source
            .read_all()
            .await
            .map_err(|e| CloudError::Request(e.to_string()))?;
        let mut nodes = self.nodes.lock();
        let node = Self::live_mut(&mut nodes, id)?;
        node.info.length = data.len() as u64;
        node.info.modified_ms = now_ms();
        node.data = data;
        if self.upload_returns_none.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(node.info.clone()))
    }
}
