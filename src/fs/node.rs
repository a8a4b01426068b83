//! Filesystem node
//!
//! One `FsNode` per virtual path, shared as `Arc` between the tree cache,
//! open streams and the upload pipeline. Length, timestamps and the uploading
//! flag change while the node is shared, so they are atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use super::path;
use crate::cloud::NodeInfo;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
pub struct FsNode {
    path: RwLock<String>,
    id: String,
    parent_ids: RwLock<Vec<String>>,
    is_dir: bool,
    length: AtomicU64,
    created_ms: AtomicU64,
    accessed_ms: AtomicU64,
    modified_ms: AtomicU64,
    fetched_at: Mutex<Instant>,
    is_uploading: AtomicBool,
    /// Created locally and not yet acknowledged by the backend
    local: bool,
    /// Negative cache entry
    not_existing: bool,
    extended_info: Mutex<Option<serde_json::Value>>,
}

impl FsNode {
    fn build(path: String, id: String, parent_ids: Vec<String>, is_dir: bool, length: u64) -> Self {
        let now = now_ms();
        Self {
            path: RwLock::new(path),
            id,
            parent_ids: RwLock::new(parent_ids),
            is_dir,
            length: AtomicU64::new(length),
            created_ms: AtomicU64::new(now),
            accessed_ms: AtomicU64::new(now),
            modified_ms: AtomicU64::new(now),
            fetched_at: Mutex::new(Instant::now()),
            is_uploading: AtomicBool::new(false),
            local: false,
            not_existing: false,
            extended_info: Mutex::new(None),
        }
    }

    /// Node for a backend record found in `parent_path`
    pub fn from_info(info: &NodeInfo, parent_path: &str) -> Self {
        Self::at_path(info, path::join(parent_path, &info.name))
    }

    /// Node for a backend record at an explicit path (used for the root)
    pub fn at_path(info: &NodeInfo, path: String) -> Self {
        let node = Self::build(
            path,
            info.id.clone(),
            info.parent_ids.clone(),
            info.is_dir,
            info.length,
        );
        node.created_ms.store(info.created_ms, Ordering::Relaxed);
        node.modified_ms.store(info.modified_ms, Ordering::Relaxed);
        node.accessed_ms.store(info.modified_ms, Ordering::Relaxed);
        node
    }

    /// Synthetic node for a file that exists only locally until its upload lands
    pub fn uploading(path: String, parent_id: &str, length: u64) -> Self {
        Self::uploading_with_id(path, uuid::Uuid::new_v4().to_string(), parent_id, length)
    }

    pub fn uploading_with_id(path: String, id: String, parent_id: &str, length: u64) -> Self {
        let mut node = Self::build(path, id, vec![parent_id.to_string()], false, length);
        node.local = true;
        node.is_uploading = AtomicBool::new(true);
        node
    }

    /// Node of an existing backend file whose new content is being uploaded
    pub fn overwriting(path: String, id: String, parent_id: &str, length: u64) -> Self {
        let node = Self::build(path, id, vec![parent_id.to_string()], false, length);
        node.is_uploading.store(true, Ordering::Release);
        node
    }

    /// Negative entry recording that nothing exists at `path`
    pub fn not_existing(path: String) -> Self {
        let mut node = Self::build(path, String::new(), Vec::new(), false, 0);
        node.not_existing = true;
        node
    }

    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    pub fn set_path(&self, new_path: String) {
        *self.path.write() = new_path;
    }

    pub fn name(&self) -> String {
        path::name(&self.path.read()).to_string()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_ids(&self) -> Vec<String> {
        self.parent_ids.read().clone()
    }

    pub fn set_parent_ids(&self, ids: Vec<String>) {
        *self.parent_ids.write() = ids;
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Release);
        self.touch_modified();
    }

    pub fn is_uploading(&self) -> bool {
        self.is_uploading.load(Ordering::Acquire)
    }

    /// Flip the uploading flag. Re-insert the node into the tree cache
    /// afterwards so its expiry is recomputed.
    pub fn set_uploading(&self, value: bool) {
        self.is_uploading.store(value, Ordering::Release);
        if !value {
            *self.fetched_at.lock() = Instant::now();
        }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_not_existing(&self) -> bool {
        self.not_existing
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms.load(Ordering::Relaxed)
    }

    pub fn accessed_ms(&self) -> u64 {
        self.accessed_ms.load(Ordering::Relaxed)
    }

    pub fn modified_ms(&self) -> u64 {
        self.modified_ms.load(Ordering::Relaxed)
    }

    pub fn touch_accessed(&self) {
        self.accessed_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn touch_modified(&self) {
        let now = now_ms();
        self.modified_ms.store(now, Ordering::Relaxed);
        self.accessed_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the node was fetched (or last demoted from uploading)
    pub fn age(&self) -> Duration {
        self.fetched_at.lock().elapsed()
    }

    pub fn extended_info(&self) -> Option<serde_json::Value> {
        self.extended_info.lock().clone()
    }

    pub fn set_extended_info(&self, info: serde_json::Value) {
        *self.extended_info.lock() = Some(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, length: u64) -> NodeInfo {
        NodeInfo {
            id: format!("id-{}", name),
            name: name.to_string(),
            is_dir: false,
            length,
            created_ms: 10,
            modified_ms: 20,
            parent_ids: vec!["p".to_string()],
            content_id: None,
        }
    }

    #[test]
    fn test_from_info_builds_path() {
        let node = FsNode::from_info(&info("a.txt", 5), "/docs");
        assert_eq!(node.path(), "/docs/a.txt");
        assert_eq!(node.name(), "a.txt");
        assert_eq!(node.length(), 5);
        assert_eq!(node.modified_ms(), 20);
        assert!(!node.is_uploading());
        assert!(!node.is_local());
    }

    #[test]
    fn test_uploading_node_gets_fresh_id() {
        let a = FsNode::uploading("/x".into(), "p", 0);
        let b = FsNode::uploading("/x".into(), "p", 0);
        assert_ne!(a.id(), b.id());
        assert!(a.is_uploading());
        assert!(a.is_local());

        a.set_uploading(false);
        assert!(!a.is_uploading());
    }
}
