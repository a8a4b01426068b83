//! Metadata Tree Cache
//!
//! Path-keyed cache of nodes and directory listings using Moka.
//! Nodes expire after the node TTL counted from when they were fetched;
//! uploading nodes never expire. Listings have their own, shorter TTL.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::fs::{path, FsNode};

/// Per-entry expiry for nodes
struct NodeExpiry {
    ttl: Duration,
}

impl NodeExpiry {
    fn remaining(&self, node: &FsNode) -> Option<Duration> {
        if node.is_uploading() {
            return None;
        }
        Some(self.ttl.saturating_sub(node.age()))
    }
}

impl Expiry<String, Arc<FsNode>> for NodeExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<FsNode>,
        _created_at: Instant,
    ) -> Option<Duration> {
        self.remaining(value)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<FsNode>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.remaining(value)
    }
}

/// Child paths of one directory
#[derive(Debug, Default)]
pub struct DirListing {
    children: RwLock<BTreeSet<String>>,
}

impl DirListing {
    fn from_paths(paths: impl IntoIterator<Item = String>) -> Self {
        Self {
            children: RwLock::new(paths.into_iter().collect()),
        }
    }

    fn insert(&self, path: String) {
        self.children.write().insert(path);
    }

    fn remove(&self, path: &str) {
        self.children.write().remove(path);
    }

    fn paths(&self) -> Vec<String> {
        self.children.read().iter().cloned().collect()
    }
}

pub struct TreeCache {
    /// Nodes by normalized path
    nodes: Cache<String, Arc<FsNode>>,
    /// Directory listings by normalized path
    dirs: Cache<String, Arc<DirListing>>,
    /// Serializes structural mutations (moves, subtree deletes)
    gate: RwLock<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TreeCache {
    /// Create a cache with default TTLs
    pub fn new() -> Self {
        Self::with_ttls(
            Duration::from_secs(300), // 5 minutes for nodes
            Duration::from_secs(60),  // 1 minute for listings
        )
    }

    /// Create a cache with custom TTLs
    ///
    /// # Arguments
    /// * `node_ttl` - TTL for nodes, counted from when they were fetched
    /// * `dir_ttl` - TTL for directory listings
    pub fn with_ttls(node_ttl: Duration, dir_ttl: Duration) -> Self {
        let nodes = Cache::builder()
            .expire_after(NodeExpiry { ttl: node_ttl })
            .name("tree_node_cache")
            .build();

        let dirs = Cache::builder()
            .time_to_live(dir_ttl)
            .name("tree_dir_cache")
            .build();

        Self {
            nodes,
            dirs,
            gate: RwLock::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a node (possibly a negative entry) from cache
    pub fn get_node(&self, path: &str) -> Option<Arc<FsNode>> {
        let _read = self.gate.read();
        match self.nodes.get(path) {
            Some(node) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(path = path, "Cache HIT for node");
                Some(node)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(path = path, "Cache MISS for node");
                None
            }
        }
    }

    /// Get the sorted child paths of a directory from cache
    pub fn get_dir(&self, path: &str) -> Option<Vec<String>> {
        let _read = self.gate.read();
        match self.dirs.get(path) {
            Some(listing) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let children = listing.paths();
                trace!(path = path, entries = children.len(), "Cache HIT for directory");
                Some(children)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(path = path, "Cache MISS for directory");
                None
            }
        }
    }

    /// Insert a node and add it to its parent's cached listing
    pub fn put_node(&self, node: Arc<FsNode>) {
        let _write = self.gate.write();
        self.put_node_locked(node);
    }

    /// Insert a node without touching any listing
    pub fn put_node_only(&self, node: Arc<FsNode>) {
        let _write = self.gate.write();
        self.nodes.insert(node.path(), node);
    }

    /// Re-insert a node so its expiry is recomputed (after the uploading
    /// flag changed)
    pub fn update_node(&self, node: Arc<FsNode>) {
        let _write = self.gate.write();
        let path = node.path();
        debug!(path = %path, uploading = node.is_uploading(), "Updated node");
        self.nodes.insert(path, node);
    }

    /// Replace the listing of `dir` and cache every child node
    pub fn put_dir_listing(&self, dir: &str, children: Vec<Arc<FsNode>>) {
        let _write = self.gate.write();
        let paths: Vec<String> = children.iter().map(|n| n.path()).collect();
        for node in children {
            self.nodes.insert(node.path(), node);
        }
        debug!(path = dir, entries = paths.len(), "Cached directory listing");
        self.dirs
            .insert(dir.to_string(), Arc::new(DirListing::from_paths(paths)));
    }

    pub fn delete_file(&self, path: &str) {
        let _write = self.gate.write();
        self.delete_file_locked(path);
    }

    /// Remove a directory, everything cached beneath it and its entry in the
    /// parent listing
    pub fn delete_dir_subtree(&self, path: &str) {
        let _write = self.gate.write();
        self.delete_dir_subtree_locked(path);
    }

    /// Move a file entry; `node` already carries its new path
    pub fn move_file(&self, old_path: &str, node: Arc<FsNode>) {
        let _write = self.gate.write();
        self.delete_file_locked(old_path);
        self.put_node_locked(node);
    }

    /// Move a directory entry; cached descendants are dropped
    pub fn move_dir(&self, old_path: &str, node: Arc<FsNode>) {
        let _write = self.gate.write();
        self.delete_dir_subtree_locked(old_path);
        self.put_node_locked(node);
    }

    fn put_node_locked(&self, node: Arc<FsNode>) {
        let node_path = node.path();
        if !path::is_root(&node_path) {
            if let Some(listing) = self.dirs.get(path::parent(&node_path)) {
                listing.insert(node_path.clone());
            }
        }
        trace!(path = %node_path, "Cached node");
        self.nodes.insert(node_path, node);
    }

    fn delete_file_locked(&self, file_path: &str) {
        self.nodes.invalidate(file_path);
        if let Some(listing) = self.dirs.get(path::parent(file_path)) {
            listing.remove(file_path);
        }
        debug!(path = file_path, "Removed node from cache");
    }

    fn delete_dir_subtree_locked(&self, dir: &str) {
        let doomed_nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|(k, _)| k.as_ref().clone())
            .filter(|k| k == dir || path::is_descendant(k, dir))
            .collect();
        for key in &doomed_nodes {
            self.nodes.invalidate(key);
        }

        let doomed_dirs: Vec<String> = self
            .dirs
            .iter()
            .map(|(k, _)| k.as_ref().clone())
            .filter(|k| k == dir || path::is_descendant(k, dir))
            .collect();
        for key in &doomed_dirs {
            self.dirs.invalidate(key);
        }

        if !path::is_root(dir) {
            if let Some(listing) = self.dirs.get(path::parent(dir)) {
                listing.remove(dir);
            }
        }
        debug!(
            path = dir,
            nodes = doomed_nodes.len(),
            dirs = doomed_dirs.len(),
            "Removed directory subtree from cache"
        );
    }

    /// Uploading nodes cached directly beneath `dir`. The backend does not
    /// list them until their upload lands.
    pub fn uploading_children(&self, dir: &str) -> Vec<Arc<FsNode>> {
        let _read = self.gate.read();
        self.nodes
            .iter()
            .filter(|(key, node)| {
                node.is_uploading() && !path::is_root(key) && path::parent(key.as_str()) == dir
            })
            .map(|(_, node)| node)
            .collect()
    }

    /// Drop expired entries now instead of waiting for the next access
    pub fn sweep(&self) {
        self.nodes.run_pending_tasks();
        self.dirs.run_pending_tasks();
    }

    /// Clear all caches
    pub fn clear(&self) {
        let _write = self.gate.write();
        self.nodes.invalidate_all();
        self.dirs.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared tree cache");
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    pub fn entry_counts(&self) -> (u64, u64) {
        (self.nodes.entry_count(), self.dirs.entry_count())
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        let (nodes, dirs) = self.entry_counts();

        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            node_entries = nodes,
            dir_entries = dirs,
            "Cache metrics"
        );
    }
}

impl Default for TreeCache {
    fn default() -> Self {
        Self::new()
    }
}
