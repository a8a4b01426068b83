//! Backend node types
//!
//! Defines the node record returned by `CloudBackend` implementations and the
//! upload source handed to them.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Numeric field that some backends send as a string or `null`
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Number(u64),
    Text(String),
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Number(n)) => Ok(n),
        Some(Lenient::Text(s)) => s.parse().map_err(serde::de::Error::custom),
        None => Ok(0),
    }
}

/// Remote file/folder metadata as reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Backend node id
    pub id: String,
    /// Base name (empty for the root)
    #[serde(default)]
    pub name: String,
    /// Whether this node is a folder
    #[serde(default)]
    pub is_dir: bool,
    /// Content length in bytes (0 for folders)
    #[serde(default, deserialize_with = "lenient_u64")]
    pub length: u64,
    /// Creation timestamp in milliseconds since epoch
    #[serde(default, deserialize_with = "lenient_u64")]
    pub created_ms: u64,
    /// Modification timestamp in milliseconds since epoch
    #[serde(default, deserialize_with = "lenient_u64")]
    pub modified_ms: u64,
    /// Ids of every folder this node is linked into
    #[serde(default)]
    pub parent_ids: Vec<String>,
    /// Content hash, if the backend reports one
    #[serde(default)]
    pub content_id: Option<String>,
}

/// Storage quota of the account behind a backend, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub total: u64,
    pub used: u64,
    /// Remaining capacity of the whole account
    pub free: u64,
    /// Part of `free` the caller may still write; 0 when the backend does
    /// not report a per-user limit
    pub available: u64,
}

/// Reopenable source of upload bytes
///
/// Backends may open the source several times (their own retries), so this is
/// a factory rather than a single stream.
#[derive(Debug, Clone)]
pub struct StreamFactory {
    path: PathBuf,
}

impl StreamFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read all upload bytes
    pub async fn read_all(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
