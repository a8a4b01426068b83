//! Durable upload records
//!
//! Every pending upload has a `<id>.info` JSON record next to its `<id>`
//! staging file. The record is written atomically (temp file, fsync, rename)
//! and its presence alone decides whether the upload is resumed at startup.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs::FsNode;

const INFO_EXT: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    /// Local id for new files, backend id for overwrites
    pub id: String,
    pub path: String,
    pub parent_id: String,
    pub length: u64,
    #[serde(default)]
    pub overwrite: bool,
}

impl UploadRecord {
    pub fn from_node(node: &FsNode, overwrite: bool) -> Self {
        Self {
            id: node.id().to_string(),
            path: node.path(),
            parent_id: node.parent_ids().into_iter().next().unwrap_or_default(),
            length: node.length(),
            overwrite,
        }
    }

    pub fn info_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.{}", id, INFO_EXT))
    }

    pub fn staging_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(id)
    }

    /// Write the record durably, replacing any previous record for the id
    pub fn write(&self, dir: &Path) -> io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".record")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        serde_json::to_writer(&mut tmp, self)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::info_path(dir, &self.id))
            .map_err(|e| e.error)?;
        debug!(id = %self.id, path = %self.path, overwrite = self.overwrite, "Wrote upload record");
        Ok(())
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Remove the record file; a missing record is not an error
    pub fn remove(dir: &Path, id: &str) {
        if let Err(e) = fs::remove_file(Self::info_path(dir, id)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(id = id, error = %e, "Failed to remove upload record");
            }
        }
    }
}

/// Remove temp files left by interrupted record writes
pub fn cleanup_temp_files(dir: &Path) {
    if let Ok(read_dir) = fs::read_dir(dir) {
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
                debug!(path = %path.display(), "Removing stale temp file");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Read every record in `dir`, oldest first, with its length taken from the
/// staging file. Records whose staging file is gone are discarded.
pub fn scan(dir: &Path) -> io::Result<Vec<UploadRecord>> {
    let mut found: Vec<(SystemTime, UploadRecord)> = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().map(|ext| ext != INFO_EXT).unwrap_or(true) {
            continue;
        }
        let mut record = match UploadRecord::read(&path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropping unreadable upload record");
                let _ = fs::remove_file(&path);
                continue;
            }
        };
        let staging = UploadRecord::staging_path(dir, &record.id);
        match fs::metadata(&staging) {
            Ok(meta) => record.length = meta.len(),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Staging file missing, dropping upload record");
                let _ = fs::remove_file(&path);
                continue;
            }
        }
        let written = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((written, record));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found.into_iter().map(|(_, record)| record).collect())
}
