//! Provider configuration
//!
//! All tunables of the provider in one serde struct. Missing fields take their
//! defaults, so an empty JSON object is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// Root of the on-disk state (small-file cache and upload staging)
    pub cache_path: PathBuf,
    /// Files up to this size are served from the small-file disk cache
    pub small_file_size_limit: u64,
    /// Byte budget of the small-file disk cache
    pub small_files_cache_size: u64,
    pub node_ttl_ms: u64,
    pub dir_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Number of uploads running at the same time
    pub upload_concurrency: usize,
    pub reupload_delay_ms: u64,
    pub block_size: u64,
    /// Blocks kept per streaming reader
    pub block_cache_blocks: usize,
    /// How long a writer waits for an uploading node to become real
    pub wait_for_real_ms: u64,
    pub read_lock_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let cache_path = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cloudmount");

        Self {
            cache_path,
            small_file_size_limit: 20 * MIB,
            small_files_cache_size: 1024 * MIB,
            node_ttl_ms: 300_000,
            dir_ttl_ms: 60_000,
            sweep_interval_ms: 30_000,
            upload_concurrency: 2,
            reupload_delay_ms: 5_000,
            block_size: MIB,
            block_cache_blocks: 5,
            wait_for_real_ms: 25_000,
            read_lock_timeout_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    /// Defaults with a different cache root
    pub fn with_cache_path(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_concurrency == 0 {
            bail!("uploadConcurrency must be at least 1");
        }
        if self.block_size == 0 {
            bail!("blockSize must be greater than zero");
        }
        if self.block_cache_blocks == 0 {
            bail!("blockCacheBlocks must be at least 1");
        }
        Ok(())
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_millis(self.node_ttl_ms)
    }

    pub fn dir_ttl(&self) -> Duration {
        Duration::from_millis(self.dir_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reupload_delay(&self) -> Duration {
        Duration::from_millis(self.reupload_delay_ms)
    }

    pub fn wait_for_real(&self) -> Duration {
        Duration::from_millis(self.wait_for_real_ms)
    }

    pub fn read_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.read_lock_timeout_ms)
    }
}
