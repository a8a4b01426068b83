//! Block cache for streamed reads of large remote files
//!
//! Each `BlockReader` keeps the last few fixed-size blocks of one file in
//! memory. A read reuses the cached blocks at both ends of the requested range
//! and fetches the rest with a single ranged download.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::cloud::CloudBackend;
use crate::error::{FsError, Result};
use crate::fs::FsNode;

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_MAX_BLOCKS: usize = 5;

struct Block {
    data: Bytes,
    last_access: u64,
}

#[derive(Default)]
struct BlockState {
    blocks: HashMap<u64, Block>,
    tick: u64,
}

impl BlockState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Drop least recently accessed blocks until at most `max` remain
    fn evict(&mut self, max: usize) {
        while self.blocks.len() > max {
            let oldest = self
                .blocks
                .iter()
                .min_by_key(|(_, b)| b.last_access)
                .map(|(idx, _)| *idx);
            match oldest {
                Some(idx) => {
                    self.blocks.remove(&idx);
                    trace!(block = idx, "Evicted block");
                }
                None => break,
            }
        }
    }
}

pub struct BlockReader {
    node: Arc<FsNode>,
    backend: Arc<dyn CloudBackend>,
    block_size: u64,
    max_blocks: usize,
    lock_timeout: Duration,
    state: Mutex<BlockState>,
}

impl BlockReader {
    pub fn new(
        node: Arc<FsNode>,
        backend: Arc<dyn CloudBackend>,
        block_size: u64,
        max_blocks: usize,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            node,
            backend,
            block_size: block_size.max(1),
            max_blocks: max_blocks.max(1),
            lock_timeout,
            state: Mutex::new(BlockState::default()),
        }
    }

    pub fn node(&self) -> &Arc<FsNode> {
        &self.node
    }

    /// Read up to `length` bytes at `offset`; an empty result means EOF.
    /// Missing blocks must arrive within `timeout`.
    pub async fn read(&self, offset: u64, length: usize, timeout: Duration) -> Result<Bytes> {
        let file_len = self.node.length();
        if offset >= file_len || length == 0 {
            return Ok(Bytes::new());
        }
        let end = (offset + length as u64).min(file_len);
        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;

        let mut state = tokio::time::timeout(self.lock_timeout, self.state.lock())
            .await
            .map_err(|_| FsError::Timeout(format!("read lock on {}", self.node.path())))?;

        // Cached prefix and suffix are reused, the middle is fetched in one go
        let mut fetch_start = first;
        while fetch_start <= last && state.blocks.contains_key(&fetch_start) {
            fetch_start += 1;
        }
        let mut fetched = Vec::new();
        if fetch_start <= last {
            let mut fetch_end = last;
            while fetch_end > fetch_start && state.blocks.contains_key(&fetch_end) {
                fetch_end -= 1;
            }
            fetched = tokio::time::timeout(
                timeout,
                self.fetch_blocks(fetch_start, fetch_end, file_len),
            )
            .await
            .map_err(|_| {
                warn!(
                    path = %self.node.path(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Block download timed out"
                );
                FsError::Timeout(format!("download of {}", self.node.path()))
            })??;
        }

        let mut parts = Vec::with_capacity((last - first + 1) as usize);
        for idx in first..=last {
            let tick = state.next_tick();
            let data = if idx >= fetch_start && idx < fetch_start + fetched.len() as u64 {
                fetched[(idx - fetch_start) as usize].clone()
            } else {
                match state.blocks.get_mut(&idx) {
                    Some(block) => {
                        block.last_access = tick;
                        block.data.clone()
                    }
                    None => {
                        return Err(FsError::DownloadFailed(format!(
                            "block {} of {} missing",
                            idx,
                            self.node.path()
                        )))
                    }
                }
            };
            parts.push(data);
        }

        for (i, data) in fetched.into_iter().enumerate() {
            let last_access = state.next_tick();
            state.blocks.insert(fetch_start + i as u64, Block { data, last_access });
        }
        state.evict(self.max_blocks);
        drop(state);

        let mut out = BytesMut::with_capacity((end - offset) as usize);
        for (i, data) in parts.iter().enumerate() {
            let block_start = (first + i as u64) * self.block_size;
            let from = offset.saturating_sub(block_start) as usize;
            let to = ((end - block_start) as usize).min(data.len());
            if from < to {
                out.extend_from_slice(&data[from..to]);
            }
        }
        trace!(path = %self.node.path(), offset = offset, size = out.len(), "Block read");
        Ok(out.freeze())
    }

    /// Download blocks `start..=stop` with one ranged request
    async fn fetch_blocks(&self, start: u64, stop: u64, file_len: u64) -> Result<Vec<Bytes>> {
        let pos = start * self.block_size;
        let total = ((stop - start + 1) * self.block_size).min(file_len - pos);
        debug!(
            path = %self.node.path(),
            offset = pos,
            size = total,
            "Downloading blocks"
        );

        let mut stream = self
            .backend
            .download(self.node.id(), pos, Some(total))
            .await?;
        let block_size = self.block_size as usize;
        let mut blocks = Vec::new();
        let mut current = BytesMut::with_capacity(block_size);
        let mut received = 0u64;

        while received < total {
            let Some(chunk) = stream.next().await else {
                break;
            };
            let mut chunk = chunk?;
            let wanted = (total - received) as usize;
            if chunk.len() > wanted {
                chunk.truncate(wanted);
            }
            received += chunk.len() as u64;
            while !chunk.is_empty() {
                let take = (block_size - current.len()).min(chunk.len());
                current.extend_from_slice(&chunk.split_to(take));
                if current.len() == block_size {
                    blocks.push(current.split().freeze());
                }
            }
        }

        if received < total {
            error!(
                path = %self.node.path(),
                expected = total,
                received = received,
                "Download stream ended early"
            );
            return Err(FsError::DownloadFailed(format!(
                "stream for {} ended after {} of {} bytes",
                self.node.path(),
                received,
                total
            )));
        }
        if !current.is_empty() {
            blocks.push(current.freeze());
        }
        Ok(blocks)
    }

    pub async fn cached_blocks(&self) -> usize {
        self.state.lock().await.blocks.len()
    }
}
