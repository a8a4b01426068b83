//! Cloud backend port
//!
//! The filesystem core only talks to the remote store through `CloudBackend`.
//! Vendor clients (HTTP calls, token refresh, JSON parsing) implement it
//! outside this crate; `MemoryCloud` is an in-process implementation.

pub mod errors;
pub mod memory;
pub mod retry;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

pub use errors::CloudError;
pub use memory::MemoryCloud;
pub use retry::RetryingBackend;
pub use types::{NodeInfo, SpaceInfo, StreamFactory};

/// Streamed body of a download, delivered chunk by chunk as bytes arrive
pub type ByteStream = BoxStream<'static, Result<Bytes, CloudError>>;

/// Node and file operations of a remote object store
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Stable identifier of this backend instance (used to namespace local state)
    fn id(&self) -> &str;

    async fn get_root(&self) -> Result<NodeInfo, CloudError>;

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>, CloudError>;

    async fn get_child(&self, parent_id: &str, name: &str) -> Result<Option<NodeInfo>, CloudError>;

    async fn get_children(&self, id: &str) -> Result<Vec<NodeInfo>, CloudError>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<NodeInfo, CloudError>;

    async fn rename(&self, id: &str, new_name: &str) -> Result<NodeInfo, CloudError>;

    async fn move_node(
        &self,
        id: &str,
        old_parent_id: &str,
        new_parent_id: &str,
    ) -> Result<NodeInfo, CloudError>;

    /// Move a node to the trash
    async fn trash(&self, id: &str) -> Result<(), CloudError>;

    /// Unlink a node from one of its parents
    async fn remove(&self, parent_id: &str, id: &str) -> Result<(), CloudError>;

    async fn get_extended_info(&self, id: &str) -> Result<serde_json::Value, CloudError>;

    /// Account quota and usage
    async fn space(&self) -> Result<SpaceInfo, CloudError>;

    /// Stream `length` bytes (or everything) starting at `offset`
    async fn download(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, CloudError>;

    /// Fill `buf` with bytes starting at `offset`, returning how many were read
    async fn download_into_buffer(
        &self,
        id: &str,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, CloudError> {
        let mut stream = self.download(id, offset, Some(buf.len() as u64)).await?;
        let mut filled = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let take = chunk.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&chunk[..take]);
            filled += take;
            if filled == buf.len() {
                break;
            }
        }
        Ok(filled)
    }

    /// Upload a new file; `None` means the backend accepted the call but
    /// returned no node
    async fn upload_new(
        &self,
        parent_id: &str,
        name: &str,
        source: &StreamFactory,
    ) -> Result<Option<NodeInfo>, CloudError>;

    /// Replace the content of an existing file
    async fn overwrite(
        &self,
        id: &str,
        source: &StreamFactory,
    ) -> Result<Option<NodeInfo>, CloudError>;
}
