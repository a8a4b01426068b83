//! Retrying backend decorator
//!
//! Wraps any `CloudBackend` and retries transient failures (rate limits,
//! proxy auth, timeouts, 5xx) with exponential backoff, so the filesystem core
//! only ever sees a final success or a terminal error.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{ByteStream, CloudBackend, CloudError, NodeInfo, SpaceInfo, StreamFactory};

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// First backoff delay; doubled on every further attempt
const BASE_DELAY: Duration = Duration::from_millis(500);

/// `CloudBackend` that retries transient errors of an inner backend
pub struct RetryingBackend<B> {
    inner: B,
    max_retries: u32,
    base_delay: Duration,
}

impl<B: CloudBackend> RetryingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self::with_policy(inner, MAX_RETRIES, BASE_DELAY)
    }

    pub fn with_policy(inner: B, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, CloudError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying backend operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(operation = operation, error = %e, "Backend operation failed after retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<B: CloudBackend> CloudBackend for RetryingBackend<B> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn get_root(&self) -> Result<NodeInfo, CloudError> {
        self.with_retry("get_root", || self.inner.get_root()).await
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>, CloudError> {
        self.with_retry("get_node", || self.inner.get_node(id)).await
    }

    async fn get_child(&self, parent_id: &str, name: &str) -> Result<Option<NodeInfo>, CloudError> {
        self.with_retry("get_child", || self.inner.get_child(parent_id, name))
            .await
    }

    async fn get_children(&self, id: &str) -> Result<Vec<NodeInfo>, CloudError> {
        self.with_retry("get_children", || self.inner.get_children(id))
            .await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<NodeInfo, CloudError> {
        self.with_retry("create_folder", || self.inner.create_folder(parent_id, name))
            .await
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<NodeInfo, CloudError> {
        self.with_retry("rename", || self.inner.rename(id, new_name))
            .await
    }

    async fn move_node(
        &self,
        id: &str,
        old_parent_id: &str,
        new_parent_id: &str,
    ) -> Result<NodeInfo, CloudError> {
        self.with_retry("move", || {
            self.inner.move_node(id, old_parent_id, new_parent_id)
        })
        .await
    }

    async fn trash(&self, id: &str) -> Result<(), CloudError> {
        self.with_retry("trash", || self.inner.trash(id)).await
    }

    async fn remove(&self, parent_id: &str, id: &str) -> Result<(), CloudError> {
        self.with_retry("remove", || self.inner.remove(parent_id, id))
            .await
    }

    async fn get_extended_info(&self, id: &str) -> Result<serde_json::Value, CloudError> {
        self.with_retry("get_extended_info", || self.inner.get_extended_info(id))
            .await
    }

    async fn space(&self) -> Result<SpaceInfo, CloudError> {
        self.with_retry("space", || self.inner.space()).await
    }

    async fn download(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, CloudError> {
        // Only opening the stream is retried; a broken body is the reader's problem
        self.with_retry("download", || self.inner.download(id, offset, length))
            .await
    }

    async fn upload_new(
        &self,
        parent_id: &str,
        name: &str,
        source: &StreamFactory,
    ) -> Result<Option<NodeInfo>, CloudError> {
        self.with_retry("upload_new", || {
            self.inner.upload_new(parent_id, name, source)
        })
        .await
    }

    async fn overwrite(
        &self,
        id: &str,
        source: &StreamFactory,
    ) -> Result<Option<NodeInfo>, CloudError> {
        self.with_retry("overwrite", || self.inner.overwrite(id, source))
            .await
    }
}
