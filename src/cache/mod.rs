//! Caching layer
//!
//! Metadata tree cache, download progress tracking, the in-memory block cache
//! for large files and the on-disk cache for small files.

pub mod block_cache;
pub mod downloader;
pub mod file_cache;
pub mod metadata;

pub use block_cache::BlockReader;
pub use downloader::DownloadTracker;
pub use file_cache::{CacheEvent, CachedFile, SmallFileCache};
pub use metadata::TreeCache;
