//! cloudmount-core
//!
//! Filesystem provider core that exposes a remote cloud object store as a
//! path-based filesystem: metadata tree cache, small-file disk cache, block
//! cache for large remote files and a durable background upload pipeline.
//!
//! A driver binding (FUSE or similar) drives `FsProvider` and the
//! `BlockStream`s it returns; a vendor client implements `CloudBackend`.

pub mod cache;
pub mod cloud;
pub mod config;
pub mod error;
pub mod fs;
pub mod upload;

pub use cloud::{CloudBackend, CloudError, MemoryCloud, NodeInfo, RetryingBackend, SpaceInfo};
pub use config::ProviderConfig;
pub use error::{ErrorClass, FsError, UploadFailure};
pub use fs::{Access, BlockStream, FsNode, FsProvider, OpenMode, ProviderStats};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Calling it again, or after another subscriber was set, does nothing.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
