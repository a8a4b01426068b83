//! Filesystem layer: nodes, virtual paths, open streams and the provider

pub mod node;
pub mod path;
pub mod provider;
pub mod stream;

pub use node::FsNode;
pub use provider::{Access, FsProvider, OpenMode, ProviderStats};
pub use stream::BlockStream;
