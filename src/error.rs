//! Filesystem error types
//!
//! `FsError` is what every provider, cache and stream operation returns. The
//! driver binding turns it into an OS status through `class()` or `to_errno()`.

use std::io;

use crate::cloud::CloudError;

/// Coarse classification used by driver bindings to pick an OS status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    AccessDenied,
    Generic,
}

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Cache accounting corrupted: {0}")]
    CacheCorruption(String),

    #[error("Cache clear incomplete, {failed} files could not be deleted")]
    CacheClearIncomplete { failed: usize },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FsError::NotFound(_) => ErrorClass::NotFound,
            FsError::AccessDenied(_) | FsError::Timeout(_) => ErrorClass::AccessDenied,
            FsError::Cloud(CloudError::NotFound(_)) => ErrorClass::NotFound,
            FsError::Cloud(CloudError::Forbidden(_)) => ErrorClass::AccessDenied,
            FsError::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorClass::NotFound,
            FsError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                ErrorClass::AccessDenied
            }
            _ => ErrorClass::Generic,
        }
    }

    /// Map the error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::AccessDenied(_) => libc::EACCES,
            FsError::Timeout(_) => libc::ETIMEDOUT,
            FsError::DownloadFailed(_) => libc::EIO,
            FsError::StreamClosed => libc::EBADF,
            FsError::CacheCorruption(_) | FsError::CacheClearIncomplete { .. } => libc::EIO,
            FsError::Cloud(e) => e.to_errno(),
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Why an upload ended without replacing its synthetic node
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadFailure {
    #[error("file is empty")]
    ZeroLength,

    #[error("backend returned no node")]
    NoNode,

    #[error("parent folder no longer exists")]
    NoFolderNode,

    #[error("overwrite target no longer exists")]
    NoOverwriteNode,

    #[error("name conflict on the backend")]
    Conflict,

    #[error("upload cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, FsError>;
