//! Error types for semshm

use std::fmt;
use std::io;
use std::sync::PoisonError;
use thiserror::Error;

/// Result type for semshm operations
pub type Result<T> = std::result::Result<T, IpcError>;

/// Kind of OS object an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Semaphore,
    SharedMemory,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Semaphore => f.write_str("semaphore"),
            Resource::SharedMemory => f.write_str("shared memory"),
        }
    }
}

/// Errors that can occur in semshm operations
#[derive(Debug, Error)]
pub enum IpcError {
    /// Exclusive create on a key that is already live
    #[error("{resource} with key {key} already exists")]
    ResourceExists { resource: Resource, key: i32 },

    /// Open on a key that does not exist (or was removed)
    #[error("{resource} with key {key} does not exist")]
    ResourceAbsent { resource: Resource, key: i32 },

    /// Operation on a handle after `close`
    #[error("{resource} with key {key} is closed")]
    ResourceClosed { resource: Resource, key: i32 },

    #[error("Permission denied on {resource} with key {key}: {source}")]
    PermissionDenied {
        resource: Resource,
        key: i32,
        #[source]
        source: io::Error,
    },

    /// Access past the end of a segment
    #[error("Size exceeded: max {max} bytes, got {got} bytes")]
    SizeExceeded { max: usize, got: usize },

    #[error("Invalid segment size: {0}")]
    InvalidSize(usize),

    /// Catch-all for errno values without a dedicated variant
    #[error("{op} failed on {resource} with key {key}: {source}")]
    Os {
        op: &'static str,
        resource: Resource,
        key: i32,
        #[source]
        source: io::Error,
    },

    #[error("Key space exhausted")]
    KeysExhausted,

    /// Writer or reader used after `close`
    #[error("{0} is closed")]
    ChannelClosed(&'static str),

    #[error("Invalid write handle: {0:?}")]
    InvalidHandle(String),

    #[error("Internal mutex was poisoned")]
    PoisonedLock,
}

impl IpcError {
    /// Translate an OS error raised by `op` on the object named by `key`.
    pub(crate) fn from_os(op: &'static str, resource: Resource, key: i32, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EEXIST) => IpcError::ResourceExists { resource, key },
            Some(libc::ENOENT) => IpcError::ResourceAbsent { resource, key },
            Some(libc::EACCES) | Some(libc::EPERM) => IpcError::PermissionDenied {
                resource,
                key,
                source,
            },
            _ => IpcError::Os {
                op,
                resource,
                key,
                source,
            },
        }
    }

    /// True for `ResourceAbsent`
    pub fn is_absent(&self) -> bool {
        matches!(self, IpcError::ResourceAbsent { .. })
    }

    /// True for `ResourceExists`
    pub fn is_exists(&self) -> bool {
        matches!(self, IpcError::ResourceExists { .. })
    }

    /// True for `ResourceClosed` and `ChannelClosed`
    pub fn is_closed(&self) -> bool {
        matches!(self, IpcError::ResourceClosed { .. } | IpcError::ChannelClosed(_))
    }
}

impl<T> From<PoisonError<T>> for IpcError {
    fn from(_: PoisonError<T>) -> Self {
        IpcError::PoisonedLock
    }
}
