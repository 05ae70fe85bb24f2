//! semshm - Semaphore-guarded shared memory channels
//!
//! Cross-process primitives for publishing variable-length payloads between
//! processes on the same host.
//!
//! # Architecture
//!
//! - **Semaphore / SharedMemory**: keyed OS objects. The creator owns and
//!   removes them, every other handle only detaches.
//! - **KeyAllocator**: hands out fresh keys, shared by writers through an `Arc`
//! - **SemaphoredWriter**: writes each payload into its current segment under
//!   that segment's semaphore, rotating to a larger pair on growth
//! - **SemaphoredReader**: turns a [`WriteResult`] back into bytes
//!
//! The [`WriteResult`] travels from writer to reader over a transport of the
//! caller's choosing. Freshness is the caller's protocol: a reader sees the
//! latest complete write to a pair, never a partial one.

pub mod error;
pub mod flags;
pub mod keys;
pub mod reader;
pub mod semaphore;
pub mod shm;
pub mod writer;

pub use error::{IpcError, Resource, Result};
pub use flags::IpcFlags;
pub use keys::KeyAllocator;
pub use reader::SemaphoredReader;
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use shm::SharedMemory;
pub use writer::{SemaphoredWriter, SizePolicy, WriteResult, WriterConfig};
