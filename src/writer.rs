//! Writer side of a semaphore-guarded shared memory channel
//!
//! Every payload lands at offset 0 of the writer's current segment. When a
//! payload no longer fits, a new (semaphore, segment) pair is created under
//! fresh keys and becomes current; the previous pair is retired and kept
//! alive for a while so readers still holding its handle can finish.

use crate::error::{IpcError, Result};
use crate::flags::IpcFlags;
use crate::keys::KeyAllocator;
use crate::semaphore::Semaphore;
use crate::shm::SharedMemory;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Default number of keys tried when creating an object collides with one
/// created elsewhere
const DEFAULT_CREATE_ATTEMPTS: usize = 64;

/// Default number of superseded pairs kept open
const DEFAULT_RETAINED_PAIRS: usize = 2;

const PAGE_SIZE: usize = 4096;

/// How large a newly allocated segment is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePolicy {
    /// Exactly the payload length (at least one byte)
    #[default]
    Exact,
    /// Payload length rounded up to whole pages
    PageRounded,
}

impl SizePolicy {
    fn capacity_for(self, len: usize) -> usize {
        let len = len.max(1);
        match self {
            SizePolicy::Exact => len,
            SizePolicy::PageRounded => len.div_ceil(PAGE_SIZE) * PAGE_SIZE,
        }
    }
}

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flags for every semaphore and segment the writer creates.
    /// `CREATE | EXCLUSIVE` are always applied.
    pub flags: IpcFlags,
    /// Keys tried per object before giving up on collisions
    pub create_attempts: usize,
    /// Superseded pairs kept open for late readers
    pub retained_pairs: usize,
    pub size_policy: SizePolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flags: IpcFlags::default(),
            create_attempts: DEFAULT_CREATE_ATTEMPTS,
            retained_pairs: DEFAULT_RETAINED_PAIRS,
            size_policy: SizePolicy::default(),
        }
    }
}

/// Where a payload was written. Hand this to a reader out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteResult {
    /// Payload length in bytes
    pub size: usize,
    pub semaphore_key: i32,
    pub shared_memory_key: i32,
    /// Write sequence number of the writer, strictly increasing from 1
    pub shared_memory_at: i64,
}

impl fmt::Display for WriteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.size, self.semaphore_key, self.shared_memory_key, self.shared_memory_at
        )
    }
}

impl FromStr for WriteResult {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || IpcError::InvalidHandle(s.to_string());
        let mut parts = s.trim().split(':');
        let mut field = || parts.next().ok_or_else(&invalid);

        let size = field()?.parse().map_err(|_| invalid())?;
        let semaphore_key = field()?.parse().map_err(|_| invalid())?;
        let shared_memory_key = field()?.parse().map_err(|_| invalid())?;
        let shared_memory_at = field()?.parse().map_err(|_| invalid())?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            size,
            semaphore_key,
            shared_memory_key,
            shared_memory_at,
        })
    }
}

/// A segment and the semaphore guarding it
pub(crate) struct Pair {
    pub(crate) semaphore: Semaphore,
    pub(crate) segment: SharedMemory,
}

impl Pair {
    fn capacity(&self) -> usize {
        self.segment.size()
    }

    /// Close both halves, reporting the first failure
    pub(crate) fn close(&mut self) -> Result<()> {
        let semaphore = self.semaphore.close();
        let segment = self.segment.close();
        semaphore.and(segment)
    }
}

enum WriterState {
    /// Nothing written yet
    Idle,
    Active(Pair),
    Closed,
}

struct Inner {
    state: WriterState,
    /// Superseded pairs, oldest first
    retired: VecDeque<Pair>,
    /// Last issued `shared_memory_at`
    sequence: i64,
}

/// Writer half of a semaphore-guarded, self-rotating shared memory channel
pub struct SemaphoredWriter {
    keys: Arc<KeyAllocator>,
    config: WriterConfig,
    inner: Mutex<Inner>,
}

impl SemaphoredWriter {
    pub fn new(keys: Arc<KeyAllocator>) -> Self {
        Self::with_config(keys, WriterConfig::default())
    }

    pub fn with_config(keys: Arc<KeyAllocator>, config: WriterConfig) -> Self {
        Self {
            keys,
            config,
            inner: Mutex::new(Inner {
                state: WriterState::Idle,
                retired: VecDeque::new(),
                sequence: 0,
            }),
        }
    }

    /// Publish `payload` and return the handle a reader needs to fetch it.
    ///
    /// The current pair is reused while its segment is large enough,
    /// otherwise a new pair is allocated. A failed write leaves the writer
    /// exactly as it was.
    pub fn write_bytes(&self, payload: &[u8]) -> Result<WriteResult> {
        let mut inner = self.inner.lock()?;

        let current = match &inner.state {
            WriterState::Closed => return Err(IpcError::ChannelClosed("writer")),
            WriterState::Active(pair) if pair.capacity() >= payload.len() => Some(pair),
            _ => None,
        };

        let (semaphore_key, shared_memory_key) = match current {
            Some(pair) => {
                write_locked(pair, payload)?;
                (pair.semaphore.key(), pair.segment.key())
            }
            None => {
                let pair = self.allocate_pair(payload.len())?;
                // Dropping `pair` on failure removes the new objects
                write_locked(&pair, payload)?;
                let keys = (pair.semaphore.key(), pair.segment.key());
                self.install(&mut inner, pair);
                keys
            }
        };

        inner.sequence += 1;
        let result = WriteResult {
            size: payload.len(),
            semaphore_key,
            shared_memory_key,
            shared_memory_at: inner.sequence,
        };
        trace!(%result, "wrote payload");
        Ok(result)
    }

    /// Segment size of the current pair
    pub fn capacity(&self) -> Result<Option<usize>> {
        let inner = self.inner.lock()?;
        Ok(match &inner.state {
            WriterState::Active(pair) => Some(pair.capacity()),
            _ => None,
        })
    }

    /// Close and remove every pair this writer created. Later writes fail
    /// with `ChannelClosed`; closing again is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let previous = std::mem::replace(&mut inner.state, WriterState::Closed);

        let mut first_err = None;
        let current = match previous {
            WriterState::Active(pair) => Some(pair),
            _ => None,
        };
        for mut pair in inner.retired.drain(..).chain(current) {
            if let Err(e) = pair.close() {
                first_err.get_or_insert(e);
            }
        }

        debug!("closed writer");
        first_err.map_or(Ok(()), Err)
    }

    /// Make `pair` current and retire the previous one
    fn install(&self, inner: &mut Inner, pair: Pair) {
        debug!(
            semaphore_key = pair.semaphore.key(),
            shared_memory_key = pair.segment.key(),
            capacity = pair.capacity(),
            "switched to new pair"
        );

        if let WriterState::Active(old) = std::mem::replace(&mut inner.state, WriterState::Active(pair)) {
            inner.retired.push_back(old);
        }
        while inner.retired.len() > self.config.retained_pairs {
            let Some(mut oldest) = inner.retired.pop_front() else {
                break;
            };
            if let Err(e) = oldest.close() {
                warn!(
                    semaphore_key = oldest.semaphore.key(),
                    shared_memory_key = oldest.segment.key(),
                    error = %e,
                    "failed to close retired pair"
                );
            }
        }
    }

    fn allocate_pair(&self, len: usize) -> Result<Pair> {
        let flags = self.config.flags | IpcFlags::CREATE | IpcFlags::EXCLUSIVE;
        let capacity = self.config.size_policy.capacity_for(len);

        let semaphore = self.create_with_retry(|key| Semaphore::create(key, flags))?;
        let segment = self.create_with_retry(|key| SharedMemory::create(key, capacity, flags))?;
        Ok(Pair { semaphore, segment })
    }

    /// Draw keys until `create` stops reporting `ResourceExists`
    fn create_with_retry<T>(&self, mut create: impl FnMut(i32) -> Result<T>) -> Result<T> {
        let mut attempts = self.config.create_attempts.max(1);
        loop {
            let key = self.keys.next()?;
            match create(key) {
                Err(e) if e.is_exists() && attempts > 1 => {
                    debug!(key, "key taken, trying next");
                    attempts -= 1;
                }
                other => return other,
            }
        }
    }
}

/// Copy `payload` into the pair's segment while holding its semaphore
fn write_locked(pair: &Pair, payload: &[u8]) -> Result<()> {
    let guard = pair.semaphore.acquire()?;
    pair.segment.write_bytes(payload)?;
    guard.release()
}

impl Drop for SemaphoredWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close writer");
        }
    }
}
