//! Process-wide key allocation for semaphores and segments

use crate::error::{IpcError, Result};
use std::sync::atomic::{AtomicI32, Ordering};

/// Width of the key range `per_process` hands to each process id
const PROCESS_RANGE_BITS: u32 = 16;

/// Monotonic generator of integer keys.
///
/// Keys are unique among the values issued by one allocator. Independent
/// processes only avoid each other if they draw from disjoint ranges, see
/// [`KeyAllocator::per_process`]. Writers still retry on collisions with
/// objects created elsewhere.
#[derive(Debug)]
pub struct KeyAllocator {
    next: AtomicI32,
}

impl KeyAllocator {
    /// Allocator whose first key is `first` (clamped to at least 1)
    pub const fn starting_at(first: i32) -> Self {
        let first = if first < 1 { 1 } else { first };
        Self {
            next: AtomicI32::new(first),
        }
    }

    /// Allocator starting in a range derived from the current process id
    pub fn per_process() -> Self {
        let pid = std::process::id() & 0x3FFF;
        Self::starting_at(((pid << PROCESS_RANGE_BITS) | 1) as i32)
    }

    /// Issue the next key
    pub fn next(&self) -> Result<i32> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |key| key.checked_add(1))
            .map_err(|_| IpcError::KeysExhausted)
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Allocator shared by every test in the crate so parallel tests never
/// reuse a key.
#[cfg(test)]
pub(crate) fn test_keys() -> std::sync::Arc<KeyAllocator> {
    use std::sync::{Arc, OnceLock};

    static KEYS: OnceLock<Arc<KeyAllocator>> = OnceLock::new();
    KEYS.get_or_init(|| Arc::new(KeyAllocator::per_process())).clone()
}
