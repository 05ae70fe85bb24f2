//! Reader side of a semaphore-guarded shared memory channel

use crate::error::{IpcError, Result};
use crate::semaphore::Semaphore;
use crate::shm::SharedMemory;
use crate::writer::{Pair, WriteResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

type PairKey = (i32, i32);

enum ReaderState {
    Open(HashMap<PairKey, Pair>),
    Closed,
}

/// Reader half of a semaphore-guarded shared memory channel.
///
/// Opened handles are cached per (semaphore key, segment key) so repeated
/// reads from the same writer pair do not reopen OS objects. The reader
/// never creates or removes anything.
pub struct SemaphoredReader {
    state: Mutex<ReaderState>,
}

impl SemaphoredReader {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReaderState::Open(HashMap::new())),
        }
    }

    /// Fetch the payload described by `handle`.
    ///
    /// The bytes are copied out while holding the pair's semaphore, so they
    /// are always one complete write. They are the latest write to that pair,
    /// which may be newer than `handle` if the writer reused it meanwhile.
    pub fn read_bytes(&self, handle: &WriteResult) -> Result<Vec<u8>> {
        let mut state = self.state.lock()?;
        let ReaderState::Open(cache) = &mut *state else {
            return Err(IpcError::ChannelClosed("reader"));
        };

        let key = (handle.semaphore_key, handle.shared_memory_key);
        if !cache.contains_key(&key) {
            prune_removed(cache);
        }
        let pair = match cache.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(open_pair(handle)?),
        };

        match read_locked(pair, handle.size) {
            Ok(bytes) => {
                trace!(%handle, "read payload");
                Ok(bytes)
            }
            Err(e) if e.is_absent() => {
                // The writer removed this pair
                debug!(%handle, "evicting removed pair");
                cache.remove(&key);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of cached (semaphore, segment) pairs
    pub fn cached_pairs(&self) -> Result<usize> {
        Ok(match &*self.state.lock()? {
            ReaderState::Open(cache) => cache.len(),
            ReaderState::Closed => 0,
        })
    }

    /// Close every cached handle. Pairs whose writer already removed them
    /// are skipped silently; the first other failure is returned. Later
    /// reads fail with `ChannelClosed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        let ReaderState::Open(cache) = std::mem::replace(&mut *state, ReaderState::Closed) else {
            return Ok(());
        };

        let mut first_err = None;
        for (_, mut pair) in cache {
            match pair.close() {
                Ok(()) => {}
                Err(e) if e.is_absent() => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        debug!("closed reader");
        first_err.map_or(Ok(()), Err)
    }
}

impl Default for SemaphoredReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SemaphoredReader {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close reader");
        }
    }
}

/// Drop cached pairs whose writer has removed them
fn prune_removed(cache: &mut HashMap<PairKey, Pair>) {
    cache.retain(|&(semaphore_key, shared_memory_key), pair| match pair.semaphore.check() {
        Err(e) if e.is_absent() => {
            debug!(semaphore_key, shared_memory_key, "pruning removed pair");
            false
        }
        _ => true,
    });
}

fn open_pair(handle: &WriteResult) -> Result<Pair> {
    let semaphore = Semaphore::open(handle.semaphore_key)?;
    let segment = SharedMemory::open(handle.shared_memory_key)?;
    Ok(Pair { semaphore, segment })
}

/// Copy `len` bytes out of the pair's segment while holding its semaphore
fn read_locked(pair: &Pair, len: usize) -> Result<Vec<u8>> {
    let guard = pair.semaphore.acquire()?;
    let bytes = pair.segment.read_bytes(len)?;
    guard.release()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{test_keys, KeyAllocator};
    use crate::writer::{SemaphoredWriter, SizePolicy, WriterConfig};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphored_shared_memory() {
        let keys = test_keys();
        let w1 = SemaphoredWriter::new(keys.clone());
        let w2 = SemaphoredWriter::new(keys);
        let r1 = SemaphoredReader::new();
        let r2 = SemaphoredReader::new();

        let b1 = b"test";
        let mut sem_keys = HashSet::new();
        let mut shm_keys = HashSet::new();
        let mut ats = Vec::new();

        for (w, r) in [(&w1, &r1), (&w2, &r2)] {
            let ro = w.write_bytes(b1).unwrap();
            assert_eq!(ro.size, 4);
            assert!(ro.semaphore_key > 0);
            assert!(ro.shared_memory_key > 0);
            assert!(ro.shared_memory_at > 0);
            assert!(sem_keys.insert(ro.semaphore_key));
            assert!(shm_keys.insert(ro.shared_memory_key));
            ats.push(ro.shared_memory_at);

            assert_eq!(r.read_bytes(&ro).unwrap(), b1);
        }

        let b3 = b"test1";
        let ro = w1.write_bytes(b3).unwrap();
        assert_ne!(ro.shared_memory_at, ats[0]);
        assert_eq!(r1.read_bytes(&ro).unwrap(), b3);

        // Any reader can use any handle
        assert_eq!(r2.read_bytes(&ro).unwrap(), b3);
    }

    #[test]
    fn test_cache_reuses_handles() {
        let writer = SemaphoredWriter::new(test_keys());
        let reader = SemaphoredReader::new();

        let ro = writer.write_bytes(b"one").unwrap();
        assert_eq!(reader.read_bytes(&ro).unwrap(), b"one");
        let ro = writer.write_bytes(b"two").unwrap();
        assert_eq!(reader.read_bytes(&ro).unwrap(), b"two");
        assert_eq!(reader.cached_pairs().unwrap(), 1);

        let ro = writer.write_bytes(b"three").unwrap();
        assert_eq!(reader.read_bytes(&ro).unwrap(), b"three");
        assert_eq!(reader.cached_pairs().unwrap(), 2);
    }

    #[test]
    fn test_page_sized_round_trips() {
        for size_policy in [SizePolicy::Exact, SizePolicy::PageRounded] {
            let config = WriterConfig {
                size_policy,
                ..Default::default()
            };
            let writer = SemaphoredWriter::with_config(test_keys(), config);
            let reader = SemaphoredReader::new();

            for len in [0usize, 1, 4095, 4096] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let ro = writer.write_bytes(&payload).unwrap();
                assert_eq!(ro.size, len);
                assert_eq!(reader.read_bytes(&ro).unwrap(), payload, "{:?} len {}", size_policy, len);
            }
        }
    }

    #[test]
    fn test_following_growth_keeps_cache_bounded() {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
        // Past the descriptor limit, capped so huge limits stay quick
        let rounds = (limit.rlim_cur as usize).min(4096) + 64;

        // Stay clear of the shared test allocator
        let base = KeyAllocator::per_process().next().unwrap() + 0xA000;
        let config = WriterConfig {
            retained_pairs: 2,
            ..Default::default()
        };
        let writer = SemaphoredWriter::with_config(Arc::new(KeyAllocator::starting_at(base)), config);
        let reader = SemaphoredReader::new();

        for len in 1..=rounds {
            let payload = vec![(len % 256) as u8; len];
            let ro = writer.write_bytes(&payload).unwrap();
            assert_eq!(reader.read_bytes(&ro).unwrap(), payload);
            // Current pair, the retained ones, and at most one stale entry
            assert!(reader.cached_pairs().unwrap() <= 4);
        }
    }

    #[test]
    fn test_missing_pair_is_not_cached() {
        let keys = test_keys();
        let handle = WriteResult {
            size: 4,
            semaphore_key: keys.next().unwrap(),
            shared_memory_key: keys.next().unwrap(),
            shared_memory_at: 1,
        };
        let reader = SemaphoredReader::new();
        assert!(reader.read_bytes(&handle).unwrap_err().is_absent());
        assert_eq!(reader.cached_pairs().unwrap(), 0);
    }

    #[test]
    fn test_oversized_handle() {
        let writer = SemaphoredWriter::new(test_keys());
        let reader = SemaphoredReader::new();

        let mut ro = writer.write_bytes(b"abc").unwrap();
        ro.size = 4;
        assert!(matches!(
            reader.read_bytes(&ro),
            Err(IpcError::SizeExceeded { max: 3, got: 4 })
        ));

        // A failed read keeps the valid entry
        assert_eq!(reader.cached_pairs().unwrap(), 1);
        ro.size = 3;
        assert_eq!(reader.read_bytes(&ro).unwrap(), b"abc");
    }

    #[test]
    fn test_removed_pair_is_evicted() {
        let writer = SemaphoredWriter::new(test_keys());
        let reader = SemaphoredReader::new();

        let ro = writer.write_bytes(b"gone").unwrap();
        assert_eq!(reader.read_bytes(&ro).unwrap(), b"gone");

        writer.close().unwrap();
        assert!(reader.read_bytes(&ro).unwrap_err().is_absent());
        assert_eq!(reader.cached_pairs().unwrap(), 0);
        reader.close().unwrap();
    }

    #[test]
    fn test_close_tolerates_removed_pairs() {
        let writer = SemaphoredWriter::new(test_keys());
        let reader = SemaphoredReader::new();

        let ro = writer.write_bytes(b"data").unwrap();
        reader.read_bytes(&ro).unwrap();
        writer.close().unwrap();

        reader.close().unwrap();
        assert!(matches!(
            reader.read_bytes(&ro),
            Err(IpcError::ChannelClosed("reader"))
        ));
        reader.close().unwrap();
    }

    #[test]
    fn test_reader_close_leaves_writer_objects() {
        let writer = SemaphoredWriter::new(test_keys());
        let reader = SemaphoredReader::new();

        let ro = writer.write_bytes(b"keep").unwrap();
        reader.read_bytes(&ro).unwrap();
        reader.close().unwrap();

        let other = SemaphoredReader::new();
        assert_eq!(other.read_bytes(&ro).unwrap(), b"keep");
    }

    #[test]
    fn test_concurrent_pairs_do_not_mix() {
        // Stay clear of the shared test allocator
        let base = KeyAllocator::per_process().next().unwrap() + 0x4000;
        let keys = Arc::new(KeyAllocator::starting_at(base));

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let keys = keys.clone();
                thread::spawn(move || {
                    let writer = SemaphoredWriter::new(keys);
                    let reader = SemaphoredReader::new();
                    let payload = [i; 4];
                    for _ in 0..50 {
                        let ro = writer.write_bytes(&payload).unwrap();
                        assert_eq!(reader.read_bytes(&ro).unwrap(), payload);
                    }
                    let ro = writer.write_bytes(&payload).unwrap();
                    (ro.semaphore_key, ro.shared_memory_key)
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let (sem, shm) = handle.join().unwrap();
            assert!(seen.insert(sem));
            assert!(seen.insert(shm));
        }
    }
}
