//! System V counting semaphores keyed by integer
//!
//! Each semaphore is a single-count mutex: the creator initializes it to 1,
//! `lock` decrements and `unlock` increments. The creator owns the OS object
//! and removes it on close; every other handle only detaches.
//!
//! A process that dies while holding the lock leaves the count at 0 for the
//! next opener. Nothing here recovers from that.

use crate::error::{IpcError, Resource, Result};
use crate::flags::IpcFlags;
use std::io;
use tracing::{debug, warn};

/// Handle to a System V semaphore
#[derive(Debug)]
pub struct Semaphore {
    key: i32,
    id: Option<libc::c_int>,
    is_owner: bool,
}

impl Semaphore {
    /// Create a semaphore for `key`.
    ///
    /// Creation is always attempted exclusively. If the key is taken, the
    /// call fails with `ResourceExists` when `flags` asks for
    /// [`IpcFlags::EXCLUSIVE`] and opens the existing semaphore otherwise.
    /// Without [`IpcFlags::CREATE`] this is the same as [`Semaphore::open`].
    pub fn create(key: i32, flags: IpcFlags) -> Result<Self> {
        if !flags.is_create() {
            return Self::open(key);
        }

        let id = unsafe { libc::semget(key as libc::key_t, 1, flags.sem_flags()) };
        if id < 0 {
            let err = IpcError::from_os("semget", Resource::Semaphore, key, io::Error::last_os_error());
            if err.is_exists() && !flags.is_exclusive() {
                return Self::open(key);
            }
            return Err(err);
        }

        // Dropping on failure removes the half-initialized object
        let semaphore = Self {
            key,
            id: Some(id),
            is_owner: true,
        };

        // Fresh System V semaphores start at 0
        if unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as libc::c_int) } < 0 {
            return Err(semaphore.id_error("semctl(SETVAL)", io::Error::last_os_error()));
        }

        debug!(key, id, "created semaphore");
        Ok(semaphore)
    }

    /// Open an existing semaphore
    pub fn open(key: i32) -> Result<Self> {
        let id = unsafe { libc::semget(key as libc::key_t, 0, 0) };
        if id < 0 {
            return Err(IpcError::from_os(
                "semget",
                Resource::Semaphore,
                key,
                io::Error::last_os_error(),
            ));
        }

        debug!(key, id, "opened semaphore");
        Ok(Self {
            key,
            id: Some(id),
            is_owner: false,
        })
    }

    /// Block until the semaphore is acquired
    pub fn lock(&self) -> Result<()> {
        self.op(-1, "semop(lock)")
    }

    pub fn unlock(&self) -> Result<()> {
        self.op(1, "semop(unlock)")
    }

    /// Lock and return a guard that unlocks when dropped
    pub fn acquire(&self) -> Result<SemaphoreGuard<'_>> {
        self.lock()?;
        Ok(SemaphoreGuard {
            semaphore: self,
            released: false,
        })
    }

    /// Close the handle.
    ///
    /// The owner removes the OS semaphore. Any other handle checks that the
    /// semaphore still exists and reports `ResourceAbsent` if its creator
    /// already removed it. The handle is closed either way and later calls
    /// return `Ok(())`.
    pub fn close(&mut self) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };

        let (op, ret) = if self.is_owner {
            ("semctl(IPC_RMID)", unsafe { libc::semctl(id, 0, libc::IPC_RMID) })
        } else {
            ("semctl(GETVAL)", unsafe { libc::semctl(id, 0, libc::GETVAL) })
        };
        if ret < 0 {
            return Err(self.id_error(op, io::Error::last_os_error()));
        }

        debug!(key = self.key, id, removed = self.is_owner, "closed semaphore");
        Ok(())
    }

    /// Check that the OS semaphore still exists. `ResourceAbsent` means its
    /// creator removed it.
    pub fn check(&self) -> Result<()> {
        let id = self.id.ok_or(IpcError::ResourceClosed {
            resource: Resource::Semaphore,
            key: self.key,
        })?;
        if unsafe { libc::semctl(id, 0, libc::GETVAL) } < 0 {
            return Err(self.id_error("semctl(GETVAL)", io::Error::last_os_error()));
        }
        Ok(())
    }

    #[inline]
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Check if this handle created (and will remove) the semaphore
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.id.is_none()
    }

    fn op(&self, delta: libc::c_short, op: &'static str) -> Result<()> {
        let id = self.id.ok_or(IpcError::ResourceClosed {
            resource: Resource::Semaphore,
            key: self.key,
        })?;

        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: 0,
        };
        loop {
            if unsafe { libc::semop(id, &mut buf, 1) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(self.id_error(op, err));
        }
    }

    /// Errors from calls on a semaphore id. A removed id reports EINVAL or
    /// EIDRM.
    fn id_error(&self, op: &'static str, err: io::Error) -> IpcError {
        match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::EIDRM) => IpcError::ResourceAbsent {
                resource: Resource::Semaphore,
                key: self.key,
            },
            _ => IpcError::from_os(op, Resource::Semaphore, self.key, err),
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        match self.close() {
            Ok(()) => {}
            Err(e) if e.is_absent() => debug!(key = self.key, "semaphore already removed"),
            Err(e) => warn!(key = self.key, error = %e, "failed to close semaphore"),
        }
    }
}

/// Held lock on a [`Semaphore`]
#[must_use = "the semaphore is unlocked as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
    released: bool,
}

impl SemaphoreGuard<'_> {
    /// Unlock now and report the result
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.semaphore.unlock()
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.semaphore.unlock() {
            warn!(key = self.semaphore.key, error = %e, "failed to release semaphore");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn exclusive() -> IpcFlags {
        IpcFlags::CREATE | IpcFlags::EXCLUSIVE | IpcFlags::from_mode(0o666)
    }

    #[test]
    fn test_create_open_close() {
        let key = test_keys().next().unwrap();

        let mut s1 = Semaphore::create(key, exclusive()).unwrap();
        assert_eq!(s1.key(), key);
        assert!(s1.is_owner());
        s1.lock().unwrap();
        s1.unlock().unwrap();

        let mut s2 = Semaphore::open(key).unwrap();
        assert_eq!(s2.key(), key);
        assert!(!s2.is_owner());
        s2.lock().unwrap();
        s2.unlock().unwrap();

        s2.check().unwrap();
        s1.close().unwrap();
        assert!(s1.is_closed());
        assert!(s1.check().unwrap_err().is_closed());
        assert!(matches!(s1.lock(), Err(IpcError::ResourceClosed { .. })));
        assert!(matches!(s1.unlock(), Err(IpcError::ResourceClosed { .. })));
        s1.close().unwrap();

        // The creator removed it underneath the second handle
        assert!(s2.check().unwrap_err().is_absent());
        assert!(s2.close().unwrap_err().is_absent());
        assert!(s2.lock().unwrap_err().is_closed());
        assert!(s2.unlock().unwrap_err().is_closed());
    }

    #[test]
    fn test_open_missing() {
        let key = test_keys().next().unwrap();
        assert!(Semaphore::open(key).unwrap_err().is_absent());
    }

    #[test]
    fn test_exclusive_collision() {
        let key = test_keys().next().unwrap();
        let _s1 = Semaphore::create(key, exclusive()).unwrap();

        assert!(Semaphore::create(key, exclusive()).unwrap_err().is_exists());

        let s2 = Semaphore::create(key, IpcFlags::CREATE | IpcFlags::from_mode(0o666)).unwrap();
        assert!(!s2.is_owner());
    }

    #[test]
    fn test_guard_excludes_other_handles() {
        let key = test_keys().next().unwrap();
        let owner = Semaphore::create(key, exclusive()).unwrap();
        let held = Arc::new(AtomicBool::new(false));

        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = {
            let held = held.clone();
            thread::spawn(move || {
                let semaphore = Semaphore::open(key).unwrap();
                let guard = semaphore.acquire().unwrap();
                held.store(true, Ordering::SeqCst);
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                held.store(false, Ordering::SeqCst);
                guard.release().unwrap();
            })
        };

        locked_rx.recv().unwrap();
        {
            let _guard = owner.acquire().unwrap();
            assert!(!held.load(Ordering::SeqCst));
        }
        holder.join().unwrap();

        // Guard drop released it again
        owner.acquire().unwrap().release().unwrap();
    }
}
