//! Creation flags shared by semaphores and shared memory segments

use bitflags::bitflags;
use rustix::fs::Mode;
use rustix::shm::ShmOFlags;

bitflags! {
    /// Creation and permission flags, composed System V style:
    /// `IpcFlags::CREATE | IpcFlags::EXCLUSIVE | IpcFlags::from_mode(0o666)`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IpcFlags: u32 {
        /// Create the object if it is absent
        const CREATE = libc::IPC_CREAT as u32;
        /// Fail if the object already exists
        const EXCLUSIVE = libc::IPC_EXCL as u32;

        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC = 0o100;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC = 0o010;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC = 0o001;

        const PERMISSIONS = 0o777;
        const READ_WRITE_ALL = 0o666;
    }
}

impl IpcFlags {
    /// Permission bits from an octal mode, everything else dropped
    pub const fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode & 0o777)
    }

    #[inline]
    pub fn permissions(self) -> u32 {
        (self & Self::PERMISSIONS).bits()
    }

    #[inline]
    pub fn is_create(self) -> bool {
        self.contains(Self::CREATE)
    }

    #[inline]
    pub fn is_exclusive(self) -> bool {
        self.contains(Self::EXCLUSIVE)
    }

    /// Open flags for an exclusive `shm_open` create
    pub(crate) fn shm_oflags(self) -> ShmOFlags {
        let mut oflags = ShmOFlags::RDWR;
        if self.is_create() {
            oflags |= ShmOFlags::CREATE | ShmOFlags::EXCL;
        }
        oflags
    }

    pub(crate) fn mode(self) -> Mode {
        Mode::from_raw_mode(self.permissions() as _)
    }

    /// Flags for an exclusive `semget` create
    pub(crate) fn sem_flags(self) -> libc::c_int {
        (libc::IPC_CREAT | libc::IPC_EXCL) | self.permissions() as libc::c_int
    }
}

impl Default for IpcFlags {
    fn default() -> Self {
        Self::CREATE | Self::EXCLUSIVE | Self::OWNER_READ | Self::OWNER_WRITE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_like_system_v() {
        let flags = IpcFlags::CREATE | IpcFlags::EXCLUSIVE | IpcFlags::from_mode(0o666);
        assert!(flags.is_create());
        assert!(flags.is_exclusive());
        assert_eq!(flags.permissions(), 0o666);
        assert_eq!(flags, IpcFlags::CREATE | IpcFlags::EXCLUSIVE | IpcFlags::READ_WRITE_ALL);
    }

    #[test]
    fn from_mode_drops_non_permission_bits() {
        let flags = IpcFlags::from_mode(0o7644);
        assert_eq!(flags.permissions(), 0o644);
        assert!(!flags.is_create());
    }

    #[test]
    fn shm_translation() {
        let flags = IpcFlags::default();
        assert!(flags.shm_oflags().contains(ShmOFlags::CREATE | ShmOFlags::EXCL));
        assert_eq!(flags.mode(), Mode::RUSR | Mode::WUSR);
        assert!(!IpcFlags::from_mode(0o600).shm_oflags().contains(ShmOFlags::CREATE));
    }
}
