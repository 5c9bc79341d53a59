//! Shared-memory OS capability.
//!
//! The communicator never maps memory itself. It needs two things from the
//! OS: opening a shared-memory object by path, and turning a descriptor into
//! a handle the daemon can use to reach the same object.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use tdl_core::{ProcessId, ShmHandle};

/// OS primitives needed to hand a shared-memory object to the daemon.
pub trait SharedMemoryOs: Send + Sync {
    /// Opens an existing shared-memory object read-only.
    fn open(&self, path: &str) -> io::Result<OwnedFd>;

    /// Creates a handle to `fd` usable by the process `daemon_pid`.
    fn create_handle(&self, fd: RawFd, daemon_pid: ProcessId) -> io::Result<ShmHandle>;
}

/// POSIX backend built on `shm_open`.
///
/// POSIX has no handle objects scoped to another process. The daemon reaches
/// the object through `/proc/<client-pid>/fd/<fd>`, so the handle is the
/// descriptor number once both the descriptor and the daemon process have
/// been checked to exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixSharedMemory;

impl SharedMemoryOs for PosixSharedMemory {
    fn open(&self, path: &str) -> io::Result<OwnedFd> {
        let name = CString::new(path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

        // SAFETY: `name` is a valid NUL-terminated string for the duration of
        // the call.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDONLY,
                (libc::S_IRUSR | libc::S_IRGRP) as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!(path, fd, "Opened shared memory object");
        // SAFETY: `fd` was just returned by a successful `shm_open` and is
        // owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn create_handle(&self, fd: RawFd, daemon_pid: ProcessId) -> io::Result<ShmHandle> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if !daemon_pid.is_valid() {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }

        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: signal 0 performs the existence and permission check only.
        if unsafe { libc::kill(daemon_pid.as_raw(), 0) } < 0 {
            let err = io::Error::last_os_error();
            // The daemon usually runs under another user.
            if err.raw_os_error() != Some(libc::EPERM) {
                return Err(err);
            }
        }

        let raw = u64::try_from(fd).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
        Ok(ShmHandle::new(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn own_pid() -> ProcessId {
        ProcessId::new(i32::try_from(std::process::id()).unwrap())
    }

    #[test]
    fn test_create_handle_for_live_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let handle = PosixSharedMemory
            .create_handle(file.as_raw_fd(), own_pid())
            .unwrap();
        assert_eq!(handle.as_raw(), file.as_raw_fd() as u64);
    }

    #[test]
    fn test_create_handle_rejects_bad_descriptor() {
        assert!(PosixSharedMemory.create_handle(-1, own_pid()).is_err());
        assert!(PosixSharedMemory.create_handle(1_000_000, own_pid()).is_err());
    }

    #[test]
    fn test_create_handle_rejects_invalid_pid() {
        let file = tempfile::tempfile().unwrap();
        assert!(PosixSharedMemory
            .create_handle(file.as_raw_fd(), ProcessId::INVALID)
            .is_err());
    }

    #[test]
    fn test_open_missing_object_fails() {
        let err = PosixSharedMemory
            .open("/tdl-test-object-that-does-not-exist")
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_open_rejects_interior_nul() {
        let err = PosixSharedMemory.open("/bad\0name").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_open_existing_object() {
        let name = format!("/tdl-shm-test-{}", std::process::id());
        let c_name = CString::new(name.clone()).unwrap();
        let created = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        assert!(created >= 0);

        let opened = PosixSharedMemory.open(&name);

        unsafe {
            libc::close(created);
            libc::shm_unlink(c_name.as_ptr());
        }
        assert!(opened.unwrap().as_raw_fd() >= 0);
    }
}
