//! Platform-specific durability and file-locking primitives
//!
//! `durable_sync` maps to the strongest flush each platform offers.
//! `lock_byte` / `unlock_byte` are advisory one-byte fcntl locks used to
//! serialise writers across processes; on non-unix targets they are no-ops
//! and only the in-process locks apply.

use std::fs::File;
use std::io;

/// Ensures data is durably written to persistent storage before returning.
///
/// - Linux: fdatasync() (data only, no metadata)
/// - macOS/iOS: fcntl(F_FULLFSYNC), plain fsync stops at the drive cache there
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// May block for a long time under heavy I/O; callers must not hold locks
/// that other threads need to make progress.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Take an exclusive advisory lock on the single byte at `offset`.
///
/// With `wait` the call blocks until the lock is granted (F_SETLKW).
/// Without it, returns `Ok(false)` when another process holds the byte.
#[cfg(unix)]
pub fn lock_byte(file: &File, offset: u64, wait: bool) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let fl = flock_for(offset, libc::F_WRLCK as i32);
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        // SAFETY: fd is valid for the lifetime of `file`; `fl` is a fully
        // initialised flock struct that outlives the call.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Release a lock taken with `lock_byte`.
#[cfg(unix)]
pub fn unlock_byte(file: &File, offset: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fl = flock_for(offset, libc::F_UNLCK as i32);
    // SAFETY: as in lock_byte.
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn flock_for(offset: u64, lock_type: i32) -> libc::flock {
    // SAFETY: flock is plain old data; all-zero is a valid starting value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = 1;
    fl
}

#[cfg(not(unix))]
pub fn lock_byte(_file: &File, _offset: u64, _wait: bool) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
pub fn unlock_byte(_file: &File, _offset: u64) -> io::Result<()> {
    Ok(())
}
