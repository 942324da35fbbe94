//! Cross-process advisory lock serializing rebind operations node-wide
//! (spec §4.7), plus the SIGINT/SIGTERM handling that must release it
//! before the process dies mid-operation.
//!
//! Matches the teacher's signal-handling idiom: register a handler via
//! `signal_hook::low_level::register` that does cleanup then re-raises
//! the default disposition with `signal_hook::low_level::emulate_default_handler`,
//! rather than calling `std::process::exit` directly from the handler.

use crate::error::{AcquireSnafu, CreateDirSnafu, LockError};
use nix::fcntl::{flock, FlockArg};
use snafu::ResultExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// A held advisory lock; dropping it releases the `flock` automatically
/// by closing the underlying file descriptor.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the node-wide lock at `dir/name`, creating `dir` (mode
    /// 0700) and the lock file (mode 0600) if they don't exist yet.
    /// Blocks until the lock is free.
    pub fn acquire(dir: &Path, name: &str) -> Result<FileLock, LockError> {
        fs::create_dir_all(dir).context(CreateDirSnafu {
            path: dir.to_path_buf(),
        })?;
        set_mode(dir, DIR_MODE);

        let path = dir.join(name);
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .create(true)
                .write(true)
                .mode(FILE_MODE)
                .open(&path)
                .context(AcquireSnafu { path: path.clone() })?
        };
        set_mode(&path, FILE_MODE);

        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| LockError::Acquire {
            path: path.clone(),
            source: std::io::Error::from_raw_os_error(e as i32),
        })?;

        register_lock_fd(file.as_raw_fd());
        Ok(FileLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        clear_lock_fd();
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

// The raw fd of the currently-held lock, if any, so the signal handler
// (which must be async-signal-safe and cannot touch Rust's ordinary
// ownership machinery) can release it directly via flock/close before
// re-raising the signal.
static HELD_LOCK_FD: AtomicI32 = AtomicI32::new(-1);

fn register_lock_fd(fd: i32) {
    HELD_LOCK_FD.store(fd, Ordering::SeqCst);
}

fn clear_lock_fd() {
    HELD_LOCK_FD.store(-1, Ordering::SeqCst);
}

/// Release the currently-registered lock fd, if any. Safe to call from
/// a signal handler: only does an `flock`/`close` syscall, no
/// allocation.
fn release_held_lock() {
    let fd = HELD_LOCK_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }
}

/// Install SIGINT/SIGTERM handlers that release any held lock and then
/// re-raise the signal with its default disposition, so the process
/// still terminates the way a plugin invoker expects (spec §4.7).
pub fn install_signal_handlers() -> Result<(), std::io::Error> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        unsafe {
            signal_hook::low_level::register(signal, move || {
                release_held_lock();
                signal_hook::low_level::emulate_default_handler(signal).ok();
            })?;
        }
    }
    Ok(())
}
