//! Network namespace handling (spec §5). `setns(2)` is per-thread, so the
//! engine must never hand namespace-scoped work to a different OS thread
//! than the one that opened the namespace fd; the binary stays
//! single-threaded and does no async/thread-pooled work for exactly this
//! reason (no tokio, no rayon — see `SPEC_FULL.md`'s Ambient stack
//! section).

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::error::{NamespaceError, NamespaceSnafu, SetNsSnafu};
use snafu::ResultExt;

/// An open handle to a network namespace, identified by its bind-mounted
/// path (e.g. `/var/run/netns/foo` or a container's `/proc/<pid>/ns/net`).
pub struct NetNsHandle {
    file: File,
    path: String,
}

impl NetNsHandle {
    pub fn open(path: &str) -> Result<NetNsHandle, NamespaceError> {
        let file = File::open(path).context(NamespaceSnafu {
            path: path.to_string(),
        })?;
        Ok(NetNsHandle {
            file,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// The namespace the calling thread was in before any `setns` call, used
/// to return home once namespace-scoped work is done.
pub struct CurrentNs {
    file: File,
}

impl CurrentNs {
    /// Capture the calling thread's current network namespace via
    /// `/proc/self/task/<tid>/ns/net` (not `/proc/self/ns/net`, which
    /// resolves the process's main thread rather than the calling one —
    /// relevant once the engine enters a non-main-thread context, though
    /// it does not today given the single-OS-thread constraint).
    pub fn capture() -> Result<CurrentNs, NamespaceError> {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        let path = format!("/proc/self/task/{}/ns/net", tid);
        let file = File::open(&path).context(NamespaceSnafu { path })?;
        Ok(CurrentNs { file })
    }

    /// The raw fd of the captured namespace, for passing to netlink calls
    /// (e.g. `IFLA_NET_NS_FD`/`RDMA_NLDEV_ATTR_NET_NS_FD`) that need to
    /// target a namespace other than the one the calling thread is
    /// currently in.
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn restore(&self) -> Result<(), NamespaceError> {
        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).context(SetNsSnafu {
            path: "<original netns>".to_string(),
        })
    }
}

/// Enter `target`'s network namespace for the duration of `work`,
/// restoring the calling thread's original namespace afterward
/// regardless of whether `work` succeeds — the namespace-scoped
/// equivalent of a scope guard.
pub fn with_netns<T>(
    target: &NetNsHandle,
    work: impl FnOnce() -> Result<T, crate::error::EngineError>,
) -> Result<T, crate::error::EngineError> {
    let original = CurrentNs::capture()?;

    setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET).context(SetNsSnafu {
        path: target.path().to_string(),
    })?;

    let result = work();

    // Always attempt to return home, even on failure; a failure to
    // restore is itself fatal since every subsequent operation on this
    // thread would silently run in the wrong namespace.
    original.restore()?;

    result
}
