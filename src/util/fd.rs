//! File descriptor limit helpers.
//!
//! Every client connection consumes one descriptor, and the accept loop
//! degrades silently once the process limit is exhausted, so the server
//! raises the soft limit at startup and watches usage while sessions
//! register.

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use tracing::debug;

/// Current soft limit on open file descriptors.
pub fn soft_limit() -> Option<u64> {
    getrlimit(Resource::RLIMIT_NOFILE).ok().map(|(soft, _)| soft)
}

/// Raise the soft limit to the hard limit. Returns the resulting soft limit.
pub fn raise_soft_limit() -> std::io::Result<u64> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(std::io::Error::from)?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard).map_err(std::io::Error::from)?;
        debug!(from = soft, to = hard, "raised open file limit");
    }
    Ok(hard)
}

/// Number of file descriptors currently open in this process, counted via
/// `/proc/self/fd`. `None` where procfs is unavailable.
pub fn num_open_fds() -> Option<u64> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.count() as u64)
}
