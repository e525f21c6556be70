//! Structured errors raised by the runtime.
//!
//! Transient socket conditions (interrupted, would-block, connect in
//! progress) are never represented here; they surface as zero bytes of
//! progress instead.

use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the reactor and its I/O objects.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS call failed. `fd` is -1 when no descriptor is involved.
    #[error("{context}; errno = {errno}; for fd = {fd}")]
    Os {
        context: &'static str,
        fd: RawFd,
        errno: i32,
    },

    /// The peer shut the connection down (zero-byte read).
    #[error("zero bytes read in recv; for fd = {fd}")]
    PeerClosed { fd: RawFd },

    /// Name resolution produced no usable address.
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// A socket was used after it was closed.
    #[error("closed socket used; for fd = {fd}")]
    Closed { fd: RawFd },

    /// An I/O object outlived the bus it was created on.
    #[error("bus is gone; for fd = {fd}")]
    Detached { fd: RawFd },
}

impl Error {
    /// Build an OS error from an `io::Error`, keeping its errno.
    pub fn os(context: &'static str, fd: RawFd, err: &io::Error) -> Self {
        Error::Os {
            context,
            fd,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }

    /// Descriptor the error relates to, or -1.
    pub fn fd(&self) -> RawFd {
        match self {
            Error::Os { fd, .. }
            | Error::PeerClosed { fd }
            | Error::Closed { fd }
            | Error::Detached { fd } => *fd,
            Error::Resolve { .. } => -1,
        }
    }

    /// OS error code, or 0 when the error did not come from the OS.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Os { errno, .. } => *errno,
            Error::Resolve { source, .. } => source.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// True for misuse of the runtime rather than an environment failure.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Error::Closed { .. } | Error::Detached { .. })
    }
}

/// Interrupted, would-block and connect-in-progress are not failures.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}
