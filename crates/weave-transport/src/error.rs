//! Transport error types.
//!
//! Strongly-typed errors for the socket layer: configuration failures
//! (runtime directory, path length), bind-time conflicts, authentication
//! rejections, and the timeout/closure failures both connection loops
//! surface. `std::io::Error` is wrapped only at the actual kernel
//! boundary so callers can match on what went wrong.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Convenience alias used throughout the transport.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors produced by the Unix-socket transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The runtime-directory environment variable is not set.
    #[error("runtime directory variable is not set")]
    RuntimeDirMissing,

    /// The runtime directory is not an absolute path.
    #[error("runtime directory is not absolute: {0}")]
    RuntimeDirNotAbsolute(PathBuf),

    /// The socket path does not fit a `sockaddr_un`.
    #[error("socket path is {len} bytes, limit is {max} including the terminator")]
    PathTooLong {
        /// Path length in bytes, terminator included.
        len: usize,
        /// Platform limit.
        max: usize,
    },

    /// A live process already owns the socket path.
    #[error("socket {0} is already owned by a live process")]
    AddressInUse(PathBuf),

    /// The connecting peer failed credential verification.
    #[error("rejected peer with uid {uid} (pid {pid})")]
    PeerUnauthenticated {
        /// Peer's user id as reported by the kernel.
        uid: u32,
        /// Peer's process id as reported by the kernel.
        pid: i32,
    },

    /// The worker did not connect back before the deadline.
    #[error("worker did not connect back within the deadline")]
    AcceptTimeout,

    /// A client-side connect did not complete before the deadline.
    #[error("connect timed out")]
    ConnectTimeout,

    /// A read did not complete before its deadline.
    #[error("read timed out")]
    ReadTimeout,

    /// A write did not complete before its deadline.
    #[error("write timed out")]
    WriteTimeout,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when this error is a deadline expiry, as opposed to a
    /// closed connection or a configuration failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AcceptTimeout | Self::ConnectTimeout | Self::ReadTimeout | Self::WriteTimeout
        )
    }
}
