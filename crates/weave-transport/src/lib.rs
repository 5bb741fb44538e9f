//! Unix-socket transport for the Weave orchestrator/worker boundary.
//!
//! Covers everything between the wire codec and the kernel: socket path
//! derivation from the runtime directory, listener binding with safe
//! file modes and stale-socket recovery, peer-credential authentication,
//! per-peer timeouts, the client-side connect, and the process-wide
//! graceful-shutdown flag.
//!
//! Authorization is deliberately single-user: a peer is trusted exactly
//! when the kernel says it runs under our own uid. There is no token in
//! the protocol and no further negotiation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod listener;
mod path;
mod shutdown;

pub use error::{Result, TransportError};
pub use listener::{
    PeerCreds, READ_TIMEOUT, SOCKET_DIR_MODE, SOCKET_FILE_MODE, SocketListener, WRITE_TIMEOUT,
    apply_timeouts, authenticate, connect_to,
};
pub use path::{
    MAX_SOCKET_PATH, RUNTIME_DIR_ENV, SOCKET_DIR_NAME, SOCKET_FILE_NAME, check_path_len,
    runtime_socket_path, socket_path_in,
};
pub use shutdown::ShutdownFlag;
