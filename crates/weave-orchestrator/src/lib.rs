//! The Weave orchestrator's worker-facing half.
//!
//! Owns the GPU worker end to end: creates the Unix-socket listener,
//! spawns the worker with the socket path and a live stdin pipe,
//! accepts the worker's connect-back on that listener, routes
//! concurrent requests over the one accepted connection by request id,
//! and tears everything down through a staged
//! close-stdin/SIGTERM/SIGKILL escalation that never leaks the
//! process or the socket file.
//!
//! The HTTP/WebSocket front-end consumes exactly two operations from
//! here: [`WorkerConnection::send`] (bytes in, bytes out) and
//! [`WorkerConnection::close`]. Everything else is supervision.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod supervisor;

pub use connection::WorkerConnection;
pub use error::{FailureClass, SendError, SupervisorError};
pub use supervisor::{CONNECT_BACK_DEADLINE, ShutdownTimeouts, WorkerHandle};
