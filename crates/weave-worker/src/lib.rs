//! The Weave GPU worker.
//!
//! A single-threaded child process that connects back to the
//! orchestrator's Unix-socket listener, authenticates its peer, and
//! turns framed generation requests into framed pixel responses
//! through an opaque [`Generator`] backend, one connection and one
//! request at a time.
//!
//! Lifetime is bound to the spawning orchestrator twice over: SIGTERM
//! and SIGINT set the shutdown flag, and a watcher thread treats EOF on
//! standard input (the kernel closing the parent's pipe) the same way.
//! The connection loop observes the flag, drains its current
//! connection, and returns. The socket file belongs to the
//! orchestrator's listener, which unlinks it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod generator;
mod parent;
mod serve;

pub use error::WorkerError;
pub use generator::{GenerateParams, Generator, GeneratorError, ImageOutput, PatternGenerator};
pub use parent::{spawn_stdin_watch, watch_parent};
pub use serve::serve;
