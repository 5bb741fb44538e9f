//! Worker error type.

use thiserror::Error;
use weave_proto::ProtocolError;
use weave_transport::TransportError;

/// Errors that end a connection or the accept loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Socket-layer failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Codec failure while producing our own frames.
    ///
    /// Peer-caused codec failures are mirrored back as error responses
    /// instead of surfacing here.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
