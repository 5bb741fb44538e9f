//! Orchestrator error types and the user-facing failure classes.

use thiserror::Error;
use weave_proto::Message;
use weave_transport::TransportError;

/// Errors surfaced by [`crate::WorkerConnection::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The request buffer cannot contain a header plus a request id.
    #[error("request buffer is {len} bytes, need at least {min}")]
    InvalidBuffer {
        /// Buffer length supplied.
        len: usize,
        /// Minimum: the 16-byte header plus the 8-byte id.
        min: usize,
    },

    /// Another request with the same id is already in flight.
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(u64),

    /// The connection is no longer usable.
    #[error("connection to worker closed")]
    ConnectionClosed,

    /// The caller-imposed deadline expired before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// Socket-layer failure while writing the request.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from spawning and terminating the worker process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker binary could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The worker outlived the full close-stdin/term/kill staging.
    #[error("worker still running after staged shutdown")]
    WorkerUnresponsive,

    /// Socket-layer failure, including the connect-back deadline.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a `send` outcome is presented to a person.
///
/// The UI layers do not see codes or transport internals; they see one
/// of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// The worker could not be brought up at all (spawn or connect-back
    /// failure).
    WorkerUnavailable,
    /// A deadline expired: the caller's own, or any wire-level timeout.
    TimedOut,
    /// The worker rejected this request; the message says why.
    RequestRejected(String),
    /// The worker failed internally, or the transport closed under the
    /// request; retrying the same request may work.
    WorkerFailed,
}

impl FailureClass {
    /// Classify a failed `send`.
    ///
    /// Timeouts of every flavor are reported as timeouts; every other
    /// transport failure is reported as the connection being gone.
    #[must_use]
    pub fn from_send_error(err: &SendError) -> Self {
        match err {
            SendError::Timeout => Self::TimedOut,
            SendError::Transport(transport) if transport.is_timeout() => Self::TimedOut,
            SendError::ConnectionClosed
            | SendError::Transport(_)
            | SendError::InvalidBuffer { .. }
            | SendError::DuplicateRequestId(_) => Self::WorkerFailed,
        }
    }

    /// Classify a failure to bring the worker up in the first place.
    #[must_use]
    pub fn from_supervisor_error(_err: &SupervisorError) -> Self {
        Self::WorkerUnavailable
    }

    /// Classify a successfully delivered response, if it is an error
    /// frame. `None` for successful generations.
    #[must_use]
    pub fn from_response(message: &Message) -> Option<Self> {
        match message {
            Message::Error(error) if error.code.is_client_error() => {
                Some(Self::RequestRejected(error.message.clone()))
            },
            Message::Error(_) => Some(Self::WorkerFailed),
            Message::Request(_) | Message::Response(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use weave_proto::{ErrorCode, ErrorResponse};

    use super::*;

    #[test]
    fn timeouts_of_every_flavor_report_as_timeouts() {
        assert_eq!(FailureClass::from_send_error(&SendError::Timeout), FailureClass::TimedOut);
        for transport in [
            TransportError::AcceptTimeout,
            TransportError::ConnectTimeout,
            TransportError::ReadTimeout,
            TransportError::WriteTimeout,
        ] {
            assert_eq!(
                FailureClass::from_send_error(&SendError::Transport(transport)),
                FailureClass::TimedOut
            );
        }
    }

    #[test]
    fn closed_transport_reports_as_worker_failure() {
        assert_eq!(
            FailureClass::from_send_error(&SendError::ConnectionClosed),
            FailureClass::WorkerFailed
        );
        assert_eq!(
            FailureClass::from_send_error(&SendError::Transport(
                TransportError::ConnectionClosed
            )),
            FailureClass::WorkerFailed
        );
    }

    #[test]
    fn bring_up_failures_report_as_unavailable() {
        assert_eq!(
            FailureClass::from_supervisor_error(&SupervisorError::WorkerUnresponsive),
            FailureClass::WorkerUnavailable
        );
        assert_eq!(
            FailureClass::from_supervisor_error(&SupervisorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "missing binary"
            ))),
            FailureClass::WorkerUnavailable
        );
    }

    #[test]
    fn error_frames_classify_by_status() {
        let rejected = Message::Error(ErrorResponse::new(1, ErrorCode::InvalidSteps, "steps"));
        assert_eq!(
            FailureClass::from_response(&rejected),
            Some(FailureClass::RequestRejected("steps".into()))
        );

        let internal = Message::Error(ErrorResponse::new(1, ErrorCode::GpuError, "device"));
        assert_eq!(FailureClass::from_response(&internal), Some(FailureClass::WorkerFailed));
    }
}
