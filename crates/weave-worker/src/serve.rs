//! The worker's connection/dispatch loop.
//!
//! The orchestrator owns the listener; the worker connects back to the
//! socket path it was spawned with and serves that connection. Strictly
//! sequential: one connection at a time, one request at a time, all on
//! the calling thread. The generator call blocks the loop by design; a
//! single GPU context serves a single generation, and any parallelism
//! belongs on the orchestrator side.
//!
//! Per connection, the loop reads framed requests until the peer closes
//! or the framing breaks. The fixed header is read and validated first,
//! and the payload buffer is sized from the validated length, so no
//! claim in a hostile header can drive an allocation past the message
//! cap.

use std::{
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use weave_proto::{
    ErrorResponse, GenerateRequest, GenerateResponse, MessageHeader, peek_request_id,
};
use weave_transport::{ShutdownFlag, TransportError, apply_timeouts, authenticate, connect_to};

use crate::{
    error::WorkerError,
    generator::{GenerateParams, Generator, GeneratorError},
};

/// How long the loop sleeps between connect attempts while the
/// orchestrator is not answering.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run the connection loop until shutdown is requested or connecting
/// fails fatally.
///
/// Each connection is dialed to the orchestrator's listener at
/// `socket_path`, authenticated before any I/O, and served until it
/// ends; then the loop dials again. An absent or not-yet-listening
/// orchestrator is polled for, authentication failures drop that one
/// connection and keep the loop alive, and only a non-retriable
/// connect failure (for example, a socket path that cannot exist) is
/// fatal.
///
/// Returns `Ok(())` when the shutdown flag stopped the loop.
pub fn serve<G: Generator>(
    socket_path: &Path,
    generator: &mut G,
    flag: &ShutdownFlag,
) -> Result<(), WorkerError> {
    loop {
        if flag.is_set() {
            tracing::info!("shutdown requested, leaving connection loop");
            return Ok(());
        }

        let stream = match connect_to(socket_path) {
            Ok(stream) => stream,
            Err(TransportError::Io(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                // Nobody is listening (yet); poll until the
                // orchestrator is, or shutdown is requested.
                thread::sleep(CONNECT_POLL_INTERVAL);
                continue;
            },
            Err(TransportError::Io(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(%err, "connect failed");
                return Err(err.into());
            },
        };

        // The kernel vouches for whoever owns the other end; a
        // foreign-uid listener at our path is not the orchestrator.
        match authenticate(&stream) {
            Ok(creds) => {
                tracing::debug!(pid = creds.pid, "connected to orchestrator");
            },
            Err(TransportError::PeerUnauthenticated { .. }) => {
                // Close without sending a byte; authenticate already
                // logged the rejected uid/pid.
                thread::sleep(CONNECT_POLL_INTERVAL);
                continue;
            },
            Err(err) => {
                tracing::warn!(%err, "peer credential query failed");
                thread::sleep(CONNECT_POLL_INTERVAL);
                continue;
            },
        }

        apply_timeouts(&stream)?;

        if let Err(err) = serve_connection(&stream, generator, flag) {
            tracing::debug!(%err, "connection ended");
        }
    }
}

/// Outcome of filling a buffer from the peer.
enum ReadOutcome {
    /// Buffer completely filled.
    Filled,
    /// Peer closed cleanly at a frame boundary.
    Eof,
    /// Shutdown was requested while waiting for a new frame.
    Shutdown,
}

/// Serve framed requests on one authenticated connection until EOF.
fn serve_connection<G: Generator>(
    mut stream: &UnixStream,
    generator: &mut G,
    flag: &ShutdownFlag,
) -> Result<(), WorkerError> {
    loop {
        let mut header_buf = [0u8; MessageHeader::SIZE];
        match read_full(&mut stream, &mut header_buf, flag)? {
            ReadOutcome::Eof | ReadOutcome::Shutdown => return Ok(()),
            ReadOutcome::Filled => {},
        }

        let header = match MessageHeader::from_bytes(&header_buf) {
            Ok(header) => *header,
            Err(err) => {
                // An invalid header means the stream position is no
                // longer trustworthy: report with id 0 and drop the
                // connection.
                tracing::debug!(%err, "rejecting frame header");
                send_error(stream, &ErrorResponse::from_protocol_error(0, &err))?;
                return Ok(());
            },
        };

        // The header passed validation, so this allocation is bounded by
        // the message cap and matches exactly what is read next.
        let payload_len = header.payload_len() as usize;
        let mut message = vec![0u8; MessageHeader::SIZE + payload_len];
        message[..MessageHeader::SIZE].copy_from_slice(&header_buf);
        match read_full(&mut stream, &mut message[MessageHeader::SIZE..], flag)? {
            ReadOutcome::Eof | ReadOutcome::Shutdown => return Ok(()),
            ReadOutcome::Filled => {},
        }

        match GenerateRequest::decode(&message) {
            Ok(request) => handle_request(stream, generator, &request)?,
            Err(err) => {
                // Framing is intact (exactly payload_len bytes were
                // consumed), so the connection stays usable. Echo the
                // request id when the payload was long enough to carry
                // one.
                let id = peek_request_id(&message[MessageHeader::SIZE..]).unwrap_or(0);
                tracing::debug!(request_id = id, %err, "rejecting request");
                send_error(stream, &ErrorResponse::from_protocol_error(id, &err))?;
            },
        }

        if flag.is_set() {
            tracing::info!("shutdown requested, closing drained connection");
            return Ok(());
        }
    }
}

/// Run one generation and write the framed result.
fn handle_request<G: Generator>(
    stream: &UnixStream,
    generator: &mut G,
    request: &GenerateRequest,
) -> Result<(), WorkerError> {
    let params = GenerateParams::from(request);

    // Recreate per-generation state up front: stale context from a prior
    // generation with different prompt lengths must not leak in.
    if let Err(err) = generator.reset() {
        tracing::warn!(request_id = request.request_id, %err, "generator reset failed");
        return send_generator_error(stream, request.request_id, &err);
    }

    let started = Instant::now();
    match generator.generate(&params) {
        Ok(image) => {
            let generation_time_ms = u32::try_from(started.elapsed().as_millis())
                .unwrap_or(u32::MAX);
            tracing::debug!(
                request_id = request.request_id,
                width = image.width,
                height = image.height,
                generation_time_ms,
                "generation complete"
            );

            let response = GenerateResponse {
                request_id: request.request_id,
                generation_time_ms,
                width: image.width,
                height: image.height,
                channels: image.channels,
                pixels: Bytes::from(image.pixels),
            };
            // to_bytes sizes the buffer from the image dimensions before
            // any byte is written.
            match response.to_bytes() {
                Ok(wire) => write_frame(stream, &wire),
                Err(err) => {
                    tracing::error!(
                        request_id = request.request_id,
                        %err,
                        "generated image failed wire validation"
                    );
                    send_error(
                        stream,
                        &ErrorResponse::from_protocol_error(request.request_id, &err),
                    )
                },
            }
        },
        Err(err) => {
            tracing::warn!(request_id = request.request_id, %err, "generation failed");
            send_generator_error(stream, request.request_id, &err)
        },
    }
}

/// Map a generator failure into the wire taxonomy and send it.
fn send_generator_error(
    stream: &UnixStream,
    request_id: u64,
    err: &GeneratorError,
) -> Result<(), WorkerError> {
    send_error(stream, &ErrorResponse::new(request_id, err.error_code(), err.to_string()))
}

fn send_error(stream: &UnixStream, error: &ErrorResponse) -> Result<(), WorkerError> {
    let wire = error.to_bytes().map_err(WorkerError::Protocol)?;
    write_frame(stream, &wire)
}

/// Fill `buf` completely, handling partial reads, `EINTR`, and the
/// shutdown flag.
///
/// A clean close before the first byte is `Eof`; a close mid-buffer is
/// a `ConnectionClosed` error. A signal that set the shutdown flag
/// while nothing has been read yet returns `Shutdown`; mid-frame, the
/// read continues so an in-flight frame is drained.
fn read_full(
    stream: &mut impl Read,
    buf: &mut [u8],
    flag: &ShutdownFlag,
) -> Result<ReadOutcome, WorkerError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(WorkerError::Transport(TransportError::ConnectionClosed));
            },
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                if flag.is_set() && filled == 0 {
                    return Ok(ReadOutcome::Shutdown);
                }
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(WorkerError::Transport(TransportError::ReadTimeout));
            },
            Err(err) => return Err(err.into()),
        }
    }
    Ok(ReadOutcome::Filled)
}

/// Write a full frame, mapping write-timeout expiry onto its typed error.
fn write_frame(mut stream: &UnixStream, bytes: &[u8]) -> Result<(), WorkerError> {
    match stream.write_all(bytes) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            Err(WorkerError::Transport(TransportError::WriteTimeout))
        },
        Err(err) => Err(err.into()),
    }
}
