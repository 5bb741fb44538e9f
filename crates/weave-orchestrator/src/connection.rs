//! The multiplexed worker connection.
//!
//! The orchestrator owns the listener; the spawned worker connects back
//! to it, and that one accepted connection carries every in-flight
//! request, keyed by the caller-chosen request id at a fixed offset in
//! each frame. A background reader routes complete response frames to
//! per-request oneshot sinks; callers await their sink. Requests
//! register their sink BEFORE writing, so a response can never arrive
//! ahead of its entry, and a guard removes the entry when a caller
//! gives up, so the pending map never retains cancelled requests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::Instant,
};
use weave_proto::{MessageHeader, peek_request_id};
use weave_transport::{
    READ_TIMEOUT, SocketListener, TransportError, WRITE_TIMEOUT, authenticate,
};

use crate::error::SendError;

/// Smallest buffer `send` accepts: header plus request id.
const MIN_REQUEST_LEN: usize = MessageHeader::SIZE + 8;

/// How often the accept loop polls while waiting for the worker's
/// connect-back.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared state between callers and the response reader.
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl Shared {
    fn fail_all_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            let count = pending.len();
            // Dropping the senders resolves every waiting caller with a
            // closed-connection error.
            pending.clear();
            if count > 0 {
                tracing::debug!(count, "failed pending requests on connection loss");
            }
        }
    }
}

/// Removes a pending entry unless the caller got its response.
///
/// Dropping the `send` future at any await point runs this, which is
/// exactly the cancellation contract: the entry is gone before anyone
/// can observe the future as finished, and a late response for the id
/// is discarded by the reader.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed
            && let Ok(mut pending) = self.shared.pending.lock()
        {
            pending.remove(&self.id);
        }
    }
}

/// A live multiplexed connection to the worker.
pub struct WorkerConnection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl WorkerConnection {
    /// Accept the worker's connect-back on the orchestrator's
    /// pre-created listener, waiting up to `deadline`.
    ///
    /// A freshly spawned worker needs a moment to come up and dial, so
    /// the accept is polled; expiry reports as `AcceptTimeout`. The
    /// accepted peer is authenticated by kernel credentials before any
    /// byte moves — a foreign-uid peer is closed and the wait
    /// continues. On success the response reader is started and the
    /// connection is ready for `send`.
    pub async fn accept_connection(
        listener: &SocketListener,
        deadline: Duration,
    ) -> Result<Self, TransportError> {
        listener.set_nonblocking(true)?;
        let give_up = Instant::now() + deadline;

        let stream = loop {
            match listener.accept() {
                Ok((stream, _addr)) => match authenticate(&stream) {
                    Ok(creds) => {
                        tracing::debug!(pid = creds.pid, "worker connected");
                        break stream;
                    },
                    Err(TransportError::PeerUnauthenticated { .. }) => {
                        // Closed without a byte; keep waiting for the
                        // real worker.
                        continue;
                    },
                    Err(err) => return Err(err),
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    if Instant::now() >= give_up {
                        return Err(TransportError::AcceptTimeout);
                    }
                    tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
                },
                Err(err) => return Err(err.into()),
            }
        };

        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));

        Ok(Self { writer: tokio::sync::Mutex::new(write_half), shared, reader })
    }

    /// Send one framed request and await its response bytes.
    ///
    /// The buffer must already be a complete wire message; the request
    /// id is read from its fixed offset. The returned bytes are the
    /// complete response frame, which may be a success or an error
    /// message; callers decode and pattern-match.
    ///
    /// Cancel-safe: dropping the future removes the pending entry and
    /// leaves the connection healthy.
    pub async fn send(&self, request: &[u8]) -> Result<Bytes, SendError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SendError::ConnectionClosed);
        }
        if request.len() < MIN_REQUEST_LEN {
            return Err(SendError::InvalidBuffer { len: request.len(), min: MIN_REQUEST_LEN });
        }
        let id = peek_request_id(&request[MessageHeader::SIZE..])
            .ok_or(SendError::InvalidBuffer { len: request.len(), min: MIN_REQUEST_LEN })?;

        // Register before writing: the reader may see the response the
        // instant the write lands.
        let rx = {
            let mut pending =
                self.shared.pending.lock().map_err(|_| SendError::ConnectionClosed)?;
            if pending.contains_key(&id) {
                return Err(SendError::DuplicateRequestId(id));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id, tx);
            rx
        };
        let guard = PendingGuard { shared: &self.shared, id, armed: true };

        {
            let mut writer = self.writer.lock().await;
            match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(request)).await {
                Ok(Ok(())) => {},
                Ok(Err(err)) => return Err(SendError::Transport(err.into())),
                Err(_) => return Err(SendError::Transport(TransportError::WriteTimeout)),
            }
        }

        match rx.await {
            Ok(bytes) => {
                guard.disarm();
                Ok(bytes)
            },
            Err(_) => {
                // Reader exited and dropped our sender; the entry is
                // already gone.
                guard.disarm();
                Err(SendError::ConnectionClosed)
            },
        }
    }

    /// [`Self::send`] under a caller-imposed deadline.
    ///
    /// Expiry returns [`SendError::Timeout`] with the pending entry
    /// already removed.
    pub async fn send_with_timeout(
        &self,
        request: &[u8],
        deadline: Duration,
    ) -> Result<Bytes, SendError> {
        match tokio::time::timeout(deadline, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// True once the reader has observed end-of-stream or a framing
    /// violation.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Shut the connection down deterministically.
    ///
    /// Half-closes the write side, then waits for the reader task to
    /// observe end-of-stream and exit. When this returns, no task of
    /// this connection is still running and the pending map is empty.
    pub async fn close(self) {
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(%err, "write-half shutdown failed");
            }
        }
        if let Err(err) = self.reader.await {
            tracing::debug!(%err, "reader task did not join cleanly");
        }
    }
}

/// Background task routing response frames to pending sinks.
///
/// Waiting for the next header is unbounded (an idle connection is
/// healthy); once a header arrives, the payload must follow within the
/// read timeout. End-of-stream, a timeout, or an invalid header ends
/// the loop, fails every pending request, and marks the connection
/// unusable.
async fn read_loop(mut read_half: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let mut header_buf = [0u8; MessageHeader::SIZE];
        match read_half.read_exact(&mut header_buf).await {
            Ok(_) => {},
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("worker closed the connection");
                break;
            },
            Err(err) => {
                tracing::debug!(%err, "response header read failed");
                break;
            },
        }

        // Same rule as the worker: validate the claimed length before
        // sizing the frame buffer.
        let header = match MessageHeader::from_bytes(&header_buf) {
            Ok(header) => *header,
            Err(err) => {
                tracing::warn!(%err, "invalid response header, dropping connection");
                break;
            },
        };

        let mut frame = vec![0u8; MessageHeader::SIZE + header.payload_len() as usize];
        frame[..MessageHeader::SIZE].copy_from_slice(&header_buf);
        match tokio::time::timeout(
            READ_TIMEOUT,
            read_half.read_exact(&mut frame[MessageHeader::SIZE..]),
        )
        .await
        {
            Ok(Ok(_)) => {},
            Ok(Err(err)) => {
                tracing::debug!(%err, "response payload read failed");
                break;
            },
            Err(_) => {
                tracing::warn!("response payload read timed out, dropping connection");
                break;
            },
        }

        let Some(id) = peek_request_id(&frame[MessageHeader::SIZE..]) else {
            tracing::warn!("response payload too short for a request id, dropping connection");
            break;
        };

        let sink = match shared.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => break,
        };
        match sink {
            Some(sink) => {
                // A cancelled caller may have vanished between lookup and
                // delivery; that loses nothing.
                let _ = sink.send(Bytes::from(frame));
            },
            None => {
                tracing::debug!(request_id = id, "dropping response with no pending caller");
            },
        }
    }

    shared.fail_all_pending();
}
