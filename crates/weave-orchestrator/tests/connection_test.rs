//! Integration tests for the multiplexed worker connection.
//!
//! These bind the orchestrator-side listener, run the real worker loop
//! on a thread (with an optional per-generation delay so cancellation
//! races are deterministic), accept its connect-back, and drive it
//! through `WorkerConnection` the way the front-end layers do.

use std::{sync::Arc, thread, time::Duration};

use weave_orchestrator::{FailureClass, SendError, WorkerConnection};
use weave_proto::{ErrorCode, GenerateRequest, GenerateResponse, Message, PromptSet};
use weave_transport::{ShutdownFlag, SocketListener, TransportError, socket_path_in};
use weave_worker::{
    GenerateParams, Generator, GeneratorError, ImageOutput, PatternGenerator, serve,
};

/// Pattern backend with an artificial per-generation delay.
struct SlowPattern {
    inner: PatternGenerator,
    delay: Duration,
}

impl Generator for SlowPattern {
    fn reset(&mut self) -> Result<(), GeneratorError> {
        self.inner.reset()
    }

    fn generate(&mut self, params: &GenerateParams) -> Result<ImageOutput, GeneratorError> {
        thread::sleep(self.delay);
        self.inner.generate(params)
    }
}

/// The orchestrator-side listener plus a worker loop dialing it.
struct TestWorker {
    flag: ShutdownFlag,
    listener: Option<SocketListener>,
    handle: Option<thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestWorker {
    fn start(delay: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path_in(dir.path()).unwrap();
        let listener = SocketListener::bind(&path).unwrap();
        let flag = ShutdownFlag::new();

        let serve_flag = flag.clone();
        let handle = thread::spawn(move || {
            let mut generator = SlowPattern { inner: PatternGenerator::new(), delay };
            serve(&path, &mut generator, &serve_flag).unwrap();
        });

        Self { flag, listener: Some(listener), handle: Some(handle), _dir: dir }
    }

    /// Accept the worker's connect-back.
    async fn accept(&self) -> WorkerConnection {
        WorkerConnection::accept_connection(
            self.listener.as_ref().unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    fn stop(&mut self) {
        self.flag.trigger();
        // Dropping the listener breaks any queued redial so the serve
        // loop unblocks and observes the flag.
        drop(self.listener.take());
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        // No join here: a test that panicked may still hold a live
        // connection, and the serve thread only unblocks once its read
        // times out.
        self.flag.trigger();
        drop(self.listener.take());
    }
}

fn request_bytes(request_id: u64) -> Vec<u8> {
    GenerateRequest {
        request_id,
        model_id: 0,
        width: 64,
        height: 64,
        steps: 4,
        cfg_scale: 5.0,
        seed: request_id,
        prompts: PromptSet::uniform("integration prompt"),
    }
    .to_bytes()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_through_connection() {
    let mut worker = TestWorker::start(Duration::ZERO);
    let conn = worker.accept().await;

    let response = conn.send(&request_bytes(31)).await.unwrap();
    let decoded = GenerateResponse::decode(&response).unwrap();
    assert_eq!(decoded.request_id, 31);
    assert_eq!(decoded.pixels.len(), 64 * 64 * 3);

    assert_eq!(conn.pending_requests(), 0);
    conn.close().await;
    worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_multiplex_by_id() {
    let mut worker = TestWorker::start(Duration::from_millis(5));
    let conn = Arc::new(worker.accept().await);

    let mut tasks = tokio::task::JoinSet::new();
    for id in 0u64..10 {
        let conn = Arc::clone(&conn);
        tasks.spawn(async move {
            let response = conn.send(&request_bytes(id)).await.unwrap();
            let decoded = GenerateResponse::decode(&response).unwrap();
            assert_eq!(decoded.request_id, id, "response routed to the wrong caller");
            id
        });
    }

    let mut seen = Vec::new();
    while let Some(result) = tasks.join_next().await {
        seen.push(result.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (0u64..10).collect::<Vec<_>>());

    assert_eq!(conn.pending_requests(), 0);
    // Dropping the connection half-closes the stream so the serve loop
    // unblocks and can observe the shutdown flag.
    drop(conn);
    worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_sends_leave_no_pending_entries() {
    // Half of 100 concurrent requests run into a deadline far shorter
    // than the generation time and get cancelled; the map must end
    // empty and the connection must stay healthy for the next request.
    let mut worker = TestWorker::start(Duration::from_millis(10));
    let conn = Arc::new(worker.accept().await);

    let mut tasks = tokio::task::JoinSet::new();
    for id in 0u64..100 {
        let conn = Arc::clone(&conn);
        let deadline = if id % 2 == 0 {
            Duration::from_millis(2)
        } else {
            Duration::from_secs(30)
        };
        tasks.spawn(async move { (id, conn.send_with_timeout(&request_bytes(id), deadline).await) });
    }

    let mut timed_out = 0;
    let mut completed = 0;
    while let Some(result) = tasks.join_next().await {
        let (id, outcome) = result.unwrap();
        match outcome {
            Ok(response) => {
                completed += 1;
                let decoded = GenerateResponse::decode(&response).unwrap();
                assert_eq!(decoded.request_id, id);
            },
            Err(SendError::Timeout) => timed_out += 1,
            Err(other) => panic!("unexpected send outcome for {id}: {other:?}"),
        }
    }
    assert_eq!(completed, 50);
    assert_eq!(timed_out, 50);
    assert_eq!(conn.pending_requests(), 0, "cancelled sends must not leak entries");

    // Late responses for the cancelled half are discarded silently; the
    // connection still serves new requests.
    let response = conn.send_with_timeout(&request_bytes(1000), Duration::from_secs(30)).await;
    assert!(response.is_ok(), "connection should stay healthy: {response:?}");

    drop(conn);
    worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_in_flight_id_rejected() {
    let mut worker = TestWorker::start(Duration::from_millis(100));
    let conn = Arc::new(worker.accept().await);

    let first = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.send(&request_bytes(7)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = conn.send(&request_bytes(7)).await;
    assert!(matches!(second, Err(SendError::DuplicateRequestId(7))));

    assert!(first.await.unwrap().is_ok());
    drop(conn);
    worker.stop();
}

#[tokio::test]
async fn accept_times_out_without_worker() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path_in(dir.path()).unwrap();
    let listener = SocketListener::bind(&path).unwrap();

    let started = std::time::Instant::now();
    let result = WorkerConnection::accept_connection(&listener, Duration::from_millis(200)).await;
    assert!(matches!(result, Err(TransportError::AcceptTimeout)));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_buffer_rejected_before_any_io() {
    let mut worker = TestWorker::start(Duration::ZERO);
    let conn = worker.accept().await;

    let result = conn.send(&[0u8; 10]).await;
    assert!(matches!(result, Err(SendError::InvalidBuffer { len: 10, .. })));
    assert_eq!(conn.pending_requests(), 0);

    conn.close().await;
    worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_frames_are_delivered_to_their_caller() {
    let mut worker = TestWorker::start(Duration::ZERO);
    let conn = worker.accept().await;

    // Patch the steps field to zero: valid framing, invalid request.
    let mut wire = request_bytes(88);
    wire[36..40].copy_from_slice(&0u32.to_be_bytes());

    let response = conn.send(&wire).await.unwrap();
    let message = Message::decode(&response).unwrap();
    match &message {
        Message::Error(error) => {
            assert_eq!(error.request_id, 88);
            assert_eq!(error.code, ErrorCode::InvalidSteps);
        },
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(matches!(
        FailureClass::from_response(&message),
        Some(FailureClass::RequestRejected(_))
    ));

    conn.close().await;
    worker.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_death_fails_pending_and_closes_connection() {
    use std::io::{Read, Write};

    use weave_proto::MessageHeader;
    use weave_transport::connect_to;

    let dir = tempfile::tempdir().unwrap();
    let path = socket_path_in(dir.path()).unwrap();
    let listener = SocketListener::bind(&path).unwrap();

    // A stub worker that dials, answers exactly one request, and then
    // dies with the connection open.
    let stub_path = path.clone();
    let stub = thread::spawn(move || {
        let mut stream = connect_to(&stub_path).unwrap();

        let mut header_buf = [0u8; MessageHeader::SIZE];
        stream.read_exact(&mut header_buf).unwrap();
        let header = MessageHeader::from_bytes(&header_buf).unwrap();
        let mut full = vec![0u8; MessageHeader::SIZE + header.payload_len() as usize];
        full[..MessageHeader::SIZE].copy_from_slice(&header_buf);
        stream.read_exact(&mut full[MessageHeader::SIZE..]).unwrap();

        let request = GenerateRequest::decode(&full).unwrap();
        let mut generator = PatternGenerator::new();
        let image = generator.generate(&GenerateParams::from(&request)).unwrap();
        let response = GenerateResponse {
            request_id: request.request_id,
            generation_time_ms: 1,
            width: image.width,
            height: image.height,
            channels: image.channels,
            pixels: image.pixels.into(),
        };
        stream.write_all(&response.to_bytes().unwrap()).unwrap();
        // Crash: the stream drops here.
    });

    let conn =
        WorkerConnection::accept_connection(&listener, Duration::from_secs(5)).await.unwrap();

    // Complete one request so the connection is demonstrably live.
    conn.send(&request_bytes(1)).await.unwrap();

    stub.join().unwrap();

    // The worker's exit closes the stream; the reader notices and marks
    // the connection unusable.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let result = conn.send(&request_bytes(2)).await;
    assert!(matches!(result, Err(SendError::ConnectionClosed)));
    assert_eq!(conn.pending_requests(), 0);

    conn.close().await;
}
