use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, sleep};

use crate::backoff::NoBackoff;
use crate::body::{RequestBody, ResponseBody, full_body};
use crate::client::Client;
use crate::context::Context;
use crate::decode::DecodeOptions;
use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
use crate::multipart::Multipart;
use crate::request::Request;
use crate::response::Response;
use crate::transport::{Transport, TransportFuture};

enum Step {
    Status(u16),
    Json(u16, &'static str),
    Fail(io::ErrorKind),
    Hang,
}

#[derive(Default)]
struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    bodies: Arc<Mutex<Vec<Bytes>>>,
}

impl ScriptedTransport {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    fn always(status: u16, count: usize) -> Arc<Self> {
        Self::new((0..count).map(|_| Step::Status(status)))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().expect("bodies lock").clone()
    }
}

impl Transport for ScriptedTransport {
    fn call(&self, request: http::Request<RequestBody>) -> TransportFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or(Step::Status(200));
        Box::pin(respond(step, request, Arc::clone(&self.bodies)))
    }
}

async fn respond(
    step: Step,
    request: http::Request<RequestBody>,
    bodies: Arc<Mutex<Vec<Bytes>>>,
) -> Result<http::Response<ResponseBody>, BoxError> {
    let body = request.into_body().collect().await?.to_bytes();
    bodies.lock().expect("bodies lock").push(body);

    match step {
        Step::Status(status) => Ok(http::Response::builder()
            .status(status)
            .body(full_body(format!("status {status}")))?),
        Step::Json(status, json) => Ok(http::Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(json))?),
        Step::Fail(kind) => Err(io::Error::from(kind).into()),
        Step::Hang => std::future::pending().await,
    }
}

struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("reader exploded")))
    }
}

fn client_with(transport: &Arc<ScriptedTransport>, max_attempts: usize) -> Client {
    Client::builder()
        .base_url("http://scripted.test")
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .max_attempts(max_attempts)
        .backoff(Arc::new(NoBackoff::new(Duration::from_millis(10))))
        .try_build()
        .expect("client should build")
}

#[tokio::test(start_paused = true)]
async fn always_server_error_makes_exactly_max_attempts_calls() {
    let transport = ScriptedTransport::always(503, 8);
    let client = client_with(&transport, 4);

    let response = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect("final 5xx response is returned, not an error");

    assert_eq!(response.status_code(), 503);
    assert_eq!(response.attempts(), 4);
    assert_eq!(transport.calls(), 4);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.attempts, 4);
    assert_eq!(metrics.retries, 3);
    assert_eq!(metrics.server_errors, 1);
    assert_eq!(metrics.requests_succeeded, 1);
    assert_eq!(metrics.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn server_error_then_success_stops_retrying() {
    let transport = ScriptedTransport::new([Step::Status(503), Step::Status(200)]);
    let client = client_with(&transport, 3);

    let response = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect("second attempt should succeed");

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.attempts(), 2);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_final() {
    let transport = ScriptedTransport::new([Step::Status(404), Step::Status(200)]);
    let client = client_with(&transport, 5);

    let response = client
        .get("/missing")
        .send(&Context::new())
        .await
        .expect("404 is a successful call");

    assert_eq!(response.status_code(), 404);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_delay_separates_attempts() {
    let transport = ScriptedTransport::always(500, 3);
    let client = client_with(&transport, 3);

    let started = Instant::now();
    let response = client
        .get("/items")
        .no_backoff(Duration::from_secs(1))
        .send(&Context::new())
        .await
        .expect("exhausted retries return the last response");

    assert_eq!(response.status_code(), 500);
    let elapsed = Instant::now() - started;
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_stops_further_attempts() {
    let transport = ScriptedTransport::always(503, 8);
    let client = client_with(&transport, 5);
    let cx = Context::new();
    let canceller = cx.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let error = client
        .get("/items")
        .no_backoff(Duration::from_secs(10))
        .send(&cx)
        .await
        .expect_err("cancellation should win over backoff");

    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert!(error.is_cancellation());
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.metrics_snapshot().cancellations, 1);
}

#[tokio::test(start_paused = true)]
async fn request_timeout_bounds_whole_attempt_sequence() {
    let transport = ScriptedTransport::always(503, 8);
    let client = client_with(&transport, 5);

    let started = Instant::now();
    let error = client
        .get("/items")
        .no_backoff(Duration::from_secs(4))
        .timeout(Duration::from_secs(6))
        .send(&Context::new())
        .await
        .expect_err("deadline should expire during the second backoff");

    assert_eq!(error.code(), ErrorCode::DeadlineExceeded);
    assert_eq!(transport.calls(), 2);
    let elapsed = Instant::now() - started;
    assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn hanging_transport_is_cut_off_by_deadline() {
    let transport = ScriptedTransport::new([Step::Hang]);
    let client = client_with(&transport, 3);

    let error = client
        .get("/slow")
        .deadline(Instant::now() + Duration::from_millis(250))
        .send(&Context::new())
        .await
        .expect_err("deadline should interrupt the call");

    assert_eq!(error.code(), ErrorCode::DeadlineExceeded);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn finished_context_fails_before_any_attempt() {
    let transport = ScriptedTransport::always(200, 1);
    let client = client_with(&transport, 3);
    let cx = Context::new();
    cx.cancel();

    let error = client
        .get("/items")
        .send(&cx)
        .await
        .expect_err("cancelled context should fail immediately");

    assert!(matches!(error, Error::Cancelled { .. }));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn connection_reset_is_retried() {
    let transport = ScriptedTransport::new([
        Step::Fail(io::ErrorKind::ConnectionReset),
        Step::Fail(io::ErrorKind::BrokenPipe),
        Step::Status(200),
    ]);
    let client = client_with(&transport, 3);

    let response = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect("third attempt should succeed");

    assert_eq!(response.status_code(), 200);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retryable_errors_return_last_error() {
    let transport = ScriptedTransport::new([
        Step::Fail(io::ErrorKind::ConnectionReset),
        Step::Fail(io::ErrorKind::ConnectionReset),
    ]);
    let client = client_with(&transport, 2);

    let error = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect_err("all attempts failed");

    assert_eq!(
        error.transport_kind(),
        Some(TransportErrorKind::ConnectionReset)
    );
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn other_transport_errors_are_fatal() {
    let transport = ScriptedTransport::new([
        Step::Fail(io::ErrorKind::ConnectionRefused),
        Step::Status(200),
    ]);
    let client = client_with(&transport, 3);

    let error = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect_err("refused connection is not retried");

    assert_eq!(error.code(), ErrorCode::Transport);
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Other));
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.metrics_snapshot().transport_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn unexpected_eof_is_retried_only_when_enabled() {
    let transport = ScriptedTransport::new([
        Step::Fail(io::ErrorKind::UnexpectedEof),
        Step::Status(200),
    ]);
    let client = client_with(&transport, 3);
    let error = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect_err("eof is fatal by default");
    assert_eq!(
        error.transport_kind(),
        Some(TransportErrorKind::UnexpectedEof)
    );
    assert_eq!(transport.calls(), 1);

    let transport = ScriptedTransport::new([
        Step::Fail(io::ErrorKind::UnexpectedEof),
        Step::Status(200),
    ]);
    let client = client_with(&transport, 3);
    let response = client
        .get("/items")
        .retry_on_eof(true)
        .send(&Context::new())
        .await
        .expect("eof should be retried when enabled");
    assert_eq!(response.status_code(), 200);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn buffered_payload_is_replayed_on_every_attempt() {
    let transport = ScriptedTransport::new([Step::Status(502), Step::Status(502), Step::Status(201)]);
    let client = client_with(&transport, 3);

    let response = client
        .post("/items")
        .json(&serde_json::json!({"name": "widget"}))
        .expect("json payload")
        .send(&Context::new())
        .await
        .expect("third attempt should succeed");

    assert_eq!(response.status_code(), 201);
    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 3);
    for body in bodies {
        assert_eq!(body, Bytes::from_static(br#"{"name":"widget"}"#));
    }
}

#[tokio::test(start_paused = true)]
async fn streaming_payload_gets_single_attempt() {
    let transport = ScriptedTransport::always(503, 5);
    let client = client_with(&transport, 5);

    let response = client
        .post("/upload")
        .body_reader(&b"streamed bytes"[..])
        .send(&Context::new())
        .await
        .expect("single attempt returns the 503");

    assert_eq!(response.status_code(), 503);
    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.bodies(), vec![Bytes::from_static(b"streamed bytes")]);
}

#[tokio::test(start_paused = true)]
async fn multipart_failure_on_first_attempt_is_surfaced() {
    let transport = ScriptedTransport::always(503, 5);
    let client = client_with(&transport, 5);

    let error = client
        .post("/upload")
        .multipart(Multipart::new().text("kind", "csv").reader("file", "a.csv", FailingReader))
        .expect("multipart payload")
        .send(&Context::new())
        .await
        .expect_err("payload failure should be reported");

    assert_eq!(error.code(), ErrorCode::Payload);
    assert!(error.to_string().contains("reader exploded"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn multipart_payload_is_streamed_to_transport() {
    let transport = ScriptedTransport::always(200, 1);
    let client = client_with(&transport, 1);
    let multipart = Multipart::new().text("greeting", "hello");
    let boundary = multipart.boundary().to_owned();

    let response = client
        .post("/upload")
        .multipart(multipart)
        .expect("multipart payload")
        .send(&Context::new())
        .await
        .expect("upload should succeed");

    assert_eq!(response.status_code(), 200);
    let body = transport.bodies().pop().expect("body should be recorded");
    let text = String::from_utf8(body.to_vec()).expect("utf8");
    assert!(text.starts_with(&format!("--{boundary}\r\n")));
    assert!(text.contains("hello"));
}

#[tokio::test(start_paused = true)]
async fn hooks_run_in_order_and_first_failure_wins() {
    let transport = ScriptedTransport::always(200, 1);
    let client = client_with(&transport, 1);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&seen);
    let second = Arc::clone(&seen);
    let third = Arc::clone(&seen);
    let error = client
        .get("/items")
        .after_execute(move |request: &Request, response: &Response| {
            first
                .lock()
                .expect("seen lock")
                .push(format!("first {} {}", request.method(), response.status_code()));
            Ok(())
        })
        .after_execute(move |_request: &Request, _response: &Response| {
            second.lock().expect("seen lock").push("second".to_owned());
            Err("quota header missing".into())
        })
        .after_execute(move |_request: &Request, _response: &Response| {
            third.lock().expect("seen lock").push("third".to_owned());
            Ok(())
        })
        .send(&Context::new())
        .await
        .expect_err("second hook should fail the call");

    assert!(matches!(error, Error::AfterExecute { index: 1, .. }));
    assert_eq!(
        *seen.lock().expect("seen lock"),
        vec!["first GET 200".to_owned(), "second".to_owned()]
    );
    assert_eq!(client.buffer_pool().available(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_client_spaces_requests() {
    let transport = ScriptedTransport::always(200, 4);
    let client = Client::builder()
        .base_url("http://scripted.test")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .rate_limit(2, Duration::from_secs(1))
        .try_build()
        .expect("client should build");

    let started = Instant::now();
    for _ in 0..4 {
        client
            .get("/items")
            .send(&Context::new())
            .await
            .expect("request should be admitted");
    }
    assert!(Instant::now() - started >= Duration::from_secs(2));
    assert_eq!(transport.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn abandoned_rate_limit_wait_closes_limiter_for_client() {
    let transport = ScriptedTransport::always(200, 4);
    let client = Client::builder()
        .base_url("http://scripted.test")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .rate_limit(1, Duration::from_secs(60))
        .try_build()
        .expect("client should build");

    let error = client
        .get("/items")
        .timeout(Duration::from_secs(1))
        .send(&Context::new())
        .await
        .expect_err("wait should be cut by the timeout");
    assert_eq!(error.code(), ErrorCode::DeadlineExceeded);

    let error = client
        .get("/items")
        .send(&Context::new())
        .await
        .expect_err("limiter is closed");
    assert_eq!(error.code(), ErrorCode::RateLimiterClosed);
    assert_eq!(transport.calls(), 0);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    id: u32,
    name: String,
}

#[tokio::test(start_paused = true)]
async fn decode_with_retained_copy_then_close_twice() {
    let transport = ScriptedTransport::new([Step::Json(200, r#"{"id":1,"name":"widget"}"#)]);
    let client = client_with(&transport, 1);
    let cx = Context::new();

    let mut response = client.get("/items/1").send(&cx).await.expect("response");
    let item: Item = response
        .decode(&cx, DecodeOptions::new().retain_body(true))
        .await
        .expect("json should decode");
    assert_eq!(item.name, "widget");

    let error = response
        .decode::<Item>(&cx, DecodeOptions::new())
        .await
        .expect_err("raw body is consumed");
    assert_eq!(error.code(), ErrorCode::BodyConsumed);

    let copied = response.bytes(&cx).await.expect("copy should remain");
    assert_eq!(copied, Bytes::from_static(br#"{"id":1,"name":"widget"}"#));

    response.close();
    response.close();
    assert_eq!(client.buffer_pool().available(), 1);
}
