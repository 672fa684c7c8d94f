//! # accesslog
//!
//! An Axum/tower middleware that emits exactly one structured access-log record per request,
//! with size-bounded previews of request and response bodies and full streaming support.
//!
//! ## Features
//!
//! - **Transparent**: clients receive the bytes the handler produced, frame for frame
//! - **Bounded capture**: body previews never exceed the configured limits, however large or long
//!   the body; binary and oversized payloads are counted but never buffered
//! - **Exactly once**: a record is emitted whether the handler succeeds, errors, panics, streams a
//!   failing body, or is cancelled
//! - **Background processing**: records are handed to a sink on a background task, so slow sinks
//!   never hold up a response
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use accesslog::{AccessLogConfig, AccessLogLayer, LoggingSink};
//! use std::net::SocketAddr;
//!
//! async fn hello() -> &'static str {
//!     "Hello, World!"
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AccessLogConfig {
//!         request_body_length: 1024,
//!         response_body_length: 1024,
//!         include_response: true,
//!         ..Default::default()
//!     };
//!     let layer = AccessLogLayer::new(config, LoggingSink);
//!
//!     let app = Router::new().route("/hello", get(hello)).layer(layer);
//!
//!     // connect info lets records carry the peer address
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Custom Sinks
//!
//! Implement the [`AccessLogSink`] trait to ship records elsewhere:
//!
//! ```rust
//! use accesslog::{AccessLogRecord, AccessLogSink};
//!
//! #[derive(Debug)]
//! struct StdoutSink;
//!
//! impl AccessLogSink for StdoutSink {
//!     async fn record(&self, record: AccessLogRecord) {
//!         if let Ok(line) = serde_json::to_string(&record) {
//!             println!("{line}");
//!         }
//!     }
//! }
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::{Method, StatusCode},
    response::Response,
};
use futures::FutureExt;
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::SystemTime,
};
use tokio::sync::mpsc;
use tower::{Layer, Service};
use tracing::{debug, instrument};

pub mod types;
pub use types::{AccessLogRecord, CapturedBody, RequestFailure};

pub mod config;
pub use config::AccessLogConfig;

pub mod body_wrapper;
use body_wrapper::{tap_request, Recording, RecordingBody};

pub mod guard;
use guard::StreamingGuard;

pub mod limiter;

mod pending;
use pending::PendingRecord;

pub mod snapshot;
use snapshot::RequestSnapshot;

pub mod logging_sink;
pub use logging_sink::LoggingSink;

pub mod multi_sink;
pub use multi_sink::MultiSink;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static STARTED_AT_SECS: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

/// Process-unique id: start time in seconds in the high half, a sequence number in the low half.
fn next_correlation_id() -> u64 {
    let epoch = *STARTED_AT_SECS.get_or_init(|| {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    });
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) & u64::from(u32::MAX);

    (epoch << 32) | sequence
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Receiver of finished access-log records.
///
/// The middleware calls [`record`](AccessLogSink::record) from a background task, once per
/// request, after the response has been sent or has failed. Persisting or shipping the record is
/// the sink's business; failures should be reported through the sink's own diagnostics.
///
/// # Examples
///
/// ```rust
/// use accesslog::{AccessLogRecord, AccessLogSink};
/// use tracing::warn;
///
/// #[derive(Debug)]
/// struct SlowRequestSink;
///
/// impl AccessLogSink for SlowRequestSink {
///     async fn record(&self, record: AccessLogRecord) {
///         if record.duration_millis > 1000 {
///             warn!(path = %record.request.path, duration_ms = record.duration_millis, "Slow request");
///         }
///     }
/// }
/// ```
pub trait AccessLogSink: Send + Sync + 'static {
    /// Handle one finished record.
    fn record(&self, record: AccessLogRecord) -> impl std::future::Future<Output = ()> + Send;
}

/// Tower layer for the access-log middleware.
///
/// This is the main entry point. It implements the Tower [`Layer`] trait and can be used with
/// Axum's layering system. Constructing it spawns the background task that feeds records to the
/// sink, so it must be created inside a Tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use accesslog::{AccessLogConfig, AccessLogLayer, LoggingSink};
/// use axum::{routing::get, Router};
/// use tower::ServiceBuilder;
///
/// # async fn hello() -> &'static str { "Hello" }
/// # #[tokio::main]
/// # async fn main() {
/// let layer = AccessLogLayer::new(AccessLogConfig::default(), LoggingSink);
///
/// let app = Router::new()
///     .route("/hello", get(hello))
///     .layer(ServiceBuilder::new().layer(layer));
///
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
/// axum::serve(listener, app).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct AccessLogLayer {
    config: Arc<AccessLogConfig>,
    tx: mpsc::UnboundedSender<AccessLogRecord>,
}

impl AccessLogLayer {
    /// Create a new access-log layer with the given configuration and sink.
    ///
    /// This spawns a background task that hands every emitted record to `sink`.
    pub fn new<S: AccessLogSink>(config: AccessLogConfig, sink: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AccessLogRecord>();
        let sink = Arc::new(sink);

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.record(record).await;
            }
            debug!("Access log channel closed, sink task exiting");
        });

        Self {
            config: Arc::new(config),
            tx,
        }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            config: Arc::clone(&self.config),
            guard: StreamingGuard::new(self.config.stream_threshold),
            tx: self.tx.clone(),
        }
    }
}

/// Tower service implementation for the access-log middleware.
///
/// Wraps an inner service, takes a snapshot of each request on entry, taps the request body when
/// configured, and records the response head and body as they flow back out. Users typically
/// don't interact with this type directly - it's created by [`AccessLogLayer`].
#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    config: Arc<AccessLogConfig>,
    guard: StreamingGuard,
    tx: mpsc::UnboundedSender<AccessLogRecord>,
}

impl<S> Service<Request> for AccessLogService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        let correlation_id = next_correlation_id();
        let snapshot = RequestSnapshot::capture(correlation_id, &request, &self.config);
        debug!(
            correlation_id = %correlation_id,
            method = %snapshot.method,
            path = %snapshot.path,
            "Captured request snapshot"
        );
        let head_request = *request.method() == Method::HEAD;
        let mut pending = PendingRecord::new(snapshot, &self.config, self.tx.clone());

        // the ready service handles this request; a fresh clone takes its place
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);
        let guard = self.guard;

        Box::pin(async move {
            let request = if config.request_body_length > 0 {
                let size_hint = http_body::Body::size_hint(request.body()).exact();
                let policy = guard.policy(request.headers(), size_hint);
                debug!(correlation_id = %correlation_id, ?policy, "Tapping request body");
                let (request, capture) =
                    tap_request(request, config.request_body_length, policy).await;
                pending.attach_request_capture(capture);
                request
            } else {
                request
            };

            debug!("Awaiting inner service response");
            // `call` itself may panic before returning a future
            let result = AssertUnwindSafe(async move { inner.call(request).await })
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(response)) => {
                    debug!(correlation_id = %correlation_id, status = %response.status(), "Inner service response received");
                    Ok(record_response(response, pending, &config, guard, head_request))
                }
                Ok(Err(e)) => {
                    debug!(correlation_id = %correlation_id, error = %e, "Inner service failed");
                    pending.fail(RequestFailure::Handler(e.to_string()));
                    drop(pending);
                    Err(e)
                }
                Err(payload) => {
                    pending.fail(RequestFailure::Panicked(panic_message(payload.as_ref())));
                    drop(pending);
                    std::panic::resume_unwind(payload)
                }
            }
        })
    }
}

/// Commit the response head to the pending record and wrap the body in a recorder.
fn record_response(
    response: Response,
    mut pending: PendingRecord,
    config: &AccessLogConfig,
    guard: StreamingGuard,
    head_request: bool,
) -> Response {
    let (parts, body) = response.into_parts();
    pending.commit(parts.status, &parts.headers, config);

    let recording = if config.include_response {
        let policy = guard.policy(&parts.headers, http_body::Body::size_hint(&body).exact());
        debug!(correlation_id = ?pending.correlation_id(), ?policy, "Recording response body");
        Recording::new(policy, config.response_body_length)
    } else {
        Recording::default()
    };

    let mut body = RecordingBody::new(body, recording, pending);
    if head_request || !status_allows_payload(parts.status) {
        body = body.without_payload();
    }
    Response::from_parts(parts, Body::new(body))
}

fn status_allows_payload(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
