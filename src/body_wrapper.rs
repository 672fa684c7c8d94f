//! Body tapping and recording.
//!
//! Both directions forward frames exactly as they were produced. The request side is tapped
//! before the inner service runs: up to the configured limit is read ahead, retained for the log,
//! and replayed to the handler ahead of the rest of the stream, so a preview exists even when the
//! handler never reads its body. The response side records while the client is being served,
//! frame by frame, without buffering anything on the way to the transport.

use axum::{body::Body, extract::Request};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tracing::debug;

use crate::guard::CapturePolicy;
use crate::limiter::BodyLimiter;
use crate::pending::PendingRecord;
use crate::types::{CapturedBody, RequestFailure};

/// Request body capture handle, finished when the record is released.
///
/// The retained prefix is fixed once the read-ahead completes; the byte count keeps growing while
/// the handler consumes the rest of the body.
#[derive(Debug)]
pub struct RequestCapture {
    retained: Bytes,
    seen: Arc<AtomicU64>,
}

impl RequestCapture {
    pub fn finish(self) -> CapturedBody {
        CapturedBody::new(self.retained, self.seen.load(Ordering::Relaxed))
    }
}

/// Read ahead up to `limit` bytes of the request body and return a request whose body replays
/// them, together with the capture handle.
///
/// With [`CapturePolicy::PassThrough`] nothing is read ahead and bytes are only counted as the
/// handler reads them.
///
/// The returned future resolves once `limit` bytes or the end of the body have arrived. A client
/// that waits for the response before sending more of its body would stall here.
///
/// # Examples
///
/// ```rust
/// use accesslog::body_wrapper::tap_request;
/// use accesslog::guard::CapturePolicy;
/// use axum::{body::Body, extract::Request};
/// use http_body_util::BodyExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let request = Request::new(Body::from("Hello, World!"));
/// let (request, capture) = tap_request(request, 5, CapturePolicy::Capture).await;
///
/// // The handler still sees the whole body
/// let body = request.into_body().collect().await?.to_bytes();
/// assert_eq!(body, "Hello, World!");
///
/// let captured = capture.finish();
/// assert_eq!(captured.bytes, "Hello");
/// assert!(captured.truncated());
/// # Ok(())
/// # }
/// ```
pub async fn tap_request(
    request: Request,
    limit: usize,
    policy: CapturePolicy,
) -> (Request, RequestCapture) {
    let (parts, mut body) = request.into_parts();
    let mut limiter = match policy {
        CapturePolicy::Capture => BodyLimiter::new(limit),
        CapturePolicy::PassThrough => BodyLimiter::new(0),
    };
    let mut buffered = VecDeque::new();
    let mut pending_error = None;
    let mut exhausted = body.is_end_stream();

    while !exhausted && limiter.remaining() > 0 {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    limiter.write(data);
                }
                buffered.push_back(frame);
            }
            Some(Err(e)) => {
                debug!(error = %e, "Request body failed during read-ahead");
                pending_error = Some(e);
                exhausted = true;
            }
            None => exhausted = true,
        }
    }

    let seen = Arc::new(AtomicU64::new(limiter.total_bytes()));
    let captured = limiter.finish();
    let replay = ReplayBody {
        buffered,
        pending_error,
        inner: (!exhausted).then_some(body),
        seen: Arc::clone(&seen),
    };

    let capture = RequestCapture {
        retained: captured.bytes,
        seen,
    };
    (Request::from_parts(parts, Body::new(replay)), capture)
}

/// Request body that yields read-ahead frames first, then the remaining stream, counting every
/// data byte that reaches the handler after the read-ahead.
#[derive(Debug)]
pub struct ReplayBody {
    buffered: VecDeque<Frame<Bytes>>,
    pending_error: Option<axum::Error>,
    inner: Option<Body>,
    seen: Arc<AtomicU64>,
}

impl HttpBody for ReplayBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(frame) = this.buffered.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        if let Some(error) = this.pending_error.take() {
            return Poll::Ready(Some(Err(error)));
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.seen.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.buffered.is_empty()
            && self.pending_error.is_none()
            && self.inner.as_ref().is_none_or(HttpBody::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        let buffered: u64 = self
            .buffered
            .iter()
            .filter_map(Frame::data_ref)
            .map(|data| data.len() as u64)
            .sum();
        let Some(inner) = self.inner.as_ref() else {
            return SizeHint::with_exact(buffered);
        };

        let inner = inner.size_hint();
        let mut hint = SizeHint::new();
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper.saturating_add(buffered));
        }
        hint.set_lower(inner.lower().saturating_add(buffered));
        hint
    }
}

/// What the response recorder keeps for one body, chosen once when the head is committed.
#[derive(Debug)]
pub(crate) enum Recording {
    Capture(BodyLimiter),
    PassThrough { bytes: u64 },
}

impl Default for Recording {
    fn default() -> Self {
        Recording::PassThrough { bytes: 0 }
    }
}

impl Recording {
    pub(crate) fn new(policy: CapturePolicy, limit: usize) -> Self {
        match policy {
            CapturePolicy::Capture => Recording::Capture(BodyLimiter::new(limit)),
            CapturePolicy::PassThrough => Recording::default(),
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        match self {
            Recording::Capture(limiter) => limiter.write(chunk),
            Recording::PassThrough { bytes } => *bytes += chunk.len() as u64,
        }
    }

    fn bytes_seen(&self) -> u64 {
        match self {
            Recording::Capture(limiter) => limiter.total_bytes(),
            Recording::PassThrough { bytes } => *bytes,
        }
    }

    fn finish(self) -> (u64, CapturedBody) {
        match self {
            Recording::Capture(limiter) => (limiter.total_bytes(), limiter.finish()),
            Recording::PassThrough { bytes } => (bytes, CapturedBody::new(Bytes::new(), bytes)),
        }
    }
}

/// Response body that forwards every frame untouched and owns the request's pending record.
///
/// The record is released when the stream ends, fails, or the body is dropped early.
pub(crate) struct RecordingBody {
    inner: Body,
    recording: Recording,
    pending: Option<PendingRecord>,
    sends_payload: bool,
}

impl RecordingBody {
    pub(crate) fn new(inner: Body, recording: Recording, pending: PendingRecord) -> Self {
        Self {
            inner,
            recording,
            pending: Some(pending),
            sends_payload: true,
        }
    }

    /// Mark a response whose body is never written to the wire (HEAD, 1xx, 204, 304).
    ///
    /// Servers drop such bodies unpolled, which then counts as a clean completion.
    pub(crate) fn without_payload(mut self) -> Self {
        self.sends_payload = false;
        self
    }

    fn finalize(&mut self, failure: Option<RequestFailure>) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        if let Some(failure) = failure {
            pending.fail(failure);
        }
        let (bytes_sent, captured) = std::mem::take(&mut self.recording).finish();
        pending.complete_body(bytes_sent, captured);
    }
}

impl HttpBody for RecordingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.recording.observe(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.finalize(Some(RequestFailure::Body(error.to_string())));
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.finalize(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordingBody {
    fn drop(&mut self) {
        if self.pending.is_none() {
            return;
        }
        // servers may drop a finished body without polling it to the end
        let aborted = self.sends_payload && !self.inner.is_end_stream();
        let failure = aborted.then(|| RequestFailure::Aborted {
            bytes_sent: self.recording.bytes_seen(),
        });
        self.finalize(failure);
    }
}
