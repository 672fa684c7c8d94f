//! The per-request logging obligation.
//!
//! A [`PendingRecord`] is acquired when a request enters the middleware and travels with the
//! request: first inside the service future, then inside the response body. Whichever owner drops
//! it last releases it, and releasing builds the [`AccessLogRecord`] and hands it to the sink.
//! Because the obligation is moved rather than shared, a record is emitted exactly once on every
//! exit path, including cancellation and panics.

use axum::http::{HeaderMap, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::body_wrapper::RequestCapture;
use crate::config::AccessLogConfig;
use crate::snapshot::{convert_headers, RequestSnapshot};
use crate::types::{AccessLogRecord, CapturedBody, RequestFailure};

pub(crate) struct PendingRecord {
    draft: Option<Draft>,
    sink: mpsc::UnboundedSender<AccessLogRecord>,
}

struct Draft {
    snapshot: RequestSnapshot,
    include_response: bool,
    request_capture: Option<RequestCapture>,
    status: Option<StatusCode>,
    response_headers: Option<BTreeMap<String, Vec<String>>>,
    time_to_headers: Option<Duration>,
    response_bytes: u64,
    response_body: Option<CapturedBody>,
    failure: Option<RequestFailure>,
}

impl PendingRecord {
    pub(crate) fn new(
        snapshot: RequestSnapshot,
        config: &AccessLogConfig,
        sink: mpsc::UnboundedSender<AccessLogRecord>,
    ) -> Self {
        Self {
            draft: Some(Draft {
                snapshot,
                include_response: config.include_response,
                request_capture: None,
                status: None,
                response_headers: None,
                time_to_headers: None,
                response_bytes: 0,
                response_body: None,
                failure: None,
            }),
            sink,
        }
    }

    pub(crate) fn correlation_id(&self) -> Option<u64> {
        self.draft.as_ref().map(|draft| draft.snapshot.correlation_id)
    }

    pub(crate) fn attach_request_capture(&mut self, capture: RequestCapture) {
        if let Some(draft) = self.draft.as_mut() {
            draft.request_capture = Some(capture);
        }
    }

    /// Record the response head once the inner service has produced it.
    pub(crate) fn commit(&mut self, status: StatusCode, headers: &HeaderMap, config: &AccessLogConfig) {
        if let Some(draft) = self.draft.as_mut() {
            draft.status = Some(status);
            draft.time_to_headers = Some(draft.snapshot.started.elapsed());
            if config.include_response && config.include_headers {
                draft.response_headers = Some(convert_headers(headers, config));
            }
        }
    }

    pub(crate) fn fail(&mut self, failure: RequestFailure) {
        if let Some(draft) = self.draft.as_mut() {
            draft.failure.get_or_insert(failure);
        }
    }

    /// Record what the response body recorder observed.
    pub(crate) fn complete_body(&mut self, bytes_sent: u64, captured: CapturedBody) {
        if let Some(draft) = self.draft.as_mut() {
            draft.response_bytes = bytes_sent;
            if draft.include_response {
                draft.response_body = Some(captured);
            }
        }
    }

    fn release(&mut self) {
        let Some(draft) = self.draft.take() else {
            return;
        };
        let correlation_id = draft.snapshot.correlation_id;
        let record = draft.into_record();

        debug!(
            correlation_id = %correlation_id,
            status = %record.status,
            duration_ms = record.duration_millis,
            failed = record.is_failure(),
            "Releasing access log record"
        );
        if self.sink.send(record).is_err() {
            error!(correlation_id = %correlation_id, "Failed to send access log record to background task");
        }
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        self.release();
    }
}

impl Draft {
    fn into_record(self) -> AccessLogRecord {
        let duration = self.snapshot.started.elapsed();
        // no head means the future never produced a response
        let failure = match (self.failure, self.status) {
            (Some(failure), _) => Some(failure),
            (None, None) => Some(RequestFailure::Cancelled),
            (None, Some(_)) => None,
        };

        AccessLogRecord {
            request_body: self.request_capture.map(RequestCapture::finish),
            status: self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            duration_millis: millis(duration),
            time_to_headers_millis: self.time_to_headers.map(millis),
            response_headers: self.response_headers,
            response_bytes: self.response_bytes,
            response_body: self.response_body,
            error: failure,
            request: self.snapshot,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
