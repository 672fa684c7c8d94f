//! Data types for emitted access-log records.
//!
//! This module contains the record handed to an [`AccessLogSink`](crate::AccessLogSink) once a
//! request finishes, along with the captured body previews and failure descriptions it carries.

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use serde::{ser::SerializeStruct, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::snapshot::RequestSnapshot;

/// A size-bounded prefix of a request or response body.
///
/// `bytes` never holds more than the configured limit; `total_bytes` counts everything that went
/// through the wire, so a preview may be empty while the body itself was large.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBody {
    /// Retained prefix of the body
    pub bytes: Bytes,
    /// Number of body bytes observed, retained or not
    pub total_bytes: u64,
}

impl CapturedBody {
    pub fn new(bytes: Bytes, total_bytes: u64) -> Self {
        Self { bytes, total_bytes }
    }

    /// Whether fewer bytes were retained than were transferred.
    pub fn truncated(&self) -> bool {
        self.total_bytes > self.bytes.len() as u64
    }

    /// The retained prefix as text, with invalid UTF-8 replaced.
    pub fn preview(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl Serialize for CapturedBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CapturedBody", 3)?;
        state.serialize_field("preview", &self.preview())?;
        state.serialize_field("total_bytes", &self.total_bytes)?;
        state.serialize_field("truncated", &self.truncated())?;
        state.end()
    }
}

/// Why a request did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestFailure {
    /// The inner service returned an error instead of a response
    #[error("handler error: {0}")]
    Handler(String),
    /// The inner service panicked while producing a response
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// The response body stream failed after the head was sent
    #[error("response body error: {0}")]
    Body(String),
    /// The request future was dropped before a response head existed
    #[error("request cancelled before a response was produced")]
    Cancelled,
    /// The response body was dropped before it finished, e.g. the client went away
    #[error("response aborted after {bytes_sent} bytes")]
    Aborted { bytes_sent: u64 },
}

impl Serialize for RequestFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The single access-log entry emitted for one request/response exchange.
///
/// Records are serializable so sinks can ship them as JSON:
///
/// ```rust
/// use accesslog::AccessLogRecord;
///
/// fn to_json_line(record: &AccessLogRecord) -> serde_json::Result<String> {
///     serde_json::to_string(record)
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogRecord {
    /// Facts captured when the request entered the middleware
    #[serde(flatten)]
    pub request: RequestSnapshot,
    /// Final status; 500 when no response head was ever produced
    #[serde(serialize_with = "serialize_status")]
    pub status: StatusCode,
    /// Time from request entry until the response body finished, failed or was dropped
    pub duration_millis: u64,
    /// Time from request entry until the response head was available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_headers_millis: Option<u64>,
    /// Request body preview, present when request capture is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<CapturedBody>,
    /// Response headers, present when response logging and header logging are enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, Vec<String>>>,
    /// Response body bytes forwarded to the client
    pub response_bytes: u64,
    /// Response body preview, present when response logging is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<CapturedBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestFailure>,
}

impl AccessLogRecord {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_millis)
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

pub(crate) fn serialize_method<S: Serializer>(
    method: &Method,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

fn serialize_status<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}
