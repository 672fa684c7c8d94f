//! Default sink that writes records as structured `tracing` events.

use tracing::{info, warn};

use crate::{AccessLogRecord, AccessLogSink};

/// [`AccessLogSink`] that emits every record as one `tracing` event with target `access_log`.
///
/// Completed requests are logged at `INFO`, failed ones at `WARN` with the failure attached.
/// The logged information includes:
/// - Correlation ID, method, path and query parameters
/// - Status code, total duration and time to response headers
/// - Remote address and request headers (in debug format)
/// - Body previews and sizes, when captured
///
/// # Examples
///
/// ```rust,no_run
/// use accesslog::{AccessLogConfig, AccessLogLayer, LoggingSink};
///
/// # #[tokio::main]
/// # async fn main() {
/// let layer = AccessLogLayer::new(AccessLogConfig::default(), LoggingSink);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

impl AccessLogSink for LoggingSink {
    async fn record(&self, record: AccessLogRecord) {
        let request = &record.request;
        let request_body = record.request_body.as_ref().map(|body| body.preview());
        let response_body = record.response_body.as_ref().map(|body| body.preview());

        match &record.error {
            None => info!(
                target: "access_log",
                correlation_id = %request.correlation_id,
                method = %request.method,
                path = %request.path,
                query = ?request.query_params,
                remote_address = request.remote_address.as_deref().unwrap_or("-"),
                headers = ?request.headers,
                status = record.status.as_u16(),
                duration_ms = record.duration_millis,
                response_bytes = record.response_bytes,
                request_body = ?request_body,
                response_body = ?response_body,
                "Request completed"
            ),
            Some(error) => warn!(
                target: "access_log",
                correlation_id = %request.correlation_id,
                method = %request.method,
                path = %request.path,
                query = ?request.query_params,
                remote_address = request.remote_address.as_deref().unwrap_or("-"),
                headers = ?request.headers,
                status = record.status.as_u16(),
                duration_ms = record.duration_millis,
                response_bytes = record.response_bytes,
                request_body = ?request_body,
                response_body = ?response_body,
                error = %error,
                "Request failed"
            ),
        }
    }
}
