//! Middleware configuration.

use serde::Deserialize;

/// Default ceiling above which a declared body length skips capture.
pub const DEFAULT_STREAM_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Configuration for the access-log middleware.
///
/// Controls how much of each body is previewed and which parts of the exchange are recorded. The
/// struct is resolved once, before the layer is built, and never changes afterwards. It
/// deserializes from any serde format; missing fields take their defaults and the camelCase names
/// (`requestBodyLength`, `responseBodyLength`, `includeResponse`) are accepted as aliases.
///
/// # Examples
///
/// ```rust
/// use accesslog::AccessLogConfig;
///
/// // Default configuration: no body capture, no response details
/// let config = AccessLogConfig::default();
/// assert_eq!(config.request_body_length, 0);
///
/// // Custom configuration
/// let config = AccessLogConfig {
///     response_body_length: 1024,
///     include_response: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Maximum request body bytes to retain; 0 disables request capture.
    ///
    /// The handler starts only after this many bytes (or the whole body) have arrived, so keep it
    /// at 0 for routes whose clients wait on response bytes before sending more of the body.
    #[serde(alias = "requestBodyLength")]
    pub request_body_length: usize,
    /// Maximum response body bytes to retain
    #[serde(alias = "responseBodyLength")]
    pub response_body_length: usize,
    /// Whether response headers and body preview are recorded at all
    #[serde(alias = "includeResponse")]
    pub include_response: bool,
    /// Whether headers are recorded
    #[serde(alias = "includeHeaders")]
    pub include_headers: bool,
    /// Header names (case-insensitive) whose values are replaced by `[REDACTED]`
    #[serde(alias = "redactHeaders")]
    pub redact_headers: Vec<String>,
    /// Treat the peer as a proxy: take the remote address from `X-Forwarded-For` (first entry) or
    /// `X-Real-IP`, using the peer address only when neither header is usable
    #[serde(alias = "trustForwardedHeaders")]
    pub trust_forwarded_headers: bool,
    /// Declared body lengths above this are passed through without capture
    #[serde(alias = "streamThreshold")]
    pub stream_threshold: u64,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            request_body_length: 0,
            response_body_length: 0,
            include_response: false,
            include_headers: true,
            redact_headers: ["authorization", "proxy-authorization", "cookie", "set-cookie"]
                .into_iter()
                .map(String::from)
                .collect(),
            trust_forwarded_headers: false,
            stream_threshold: DEFAULT_STREAM_THRESHOLD,
        }
    }
}

impl AccessLogConfig {
    pub(crate) fn is_redacted(&self, name: &str) -> bool {
        self.redact_headers
            .iter()
            .any(|redacted| redacted.eq_ignore_ascii_case(name))
    }
}
