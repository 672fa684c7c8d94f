//! Buffer-or-pass-through decision for bodies.
//!
//! Binary payloads and bodies declared larger than a safety ceiling are never previewed: they are
//! forwarded untouched and only counted.

use axum::http::{header, HeaderMap};

/// Media types whose content is never useful as a text preview.
const BINARY_TYPES: &[&str] = &[
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-tar",
    "application/x-7z-compressed",
    "application/x-protobuf",
    "application/grpc",
    "application/wasm",
];

/// Media type prefixes treated as binary.
const BINARY_PREFIXES: &[&str] = &["image/", "audio/", "video/", "font/", "multipart/"];

/// How a body is handled for logging, decided once per body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    /// Feed the body through a [`BodyLimiter`](crate::limiter::BodyLimiter)
    Capture,
    /// Forward and count only
    PassThrough,
}

/// Classifies bodies by content type and declared length.
///
/// # Examples
///
/// ```rust
/// use accesslog::guard::StreamingGuard;
///
/// let guard = StreamingGuard::new(1024 * 1024);
/// assert!(guard.should_capture(Some("application/json; charset=utf-8"), Some(512)));
/// assert!(!guard.should_capture(Some("application/octet-stream"), Some(512)));
/// assert!(!guard.should_capture(Some("text/plain"), Some(10 * 1024 * 1024)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StreamingGuard {
    ceiling: u64,
}

impl StreamingGuard {
    /// `ceiling` is the largest declared length that is still captured.
    pub fn new(ceiling: u64) -> Self {
        Self { ceiling }
    }

    pub fn should_capture(&self, content_type: Option<&str>, declared_length: Option<u64>) -> bool {
        if content_type.is_some_and(is_binary) {
            return false;
        }
        declared_length.is_none_or(|length| length <= self.ceiling)
    }

    /// Resolve the policy for a body from its headers, falling back to the body's exact size
    /// hint when no usable `Content-Length` is present.
    pub fn policy(&self, headers: &HeaderMap, size_hint: Option<u64>) -> CapturePolicy {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        let declared_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(size_hint);

        if self.should_capture(content_type, declared_length) {
            CapturePolicy::Capture
        } else {
            CapturePolicy::PassThrough
        }
    }
}

fn is_binary(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    BINARY_TYPES.contains(&essence.as_str())
        || BINARY_PREFIXES
            .iter()
            .any(|prefix| essence.starts_with(prefix))
}
