//! Per-request facts captured when a request enters the middleware.

use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderMap, Method},
};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    time::{Instant, SystemTime},
};
use tracing::debug;

use crate::config::AccessLogConfig;
use crate::types::serialize_method;

const REDACTED: &str = "[REDACTED]";

/// Error decoding one component of a query string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryDecodeError {
    #[error("truncated percent escape at byte {0}")]
    TruncatedEscape(usize),
    #[error("invalid percent escape at byte {0}")]
    InvalidEscape(usize),
    #[error("decoded bytes are not valid UTF-8")]
    InvalidUtf8,
}

/// Immutable facts about a request, taken before the inner service runs.
///
/// Reading a snapshot never touches the request body.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    /// Unique identifier stamped on the emitted record
    pub correlation_id: u64,
    /// When the request was received by the middleware
    pub timestamp: SystemTime,
    /// Monotonic entry time used for durations
    #[serde(skip)]
    pub started: Instant,
    /// HTTP method (GET, POST, etc.)
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub path: String,
    /// Decoded query parameters; repeated names keep every value in order
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Request headers, redacted per configuration; empty when header logging is off
    pub headers: BTreeMap<String, Vec<String>>,
    pub remote_address: Option<String>,
}

impl RequestSnapshot {
    pub fn capture(correlation_id: u64, request: &Request, config: &AccessLogConfig) -> Self {
        let headers = if config.include_headers {
            convert_headers(request.headers(), config)
        } else {
            BTreeMap::new()
        };

        Self {
            correlation_id,
            timestamp: SystemTime::now(),
            started: Instant::now(),
            method: request.method().clone(),
            path: request.uri().path().to_owned(),
            query_params: request.uri().query().map(parse_query).unwrap_or_default(),
            headers,
            remote_address: remote_address(request, config.trust_forwarded_headers),
        }
    }
}

/// Convert a header map to name -> values, redacting configured names.
pub(crate) fn convert_headers(
    headers: &HeaderMap,
    config: &AccessLogConfig,
) -> BTreeMap<String, Vec<String>> {
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let value = if config.is_redacted(name.as_str()) {
            REDACTED.to_owned()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        result.entry(name.as_str().to_owned()).or_default().push(value);
    }
    result
}

/// Parse a raw query string into name -> ordered values.
///
/// A parameter with any malformed name or value maps to an empty list.
///
/// ```rust
/// use accesslog::snapshot::parse_query;
///
/// let params = parse_query("name=thomas&address=a1&address=a2&bad=%zz");
/// assert_eq!(params["address"], vec!["a1", "a2"]);
/// assert!(params["bad"].is_empty());
/// ```
pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut malformed = BTreeSet::new();

    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (raw_name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));

        let name = match decode_component(raw_name) {
            Ok(name) => name,
            Err(e) => {
                debug!(parameter = raw_name, error = %e, "Malformed query parameter name");
                malformed.insert(raw_name.to_owned());
                continue;
            }
        };

        match decode_component(raw_value) {
            Ok(value) => params.entry(name).or_default().push(value),
            Err(e) => {
                debug!(parameter = %name, error = %e, "Malformed query parameter value");
                malformed.insert(name);
            }
        }
    }

    for name in malformed {
        params.insert(name, Vec::new());
    }
    params
}

/// Decode one `application/x-www-form-urlencoded` component.
///
/// Unlike lenient decoders, a `%` that is not followed by two hex digits is an error.
pub fn decode_component(raw: &str) -> Result<String, QueryDecodeError> {
    let bytes = raw.as_bytes();
    for (i, _) in raw.match_indices('%') {
        let Some(escape) = bytes.get(i + 1..i + 3) else {
            return Err(QueryDecodeError::TruncatedEscape(i));
        };
        if !escape.iter().all(u8::is_ascii_hexdigit) {
            return Err(QueryDecodeError::InvalidEscape(i));
        }
    }

    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| QueryDecodeError::InvalidUtf8)
}

/// Peer IP, or the client named by forwarding headers when the peer is a trusted proxy.
fn remote_address(request: &Request, trust_forwarded: bool) -> Option<String> {
    let headers = request.headers();
    let forwarded = trust_forwarded
        .then(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .or_else(|| {
                    headers
                        .get("x-real-ip")
                        .and_then(|value| value.to_str().ok())
                })
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        })
        .flatten();

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}
