//! Composite sink for fanning records out to several sinks.
//!
//! This module provides [`MultiSink`], which composes an arbitrary number of
//! [`AccessLogSink`] implementations. Every record is delivered to all of them concurrently.
//!
//! # Example
//!
//! ```rust
//! use accesslog::{LoggingSink, MultiSink};
//!
//! let sink = MultiSink::new()
//!     .with(LoggingSink);
//!
//! // let layer = AccessLogLayer::new(config, sink);
//! ```

use crate::{AccessLogRecord, AccessLogSink};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Dyn-compatible view of [`AccessLogSink`], so sinks of different types can share a `Vec`.
trait DynSink: Send + Sync + 'static {
    fn record_boxed(&self, record: AccessLogRecord) -> BoxFuture<'_>;
}

struct SinkWrapper<S: AccessLogSink> {
    inner: S,
}

impl<S: AccessLogSink> DynSink for SinkWrapper<S> {
    fn record_boxed(&self, record: AccessLogRecord) -> BoxFuture<'_> {
        Box::pin(self.inner.record(record))
    }
}

/// A sink that delegates to multiple inner sinks.
///
/// `MultiSink` is `Send + Sync`; each inner sink is wrapped in an `Arc`.
pub struct MultiSink {
    sinks: Vec<Arc<dyn DynSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink. Returns self for builder pattern.
    pub fn with<S: AccessLogSink>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(SinkWrapper { inner: sink }));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for MultiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessLogSink for MultiSink {
    async fn record(&self, record: AccessLogRecord) {
        let futures: Vec<_> = self
            .sinks
            .iter()
            .map(|sink| {
                let record = record.clone();
                let sink = Arc::clone(sink);
                async move { sink.record_boxed(record).await }
            })
            .collect();
        futures::future::join_all(futures).await;
    }
}
