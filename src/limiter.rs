//! Bounded byte sink used for body previews.
//!
//! A [`BodyLimiter`] keeps at most `limit` bytes of everything written to it and counts the
//! rest, so memory stays O(limit) however large the body gets.

use bytes::BytesMut;

use crate::types::CapturedBody;

/// Upper bound on the buffer allocated up front; larger limits grow on demand.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Accumulates a size-bounded prefix of a byte stream.
///
/// # Examples
///
/// ```rust
/// use accesslog::limiter::BodyLimiter;
///
/// let mut limiter = BodyLimiter::new(4);
/// limiter.write(b"hello");
/// limiter.write(b" world");
///
/// let captured = limiter.finish();
/// assert_eq!(&captured.bytes[..], b"hell");
/// assert_eq!(captured.total_bytes, 11);
/// assert!(captured.truncated());
/// ```
#[derive(Debug)]
pub struct BodyLimiter {
    limit: usize,
    retained: BytesMut,
    total: u64,
}

impl BodyLimiter {
    /// Create a limiter retaining at most `limit` bytes. A limit of zero only counts.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            retained: BytesMut::with_capacity(limit.min(INITIAL_CAPACITY)),
            total: 0,
        }
    }

    /// Feed a chunk. Bytes past the limit are counted and dropped.
    pub fn write(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let take = self.remaining().min(chunk.len());
        if take > 0 {
            self.retained.extend_from_slice(&chunk[..take]);
        }
    }

    /// How many more bytes would be retained.
    pub fn remaining(&self) -> usize {
        self.limit - self.retained.len()
    }

    /// Total bytes written so far, retained or not.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn finish(self) -> CapturedBody {
        CapturedBody::new(self.retained.freeze(), self.total)
    }
}
