//! Correlation id generation for control-channel requests.
//!
//! Every request carries a correlation id, and the device helper echoes it in
//! the matching response.  Ids only need to be unique among the requests that
//! are pending on one session at the same time, so a per-session counter is
//! enough.
//!
//! Zero is reserved for notifications, which never expect a response, so the
//! generator skips it (including after wrap-around).

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing source of non-zero correlation ids.
///
/// # Examples
///
/// ```rust
/// use projection_core::protocol::CorrelationIdGenerator;
///
/// let ids = CorrelationIdGenerator::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    last: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Returns the next id, never zero.
    ///
    /// `Relaxed` is enough: ids only have to be distinct, they do not order
    /// any other memory.
    pub fn next(&self) -> u64 {
        loop {
            let id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
