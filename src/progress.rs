//! Progress reporting and cooperative cancellation.
//!
//! The engine never owns a progress surface; callers inject a [`Progress`]
//! sink and may hand the same [`CancelToken`] to several operations. Both
//! are checked at block granularity, so cancellation latency is bounded by
//! one block of I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PatchError, Result};

/// Sink for byte-level progress reports.
///
/// `begin` is called once per operation with the total byte count when it
/// is known; `advance` reports bytes processed since the last call.
pub trait Progress {
    /// An operation over `total` bytes is starting.
    fn begin(&self, total: u64) {
        let _ = total;
    }

    /// `bytes` more bytes have been processed.
    fn advance(&self, bytes: u64) {
        let _ = bytes;
    }
}

/// A progress sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {}

/// Cooperative cancellation flag, cheap to clone and share.
///
/// # Example
///
/// ```rust
/// use blockpatch::CancelToken;
///
/// let token = CancelToken::new();
/// assert!(token.check().is_ok());
/// token.cancel();
/// assert!(token.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. All holders observe the cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Fail with [`PatchError::Cancelled`] if the token has been tripped.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Cancelled`] after [`cancel`](Self::cancel).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes() {
        assert!(CancelToken::new().check().is_ok());
    }

    #[test]
    fn cancelled_token_fails() {
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(token.check(), Err(PatchError::Cancelled)));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
