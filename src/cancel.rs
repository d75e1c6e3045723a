//! Cancellation plumbing (spec §5, §4.10).
//!
//! Every long-running engine operation accepts a [`CancelToken`]. Workers
//! race it against their next await point with `tokio::select!` so
//! cancellation is observed promptly rather than only between chunks.

pub use tokio_util::sync::CancellationToken as CancelToken;

use crate::error::{Error, Result};

/// Return `Err(Error::Canceled)` if `token` has been triggered, otherwise
/// `Ok(())`. Call this at loop heads so a cancellation observed between
/// `select!` polls is not missed.
#[inline]
pub fn check(token: &CancelToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Canceled)
    } else {
        Ok(())
    }
}
