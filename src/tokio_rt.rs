//! Async utilities around the Tokio runtime.

use std::future::Future;

/// Block on the given future with a fresh current-thread Tokio runtime.
///
/// This is used only by the synchronous facades (e.g. single blocking
/// resolves used from tests); the engine itself is driven from a caller-owned
/// multi-thread runtime and never calls this.
pub fn sync<F: Future>(future: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
        .expect("failed to start Tokio runtime");

    rt.block_on(future)
}
