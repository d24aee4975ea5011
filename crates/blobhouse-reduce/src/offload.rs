//! Moves CPU-heavy codec work off the async executor.

use crate::error::ReduceError;
use tokio::task;

/// Inputs at or below this size are processed inline.
pub const OFFLOAD_THRESHOLD: usize = 64 * 1024;

/// Run `f` inline for small inputs, on the blocking pool otherwise.
pub(crate) async fn run_cpu_bound<F, T>(input_len: usize, f: F) -> Result<T, ReduceError>
where
    F: FnOnce() -> Result<T, ReduceError> + Send + 'static,
    T: Send + 'static,
{
    if input_len <= OFFLOAD_THRESHOLD {
        return f();
    }
    task::spawn_blocking(f)
        .await
        .map_err(|e| ReduceError::WorkerFailed(e.to_string()))?
}
