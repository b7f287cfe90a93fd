//! Deadline-bounded execution of blocking operations.
//!
//! The operation runs on Tokio's blocking pool while the caller waits on a
//! timer. When the timer wins, the caller gets [`TransportError::TransportTimeout`]
//! and the worker is abandoned: its cancellation token is triggered, but a
//! syscall that is already blocked keeps running until the OS returns it,
//! usually when the remote end or the owning process goes away. Callers
//! should treat repeated timeouts on one session as fatal and close it,
//! which tears the process down and unblocks the worker.
//!
//! A worker still blocked when the runtime shuts down delays shutdown until
//! its syscall returns.

use log::debug;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Runs `op` on a blocking thread and returns its result if it completes
/// within `timeout`.
///
/// `op` receives a token that is cancelled once the deadline has passed.
/// Operations should check it before starting blocking work and may use it
/// to decide what to do with results that arrive too late; whatever they
/// return after cancellation is discarded.
///
/// A zero `timeout` reports a timeout without waiting for `op`.
pub async fn run_with_timeout<T, F>(timeout: Duration, op: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, TransportError> + Send + 'static,
{
    if timeout.is_zero() {
        return Err(TransportError::TransportTimeout);
    }

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = tokio::task::spawn_blocking(move || {
        if worker_cancel.is_cancelled() {
            return Err(TransportError::TransportTimeout);
        }
        op(&worker_cancel)
    });

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            debug!("transport worker did not complete: {join_err}");
            Err(TransportError::TransportFailure)
        }
        Err(_) => {
            cancel.cancel();
            Err(TransportError::TransportTimeout)
        }
    }
}
