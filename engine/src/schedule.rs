//! One-shot deferred actions on the framework executor.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;

/// Handle to a scheduled action. Dropping the handle does not cancel it.
pub struct Schedule {
    cancel: Option<oneshot::Sender<()>>,
}

impl Schedule {
    /// Prevents the action from running if it has not yet started. Once the
    /// action has begun it always runs to completion; cancelling after that
    /// point has no effect.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

/// Runs `action` exactly once after `delay`, measured on the monotonic
/// timer. There is no ordering guarantee between actions sharing a deadline.
pub fn schedule<F>(delay: Duration, action: F) -> Schedule
where
    F: Future<Output = ()> + Send + 'static,
{
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        // The cancel signal is only observed while waiting; once the sleep
        // branch wins, the action is committed.
        tokio::select! {
            _ = tokio::time::sleep(delay) => action.await,
            _ = cancel_rx => {}
        }
    });
    Schedule {
        cancel: Some(cancel_tx),
    }
}
