use crate::tracker::{ConnectionTracker, DrainOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome delivered to a graceful-shutdown callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracefulShutdownResult {
    /// Graceful shutdown was not configured; there was nothing to drain.
    Immediate,
    /// Every active connection finished within the grace period.
    Graceful,
    /// The grace period elapsed with connections still active.
    TimedOut,
    /// A hard stop overrode the drain.
    Aborted,
}

/// Callback fired exactly once when a graceful shutdown concludes.
pub type ShutdownCallback = Box<dyn FnOnce(GracefulShutdownResult) + Send>;

/// Coordinates a graceful shutdown: stops admission, then waits for active
/// connections to drain on a background task so the caller never blocks.
pub struct GracefulShutdown {
    tracker: Arc<ConnectionTracker>,
    grace_period: Option<Duration>,
}

impl GracefulShutdown {
    pub fn new(tracker: Arc<ConnectionTracker>, grace_period: Option<Duration>) -> Self {
        GracefulShutdown {
            tracker,
            grace_period,
        }
    }

    /// Flip the tracker to refusing, then drain asynchronously. The callback
    /// fires exactly once with the drain outcome, never before refusal has
    /// taken effect.
    pub fn shut_down_gracefully(&self, callback: ShutdownCallback) {
        self.tracker.begin_refusing();
        info!(
            active = self.tracker.active(),
            grace_period = ?self.grace_period,
            "commencing graceful shutdown"
        );
        let tracker = Arc::clone(&self.tracker);
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            let result = match tracker.await_drain(grace_period).await {
                DrainOutcome::Drained => {
                    info!("graceful shutdown complete");
                    GracefulShutdownResult::Graceful
                }
                DrainOutcome::TimedOut => {
                    warn!(
                        still_active = tracker.active(),
                        "grace period elapsed with connections still active"
                    );
                    GracefulShutdownResult::TimedOut
                }
                DrainOutcome::Aborted => {
                    debug!("graceful shutdown aborted");
                    GracefulShutdownResult::Aborted
                }
            };
            callback(result);
        });
    }

    /// Cancel an in-progress drain. The pending callback fires with
    /// [`GracefulShutdownResult::Aborted`].
    pub fn abort(&self) {
        self.tracker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn callback_channel() -> (ShutdownCallback, oneshot::Receiver<GracefulShutdownResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn drains_and_reports_graceful() {
        let tracker = Arc::new(ConnectionTracker::new());
        let id = tracker.connection_opened(None).unwrap();
        let graceful = GracefulShutdown::new(Arc::clone(&tracker), Some(Duration::from_secs(5)));

        let (callback, rx) = callback_channel();
        graceful.shut_down_gracefully(callback);
        assert!(!tracker.is_accepting());

        tracker.connection_closed(id);
        assert_eq!(rx.await.unwrap(), GracefulShutdownResult::Graceful);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_timeout_when_connections_never_close() {
        let tracker = Arc::new(ConnectionTracker::new());
        let _held = tracker.connection_opened(None).unwrap();
        let graceful = GracefulShutdown::new(Arc::clone(&tracker), Some(Duration::from_secs(1)));

        let (callback, rx) = callback_channel();
        graceful.shut_down_gracefully(callback);
        assert_eq!(rx.await.unwrap(), GracefulShutdownResult::TimedOut);
    }

    #[tokio::test]
    async fn abort_collapses_pending_drain() {
        let tracker = Arc::new(ConnectionTracker::new());
        let _held = tracker.connection_opened(None).unwrap();
        let graceful = GracefulShutdown::new(Arc::clone(&tracker), None);

        let (callback, rx) = callback_channel();
        graceful.shut_down_gracefully(callback);
        graceful.abort();
        assert_eq!(rx.await.unwrap(), GracefulShutdownResult::Aborted);
    }
}
