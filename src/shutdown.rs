//! Graceful drain of in-flight sessions.
//!
//! Closing happens in two steps. `request_close` stops the accept loop and
//! refuses new WebSocket requests. In-flight sessions then run to completion
//! and `wait_drained` resolves once the last one has ended.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    close: CancellationToken,
    close_requested: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session. Dropping the guard marks its end.
    pub fn mark_start(self: &Arc<Self>) -> SessionGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            coordinator: Arc::clone(self),
        }
    }

    fn mark_end(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Returns true only for the first request.
    pub fn request_close(&self) -> bool {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            debug!("Close already requested");
            return false;
        }
        self.close.cancel();
        info!(
            in_flight = self.in_flight(),
            "Received exit request, waiting for all clients to close sessions"
        );
        true
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once `request_close` has been called.
    pub async fn closed(self: Arc<Self>) {
        self.close.cancelled().await;
    }

    /// Resolves once no session is in flight.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held for the lifetime of one session.
#[derive(Debug)]
pub struct SessionGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.coordinator.mark_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_close_first_call_only() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_closing());
        assert!(coordinator.request_close());
        assert!(coordinator.is_closing());
        assert!(!coordinator.request_close());
    }

    #[test]
    fn test_guard_tracks_in_flight() {
        let coordinator = ShutdownCoordinator::new();
        let a = coordinator.mark_start();
        let b = coordinator.mark_start();
        assert_eq!(coordinator.in_flight(), 2);
        drop(a);
        assert_eq!(coordinator.in_flight(), 1);
        drop(b);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_returns_when_idle() {
        let coordinator = ShutdownCoordinator::new();
        tokio::time::timeout(Duration::from_secs(1), coordinator.wait_drained())
            .await
            .expect("no sessions, should not block");
    }

    #[tokio::test]
    async fn test_wait_drained_waits_for_last_session() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.mark_start();
        coordinator.request_close();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.wait_drained().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_resolves_after_request() {
        let coordinator = ShutdownCoordinator::new();
        let closed = tokio::spawn(Arc::clone(&coordinator).closed());
        coordinator.request_close();
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .expect("closed future should resolve")
            .unwrap();
    }
}
