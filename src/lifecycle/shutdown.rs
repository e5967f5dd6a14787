//! Shutdown coordination and single-shot close signals.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Coordinator for graceful shutdown.
///
/// Latched: a task that subscribes after [`Shutdown::trigger`] still sees
/// the signal.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownReceiver {
        ShutdownReceiver(self.tx.subscribe())
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription handed out by [`Shutdown::subscribe`].
#[derive(Debug)]
pub struct ShutdownReceiver(watch::Receiver<bool>);

impl ShutdownReceiver {
    /// Resolve once shutdown has been triggered, or the coordinator is gone.
    pub async fn recv(&mut self) {
        let _ = self.0.wait_for(|triggered| *triggered).await;
    }
}

/// A one-way "closed" latch.
///
/// The first call to [`CloseSignal::trigger`] wins the compare-and-set and
/// publishes the closed state; every later call is a no-op that returns
/// `false`. Waiters blocked in [`CloseSignal::triggered`] are woken once, and
/// waiters arriving after the fact resolve immediately.
#[derive(Debug)]
pub struct CloseSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Fire the signal. Returns `true` only for the caller that fired it.
    pub fn trigger(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolve once the signal has fired.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn trigger_wins_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn concurrent_triggers_have_one_winner() {
        let signal = Arc::new(CloseSignal::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let signal = Arc::clone(&signal);
            handles.push(tokio::spawn(async move { signal.trigger() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn waiter_wakes_on_trigger() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.triggered().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn late_waiter_resolves_immediately() {
        let signal = CloseSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("already-fired signal should resolve");
    }

    #[tokio::test]
    async fn shutdown_reaches_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 1);
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("subscriber should see the trigger");
    }

    #[tokio::test]
    async fn late_subscriber_sees_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());

        let mut rx = shutdown.subscribe();
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("trigger before subscribe must not be lost");
    }
}
