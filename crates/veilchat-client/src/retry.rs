//! Per-peer cancellable retry timers.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::exchange::ExchangeEvent;

/// One delayed task per peer. When the delay elapses the task posts
/// `ExchangeEvent::RetryDue` back to the owning actor; it never touches
/// exchange state itself.
pub struct RetryScheduler {
    delay: Duration,
    events: mpsc::UnboundedSender<ExchangeEvent>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl RetryScheduler {
    pub fn new(delay: Duration, events: mpsc::UnboundedSender<ExchangeEvent>) -> Self {
        Self {
            delay,
            events,
            timers: HashMap::new(),
        }
    }

    /// Schedule a retry for `peer`, replacing any timer already running.
    pub fn schedule(&mut self, peer: &str, generation: u64) {
        self.cancel(peer);

        let events = self.events.clone();
        let delay = self.delay;
        let name = peer.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ExchangeEvent::RetryDue {
                peer: name,
                generation,
            });
        });
        debug!(peer = %peer, ?delay, "retry scheduled");
        self.timers.insert(peer.to_string(), handle);
    }

    pub fn cancel(&mut self, peer: &str) -> bool {
        match self.timers.remove(peer) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, peer: &str) -> bool {
        self.timers
            .get(peer)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Forget a timer that has already fired.
    pub(crate) fn fired(&mut self, peer: &str) {
        self.timers.remove(peer);
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    fn scheduler() -> (RetryScheduler, mpsc::UnboundedReceiver<ExchangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RetryScheduler::new(Duration::from_secs(1), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (mut retries, mut rx) = scheduler();
        let start = Instant::now();
        retries.schedule("bob", 7);
        assert!(retries.is_scheduled("bob"));

        match rx.recv().await.unwrap() {
            ExchangeEvent::RetryDue { peer, generation } => {
                assert_eq!(peer, "bob");
                assert_eq!(generation, 7);
            }
            _ => panic!("expected RetryDue"),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut retries, mut rx) = scheduler();
        retries.schedule("bob", 1);
        assert!(retries.cancel("bob"));
        assert!(!retries.is_scheduled("bob"));

        let waited = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(waited.is_err(), "cancelled retry fired");
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_previous_timer() {
        let (mut retries, mut rx) = scheduler();
        retries.schedule("bob", 1);
        tokio::time::advance(Duration::from_millis(600)).await;
        retries.schedule("bob", 2);

        match rx.recv().await.unwrap() {
            ExchangeEvent::RetryDue { generation, .. } => assert_eq!(generation, 2),
            _ => panic!("expected RetryDue"),
        }
        let extra = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timers_are_independent_per_peer() {
        let (mut retries, mut rx) = scheduler();
        retries.schedule("bob", 1);
        retries.schedule("carol", 2);
        retries.cancel("bob");

        match rx.recv().await.unwrap() {
            ExchangeEvent::RetryDue { peer, .. } => assert_eq!(peer, "carol"),
            _ => panic!("expected RetryDue"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_everything() {
        let (mut retries, mut rx) = scheduler();
        retries.schedule("bob", 1);
        retries.schedule("carol", 2);
        retries.cancel_all();
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.is_err());
    }
}
