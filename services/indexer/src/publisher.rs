//! Per-session progress pub/sub.
//!
//! Subscribers see events from the moment of subscription; nothing is
//! backfilled. Each subscriber has a bounded queue: on overflow the oldest
//! non-terminal event is dropped. Terminal events are never dropped and are
//! always the last event a subscriber receives.

use crate::metrics::Metrics;
use indexer_common::ProgressEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct QueueInner {
    deque: VecDeque<ProgressEvent>,
    finished: bool,
    dropped: u64,
}

struct SubscriberQueue {
    id: u64,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SubscriberQueue {
    fn push(&self, event: ProgressEvent) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        if inner.deque.len() >= self.capacity {
            if let Some(pos) = inner.deque.iter().position(|e| !e.is_terminal()) {
                inner.deque.remove(pos);
                inner.dropped += 1;
            } else {
                return;
            }
        }
        if event.is_terminal() {
            inner.finished = true;
        }
        inner.deque.push_back(event);
        drop(inner);
        self.notify.notify_waiters();
    }
}

/// Publish/subscribe broker keyed by session id.
pub struct ProgressPublisher {
    capacity: usize,
    next_subscriber_id: AtomicU64,
    sessions: Mutex<HashMap<String, Vec<Arc<SubscriberQueue>>>>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_subscriber_id: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber for a session's events.
    pub fn subscribe(self: &Arc<Self>, session_id: &str) -> ProgressStream {
        let queue = Arc::new(SubscriberQueue {
            id: self.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
            capacity: self.capacity,
            inner: Mutex::new(QueueInner {
                deque: VecDeque::new(),
                finished: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        });

        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(queue.clone());

        ProgressStream {
            session_id: session_id.to_string(),
            queue,
            publisher: self.clone(),
        }
    }

    /// Deliver an event to every active subscriber of its session. After a
    /// terminal event the session entry is retired; late events are lost by
    /// design.
    pub fn publish(&self, event: ProgressEvent) {
        Metrics::progress_event();
        let mut sessions = self.sessions.lock();
        let session_id = event.session_id().to_string();
        let Some(subscribers) = sessions.get(&session_id) else {
            return;
        };

        for subscriber in subscribers {
            subscriber.push(event.clone());
        }

        if event.is_terminal() {
            debug!("retiring progress channel for session {}", session_id);
            sessions.remove(&session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let mut sessions = self.sessions.lock();
        if let Some(subscribers) = sessions.get_mut(session_id) {
            subscribers.retain(|s| s.id != subscriber_id);
            if subscribers.is_empty() {
                sessions.remove(session_id);
            }
        }
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of a session's event stream.
pub struct ProgressStream {
    session_id: String,
    queue: Arc<SubscriberQueue>,
    publisher: Arc<ProgressPublisher>,
}

impl ProgressStream {
    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut inner = self.queue.inner.lock();
                if let Some(event) = inner.deque.pop_front() {
                    return Some(event);
                }
                if inner.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Events discarded from this subscriber's queue so far.
    pub fn dropped(&self) -> u64 {
        self.queue.inner.lock().dropped
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        self.publisher.unsubscribe(&self.session_id, self.queue.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indexer_common::{ErrorPayload, SessionMetrics};

    fn progress(session: &str, value: u8) -> ProgressEvent {
        ProgressEvent::Progress {
            session_id: session.to_string(),
            progress: value,
            metrics: SessionMetrics::default(),
            ts: Utc::now(),
        }
    }

    fn completed(session: &str) -> ProgressEvent {
        ProgressEvent::SessionCompleted {
            session_id: session.to_string(),
            metrics: SessionMetrics::default(),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let publisher = Arc::new(ProgressPublisher::new());
        let mut stream = publisher.subscribe("s1");

        publisher.publish(progress("s1", 10));
        publisher.publish(progress("s1", 20));
        publisher.publish(completed("s1"));

        for expected in [10u8, 20] {
            match stream.recv().await {
                Some(ProgressEvent::Progress { progress, .. }) => assert_eq!(progress, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(stream.recv().await.unwrap().is_terminal());
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_no_backfill() {
        let publisher = Arc::new(ProgressPublisher::new());
        publisher.publish(progress("s1", 10));

        let mut stream = publisher.subscribe("s1");
        publisher.publish(progress("s1", 50));
        match stream.recv().await {
            Some(ProgressEvent::Progress { progress, .. }) => assert_eq!(progress, 50),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_non_terminal() {
        let publisher = Arc::new(ProgressPublisher::with_capacity(2));
        let mut stream = publisher.subscribe("s1");

        publisher.publish(progress("s1", 1));
        publisher.publish(progress("s1", 2));
        publisher.publish(completed("s1"));

        // Capacity 2: the terminal push evicted progress=1.
        match stream.recv().await {
            Some(ProgressEvent::Progress { progress, .. }) => assert_eq!(progress, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(stream.recv().await.unwrap().is_terminal());
        assert_eq!(stream.recv().await, None);
        assert_eq!(stream.dropped(), 1);
    }

    #[tokio::test]
    async fn test_terminal_is_last() {
        let publisher = Arc::new(ProgressPublisher::new());
        let mut stream = publisher.subscribe("s1");

        publisher.publish(completed("s1"));
        // Events after terminal are dropped for subscribers and the session
        // entry is retired.
        publisher.publish(progress("s1", 99));

        assert!(stream.recv().await.unwrap().is_terminal());
        assert_eq!(stream.recv().await, None);
        assert_eq!(publisher.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let publisher = Arc::new(ProgressPublisher::new());
        let mut s1 = publisher.subscribe("s1");
        let _s2 = publisher.subscribe("s2");

        publisher.publish(progress("s2", 30));
        publisher.publish(progress("s1", 70));

        match s1.recv().await {
            Some(ProgressEvent::Progress { progress, .. }) => assert_eq!(progress, 70),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let publisher = Arc::new(ProgressPublisher::new());
        let stream = publisher.subscribe("s1");
        assert_eq!(publisher.subscriber_count("s1"), 1);
        drop(stream);
        assert_eq!(publisher.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_failed_event_carries_error() {
        let publisher = Arc::new(ProgressPublisher::new());
        let mut stream = publisher.subscribe("s1");
        publisher.publish(ProgressEvent::SessionFailed {
            session_id: "s1".into(),
            error: ErrorPayload {
                code: "timeout".into(),
                message: "hard deadline exceeded".into(),
                retryable: true,
            },
            ts: Utc::now(),
        });
        match stream.recv().await {
            Some(ProgressEvent::SessionFailed { error, .. }) => {
                assert_eq!(error.code, "timeout");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
