//! Bounded per-observer outbound queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use super::Event;

/// What an observer receives next.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<Event>),
    /// Stands in for `dropped` events lost to overflow at this point in the stream.
    Backpressure { dropped: u64 },
}

/// Result of offering an event to an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest message.
    Overflowed,
    /// The outbox is closed; the observer should be unregistered.
    Closed,
}

#[derive(Debug, Default)]
struct State {
    messages: VecDeque<Arc<Event>>,
    /// Evicted and not yet reported to the reader.
    unreported_drops: u64,
    /// Evicted since the reader last emptied the queue.
    drops_since_caught_up: usize,
    closed: bool,
}

/// Drop-oldest queue shared by the hub loop (writer) and one observer (reader).
///
/// Memory is bounded by `depth` events regardless of how slow the reader is.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<State>,
    notify: Notify,
    depth: usize,
    max_dropped: usize,
}

impl Outbox {
    #[must_use]
    pub fn new(depth: usize, max_dropped: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            depth: depth.max(1),
            max_dropped,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer an event. Never blocks.
    pub fn push(&self, event: Arc<Event>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if state.messages.len() >= self.depth {
                state.messages.pop_front();
                state.unreported_drops += 1;
                state.drops_since_caught_up += 1;
                outcome = PushOutcome::Overflowed;

                if state.drops_since_caught_up > self.max_dropped {
                    state.closed = true;
                    state.messages.clear();
                    outcome = PushOutcome::Closed;
                }
            }
            if outcome != PushOutcome::Closed {
                state.messages.push_back(event);
            }
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Close the outbox; pending and future reads return `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the next message without waiting.
    pub fn try_recv(&self) -> Option<Outbound> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        if state.unreported_drops > 0 {
            let dropped = std::mem::take(&mut state.unreported_drops);
            return Some(Outbound::Backpressure { dropped });
        }
        let event = state.messages.pop_front()?;
        if state.messages.is_empty() {
            state.drops_since_caught_up = 0;
        }
        Some(Outbound::Event(event))
    }

    /// Wait for the next message. Returns `None` once closed.
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Topic;

    fn event(n: i64) -> Arc<Event> {
        Arc::new(Event::new(Topic::Job, "job:test", serde_json::json!({ "n": n })))
    }

    fn payload_n(message: Option<Outbound>) -> i64 {
        match message {
            Some(Outbound::Event(e)) => e.payload["n"].as_i64().unwrap(),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let outbox = Outbox::new(4, 10);
        for n in 0..3 {
            assert_eq!(outbox.push(event(n)), PushOutcome::Queued);
        }
        assert_eq!(payload_n(outbox.try_recv()), 0);
        assert_eq!(payload_n(outbox.try_recv()), 1);
        assert_eq!(payload_n(outbox.try_recv()), 2);
        assert!(outbox.try_recv().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports_marker() {
        let outbox = Outbox::new(2, 10);
        outbox.push(event(0));
        outbox.push(event(1));
        assert_eq!(outbox.push(event(2)), PushOutcome::Overflowed);
        assert_eq!(outbox.len(), 2);

        match outbox.try_recv() {
            Some(Outbound::Backpressure { dropped }) => assert_eq!(dropped, 1),
            other => panic!("expected backpressure marker, got {other:?}"),
        }
        assert_eq!(payload_n(outbox.try_recv()), 1);
        assert_eq!(payload_n(outbox.try_recv()), 2);
    }

    #[test]
    fn test_repeated_overflow_closes() {
        let outbox = Outbox::new(1, 2);
        outbox.push(event(0));
        assert_eq!(outbox.push(event(1)), PushOutcome::Overflowed);
        assert_eq!(outbox.push(event(2)), PushOutcome::Overflowed);
        assert_eq!(outbox.push(event(3)), PushOutcome::Closed);
        assert!(outbox.is_closed());
        assert!(outbox.try_recv().is_none());
        assert_eq!(outbox.push(event(4)), PushOutcome::Closed);
    }

    #[test]
    fn test_catching_up_resets_drop_budget() {
        let outbox = Outbox::new(1, 1);
        outbox.push(event(0));
        assert_eq!(outbox.push(event(1)), PushOutcome::Overflowed);
        // Drain: marker then the surviving event
        assert!(matches!(outbox.try_recv(), Some(Outbound::Backpressure { .. })));
        assert_eq!(payload_n(outbox.try_recv()), 1);

        outbox.push(event(2));
        assert_eq!(outbox.push(event(3)), PushOutcome::Overflowed);
        assert!(!outbox.is_closed());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let outbox = Arc::new(Outbox::new(4, 4));
        let reader = Arc::clone(&outbox);
        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;
        outbox.push(event(7));
        let received = handle.await.unwrap();
        assert_eq!(payload_n(received), 7);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let outbox = Outbox::new(4, 4);
        outbox.close();
        assert!(outbox.recv().await.is_none());
    }
}
