//! Per-input send queue of an output channel.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::wire::Outgoing;

#[derive(Default)]
struct State {
    items: VecDeque<Outgoing>,
    ready: bool,
    closed: bool,
    dropping: bool,
}

/// Result of offering a chunk without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    /// Accepted after discarding the oldest queued chunk.
    Evicted,
    Dropped,
    /// Would need to wait; nothing was queued.
    Busy,
    Closed,
}

/// Queue between writers and the connection task serving one input.
///
/// `ready` is true while the input holds a credit and nothing is queued,
/// i.e. while the connection task waits for data.
pub(crate) struct PeerQueue {
    state: Mutex<State>,
    data: Notify,
    space: Arc<Notify>,
}

impl PeerQueue {
    pub fn new(space: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            data: Notify::new(),
            space,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        let mut state = self.state.lock();
        state.ready = ready && state.items.is_empty();
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.ready && state.items.is_empty() && !state.closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.data.notify_one();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Queue a control message; never dropped.
    pub fn push_control(&self, message: Outgoing) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.items.push_back(message);
        state.ready = false;
        drop(state);
        self.data.notify_one();
    }

    /// Queue data if the input is waiting for it.
    pub fn offer_if_ready(&self, message: &Outgoing) -> Offer {
        let mut state = self.state.lock();
        if state.closed {
            return Offer::Closed;
        }
        if state.ready && state.items.is_empty() {
            state.items.push_back(message.clone());
            state.ready = false;
            state.dropping = false;
            drop(state);
            self.data.notify_one();
            Offer::Queued
        } else {
            Offer::Dropped
        }
    }

    /// Queue data if fewer than `capacity` messages are queued.
    pub fn offer_bounded(&self, message: &Outgoing, capacity: usize) -> Offer {
        let mut state = self.state.lock();
        if state.closed {
            return Offer::Closed;
        }
        if state.items.len() < capacity.max(1) {
            state.items.push_back(message.clone());
            state.ready = false;
            drop(state);
            self.data.notify_one();
            Offer::Queued
        } else {
            Offer::Busy
        }
    }

    /// Queue data, discarding the oldest queued data beyond `capacity`.
    pub fn offer_evicting(&self, message: &Outgoing, capacity: usize) -> Offer {
        let mut state = self.state.lock();
        if state.closed {
            return Offer::Closed;
        }
        state.items.push_back(message.clone());
        state.ready = false;
        let mut evicted = false;
        while state.items.iter().filter(|m| m.is_data()).count() > capacity.max(1) {
            match state.items.iter().position(Outgoing::is_data) {
                Some(pos) => {
                    state.items.remove(pos);
                    evicted = true;
                }
                None => break,
            }
        }
        drop(state);
        self.data.notify_one();
        if evicted {
            Offer::Evicted
        } else {
            Offer::Queued
        }
    }

    /// Remember whether data is currently being discarded; returns true on
    /// the transition into discarding.
    pub fn mark_dropping(&self, dropping: bool) -> bool {
        let mut state = self.state.lock();
        let started = dropping && !state.dropping;
        state.dropping = dropping;
        started
    }

    /// Wait for `offer_bounded` to succeed or the queue to close.
    pub async fn push_waiting(&self, message: &Outgoing, capacity: usize) -> Offer {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.offer_bounded(message, capacity) {
                Offer::Busy => notified.await,
                other => return other,
            }
        }
    }

    /// Next message for the connection task; `None` once closed and drained.
    ///
    /// Cancel safe: a message is only taken when the future completes.
    pub async fn next(&self) -> Option<Outgoing> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.items.pop_front() {
                    drop(state);
                    self.space.notify_waiters();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.data.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn data(n: u32) -> Outgoing {
        Outgoing::Data {
            items: Vec::new(),
            schema_version: n,
        }
    }

    fn version(m: &Outgoing) -> u32 {
        match m {
            Outgoing::Data { schema_version, .. } => *schema_version,
            _ => u32::MAX,
        }
    }

    #[tokio::test]
    async fn drop_only_when_ready() {
        let q = PeerQueue::new(Arc::new(Notify::new()));
        assert_eq!(q.offer_if_ready(&data(1)), Offer::Dropped);
        q.set_ready(true);
        assert_eq!(q.offer_if_ready(&data(2)), Offer::Queued);
        assert_eq!(q.offer_if_ready(&data(3)), Offer::Dropped);
        assert_eq!(version(&q.next().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn eviction_keeps_control_messages() {
        let q = PeerQueue::new(Arc::new(Notify::new()));
        q.offer_evicting(&data(1), 2);
        q.push_control(Outgoing::EndOfStream);
        q.offer_evicting(&data(2), 2);
        assert_eq!(q.offer_evicting(&data(3), 2), Offer::Evicted);
        assert!(matches!(q.next().await.unwrap(), Outgoing::EndOfStream));
        assert_eq!(version(&q.next().await.unwrap()), 2);
        assert_eq!(version(&q.next().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn waiting_writer_resumes_after_take() {
        let q = Arc::new(PeerQueue::new(Arc::new(Notify::new())));
        assert_eq!(q.push_waiting(&data(1), 1).await, Offer::Queued);
        let q2 = q.clone();
        let writer = tokio::spawn(async move { q2.push_waiting(&data(2), 1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(version(&q.next().await.unwrap()), 1);
        assert_eq!(writer.await.unwrap(), Offer::Queued);
        q.close();
        assert_eq!(version(&q.next().await.unwrap()), 2);
        assert!(q.next().await.is_none());
    }
}
