//! Shared FIFO of regions with drain tracking and typed shutdown.
//!
//! Invariant: `put == acked + inflight + remaining`. The queue counts as
//! drained only when nothing remains and every dequeued item was acked.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// What a consumer gets back from [`WorkQueue::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// Shutdown marker; the consumer stops and does not ack.
    Stop,
}

#[derive(Debug, thiserror::Error)]
#[error("no dequeued item to ack or requeue")]
pub struct AckWithoutItem;

#[derive(Debug)]
struct State<T> {
    entries: VecDeque<Dequeued<T>>,
    /// Items (not stop markers) waiting in `entries`.
    remaining: usize,
    inflight: usize,
    acked: usize,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    available: Notify,
    drained: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                remaining: 0,
                inflight: 0,
                acked: 0,
            }),
            available: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub async fn put(&self, item: T) {
        let mut state = self.state.lock().await;
        state.entries.push_back(Dequeued::Item(item));
        state.remaining += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Enqueue one stop marker behind everything already queued.
    pub async fn stop(&self) {
        self.state.lock().await.entries.push_back(Dequeued::Stop);
        self.available.notify_one();
    }

    /// Wait for the next entry.
    ///
    /// A returned [`Dequeued::Item`] is inflight until [`ack`](Self::ack).
    pub async fn get(&self) -> Dequeued<T> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.pop_front() {
                    if matches!(entry, Dequeued::Item(_)) {
                        state.remaining -= 1;
                        state.inflight += 1;
                    }
                    let more = !state.entries.is_empty();
                    drop(state);
                    // Pass the wakeup on if another consumer can proceed.
                    if more {
                        self.available.notify_one();
                    }
                    return entry;
                }
            }
            notified.await;
        }
    }

    /// Mark one dequeued item as fully processed.
    pub async fn ack(&self) -> Result<(), AckWithoutItem> {
        let mut state = self.state.lock().await;
        if state.inflight == 0 {
            return Err(AckWithoutItem);
        }
        state.inflight -= 1;
        state.acked += 1;
        if state.inflight == 0 && state.remaining == 0 {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    /// Hand a dequeued item back unprocessed, ahead of everything queued.
    ///
    /// Used when the consumer holding it goes away; the item stays counted
    /// as undrained.
    pub async fn requeue(&self, item: T) -> Result<(), AckWithoutItem> {
        let mut state = self.state.lock().await;
        if state.inflight == 0 {
            return Err(AckWithoutItem);
        }
        state.inflight -= 1;
        state.remaining += 1;
        state.entries.push_front(Dequeued::Item(item));
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Wait until every item put so far has been dequeued and acked.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let state = self.state.lock().await;
                if state.remaining == 0 && state.inflight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Items waiting to be dequeued.
    pub async fn len(&self) -> usize {
        self.state.lock().await.remaining
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Items dequeued but not yet acked.
    pub async fn inflight(&self) -> usize {
        self.state.lock().await.inflight
    }

    pub async fn acked(&self) -> usize {
        self.state.lock().await.acked
    }
}
