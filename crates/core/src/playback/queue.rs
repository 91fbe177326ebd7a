use super::PlaybackItem;
use crate::lock;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use tokio::sync::watch;

struct QueueState {
    items: VecDeque<(u64, PlaybackItem)>,
    last_seq: u64,
    consumer_alive: bool,
}

/// FIFO work queue with a processed-through watermark.
///
/// Every push gets the next sequence number. The watermark only grows; it is
/// raised when an item finishes, when queued items are discarded and when
/// the consumer dies, so a drain wait on a snapshot of `last_seq` always ends.
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    processed: watch::Sender<u64>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                last_seq: 0,
                consumer_alive: false,
            }),
            available: Condvar::new(),
            processed: watch::channel(0).0,
        }
    }

    /// Appends an item. Returns true when the caller must start a consumer.
    pub fn push(&self, item: PlaybackItem) -> bool {
        let mut state = lock(&self.state);
        state.last_seq += 1;
        let seq = state.last_seq;
        state.items.push_back((seq, item));
        let start = !state.consumer_alive;
        state.consumer_alive = true;
        self.available.notify_one();
        start
    }

    pub fn pop(&self) -> (u64, PlaybackItem) {
        let mut state = lock(&self.state);
        loop {
            if let Some(entry) = state.items.pop_front() {
                return entry;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn complete(&self, seq: u64) {
        self.processed.send_modify(|done| *done = (*done).max(seq));
    }

    /// Drops every queued item unexecuted. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        let (count, last) = {
            let mut state = lock(&self.state);
            let last = state.items.back().map(|(seq, _)| *seq);
            let count = state.items.len();
            state.items.clear();
            (count, last)
        };
        if let Some(last) = last {
            self.complete(last);
        }
        count
    }

    /// Marks the consumer gone if nothing is queued; false means keep running.
    pub fn retire_if_idle(&self) -> bool {
        let mut state = lock(&self.state);
        if state.items.is_empty() {
            state.consumer_alive = false;
            true
        } else {
            false
        }
    }

    /// The consumer died: drop everything and release every waiter.
    pub fn fail(&self) {
        let last = {
            let mut state = lock(&self.state);
            state.items.clear();
            state.consumer_alive = false;
            state.last_seq
        };
        self.complete(last);
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumer_alive(&self) -> bool {
        lock(&self.state).consumer_alive
    }

    pub fn last_seq(&self) -> u64 {
        lock(&self.state).last_seq
    }

    pub fn processed_through(&self) -> u64 {
        *self.processed.borrow()
    }

    pub async fn wait_through(&self, target: u64) {
        let mut rx = self.processed.subscribe();
        // The sender lives as long as the queue, so this only ends by reaching the target.
        let _ = rx.wait_for(|done| *done >= target).await;
    }
}
