//! Shared FIFO work queue between the crawler and the downloaders.
//!
//! The queue carries [`QueueItem`]s. Closing it places a single logical
//! [`QueueItem::Terminate`] at the tail: it is never removed, so every
//! consumer that drains the queue observes it exactly once and stops.
//! Decisions re-queued after the close are inserted ahead of the terminate
//! marker, which means a retry can never be stranded behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::decision::Decision;

/// A decision together with the delivery attempt it is on (starting at 1).
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedDecision {
    pub decision: Decision,
    pub attempt: u32,
}

impl QueuedDecision {
    pub fn first(decision: Decision) -> Self {
        Self {
            decision,
            attempt: 1,
        }
    }

    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Decision(QueuedDecision),
    Terminate,
}

/// What sits at the head of the queue, without consuming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueHead {
    Decision { ada: String, attempt: u32 },
    Terminate,
}

#[derive(Debug, thiserror::Error)]
#[error("queue already terminated, cannot accept decision {ada}")]
pub struct QueueClosed {
    pub ada: String,
}

#[derive(Default)]
struct State {
    items: VecDeque<QueuedDecision>,
    closed: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    capacity: Option<usize>,
    items_available: Notify,
    space_available: Notify,
    terminations: AtomicUsize,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl WorkQueue {
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// `capacity` bounds [`push`](Self::push) only; re-queues always succeed.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity: capacity.map(|c| c.max(1)),
            items_available: Notify::new(),
            space_available: Notify::new(),
            terminations: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer push; waits while the queue is at capacity.
    pub async fn push(&self, item: QueuedDecision) -> Result<(), QueueClosed> {
        loop {
            let space = self.space_available.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueClosed {
                        ada: item.decision.ada().to_string(),
                    });
                }
                let full = self
                    .capacity
                    .is_some_and(|capacity| state.items.len() >= capacity);
                if !full {
                    state.items.push_back(item);
                    drop(state);
                    self.items_available.notify_waiters();
                    return Ok(());
                }
            }
            space.await;
        }
    }

    /// Puts a decision back for another attempt, ahead of the terminate marker.
    pub fn requeue(&self, item: QueuedDecision) {
        self.lock().items.push_back(item);
        self.items_available.notify_waiters();
    }

    /// Emits the terminate signal. Returns `false` if it was already emitted.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.items_available.notify_waiters();
        self.space_available.notify_waiters();
        newly_closed
    }

    /// Waits for the next item. Once the queue is closed and drained this
    /// keeps yielding [`QueueItem::Terminate`] without consuming it.
    pub async fn pop(&self) -> QueueItem {
        loop {
            let available = self.items_available.notified();
            tokio::pin!(available);
            available.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space_available.notify_waiters();
                    return QueueItem::Decision(item);
                }
                if state.closed {
                    self.terminations.fetch_add(1, Ordering::SeqCst);
                    return QueueItem::Terminate;
                }
            }
            available.await;
        }
    }

    pub fn peek(&self) -> Option<QueueHead> {
        let state = self.lock();
        match state.items.front() {
            Some(item) => Some(QueueHead::Decision {
                ada: item.decision.ada().to_string(),
                attempt: item.attempt,
            }),
            None if state.closed => Some(QueueHead::Terminate),
            None => None,
        }
    }

    /// Pending decisions, not counting the terminate marker.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// How many times a consumer has observed the terminate signal.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}
