//! Unbounded FIFO queues connecting stages.
//!
//! Each queue carries [`Message::Item`]s followed by exactly one
//! [`Message::Stop`]. A consumer that sees `Stop` hands it on to the next
//! sibling still consuming; the last one out drops it, so the queue ends
//! empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A queue value: a unit of work, or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    Item(T),
    Stop,
}

impl<T> Message<T> {
    pub fn is_stop(&self) -> bool {
        matches!(self, Message::Stop)
    }
}

/// Multi-producer multi-consumer queue with an async bounded-wait receive.
pub struct StageQueue<T> {
    name: String,
    items: Mutex<VecDeque<Message<T>>>,
    notify: Notify,
    enqueued: AtomicU64,
}

impl<T> StageQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, item: T) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.push(Message::Item(item));
    }

    /// Signal end-of-stream. Call once per queue.
    pub fn stop(&self) {
        self.push(Message::Stop);
    }

    pub fn push(&self, msg: Message<T>) {
        self.items.lock().push_back(msg);
        self.notify.notify_one();
    }

    pub fn try_get(&self) -> Option<Message<T>> {
        self.items.lock().pop_front()
    }

    /// Wait up to `wait` for the next message. `None` means the wait elapsed.
    pub async fn get_timeout(&self, wait: Duration) -> Option<Message<T>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_get() {
                return Some(msg);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_get();
            }
        }
    }

    /// Hand a consumed stop marker on. `leave` detaches the caller and
    /// returns how many consumers remain; the marker is re-queued only if
    /// that is nonzero. Runs under the queue lock so it cannot interleave
    /// with [`leave_if_empty`](Self::leave_if_empty).
    pub fn relay_stop(&self, leave: impl FnOnce() -> usize) {
        let mut items = self.items.lock();
        if leave() > 0 {
            items.push_back(Message::Stop);
            self.notify.notify_one();
        }
    }

    /// Detach an idle consumer if nothing is queued. Returns whether `leave`
    /// was called.
    pub fn leave_if_empty(&self, leave: impl FnOnce() -> usize) -> bool {
        let items = self.items.lock();
        if items.is_empty() {
            leave();
            true
        } else {
            false
        }
    }

    /// Let a surplus consumer go unless a stop marker is already queued, in
    /// which case it must stay to take part in the relay.
    pub fn retire_unless_stopping(&self, retire: impl FnOnce() -> bool) -> bool {
        let items = self.items.lock();
        if items.back().is_some_and(Message::is_stop) {
            return false;
        }
        retire()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Total items ever enqueued (stop markers excluded).
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
}
