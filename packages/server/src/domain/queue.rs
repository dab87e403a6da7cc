//! Thread-safe FIFO handoff between the service loop and the console threads.
//!
//! Two instances exist at runtime: the inbound queue (service loop → console
//! bridge) and the outbound queue (console input → service loop). Each has a
//! single producer thread and a single consumer thread.

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use super::Message;

/// Unbounded FIFO of [`Message`]s guarded by a mutex.
///
/// The guard is only held for the duration of a push or a drain, never across
/// a blocking call.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the tail and wake a consumer blocked in [`wait_for`].
    ///
    /// [`wait_for`]: MessageQueue::wait_for
    pub fn enqueue(&self, message: impl Into<Message>) {
        self.messages.lock().push_back(message.into());
        self.arrived.notify_one();
    }

    /// Put messages back at the head, ahead of anything queued since.
    ///
    /// Used for a drained batch that could not be delivered, so the relative
    /// order of all messages is kept.
    pub fn requeue_front(&self, returned: Vec<Message>) {
        if returned.is_empty() {
            return;
        }
        let mut messages = self.messages.lock();
        for message in returned.into_iter().rev() {
            messages.push_front(message);
        }
        drop(messages);
        self.arrived.notify_one();
    }

    /// Remove and return every queued message, oldest first.
    ///
    /// Returns immediately; an empty queue yields an empty `Vec`.
    pub fn drain_all(&self) -> Vec<Message> {
        let mut messages = self.messages.lock();
        messages.drain(..).collect()
    }

    /// Block until the queue is non-empty or `timeout` elapses.
    ///
    /// Nothing is removed. Returns `true` if messages are available.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut messages = self.messages.lock();
        if messages.is_empty() {
            self.arrived.wait_for(&mut messages, timeout);
        }
        !messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}
