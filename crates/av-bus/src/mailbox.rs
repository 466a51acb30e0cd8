//! Bounded per-client message mailbox.
//!
//! A drop-oldest FIFO: the broker enqueues synchronously (it holds its own
//! lock while routing), the client's dispatcher drains asynchronously.  A
//! full mailbox evicts the oldest message and counts the drop; the publisher
//! never blocks.

use crate::BusMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct Mailbox {
    queue: Mutex<VecDeque<BusMessage>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue a message, evicting the oldest one when full.
    pub fn push(&self, message: BusMessage) {
        {
            let mut queue = self.queue.lock().expect("mailbox lock poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<BusMessage> {
        self.queue.lock().expect("mailbox lock poisoned").pop_front()
    }

    /// Dequeue, waiting until a message arrives.
    pub async fn recv(&self) -> BusMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_pop() {
                return message;
            }
            notified.await;
        }
    }

    /// Messages evicted because the mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("mailbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
