//! The in-process message broker.
//!
//! Routing state is two tables under one mutex: pattern -> subscriber ids
//! (insertion-ordered) and client id -> mailbox.  Matching happens inside
//! the same critical section as the mailbox enqueue, so a subscriber never
//! observes a message published before its subscription took effect.

use crate::mailbox::Mailbox;
use crate::topic::{pattern_matches, validate_pattern};
use crate::{BusError, BusMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
struct BrokerState {
    /// Pattern -> subscriber client ids, in subscription order.
    patterns: Vec<PatternEntry>,
    clients: HashMap<String, Arc<Mailbox>>,
}

struct PatternEntry {
    pattern: String,
    subscribers: Vec<String>,
}

#[derive(Default)]
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Broker::default())
    }

    /// Record a client's mailbox under its id.  Ids are unique.
    pub fn register(&self, client_id: &str, mailbox: Arc<Mailbox>) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("broker lock poisoned");
        if state.clients.contains_key(client_id) {
            return Err(BusError::DuplicateClient(client_id.to_owned()));
        }
        state.clients.insert(client_id.to_owned(), mailbox);
        debug!(client_id, "bus client registered");
        Ok(())
    }

    /// Remove a client and evict it from every subscription.  Idempotent.
    pub fn unregister(&self, client_id: &str) {
        let mut state = self.state.lock().expect("broker lock poisoned");
        state.clients.remove(client_id);
        for entry in &mut state.patterns {
            entry.subscribers.retain(|s| s != client_id);
        }
        state.patterns.retain(|e| !e.subscribers.is_empty());
        debug!(client_id, "bus client unregistered");
    }

    /// Add `client_id` to the subscribers of `pattern`.  Idempotent.
    pub fn subscribe(&self, client_id: &str, pattern: &str) -> Result<(), BusError> {
        validate_pattern(pattern)?;
        let mut state = self.state.lock().expect("broker lock poisoned");
        match state.patterns.iter_mut().find(|e| e.pattern == pattern) {
            Some(entry) => {
                if !entry.subscribers.iter().any(|s| s == client_id) {
                    entry.subscribers.push(client_id.to_owned());
                }
            }
            None => state.patterns.push(PatternEntry {
                pattern: pattern.to_owned(),
                subscribers: vec![client_id.to_owned()],
            }),
        }
        Ok(())
    }

    /// Remove `client_id` from `pattern`'s subscribers; empty patterns are
    /// dropped.  A no-op when the subscription does not exist.
    pub fn unsubscribe(&self, client_id: &str, pattern: &str) {
        let mut state = self.state.lock().expect("broker lock poisoned");
        if let Some(entry) = state.patterns.iter_mut().find(|e| e.pattern == pattern) {
            entry.subscribers.retain(|s| s != client_id);
        }
        state.patterns.retain(|e| !e.subscribers.is_empty());
    }

    /// Route one message: enqueue to every subscriber of every matching
    /// pattern, except the sender.  A subscriber reached through several
    /// matching patterns receives the message once.
    ///
    /// Publishes from an id that is not registered are dropped — a closed
    /// client cannot speak.
    pub fn publish(&self, sender_id: &str, topic: &str, payload: serde_json::Value) {
        let state = self.state.lock().expect("broker lock poisoned");
        if !state.clients.contains_key(sender_id) {
            debug!(sender_id, topic, "publish from unregistered client dropped");
            return;
        }

        let message = BusMessage::stamp(sender_id, topic, payload);
        let mut delivered: HashSet<&str> = HashSet::new();
        for entry in &state.patterns {
            if !pattern_matches(&entry.pattern, topic) {
                continue;
            }
            for subscriber in &entry.subscribers {
                if subscriber == sender_id || !delivered.insert(subscriber.as_str()) {
                    continue;
                }
                if let Some(mailbox) = state.clients.get(subscriber) {
                    mailbox.push(message.clone());
                }
            }
        }

        if delivered.is_empty() {
            debug!(topic, "no subscribers for topic");
        }
    }
}
