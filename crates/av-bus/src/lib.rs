// av-bus: In-process topic-routed publish/subscribe.
//
// One `Broker` per process routes `BusMessage` envelopes between named
// `BusClient`s.  Subscriptions are topic patterns with MQTT-style wildcards
// (`+` one segment, `#` trailing rest); delivery is asynchronous through a
// bounded per-client mailbox drained by one dispatcher task per client.

pub mod broker;
pub mod client;
pub mod mailbox;
pub mod topic;

pub use broker::Broker;
pub use client::{BusClient, Handler, HandlerError};
pub use mailbox::Mailbox;
pub use topic::pattern_matches;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default per-client mailbox depth before the oldest message is dropped.
pub const MAILBOX_CAPACITY: usize = 256;

/// Errors from broker and client operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("client id already registered: {0}")]
    DuplicateClient(String),
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// The envelope every published message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    pub payload: serde_json::Value,
}

impl BusMessage {
    /// Stamp a fresh envelope for a publish.
    pub fn stamp(sender: &str, topic: &str, payload: serde_json::Value) -> Self {
        BusMessage {
            topic: topic.to_owned(),
            sender: sender.to_owned(),
            timestamp: Utc::now(),
            message_id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }
}
