//! A named bus endpoint: subscribe with handlers, publish, close.
//!
//! Each client owns one dispatcher task that drains its mailbox and runs
//! handlers strictly sequentially.  Handler selection prefers an exact
//! pattern match over the topic, then falls back to the first
//! insertion-ordered pattern whose wildcard rules match.  A handler failure
//! or panic is logged and swallowed; it never unwinds the dispatcher.

use crate::broker::Broker;
use crate::mailbox::Mailbox;
use crate::topic::pattern_matches;
use crate::{BusError, BusMessage, MAILBOX_CAPACITY};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long `close()` waits for the dispatcher to drain before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// An async message handler registered against a topic pattern.
pub type Handler = Box<dyn Fn(BusMessage) -> HandlerFuture + Send + Sync>;

pub struct BusClient {
    client_id: String,
    broker: Arc<Broker>,
    mailbox: Arc<Mailbox>,
    handlers: Arc<Mutex<Vec<(String, Handler)>>>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Register with the broker and start the dispatcher task.
    pub fn connect(broker: &Arc<Broker>, client_id: impl Into<String>) -> Result<Arc<Self>, BusError> {
        let client_id = client_id.into();
        let mailbox = Arc::new(Mailbox::new(MAILBOX_CAPACITY));
        broker.register(&client_id, mailbox.clone())?;

        let handlers: Arc<Mutex<Vec<(String, Handler)>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch_loop(
            client_id.clone(),
            mailbox.clone(),
            handlers.clone(),
            shutdown_rx,
        ));

        Ok(Arc::new(BusClient {
            client_id,
            broker: broker.clone(),
            mailbox,
            handlers,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe to `pattern` with `handler`.  Idempotent at the broker;
    /// re-subscribing replaces the stored handler.
    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Result<(), BusError> {
        self.broker.subscribe(&self.client_id, pattern)?;
        let mut handlers = self.handlers.lock().expect("handler table poisoned");
        if let Some(slot) = handlers.iter_mut().find(|(p, _)| p == pattern) {
            slot.1 = handler;
        } else {
            handlers.push((pattern.to_owned(), handler));
        }
        Ok(())
    }

    /// Remove the subscription and its handler.  A no-op when absent.
    pub fn unsubscribe(&self, pattern: &str) {
        self.broker.unsubscribe(&self.client_id, pattern);
        self.handlers
            .lock()
            .expect("handler table poisoned")
            .retain(|(p, _)| p != pattern);
    }

    /// Publish with this client's id as the sender.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        self.broker.publish(&self.client_id, topic, payload);
    }

    /// Messages this client's mailbox has had to drop.
    pub fn dropped_messages(&self) -> u64 {
        self.mailbox.dropped()
    }

    /// Stop the dispatcher (draining the mailbox, bounded), then unregister.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.dispatcher.lock().expect("dispatcher slot poisoned").take();
        if let Some(handle) = handle
            && tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err()
        {
            warn!(client_id = %self.client_id, "dispatcher did not drain within close timeout");
        }
        self.broker.unregister(&self.client_id);
    }
}

async fn dispatch_loop(
    client_id: String,
    mailbox: Arc<Mailbox>,
    handlers: Arc<Mutex<Vec<(String, Handler)>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped sender means the client is gone; stop either way.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = mailbox.recv() => {
                dispatch_one(&client_id, &handlers, message).await;
            }
        }
    }

    // Drain what is already queued, bounded so close() stays prompt even
    // with a slow handler or a full mailbox.
    let deadline = tokio::time::Instant::now() + CLOSE_TIMEOUT;
    while let Some(message) = mailbox.try_pop() {
        if tokio::time::Instant::now() >= deadline {
            debug!(client_id = %client_id, remaining = mailbox.len(), "drain deadline hit");
            break;
        }
        dispatch_one(&client_id, &handlers, message).await;
    }
}

async fn dispatch_one(
    client_id: &str,
    handlers: &Arc<Mutex<Vec<(String, Handler)>>>,
    message: BusMessage,
) {
    let topic = message.topic.clone();
    let future = {
        let handlers = handlers.lock().expect("handler table poisoned");
        let exact = handlers.iter().find(|(p, _)| *p == topic);
        let selected = exact.or_else(|| {
            handlers.iter().find(|(p, _)| pattern_matches(p, &topic))
        });
        selected.map(|(_, handler)| handler(message))
    };

    let Some(future) = future else {
        debug!(client_id, topic = %topic, "no handler for message");
        return;
    };

    // Run inside a task so a panicking handler is contained.
    match tokio::spawn(future).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(client_id, topic = %topic, %error, "message handler failed"),
        Err(join_error) => {
            warn!(client_id, topic = %topic, %join_error, "message handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn forwarding_handler(tx: mpsc::UnboundedSender<BusMessage>) -> Handler {
        Box::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
                Ok(())
            })
        })
    }

    async fn recv_within(rx: &mut mpsc::UnboundedReceiver<BusMessage>, ms: u64) -> BusMessage {
        tokio::time::timeout(Duration::from_millis(ms), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn subscribe_publish_receive() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("info/#", forwarding_handler(tx)).unwrap();

        a.publish("info/local_devices", json!({"video": {}}));
        let msg = recv_within(&mut rx, 1000).await;
        assert_eq!(msg.topic, "info/local_devices");
        assert_eq!(msg.sender, "a");
        assert!(!msg.message_id.is_empty());
        assert_eq!(a.client_id(), "a");
        assert_eq!(b.dropped_messages(), 0);
    }

    #[tokio::test]
    async fn exact_handler_wins_over_wildcard() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (wild_tx, mut wild_rx) = mpsc::unbounded_channel();
        let (exact_tx, mut exact_rx) = mpsc::unbounded_channel();
        b.subscribe("cmd/#", forwarding_handler(wild_tx)).unwrap();
        b.subscribe("cmd/x/go", forwarding_handler(exact_tx)).unwrap();

        a.publish("cmd/x/go", json!(1));
        recv_within(&mut exact_rx, 1000).await;
        assert!(wild_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_matching_wildcard_in_insertion_order_wins() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        b.subscribe("cmd/#", forwarding_handler(first_tx)).unwrap();
        b.subscribe("cmd/+/go", forwarding_handler(second_tx)).unwrap();

        a.publish("cmd/x/go", json!(1));
        recv_within(&mut first_rx, 1000).await;
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handlers_run_sequentially_in_publish_order() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("seq/#", forwarding_handler(tx)).unwrap();

        for n in 0..100 {
            a.publish("seq/n", json!(n));
        }
        for n in 0..100 {
            let msg = recv_within(&mut rx, 1000).await;
            assert_eq!(msg.payload, json!(n));
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_dispatcher() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe(
            "boom/now",
            Box::new(|_msg| Box::pin(async { panic!("handler blew up") })),
        )
        .unwrap();
        b.subscribe("ok/#", forwarding_handler(tx)).unwrap();

        a.publish("boom/now", json!(1));
        a.publish("ok/after", json!(2));
        let msg = recv_within(&mut rx, 1000).await;
        assert_eq!(msg.payload, json!(2));
    }

    #[tokio::test]
    async fn erroring_handler_is_swallowed() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe(
            "bad/input",
            Box::new(|_msg| Box::pin(async { Err("malformed payload".into()) })),
        )
        .unwrap();
        b.subscribe("ok/#", forwarding_handler(tx)).unwrap();

        a.publish("bad/input", json!(1));
        a.publish("ok/after", json!(2));
        recv_within(&mut rx, 1000).await;
    }

    #[tokio::test]
    async fn close_is_bounded_and_repeatable() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let started = tokio::time::Instant::now();
        a.close().await;
        a.close().await;
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn close_drains_queued_messages() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("drain/#", forwarding_handler(tx)).unwrap();
        for n in 0..10 {
            a.publish("drain/n", json!(n));
        }
        b.close().await;

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[tokio::test]
    async fn publish_after_close_is_dropped() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("late/#", forwarding_handler(tx)).unwrap();

        a.close().await;
        a.publish("late/x", json!(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = Broker::new();
        let a = BusClient::connect(&broker, "a").unwrap();
        let b = BusClient::connect(&broker, "b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("t/#", forwarding_handler(tx)).unwrap();
        a.publish("t/one", json!(1));
        recv_within(&mut rx, 1000).await;

        b.unsubscribe("t/#");
        b.unsubscribe("t/#"); // repeat is a no-op
        a.publish("t/two", json!(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
