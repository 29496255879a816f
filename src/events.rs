//! fallbranch/src/events.rs
//! The proxy's event bus: a fan-out broadcast of lifecycle events
//! (`client-accepted`, `pre-conn-processed`, `player-join`,
//! `server-not-found`, `server-dial-failed`, `conn-tunneled`, `conn-closed`,
//! plus the operational `listener-bound` and `pre-conn-processing-failed`)
//! to any number of subscribers, each with its own bounded queue so one slow
//! consumer can never block another or the pipeline itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SubscriberError;

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: &'static str,
    pub gateway_id: Option<String>,
    pub server_id: Option<String>,
    pub conn_id: Option<u64>,
    pub fields: Value,
}

impl Event {
    pub fn new(topic: &'static str) -> Self {
        Event {
            topic,
            gateway_id: None,
            server_id: None,
            conn_id: None,
            fields: Value::Null,
        }
    }

    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_conn(mut self, conn_id: u64) -> Self {
        self.conn_id = Some(conn_id);
        self
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Event>,
}

/// Owns every subscriber queue and the single dispatcher task that drains
/// the publish channel and fans each event out. Cloning `EventBus` clones the
/// publish handle only; there is exactly one dispatcher per bus.
#[derive(Clone)]
pub struct EventBus {
    publish_tx: mpsc::Sender<Event>,
}

const PUBLISH_QUEUE_CAP: usize = 1024;
const SUBSCRIBER_QUEUE_CAP: usize = 256;

impl EventBus {
    /// Spawns the dispatcher task and returns the bus plus a registrar that
    /// must be used to add subscribers *before* the first event is published
    /// -- subscriber registration happens on the same `Arc<Mutex<..>>>` the
    /// dispatcher reads from, so it's safe to do at any time, but events
    /// published before a subscriber registers are simply missed, matching
    /// at-most-once, no-replay delivery.
    pub fn new() -> (Self, EventBusHandle) {
        let (publish_tx, mut publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAP);
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let dispatch_subscribers = subscribers.clone();

        tokio::spawn(async move {
            while let Some(event) = publish_rx.recv().await {
                let subs = dispatch_subscribers.lock().unwrap();
                for sub in subs.iter() {
                    if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone())
                    {
                        let err = SubscriberError::Overflow {
                            name: sub.name.clone(),
                        };
                        warn!(subscriber = %sub.name, topic = event.topic, "{err}");
                    }
                }
            }
        });

        (
            EventBus {
                publish_tx: publish_tx.clone(),
            },
            EventBusHandle { subscribers },
        )
    }

    /// Never blocks: a full publish queue means events are dropped rather
    /// than stalling whichever pipeline stage is publishing.
    pub fn publish(&self, event: Event) {
        if self.publish_tx.try_send(event).is_err() {
            warn!("event bus publish queue full, dropping event");
        }
    }
}

#[derive(Clone)]
pub struct EventBusHandle {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBusHandle {
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        self.subscribers.lock().unwrap().push(Subscriber {
            name: name.into(),
            tx,
        });
        rx
    }
}

pub const TOPIC_LISTENER_BOUND: &str = "listener-bound";
pub const TOPIC_CLIENT_ACCEPTED: &str = "client-accepted";
pub const TOPIC_PRE_CONN_PROCESSED: &str = "pre-conn-processed";
pub const TOPIC_PRE_CONN_PROCESSING_FAILED: &str = "pre-conn-processing-failed";
pub const TOPIC_PLAYER_JOIN: &str = "player-join";
pub const TOPIC_SERVER_NOT_FOUND: &str = "server-not-found";
pub const TOPIC_SERVER_DIAL_FAILED: &str = "server-dial-failed";
pub const TOPIC_CONN_TUNNELED: &str = "conn-tunneled";
pub const TOPIC_CONN_CLOSED: &str = "conn-closed";

/// Duration formatted the way `conn-closed` events report tunnel lifetime:
/// whole milliseconds, no fractional component.
pub fn duration_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn delivers_published_events_to_subscribers() {
        let (bus, handle) = EventBus::new();
        let mut rx = handle.subscribe("test");

        bus.publish(Event::new(TOPIC_PRE_CONN_PROCESSED).with_conn(7));

        let event = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, TOPIC_PRE_CONN_PROCESSED);
        assert_eq!(event.conn_id, Some(7));
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_a_copy() {
        let (bus, handle) = EventBus::new();
        let mut rx_a = handle.subscribe("a");
        let mut rx_b = handle.subscribe("b");

        bus.publish(Event::new(TOPIC_CLIENT_ACCEPTED));

        tokio::time::timeout(StdDuration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
