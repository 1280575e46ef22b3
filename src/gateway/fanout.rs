// Subscription fanout over per-connection outbound channels

use crate::gateway::address;
use crate::gateway::frame::{Command, Frame};
use crate::gateway::model::{ConnectionId, Identity};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Body handed to the publish primitive
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub content_type: &'static str,
    pub body: String,
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Self {
        Self {
            content_type: "application/json",
            body: serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: "text/plain",
            body: body.into(),
        }
    }
}

/// Publish primitive used for every fanout and acknowledgment.
///
/// Fire-and-forget: the caller never learns whether anyone received it.
pub trait Publisher: Send + Sync {
    fn publish(&self, destination: &str, payload: Payload);
}

/// A subscription refused by the hub
#[derive(Debug, PartialEq, Eq)]
pub struct Forbidden(pub String);

/// One subscription on one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Subscriber {
    connection: ConnectionId,
    subscription: String,
}

/// In-process pub/sub between connections
pub struct SubscriptionHub {
    outbound: DashMap<ConnectionId, mpsc::UnboundedSender<Frame>>,
    topics: DashMap<String, Vec<Subscriber>>,
    next_message_id: AtomicU64,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            outbound: DashMap::new(),
            topics: DashMap::new(),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Register the outbound channel of a connection
    pub fn attach(&self, connection: &ConnectionId, tx: mpsc::UnboundedSender<Frame>) {
        self.outbound.insert(connection.clone(), tx);
    }

    /// Drop a connection and every subscription it holds
    pub fn detach(&self, connection: &ConnectionId) {
        self.outbound.remove(connection);
        self.topics
            .iter_mut()
            .for_each(|mut entry| entry.value_mut().retain(|s| &s.connection != connection));
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Subscribe `connection` to `destination` under the client's subscription id.
    ///
    /// Per-identity addresses only accept their owner.
    pub fn subscribe(
        &self,
        connection: &ConnectionId,
        subscription: &str,
        destination: &str,
        principal: &Identity,
    ) -> Result<(), Forbidden> {
        if let Some(owner) = address::owner_of(destination) {
            if owner != principal.id {
                return Err(Forbidden(format!(
                    "{} may not subscribe to {}",
                    principal.username, destination
                )));
            }
        }

        let subscriber = Subscriber {
            connection: connection.clone(),
            subscription: subscription.to_string(),
        };

        let mut entry = self.topics.entry(destination.to_string()).or_default();
        if !entry.contains(&subscriber) {
            entry.push(subscriber);
        }

        tracing::debug!(
            connection_id = %connection,
            destination,
            subscription,
            "Subscribed"
        );
        Ok(())
    }

    pub fn unsubscribe(&self, connection: &ConnectionId, subscription: &str) {
        self.topics.iter_mut().for_each(|mut entry| {
            entry
                .value_mut()
                .retain(|s| !(&s.connection == connection && s.subscription == subscription))
        });
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Number of live subscriptions on `destination`
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.topics.get(destination).map(|s| s.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for SubscriptionHub {
    fn publish(&self, destination: &str, payload: Payload) {
        let subscribers = match self.topics.get(destination) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::trace!(destination, "No subscribers");
                return;
            }
        };

        let mut closed = Vec::new();

        for subscriber in subscribers {
            let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            let frame = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", subscriber.subscription.as_str())
                .header("message-id", message_id.to_string())
                .header("content-type", payload.content_type)
                .with_body(payload.body.clone());

            let delivered = self
                .outbound
                .get(&subscriber.connection)
                .map(|tx| tx.send(frame).is_ok())
                .unwrap_or(false);

            if !delivered {
                tracing::warn!(
                    connection_id = %subscriber.connection,
                    destination,
                    "Failed to deliver to subscriber"
                );
                closed.push(subscriber.connection);
            }
        }

        // Prune closed channels
        for connection in closed {
            self.detach(&connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::model::GroupId;

    fn attached(hub: &SubscriptionHub) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        hub.attach(&id, tx);
        (id, rx)
    }

    #[test]
    fn test_publish_reaches_subscribers() {
        let hub = SubscriptionHub::new();
        let alice = Identity::new(1, "alice");
        let (conn, mut rx) = attached(&hub);

        hub.subscribe(&conn, "sub-0", address::STATUS, &alice).unwrap();
        hub.publish(address::STATUS, Payload::text("bob is online"));

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("destination"), Some(address::STATUS));
        assert_eq!(frame.get("subscription"), Some("sub-0"));
        assert_eq!(frame.get("content-type"), Some("text/plain"));
        assert_eq!(frame.body, "bob is online");

        hub.unsubscribe(&conn, "sub-0");
        hub.publish(address::STATUS, Payload::text("bob is offline"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_private_addresses_require_owner() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = attached(&hub);
        let bob = Identity::new(2, "bob");

        let queue = address::private_queue(bob.id);
        assert!(hub.subscribe(&conn, "s", &queue, &bob).is_ok());

        let mallory = Identity::new(3, "mallory");
        assert!(hub.subscribe(&conn, "s2", &queue, &mallory).is_err());
        assert_eq!(hub.subscriber_count(&queue), 1);

        let group_acks = address::group_ack(bob.id);
        assert!(hub.subscribe(&conn, "s3", &group_acks, &mallory).is_err());
        assert!(hub.subscribe(&conn, "s4", &group_acks, &bob).is_ok());
        assert!(hub.subscribe(&conn, "s5", &address::group_topic(GroupId(2)), &mallory).is_ok());
    }

    #[test]
    fn test_closed_channels_are_pruned() {
        let hub = SubscriptionHub::new();
        let alice = Identity::new(1, "alice");
        let (conn, rx) = attached(&hub);

        hub.subscribe(&conn, "s", address::STATUS, &alice).unwrap();
        drop(rx);

        hub.publish(address::STATUS, Payload::text("x"));
        assert_eq!(hub.subscriber_count(address::STATUS), 0);
        assert_eq!(hub.connection_count(), 0);
    }
}
