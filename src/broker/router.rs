//! Message routing for the broker
//!
//! Subscriptions are exact topic names. A publish is delivered to every client
//! subscribed to exactly that topic, at the lower of the two QoS levels.

use crate::packet::publish::PublishPacket;
use crate::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct Subscription {
    pub client_id: String,
    pub qos: QoS,
}

#[derive(Debug, Clone)]
struct ClientInfo {
    sender: mpsc::Sender<PublishPacket>,
}

/// Message router for the broker
#[derive(Debug, Default)]
pub struct MessageRouter {
    /// Topic -> subscriptions
    subscriptions: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
    clients: Arc<RwLock<HashMap<String, ClientInfo>>>,
}

impl MessageRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client connection, replacing any earlier one with the same id
    pub async fn register_client(&self, client_id: String, sender: mpsc::Sender<PublishPacket>) {
        let mut clients = self.clients.write().await;
        if clients
            .insert(client_id.clone(), ClientInfo { sender })
            .is_some()
        {
            debug!(client_id = %client_id, "Replaced existing connection");
        }
    }

    /// Unregisters a client and drops its subscriptions
    ///
    /// Does nothing if the id has since been taken over by a newer connection
    /// using a different channel.
    pub async fn unregister_client(&self, client_id: &str, sender: &mpsc::Sender<PublishPacket>) {
        let mut clients = self.clients.write().await;
        match clients.get(client_id) {
            Some(info) if info.sender.same_channel(sender) => {
                clients.remove(client_id);
            }
            _ => return,
        }
        drop(clients);

        let mut subscriptions = self.subscriptions.write().await;
        for subs in subscriptions.values_mut() {
            subs.retain(|sub| sub.client_id != client_id);
        }
        subscriptions.retain(|_, subs| !subs.is_empty());
        debug!(client_id = %client_id, "Unregistered client");
    }

    pub async fn subscribe(&self, client_id: String, topic: String, qos: QoS) {
        let mut subscriptions = self.subscriptions.write().await;
        let subs = subscriptions.entry(topic.clone()).or_default();
        subs.retain(|sub| sub.client_id != client_id);
        debug!(client_id = %client_id, topic = %topic, "Subscribed");
        subs.push(Subscription { client_id, qos });
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Delivers a publish to every subscriber of its topic
    ///
    /// Returns the number of clients it was queued for.
    pub async fn route_message(&self, publish: &PublishPacket) -> usize {
        trace!(topic = %publish.topic_name, "Routing message");

        let subscriptions = self.subscriptions.read().await;
        let Some(subs) = subscriptions.get(&publish.topic_name) else {
            return 0;
        };
        let clients = self.clients.read().await;

        let mut delivered = 0;
        for sub in subs {
            let Some(client) = clients.get(&sub.client_id) else {
                continue;
            };
            let mut outgoing = publish.clone();
            outgoing.qos = publish.qos.min(sub.qos);
            outgoing.packet_id = None;
            outgoing.retain = false;
            outgoing.dup = false;
            if client.sender.try_send(outgoing).is_ok() {
                delivered += 1;
            } else {
                warn!(client_id = %sub.client_id, "Subscriber queue full, message dropped");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_match_fan_out() {
        let router = MessageRouter::new();
        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);

        router.register_client("a".to_string(), tx1).await;
        router.register_client("b".to_string(), tx2).await;
        router
            .subscribe("a".to_string(), "/devices/d1/events".to_string(), QoS::AtLeastOnce)
            .await;
        router
            .subscribe("b".to_string(), "/devices/d1/events".to_string(), QoS::AtMostOnce)
            .await;

        let publish = PublishPacket::new("/devices/d1/events", "Message 0", QoS::AtLeastOnce)
            .with_packet_id(3);
        assert_eq!(router.route_message(&publish).await, 2);

        let got = rx1.recv().await.unwrap();
        assert_eq!(got.qos, QoS::AtLeastOnce);
        assert_eq!(got.packet_id, None);
        assert_eq!(rx2.recv().await.unwrap().qos, QoS::AtMostOnce);

        let other = PublishPacket::new("/devices/d1/events/x", "x", QoS::AtMostOnce);
        assert_eq!(router.route_message(&other).await, 0);
    }

    #[tokio::test]
    async fn test_unregister_ignores_replaced_connection() {
        let router = MessageRouter::new();
        let (old_tx, _old_rx) = mpsc::channel(1);
        let (new_tx, _new_rx) = mpsc::channel(1);

        router.register_client("a".to_string(), old_tx.clone()).await;
        router
            .subscribe("a".to_string(), "/devices/d1/events".to_string(), QoS::AtLeastOnce)
            .await;
        router.register_client("a".to_string(), new_tx.clone()).await;

        router.unregister_client("a", &old_tx).await;
        assert_eq!(router.subscriber_count("/devices/d1/events").await, 1);

        router.unregister_client("a", &new_tx).await;
        assert_eq!(router.subscriber_count("/devices/d1/events").await, 0);
    }
}
