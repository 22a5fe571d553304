//! # In-process broker adapter.
//!
//! [`MemoryBroker`] is a loopback implementation of the
//! [`Broker`](crate::Broker) seam: messages published on one link are routed
//! to every link with a matching subscription, honoring exchange kinds,
//! retained messages and last wills. It backs the integration tests and
//! demos; production deployments plug a real protocol adapter into the same
//! seam.
//!
//! Test controls: [`set_offline`](MemoryBroker::set_offline) makes future
//! connects fail, and [`kick_all`](MemoryBroker::kick_all) severs every live
//! link, simulating a broker restart (client state, including wills, is
//! lost with the broker).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::eventbus::broker::{Broker, BrokerLink, Delivery, Message, Subscription};
use crate::eventbus::config::EventbusConfig;
use crate::eventbus::topic::{kind_matches, valid_filter};

struct Client {
    subs: Vec<Subscription>,
    tx: mpsc::UnboundedSender<Delivery>,
    will: Option<Message>,
}

#[derive(Default)]
struct Hub {
    next_client: u64,
    next_token: u64,
    offline: bool,
    clients: HashMap<u64, Client>,
    declared: Vec<Subscription>,
    acked: HashSet<u64>,
    retained: HashMap<String, Message>,
}

impl Hub {
    /// Routes one message to every client with a matching subscription.
    fn route(&mut self, message: &Message) {
        if message.retain {
            self.retained
                .insert(message.topic.clone(), message.clone());
        }

        let mut targets: Vec<u64> = Vec::new();
        for (id, client) in &self.clients {
            let matched = client
                .subs
                .iter()
                .any(|s| kind_matches(s.kind, &s.filter, &message.topic));
            if matched {
                targets.push(*id);
            }
        }

        for id in targets {
            let token = self.next_token;
            self.next_token += 1;
            if let Some(client) = self.clients.get(&id) {
                let _ = client.tx.send(Delivery {
                    message: message.clone(),
                    ack_token: Some(token),
                });
            }
        }
    }

    /// Removes a client; routes its will unless the close was clean.
    fn disconnect(&mut self, id: u64, clean: bool) {
        if let Some(client) = self.clients.remove(&id) {
            if !clean {
                if let Some(will) = client.will {
                    self.route(&will);
                }
            }
        }
    }
}

/// Loopback broker shared by all links it hands out.
pub struct MemoryBroker {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::new(Mutex::new(Hub::default())),
        })
    }

    /// Makes future `connect` calls fail while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.hub.lock().unwrap().offline = offline;
    }

    /// Severs every live link, as if the broker process restarted.
    pub fn kick_all(&self) {
        self.hub.lock().unwrap().clients.clear();
    }

    /// Routes a message as if published by an external client.
    pub fn inject(&self, message: &Message) {
        self.hub.lock().unwrap().route(message);
    }

    /// Every declare observed since creation, in order.
    pub fn declared(&self) -> Vec<Subscription> {
        self.hub.lock().unwrap().declared.clone()
    }

    /// Number of acknowledged deliveries.
    pub fn acked_count(&self) -> usize {
        self.hub.lock().unwrap().acked.len()
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.hub.lock().unwrap().clients.len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, config: &EventbusConfig) -> Result<Box<dyn BrokerLink>, BusError> {
        let mut hub = self.hub.lock().unwrap();
        if hub.offline {
            return Err(BusError::connection(format!(
                "broker unreachable at {}",
                config.address()
            )));
        }

        let id = hub.next_client;
        hub.next_client += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let will = config.will.as_ref().map(|w| Message {
            topic: w.topic.clone(),
            payload: w.payload.clone(),
            qos: w.qos,
            retain: w.retain,
        });
        hub.clients.insert(
            id,
            Client {
                subs: Vec::new(),
                tx,
                will,
            },
        );

        Ok(Box::new(MemoryLink {
            hub: Arc::clone(&self.hub),
            id,
            rx,
            closed: false,
        }))
    }
}

struct MemoryLink {
    hub: Arc<Mutex<Hub>>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn declare(&mut self, sub: &Subscription) -> Result<(), BusError> {
        if !valid_filter(&sub.filter) {
            return Err(BusError::protocol(format!(
                "invalid filter {:?}: '#' must be the final segment",
                sub.filter
            )));
        }

        let mut hub = self.hub.lock().unwrap();
        let retained: Vec<Message> = hub
            .retained
            .values()
            .filter(|m| kind_matches(sub.kind, &sub.filter, &m.topic))
            .cloned()
            .collect();

        hub.clients
            .get_mut(&self.id)
            .ok_or_else(|| BusError::connection("link closed by broker"))?
            .subs
            .push(sub.clone());
        hub.declared.push(sub.clone());

        for message in retained {
            let token = hub.next_token;
            hub.next_token += 1;
            if let Some(client) = hub.clients.get(&self.id) {
                let _ = client.tx.send(Delivery {
                    message,
                    ack_token: Some(token),
                });
            }
        }
        Ok(())
    }

    async fn unbind(&mut self, sub: &Subscription) -> Result<(), BusError> {
        let mut hub = self.hub.lock().unwrap();
        let client = hub
            .clients
            .get_mut(&self.id)
            .ok_or_else(|| BusError::connection("link closed by broker"))?;
        if let Some(pos) = client.subs.iter().position(|s| s == sub) {
            client.subs.remove(pos);
        }
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), BusError> {
        let mut hub = self.hub.lock().unwrap();
        if !hub.clients.contains_key(&self.id) {
            return Err(BusError::connection("link closed by broker"));
        }
        hub.route(message);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Delivery, BusError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BusError::connection("connection lost"))
    }

    async fn ack(&mut self, token: u64) -> Result<(), BusError> {
        let mut hub = self.hub.lock().unwrap();
        if !hub.acked.insert(token) {
            return Err(BusError::protocol(format!("duplicate ack for {token}")));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.closed = true;
        self.hub.lock().unwrap().disconnect(self.id, true);
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        if !self.closed {
            self.hub.lock().unwrap().disconnect(self.id, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::config::Will;

    fn config() -> EventbusConfig {
        EventbusConfig::default()
    }

    #[tokio::test]
    async fn offline_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        assert!(broker.connect(&config()).await.is_err());

        broker.set_offline(false);
        assert!(broker.connect(&config()).await.is_ok());
    }

    #[tokio::test]
    async fn will_fires_on_unclean_drop_only() {
        let broker = MemoryBroker::new();

        let mut watcher = broker.connect(&config()).await.unwrap();
        watcher
            .declare(&Subscription::topic("status/gone"))
            .await
            .unwrap();

        let with_will = EventbusConfig {
            will: Some(Will::new("status/gone", b"offline".to_vec())),
            ..config()
        };

        // Clean close suppresses the will.
        let mut clean = broker.connect(&with_will).await.unwrap();
        clean.close().await.unwrap();

        // Dropping without close publishes it.
        let unclean = broker.connect(&with_will).await.unwrap();
        drop(unclean);

        let delivery = watcher.recv().await.unwrap();
        assert_eq!(delivery.message.topic, "status/gone");
        assert_eq!(delivery.message.payload, b"offline");
    }

    #[tokio::test]
    async fn retained_message_reaches_late_subscriber() {
        let broker = MemoryBroker::new();

        let mut publisher = broker.connect(&config()).await.unwrap();
        let mut retained = Message::new("state/last", b"v1".to_vec());
        retained.retain = true;
        publisher.send(&retained).await.unwrap();

        let mut late = broker.connect(&config()).await.unwrap();
        late.declare(&Subscription::topic("state/#")).await.unwrap();

        let delivery = late.recv().await.unwrap();
        assert_eq!(delivery.message.payload, b"v1");
    }

    #[tokio::test]
    async fn duplicate_ack_is_a_protocol_error() {
        let broker = MemoryBroker::new();

        let mut link = broker.connect(&config()).await.unwrap();
        link.declare(&Subscription::topic("a/#")).await.unwrap();
        link.send(&Message::new("a/b", b"x".to_vec())).await.unwrap();

        let delivery = link.recv().await.unwrap();
        let token = delivery.ack_token.unwrap();
        link.ack(token).await.unwrap();
        assert!(matches!(
            link.ack(token).await,
            Err(BusError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn multilevel_wildcard_must_be_final() {
        let broker = MemoryBroker::new();
        let mut link = broker.connect(&config()).await.unwrap();
        assert!(link.declare(&Subscription::topic("a/#/b")).await.is_err());
        assert!(link.declare(&Subscription::topic("a/#")).await.is_ok());
    }
}
