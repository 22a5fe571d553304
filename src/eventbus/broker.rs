//! # Protocol-adapter seam for the eventbus.
//!
//! The connection manager never talks to a broker crate directly; it goes
//! through the [`Broker`] / [`BrokerLink`] traits. An adapter owns the wire
//! protocol (AMQP exchange declares, MQTT SUBSCRIBE packets, ...) while the
//! manager owns reconnects, registries, and dispatch. The crate ships one
//! in-process adapter, [`MemoryBroker`](crate::eventbus::MemoryBroker).
//!
//! ## Single-writer discipline
//! A [`BrokerLink`] is owned exclusively by the serve task; adapters may
//! therefore take `&mut self` and skip internal locking.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::eventbus::config::EventbusConfig;

/// Delivery-guarantee level requested for a publish or subscribe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery; duplicates possible.
    AtLeastOnce,
    /// Fully deduplicated delivery.
    ExactlyOnce,
}

/// Broker-side routing behavior of a subscription's exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Wildcard routing on the filter.
    #[default]
    Topic,
    /// Exact-match routing on the filter.
    Direct,
    /// Every bound consumer receives every message.
    Fanout,
}

/// A broker-side binding: declared on connect and redeclared after every
/// reconnect until removed by `unsubscribe`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Exchange or topic root; empty selects the broker default.
    pub exchange: String,
    /// Routing filter, may include `+`/`*` and `#` wildcards.
    pub filter: String,
    /// Exchange kind, for adapters that distinguish them.
    pub kind: ExchangeKind,
}

impl Subscription {
    /// Topic subscription on the default exchange.
    pub fn topic(filter: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            filter: filter.into(),
            kind: ExchangeKind::Topic,
        }
    }

    /// Subscription with an explicit exchange and kind.
    pub fn new(
        exchange: impl Into<String>,
        filter: impl Into<String>,
        kind: ExchangeKind,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            filter: filter.into(),
            kind,
        }
    }
}

/// An outbound or inbound event message. Transient: never stored beyond
/// dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Hierarchical routing topic. Cannot include wildcards when publishing.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Requested delivery guarantee.
    pub qos: QoS,
    /// Whether the broker should retain the message for late subscribers.
    pub retain: bool,
}

impl Message {
    /// Creates a message with default QoS and no retain flag.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
        }
    }

    /// Creates a message carrying `value` as a JSON payload.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    /// Decodes the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// One inbound message plus the token needed to acknowledge it.
#[derive(Debug)]
pub struct Delivery {
    /// The received message.
    pub message: Message,
    /// Opaque ack token; `None` when the adapter acknowledges implicitly.
    pub ack_token: Option<u64>,
}

/// Factory for broker connections.
///
/// `connect` is called once per reconnect cycle; the returned link is used
/// until it fails, then dropped and replaced on the next cycle.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Establishes a fresh connection to the broker, registering the
    /// configured last will if the config carries one.
    async fn connect(&self, config: &EventbusConfig) -> Result<Box<dyn BrokerLink>, BusError>;
}

/// A live connection to the broker.
///
/// Owned exclusively by the serve task; see the module docs for the
/// single-writer discipline. `recv` must be cancel-safe: the serve loop
/// races it against the pending-operation queue and the shutdown token.
#[async_trait]
pub trait BrokerLink: Send {
    /// Declares/binds a subscription on the broker.
    async fn declare(&mut self, sub: &Subscription) -> Result<(), BusError>;

    /// Removes a binding. Best effort; absence is not an error.
    async fn unbind(&mut self, sub: &Subscription) -> Result<(), BusError>;

    /// Sends one message to the broker.
    async fn send(&mut self, message: &Message) -> Result<(), BusError>;

    /// Waits for the next inbound message. Must be cancel-safe.
    async fn recv(&mut self) -> Result<Delivery, BusError>;

    /// Acknowledges a delivery. Called exactly once per ack token.
    async fn ack(&mut self, token: u64) -> Result<(), BusError>;

    /// Closes the connection cleanly, suppressing the last will.
    async fn close(&mut self) -> Result<(), BusError>;
}
