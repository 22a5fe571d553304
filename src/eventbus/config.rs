//! # Eventbus connection configuration.
//!
//! [`EventbusConfig`] describes how to reach the broker: transport protocol,
//! host, optional port (defaulted per protocol), websocket path, optional
//! last-will message, and the timing knobs of the reconnect/serve loop.
//!
//! Default ports:
//!
//! | protocol | transport            | port |
//! |----------|----------------------|------|
//! | `mqtt`   | plain TCP            | 1883 |
//! | `mqtts`  | TCP + TLS            | 8883 |
//! | `ws`     | websocket            | 80   |
//! | `wss`    | websocket over HTTPS | 443  |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::BusError;
use crate::eventbus::broker::QoS;

/// Transport protocol for the broker connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP.
    #[default]
    Mqtt,
    /// TCP + TLS.
    Mqtts,
    /// Websocket.
    Ws,
    /// Websocket over HTTPS.
    Wss,
}

impl Protocol {
    /// Default port for this protocol.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Mqtt => 1883,
            Protocol::Mqtts => 8883,
            Protocol::Ws => 80,
            Protocol::Wss => 443,
        }
    }

    /// True for the websocket variants; only these carry a path.
    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    /// Scheme string used in the rendered address.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Mqtts => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

/// Last-will message registered with the broker at connect time.
///
/// Published by the broker on our behalf when the connection drops without
/// a clean close. Must be configured before startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Will {
    /// Topic the will is published to. Cannot include wildcards.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Delivery guarantee requested for the will.
    pub qos: QoS,
    /// Whether the broker retains the will message.
    pub retain: bool,
}

impl Will {
    /// Creates a will with default QoS and no retain flag.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
        }
    }
}

/// Connection settings for the eventbus client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventbusConfig {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Hostname of the broker.
    pub host: String,
    /// Port of the broker; `None` uses the protocol default.
    pub port: Option<u16>,
    /// Broker path, only meaningful for websocket protocols.
    pub path: String,
    /// Optional last-will message.
    pub will: Option<Will>,
    /// Delay policy between reconnect attempts.
    pub backoff: BackoffPolicy,
    /// Bound on the serve loop's wait for a pending operation, so liveness
    /// is rechecked even with no traffic.
    pub pending_wait: Duration,
    /// Bound on one broker round-trip (connect, declare, publish, ack).
    pub interaction_timeout: Duration,
}

impl Default for EventbusConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Mqtt,
            host: "eventbus".to_string(),
            port: None,
            path: String::new(),
            will: None,
            backoff: BackoffPolicy::default(),
            pending_wait: Duration::from_secs(5),
            interaction_timeout: Duration::from_secs(5),
        }
    }
}

impl EventbusConfig {
    /// The port actually used: explicit, or the protocol default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Rendered address, e.g. `mqtt://eventbus:1883` or `wss://host:443/eventbus`.
    pub fn address(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol.scheme(),
            self.host,
            self.effective_port(),
            if self.protocol.is_websocket() {
                self.path.as_str()
            } else {
                ""
            }
        )
    }

    /// Validates the host/path/protocol combination.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.host.is_empty() {
            return Err(BusError::protocol("broker host must not be empty"));
        }
        if !self.path.is_empty() && !self.protocol.is_websocket() {
            return Err(BusError::protocol(format!(
                "path {:?} is only valid for websocket protocols",
                self.path
            )));
        }
        if let Some(will) = &self.will {
            if will.topic.contains(['#', '+', '*']) {
                return Err(BusError::protocol(
                    "will topic cannot include wildcards",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for EventbusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}
