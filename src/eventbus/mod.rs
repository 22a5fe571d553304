//! # Reconnecting eventbus client.
//!
//! The eventbus feature keeps one managed broker connection per application:
//! subscriptions survive reconnects, listener callbacks are matched with
//! topic wildcards, and publishes queue briefly while the link recovers.
//!
//! ```text
//! Eventbus (feature)
//!   ├── Repeater ──► EventHandler::run()      reconnect cycle, one per loop
//!   │                   ├── Broker::connect   protocol adapter seam
//!   │                   ├── redeclare subs    registry, oldest first
//!   │                   └── serve loop        ops queue + inbound dispatch
//!   └── EventHandler   subscribe / listen / publish surface
//! ```
//!
//! Subscribing and listening are deliberately separate: a subscription is a
//! broker-side binding (redeclared after reconnects), a listener is a local
//! `(pattern, callback)` pair. Subscribe once to a broad filter, then attach
//! listeners for the specific topics you care about.

mod broker;
mod config;
mod handler;
mod listener;
mod memory;
mod topic;

pub use broker::{Broker, BrokerLink, Delivery, ExchangeKind, Message, QoS, Subscription};
pub use config::{EventbusConfig, Protocol, Will};
pub use handler::{ConnectionState, EventHandler, Publish};
pub use listener::{Listener, ListenerFn, ListenerRef};
pub use memory::MemoryBroker;
pub use topic::{topic_matches, valid_filter};

use std::sync::Arc;

use crate::app::App;
use crate::repeater::Repeater;

/// The eventbus feature: an [`EventHandler`] driven by a [`Repeater`].
///
/// Created by [`setup`]; retrieved with [`get`].
pub struct Eventbus {
    handler: Arc<EventHandler>,
    repeater: Repeater,
}

impl Eventbus {
    /// Starts the managed connection loop.
    pub async fn start(&self) {
        self.repeater.start().await;
    }

    /// Stops the connection loop and closes the link.
    pub async fn stop(&self) {
        self.repeater.stop().await;
    }

    /// True while the connection loop task is running.
    pub async fn active(&self) -> bool {
        self.repeater.active().await
    }

    /// The connection handler, for subscribe/listen/publish calls.
    pub fn handler(&self) -> &Arc<EventHandler> {
        &self.handler
    }
}

/// Installs the eventbus feature on an application.
///
/// The connection is not opened here; it starts with
/// [`App::start`](crate::App::start) or an explicit [`Eventbus::start`].
pub fn setup(app: &mut App, config: EventbusConfig, broker: Arc<dyn Broker>) {
    let handler = EventHandler::new(config, broker, app.scheduler().clone());
    let repeater = Repeater::new(app.scheduler().clone(), handler.clone());
    app.set_eventbus(Eventbus { handler, repeater });
}

/// The eventbus feature installed by [`setup`].
///
/// # Panics
/// Panics when [`setup`] was never called for this application. Features are
/// wired at startup, so a missing one is a construction bug.
pub fn get(app: &App) -> &Eventbus {
    app.eventbus()
        .expect("eventbus feature not installed; call eventbus::setup first")
}
