//! # eventvisor
//!
//! **Eventvisor** is a lightweight messaging runtime for Rust services.
//!
//! It provides primitives to schedule long-lived background tasks, keep
//! them looping through failures, and maintain a self-healing eventbus
//! connection with wildcard listener dispatch. The crate is designed as
//! the messaging core of a larger service framework.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!               ┌─────────────────────────────────────────┐
//!               │  App (composition root)                 │
//!               │  - TaskScheduler (owns all tasks)       │
//!               │  - Eventbus feature                     │
//!               └──────┬──────────────────────┬───────────┘
//!                      ▼                      ▼
//!            ┌──────────────────┐   ┌──────────────────────┐
//!            │  TaskScheduler   │   │  Eventbus            │
//!            │  create/cancel   │   │  Repeater ► handler  │
//!            │  cleanup sweep   │   └─────────┬────────────┘
//!            └──────────────────┘             ▼
//!                              ┌───────────────────────────┐
//!                              │  EventHandler (Repeat)    │
//!                              │  - connection state       │
//!                              │  - subscription registry  │
//!                              │  - listener registry      │
//!                              │  - pending-op queue       │
//!                              └─────────┬─────────────────┘
//!                                        ▼
//!                              ┌───────────────────────────┐
//!                              │  Broker / BrokerLink      │
//!                              │  (protocol adapter seam)  │
//!                              └───────────────────────────┘
//! ```
//!
//! ### Connection lifecycle
//! ```text
//! Repeater ──► EventHandler::run()
//!
//! loop {
//!   ├─► Connecting: Broker::connect (bounded by interaction_timeout)
//!   ├─► redeclare every registry subscription, oldest first
//!   ├─► Ready: serve loop
//!   │     ├─ inbound delivery ─► ack once ─► dispatch matching listeners
//!   │     ├─ queued Declare   ─► apply, register on success
//!   │     ├─ queued Publish   ─► apply, reply to the caller
//!   │     └─ failure ─────────► Disconnected
//!   ├─► backoff sleep (cancellable), attempt counter resets on Ready
//!   └─► shutdown: clean close ─► Closed
//! }
//! ```
//!
//! ## Features
//! | Area             | Description                                                       | Key types / traits                    |
//! |------------------|-------------------------------------------------------------------|---------------------------------------|
//! | **Scheduling**   | Own, cancel, and sweep long-running async tasks.                  | [`TaskScheduler`], [`TaskHandle`]     |
//! | **Repeating**    | Keep a unit of work looping with once-per-streak error logs.      | [`Repeat`], [`Repeater`]              |
//! | **Eventbus**     | Reconnecting broker client with durable subscriptions.            | [`EventHandler`], [`Eventbus`]        |
//! | **Listeners**    | Wildcard-matched local callbacks, dispatched as isolated tasks.   | [`Listener`], [`ListenerFn`]          |
//! | **Adapters**     | Pluggable broker protocols behind one seam.                       | [`Broker`], [`BrokerLink`]            |
//! | **Policies**     | Reconnect pacing with optional jitter.                            | [`BackoffPolicy`], [`Jitter`]         |
//! | **Errors**       | Typed errors for the loop and the bus.                            | [`RepeatError`], [`BusError`]         |
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use eventvisor::{eventbus, App, BusError, EventbusConfig, ListenerFn, MemoryBroker, Publish};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!
//!     let mut app = App::new();
//!     eventbus::setup(&mut app, EventbusConfig::default(), broker);
//!     app.start().await;
//!
//!     let handler = eventbus::get(&app).handler();
//!     handler.wait_ready(Duration::from_secs(1)).await?;
//!
//!     handler.subscribe("brewcast/#").await?;
//!     handler
//!         .listen("brewcast/state/+", ListenerFn::arc(|topic: String, payload: Vec<u8>| async move {
//!             println!("{topic}: {} bytes", payload.len());
//!             Ok::<_, BusError>(())
//!         }))
//!         .await;
//!
//!     handler.publish(Publish::new("brewcast/state/spark", b"{}".to_vec())).await?;
//!
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```

mod app;
mod backoff;
mod error;
mod logging;
mod repeater;
mod scheduler;

pub mod eventbus;

// ---- Public re-exports ----

pub use app::App;
pub use backoff::{BackoffPolicy, Jitter};
pub use error::{BusError, RepeatError};
pub use eventbus::{
    Broker, BrokerLink, ConnectionState, Delivery, EventHandler, Eventbus, EventbusConfig,
    ExchangeKind, Listener, ListenerFn, ListenerRef, MemoryBroker, Message, Protocol, Publish,
    QoS, Subscription, Will,
};
pub use eventbus::{topic_matches, valid_filter};
pub use logging::{init as init_logging, init_with_level as init_logging_with_level};
pub use repeater::{Repeat, RepeatRef, Repeater};
pub use scheduler::{SchedulerConfig, TaskHandle, TaskScheduler};
