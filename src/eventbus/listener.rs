//! # Listener callbacks and the function-backed implementation.
//!
//! A listener is purely local bookkeeping: a `(pattern, callback)` pair
//! matched against inbound topics, never sent to the broker. [`ListenerFn`]
//! wraps a closure so simple callbacks need no trait impl, mirroring the
//! crate's function-backed task style.
//!
//! ## Example
//! ```
//! use eventvisor::{BusError, ListenerFn, ListenerRef};
//!
//! let listener: ListenerRef = ListenerFn::arc(|topic: String, payload: Vec<u8>| async move {
//!     println!("{topic}: {} bytes", payload.len());
//!     Ok::<_, BusError>(())
//! });
//! # let _ = listener;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;

/// # Callback for inbound event messages.
///
/// Each invocation runs as an independent scheduler task: a slow or failing
/// callback cannot stall message intake or other callbacks. Errors are
/// logged at the dispatch site and dropped.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Handles one message delivered to a matching topic.
    async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
}

/// Shared handle to a listener; identity (`Arc::ptr_eq`) is what `unlisten`
/// compares.
pub type ListenerRef = Arc<dyn Listener>;

/// Function-backed listener implementation.
///
/// Wraps a closure that creates a fresh future per message.
pub struct ListenerFn<F> {
    f: F,
}

impl<F> ListenerFn<F> {
    /// Creates a new function-backed listener.
    ///
    /// Prefer [`ListenerFn::arc`] when you immediately need a [`ListenerRef`].
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Creates the listener and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Listener for ListenerFn<F>
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        (self.f)(topic.to_string(), payload.to_vec()).await
    }
}
