//! # EventHandler: the reconnecting eventbus client.
//!
//! Owns the single broker connection, the subscription and listener
//! registries, and the pending-operation queue. Implemented as a
//! [`Repeat`] whose [`run`](Repeat::run) performs exactly one
//! reconnect-and-serve cycle; the outer repeater supplies reconnection,
//! and [`BackoffPolicy`](crate::BackoffPolicy) paces the attempts.
//!
//! ## State machine
//! ```text
//! Idle ──► Connecting ──► Ready ──► Disconnected ──► Connecting ──► …
//!                │          │            │
//!                └──────────┴────────────┴──► Closed (shutdown, clean close attempted)
//! ```
//! - `Connecting → Ready`: link established and every registry subscription
//!   redeclared, oldest first.
//! - `Ready → Disconnected`: transport error, broker close, or a failed
//!   declare of a newly added subscription.
//!
//! ## Serve loop
//! While `Ready`, one task races the broker's inbound stream against the
//! pending-operation queue (bounded wait, so liveness is rechecked without
//! traffic). Only this task ever touches the link; callers communicate via
//! the queue and the registries, which removes the need for locks around
//! the transport itself.
//!
//! Inbound messages are acknowledged exactly once, then every matching
//! listener is dispatched as an independent scheduler task so a slow or
//! failing callback cannot stall intake.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Notify, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BusError, RepeatError};
use crate::eventbus::broker::{Broker, BrokerLink, Delivery, Message, QoS, Subscription};
use crate::eventbus::config::EventbusConfig;
use crate::eventbus::listener::ListenerRef;
use crate::eventbus::topic::{topic_matches, valid_filter};
use crate::repeater::Repeat;
use crate::scheduler::TaskScheduler;

/// Connection lifecycle of the eventbus client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet.
    Idle,
    /// Establishing transport and redeclaring subscriptions.
    Connecting,
    /// Live; pending operations are being applied.
    Ready,
    /// Connection lost; the next cycle will reconnect.
    Disconnected,
    /// Shut down for good.
    Closed,
}

/// A queued operation awaiting application to the live connection.
enum Op {
    Declare(Subscription),
    Unbind(Subscription),
    Publish {
        message: Message,
        reply: oneshot::Sender<Result<(), BusError>>,
    },
}

/// Pending-operation queue: FIFO with front re-enqueue for failed declares.
///
/// `pop` waits up to `wait` for an item so the serve loop regains control
/// periodically even when nothing is queued.
#[derive(Default)]
struct OpQueue {
    items: StdMutex<VecDeque<Op>>,
    notify: Notify,
}

impl OpQueue {
    fn push_back(&self, op: Op) {
        self.items.lock().unwrap().push_back(op);
        self.notify.notify_one();
    }

    fn push_front(&self, op: Op) {
        self.items.lock().unwrap().push_front(op);
        self.notify.notify_one();
    }

    async fn pop(&self, wait: Duration) -> Option<Op> {
        if let Some(op) = self.items.lock().unwrap().pop_front() {
            return Some(op);
        }
        let _ = time::timeout(wait, self.notify.notified()).await;
        self.items.lock().unwrap().pop_front()
    }

    fn contains_declare(&self, sub: &Subscription) -> bool {
        self.items
            .lock()
            .unwrap()
            .iter()
            .any(|op| matches!(op, Op::Declare(s) if s == sub))
    }

    fn remove_declares(&self, filter: &str) {
        self.items
            .lock()
            .unwrap()
            .retain(|op| !matches!(op, Op::Declare(s) if s.filter == filter));
    }
}

/// A publish request.
///
/// Built with [`Publish::new`] or [`Publish::json`] and refined through the
/// builder methods. `silent()` suppresses the error for fire-and-forget
/// callers: the call returns normally on failure, but does not deliver.
#[derive(Debug)]
pub struct Publish {
    /// Message topic. Cannot include wildcards.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Requested delivery guarantee.
    pub qos: QoS,
    /// Whether the broker retains the message.
    pub retain: bool,
    /// Bound on the whole call; defaults to twice the interaction timeout.
    pub timeout: Option<Duration>,
    /// Whether failures are surfaced to the caller.
    pub err: bool,
}

impl Publish {
    /// Publish request with default QoS, no retain, errors surfaced.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
            timeout: None,
            err: true,
        }
    }

    /// Publish request carrying `value` as a JSON payload.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    /// Sets the requested delivery guarantee.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Marks the message as retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Bounds the whole publish call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Suppresses failures: the call returns `Ok` even when undelivered.
    pub fn silent(mut self) -> Self {
        self.err = false;
        self
    }
}

/// Exit condition of one serve loop.
enum ServeExit {
    Cancelled,
    Failed(BusError),
}

/// One select round of the serve loop.
enum Step {
    Cancelled,
    Delivery(Result<Delivery, BusError>),
    Op(Option<Op>),
}

/// Connection handler for eventbus messages.
///
/// Subscribe and listen are handled separately: subscribe a wildcard once,
/// then attach any number of listener callbacks for specific topics within
/// it. All registered subscriptions are redeclared whenever the connection
/// is lost and reestablished.
pub struct EventHandler {
    config: EventbusConfig,
    broker: Arc<dyn Broker>,
    scheduler: Arc<TaskScheduler>,
    state_tx: watch::Sender<ConnectionState>,
    subs: RwLock<Vec<Subscription>>,
    listeners: RwLock<Vec<(String, ListenerRef)>>,
    ops: OpQueue,
    // Declare currently applied by the serve loop; cleared by unsubscribe
    // to drop a subscription that is mid-flight on the broker.
    inflight: StdMutex<Option<Subscription>>,
    attempts: AtomicU32,
}

impl EventHandler {
    /// Creates a handler; the connection is managed by the repeat loop,
    /// so every operation below is safe to call before it starts.
    pub fn new(
        config: EventbusConfig,
        broker: Arc<dyn Broker>,
        scheduler: Arc<TaskScheduler>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            config,
            broker,
            scheduler,
            state_tx,
            subs: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            ops: OpQueue::default(),
            inflight: StdMutex::new(None),
            attempts: AtomicU32::new(0),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// True while the connection is live.
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// The configuration this handler was built with.
    pub fn config(&self) -> &EventbusConfig {
        &self.config
    }

    /// Waits until the connection reaches `Ready`, bounded by `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), BusError> {
        let mut rx = self.state_tx.subscribe();
        let ready = async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Ready {
                    return Ok(());
                }
                rx.changed()
                    .await
                    .map_err(|_| BusError::connection("handler dropped"))?;
            }
        };
        match time::timeout(timeout, ready).await {
            Ok(res) => res,
            Err(_) => Err(BusError::Timeout { timeout }),
        }
    }

    /// Subscribes to a topic filter on the default exchange.
    ///
    /// Idempotent. Safe before any connection exists (the declare is
    /// queued) and while connected (applied live). Rejects syntactically
    /// invalid filters up front. To receive callbacks,
    /// [`listen`](Self::listen) must also be used.
    pub async fn subscribe(&self, filter: impl Into<String>) -> Result<(), BusError> {
        self.subscribe_with(Subscription::topic(filter)).await
    }

    /// Subscribes with an explicit exchange and kind.
    pub async fn subscribe_with(&self, sub: Subscription) -> Result<(), BusError> {
        if !valid_filter(&sub.filter) {
            return Err(BusError::protocol(format!(
                "invalid filter {:?}: '#' must be the final segment",
                sub.filter
            )));
        }

        let duplicate = self.subs.read().await.contains(&sub)
            || self.ops.contains_declare(&sub)
            || self.inflight.lock().unwrap().as_ref() == Some(&sub);
        if duplicate {
            debug!(filter = %sub.filter, "already subscribed");
            return Ok(());
        }
        info!(filter = %sub.filter, "subscribe");
        self.ops.push_back(Op::Declare(sub));
        Ok(())
    }

    /// Removes a subscription set by [`subscribe`](Self::subscribe).
    ///
    /// Best-effort unbind on the broker if connected. Does nothing if no
    /// subscription matches the filter.
    pub async fn unsubscribe(&self, filter: &str) {
        info!(filter = %filter, "unsubscribe");
        self.ops.remove_declares(filter);

        // A declare mid-flight on the broker is dropped at its completion
        // point in the serve loop.
        {
            let mut inflight = self.inflight.lock().unwrap();
            if inflight.as_ref().is_some_and(|s| s.filter == filter) {
                *inflight = None;
            }
        }

        let removed = {
            let mut subs = self.subs.write().await;
            subs.iter()
                .position(|s| s.filter == filter)
                .map(|pos| subs.remove(pos))
        };
        if let Some(sub) = removed {
            if self.connected() {
                self.ops.push_back(Op::Unbind(sub));
            }
        }
    }

    /// Attaches a listener callback for topics matching `pattern`.
    ///
    /// Purely local bookkeeping, no broker interaction; multiple listeners
    /// may share one subscription's filter space.
    pub async fn listen(&self, pattern: impl Into<String>, listener: ListenerRef) {
        let pattern = pattern.into();
        info!(pattern = %pattern, "listen");
        self.listeners.write().await.push((pattern, listener));
    }

    /// Removes a listener set by [`listen`](Self::listen).
    ///
    /// Both the pattern and the callback identity must match. Does nothing
    /// if no such listener exists.
    pub async fn unlisten(&self, pattern: &str, listener: &ListenerRef) {
        info!(pattern = %pattern, "unlisten");
        let mut listeners = self.listeners.write().await;
        if let Some(pos) = listeners
            .iter()
            .position(|(p, l)| p == pattern && Arc::ptr_eq(l, listener))
        {
            listeners.remove(pos);
        }
    }

    /// Publishes a message.
    ///
    /// Connection failures are retried once immediately; afterwards the
    /// error is surfaced, unless the request was marked
    /// [`silent`](Publish::silent), in which case the call returns `Ok`.
    pub async fn publish(&self, publish: Publish) -> Result<(), BusError> {
        let surface = publish.err;
        let timeout = publish
            .timeout
            .unwrap_or(self.config.interaction_timeout * 2);
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };

        match self.try_publish(message, timeout).await {
            Ok(()) => Ok(()),
            Err(err) if !surface => {
                debug!(error = %err, "publish suppressed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Publishes `value` as a JSON payload. Shorthand for
    /// [`Publish::json`] + [`publish`](Self::publish).
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: impl Into<String>,
        value: &T,
    ) -> Result<(), BusError> {
        let publish = Publish::json(topic, value)
            .map_err(|e| BusError::protocol(format!("payload serialization failed: {e}")))?;
        self.publish(publish).await
    }

    /// One attempt plus one immediate retry on a retryable failure.
    async fn try_publish(&self, message: Message, timeout: Duration) -> Result<(), BusError> {
        let mut last = BusError::connection("not connected");
        for attempt in 0..2 {
            if !self.connected() {
                last = BusError::connection(format!("not connected to {}", self.config));
                continue;
            }

            let (reply, rx) = oneshot::channel();
            self.ops.push_back(Op::Publish {
                message: message.clone(),
                reply,
            });

            match time::timeout(timeout, rx).await {
                Ok(Ok(Ok(()))) => return Ok(()),
                Ok(Ok(Err(err))) => {
                    if !(err.is_retryable() && attempt == 0) {
                        return Err(err);
                    }
                    last = err;
                }
                Ok(Err(_dropped)) => {
                    last = BusError::connection("connection lost before the publish applied");
                }
                Err(_) => return Err(BusError::Timeout { timeout }),
            }
        }
        Err(last)
    }

    /// Bounds one broker round-trip by the configured interaction timeout.
    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BusError>>,
    ) -> Result<T, BusError> {
        match time::timeout(self.config.interaction_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(BusError::Timeout {
                timeout: self.config.interaction_timeout,
            }),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = *self.state_tx.borrow();
        if prev != next {
            debug!(from = ?prev, to = ?next, "connection state");
            self.state_tx.send_replace(next);
        }
    }

    /// Transitions to `Disconnected`, sleeps the backoff delay (cancellable)
    /// and hands the error to the outer repeat loop.
    async fn recover(&self, ctx: &CancellationToken, err: BusError) -> Result<(), RepeatError> {
        self.set_state(ConnectionState::Disconnected);
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.backoff.next(attempt);

        tokio::select! {
            _ = ctx.cancelled() => {
                self.set_state(ConnectionState::Closed);
                return Err(RepeatError::Cancelled);
            }
            _ = time::sleep(delay) => {}
        }
        Err(RepeatError::from(err))
    }

    /// Applies queued operations and dispatches inbound messages until the
    /// connection fails or shutdown is requested.
    async fn serve(&self, ctx: &CancellationToken, link: &mut dyn BrokerLink) -> ServeExit {
        loop {
            let step = tokio::select! {
                _ = ctx.cancelled() => Step::Cancelled,
                delivery = link.recv() => Step::Delivery(delivery),
                op = self.ops.pop(self.config.pending_wait) => Step::Op(op),
            };

            match step {
                Step::Cancelled => return ServeExit::Cancelled,
                Step::Delivery(Ok(delivery)) => {
                    if let Err(err) = self.dispatch(link, delivery).await {
                        return ServeExit::Failed(err);
                    }
                }
                Step::Delivery(Err(err)) => return ServeExit::Failed(err),
                // Bounded wait expired with nothing queued: loop around so
                // cancellation and connection liveness are rechecked.
                Step::Op(None) => {}
                Step::Op(Some(Op::Declare(sub))) => {
                    if self.subs.read().await.contains(&sub) {
                        debug!(filter = %sub.filter, "already declared");
                        continue;
                    }
                    *self.inflight.lock().unwrap() = Some(sub.clone());
                    let res = self.timed(link.declare(&sub)).await;
                    // unsubscribe clears the slot while the declare is in
                    // flight; an empty slot means the sub is unwanted now.
                    let wanted = self.inflight.lock().unwrap().take().is_some();
                    match res {
                        Ok(()) if wanted => {
                            debug!(filter = %sub.filter, "declared");
                            self.subs.write().await.push(sub);
                        }
                        Ok(()) => {
                            debug!(filter = %sub.filter, "unsubscribed mid-declare");
                            if let Err(err) = self.timed(link.unbind(&sub)).await {
                                debug!(filter = %sub.filter, error = %err, "unbind failed");
                            }
                        }
                        Err(err) => {
                            // Reconnect and retry from scratch, keeping the
                            // registry and the broker consistent.
                            if wanted {
                                self.ops.push_front(Op::Declare(sub));
                            }
                            return ServeExit::Failed(err);
                        }
                    }
                }
                Step::Op(Some(Op::Unbind(sub))) => {
                    if let Err(err) = self.timed(link.unbind(&sub)).await {
                        debug!(filter = %sub.filter, error = %err, "unbind failed");
                    }
                }
                Step::Op(Some(Op::Publish { message, reply })) => {
                    match self.timed(link.send(&message)).await {
                        Ok(()) => {
                            debug!(topic = %message.topic, "published");
                            let _ = reply.send(Ok(()));
                        }
                        Err(err) => {
                            let lost = err.is_retryable();
                            let _ = reply.send(Err(err));
                            if lost {
                                return ServeExit::Failed(BusError::connection(
                                    "publish failed; reconnecting",
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Acknowledges one delivery, then dispatches every matching listener
    /// as an independent task.
    async fn dispatch(&self, link: &mut dyn BrokerLink, delivery: Delivery) -> Result<(), BusError> {
        if let Some(token) = delivery.ack_token {
            self.timed(link.ack(token)).await?;
        }

        let topic = delivery.message.topic;
        let payload = delivery.message.payload;

        let matched: Vec<ListenerRef> = self
            .listeners
            .read()
            .await
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, &topic))
            .map(|(_, listener)| listener.clone())
            .collect();

        if matched.is_empty() {
            debug!(topic = %topic, "no listener matched; dropping");
            return Ok(());
        }

        for listener in matched {
            let topic = topic.clone();
            let payload = payload.clone();
            self.scheduler
                .create("eventbus-dispatch", move |dctx| async move {
                    if dctx.is_cancelled() {
                        return;
                    }
                    // AssertUnwindSafe: the callback owns its captures; a
                    // panic cannot corrupt handler state.
                    let call =
                        std::panic::AssertUnwindSafe(listener.on_message(&topic, &payload));
                    match call.catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!(topic = %topic, error = %err, "listener callback failed");
                        }
                        Err(_panic) => {
                            warn!(topic = %topic, "listener callback panicked");
                        }
                    }
                })
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl Repeat for EventHandler {
    fn name(&self) -> &str {
        "eventbus"
    }

    async fn prepare(&self, _ctx: CancellationToken) -> Result<(), RepeatError> {
        self.config.validate()?;
        info!(address = %self.config.address(), "starting eventbus handler");
        Ok(())
    }

    /// One reconnect-and-serve cycle.
    async fn run(&self, ctx: CancellationToken) -> Result<(), RepeatError> {
        self.set_state(ConnectionState::Connecting);

        let mut link = tokio::select! {
            _ = ctx.cancelled() => {
                self.set_state(ConnectionState::Closed);
                return Err(RepeatError::Cancelled);
            }
            res = self.timed(self.broker.connect(&self.config)) => match res {
                Ok(link) => link,
                Err(err) => return self.recover(&ctx, err).await,
            }
        };

        // Restore every registered subscription, oldest first, before
        // applying anything new.
        let existing = self.subs.read().await.clone();
        for sub in &existing {
            debug!(filter = %sub.filter, "redeclare");
            if let Err(err) = self.timed(link.declare(sub)).await {
                let _ = link.close().await;
                return self.recover(&ctx, err).await;
            }
        }

        self.attempts.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Ready);
        info!(address = %self.config.address(), "connected");

        match self.serve(&ctx, link.as_mut()).await {
            ServeExit::Cancelled => {
                let _ = link.close().await;
                self.set_state(ConnectionState::Closed);
                Err(RepeatError::Cancelled)
            }
            ServeExit::Failed(err) => {
                let _ = link.close().await;
                self.recover(&ctx, err).await
            }
        }
    }
}
