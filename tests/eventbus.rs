//! End-to-end eventbus tests against the in-process broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use eventvisor::{
    eventbus, App, BackoffPolicy, Broker, BrokerLink, BusError, ConnectionState, Delivery,
    EventbusConfig, Jitter, ListenerFn, ListenerRef, MemoryBroker, Message, Publish, Subscription,
};

/// Wraps a broker so every declare takes a while, widening the window in
/// which a subscription is applied but not yet registered.
struct SlowDeclareBroker {
    inner: Arc<MemoryBroker>,
    delay: Duration,
}

#[async_trait]
impl Broker for SlowDeclareBroker {
    async fn connect(&self, config: &EventbusConfig) -> Result<Box<dyn BrokerLink>, BusError> {
        let link = self.inner.connect(config).await?;
        Ok(Box::new(SlowDeclareLink {
            link,
            delay: self.delay,
        }))
    }
}

struct SlowDeclareLink {
    link: Box<dyn BrokerLink>,
    delay: Duration,
}

#[async_trait]
impl BrokerLink for SlowDeclareLink {
    async fn declare(&mut self, sub: &Subscription) -> Result<(), BusError> {
        time::sleep(self.delay).await;
        self.link.declare(sub).await
    }

    async fn unbind(&mut self, sub: &Subscription) -> Result<(), BusError> {
        self.link.unbind(sub).await
    }

    async fn send(&mut self, message: &Message) -> Result<(), BusError> {
        self.link.send(message).await
    }

    async fn recv(&mut self) -> Result<Delivery, BusError> {
        self.link.recv().await
    }

    async fn ack(&mut self, token: u64) -> Result<(), BusError> {
        self.link.ack(token).await
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.link.close().await
    }
}

fn fast_config() -> EventbusConfig {
    EventbusConfig {
        backoff: BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 1.0,
            jitter: Jitter::None,
        },
        pending_wait: Duration::from_millis(20),
        interaction_timeout: Duration::from_millis(500),
        ..EventbusConfig::default()
    }
}

async fn started_app(broker: Arc<MemoryBroker>) -> App {
    let mut app = App::new();
    eventbus::setup(&mut app, fast_config(), broker);
    app.start().await;
    app
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting until {what}");
}

fn counting_listener(hits: Arc<AtomicUsize>) -> ListenerRef {
    ListenerFn::arc(move |_topic: String, _payload: Vec<u8>| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BusError>(())
        }
    })
}

#[tokio::test]
async fn subscribe_before_start_declares_on_connect() {
    let broker = MemoryBroker::new();
    let mut app = App::new();
    eventbus::setup(&mut app, fast_config(), broker.clone());

    let handler = eventbus::get(&app).handler().clone();
    handler.subscribe("brewcast/#").await.unwrap();
    handler.subscribe("brewcast/#").await.unwrap(); // idempotent
    assert_eq!(broker.declared().len(), 0);

    app.start().await;
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    let b = broker.clone();
    wait_until("subscription declared", move || b.declared().len() == 1).await;
    assert_eq!(broker.declared()[0].filter, "brewcast/#");

    app.shutdown().await;
}

#[tokio::test]
async fn reconnect_redeclares_in_registration_order() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();

    handler.subscribe("alpha/#").await.unwrap();
    handler.subscribe("beta/#").await.unwrap();
    let b = broker.clone();
    wait_until("both subscriptions declared", move || b.declared().len() == 2).await;

    for round in 1..=3usize {
        broker.kick_all();
        let b = broker.clone();
        let expected = 2 * (round + 1);
        wait_until("redeclare after kick", move || b.declared().len() == expected).await;
    }

    let filters: Vec<String> = broker.declared().iter().map(|s| s.filter.clone()).collect();
    assert_eq!(
        filters,
        vec!["alpha/#", "beta/#", "alpha/#", "beta/#", "alpha/#", "beta/#", "alpha/#", "beta/#"]
    );

    app.shutdown().await;
}

#[tokio::test]
async fn wildcard_listeners_fan_out() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    handler.subscribe("brewcast/#").await.unwrap();
    let b = broker.clone();
    wait_until("subscription declared", move || b.declared().len() == 1).await;

    let broad = Arc::new(AtomicUsize::new(0));
    let narrow = Arc::new(AtomicUsize::new(0));
    let unrelated = Arc::new(AtomicUsize::new(0));
    handler.listen("brewcast/#", counting_listener(broad.clone())).await;
    handler
        .listen("brewcast/state/+", counting_listener(narrow.clone()))
        .await;
    handler
        .listen("flapjacks/#", counting_listener(unrelated.clone()))
        .await;

    handler
        .publish(Publish::new("brewcast/state/spark", b"{}".to_vec()))
        .await
        .unwrap();

    let (b1, b2) = (broad.clone(), narrow.clone());
    wait_until("both matching listeners hit", move || {
        b1.load(Ordering::SeqCst) == 1 && b2.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(unrelated.load(Ordering::SeqCst), 0);

    // Each delivery is acknowledged exactly once, not per listener.
    assert_eq!(broker.acked_count(), 1);

    app.shutdown().await;
}

#[tokio::test]
async fn publish_surfaces_or_suppresses_disconnect_errors() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    handler.subscribe("audit/#").await.unwrap();
    let b = broker.clone();
    wait_until("subscription declared", move || b.declared().len() == 1).await;

    let topics = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = topics.clone();
    handler
        .listen(
            "audit/#",
            ListenerFn::arc(move |topic: String, _payload: Vec<u8>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(topic);
                    Ok::<_, BusError>(())
                }
            }),
        )
        .await;

    broker.set_offline(true);
    broker.kick_all();
    let h = handler.clone();
    wait_until("handler noticed the disconnect", move || !h.connected()).await;

    let err = handler
        .publish(Publish::new("audit/event", b"x".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Connection { .. }));

    handler
        .publish(Publish::new("audit/suppressed", b"x".to_vec()).silent())
        .await
        .unwrap();

    // Back online: normal publishing resumes.
    broker.set_offline(false);
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();
    handler
        .publish(Publish::new("audit/online", b"x".to_vec()))
        .await
        .unwrap();

    // Only the post-reconnect publish arrives; nothing published while
    // disconnected was queued for later delivery.
    let t = topics.clone();
    wait_until("post-reconnect publish dispatched", move || {
        !t.lock().unwrap().is_empty()
    })
    .await;
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*topics.lock().unwrap(), vec!["audit/online".to_string()]);

    app.shutdown().await;
}

#[tokio::test]
async fn duplicate_subscribe_during_slow_declare_is_ignored() {
    let broker = MemoryBroker::new();
    let mut app = App::new();
    eventbus::setup(
        &mut app,
        fast_config(),
        Arc::new(SlowDeclareBroker {
            inner: broker.clone(),
            delay: Duration::from_millis(200),
        }),
    );
    app.start().await;

    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    // The second subscribe lands while the first declare is still on the
    // wire; the broker must see a single declare.
    handler.subscribe("x/#").await.unwrap();
    time::sleep(Duration::from_millis(80)).await;
    handler.subscribe("x/#").await.unwrap();

    let b = broker.clone();
    wait_until("first declare landed", move || b.declared().len() == 1).await;
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.declared().len(), 1);

    app.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_during_slow_declare_wins() {
    let broker = MemoryBroker::new();
    let mut app = App::new();
    eventbus::setup(
        &mut app,
        fast_config(),
        Arc::new(SlowDeclareBroker {
            inner: broker.clone(),
            delay: Duration::from_millis(200),
        }),
    );
    app.start().await;

    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    handler.subscribe("x/#").await.unwrap();
    time::sleep(Duration::from_millis(80)).await;
    handler.unsubscribe("x/#").await;

    let b = broker.clone();
    wait_until("in-flight declare landed", move || b.declared().len() == 1).await;

    // The subscription must not survive into the registry: after a broker
    // restart nothing is redeclared.
    broker.kick_all();
    let b = broker.clone();
    wait_until("reconnected", move || b.client_count() == 1).await;
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.declared().len(), 1);

    app.shutdown().await;
}

#[tokio::test]
async fn invalid_filter_rejected_at_subscribe() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    let err = handler.subscribe("a/#/b").await.unwrap_err();
    assert!(matches!(err, BusError::Protocol { .. }));

    // The typo never reaches the broker and later subscribes are unaffected.
    handler.subscribe("a/#").await.unwrap();
    let b = broker.clone();
    wait_until("valid subscription declared", move || b.declared().len() == 1).await;
    assert_eq!(broker.declared()[0].filter, "a/#");

    app.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_stops_future_redeclares() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();

    handler.subscribe("alpha/#").await.unwrap();
    handler.subscribe("beta/#").await.unwrap();
    let b = broker.clone();
    wait_until("both subscriptions declared", move || b.declared().len() == 2).await;

    handler.unsubscribe("alpha/#").await;
    broker.kick_all();
    let b = broker.clone();
    wait_until("redeclare after kick", move || b.declared().len() == 3).await;

    let filters: Vec<String> = broker.declared().iter().map(|s| s.filter.clone()).collect();
    assert_eq!(filters, vec!["alpha/#", "beta/#", "beta/#"]);

    app.shutdown().await;
}

#[tokio::test]
async fn unlisten_detaches_a_single_callback() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    handler.subscribe("sensors/#").await.unwrap();
    let b = broker.clone();
    wait_until("subscription declared", move || b.declared().len() == 1).await;

    let kept = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    let kept_listener = counting_listener(kept.clone());
    let dropped_listener = counting_listener(dropped.clone());
    handler.listen("sensors/#", kept_listener).await;
    handler.listen("sensors/#", dropped_listener.clone()).await;
    handler.unlisten("sensors/#", &dropped_listener).await;

    handler
        .publish(Publish::new("sensors/temp", b"21.5".to_vec()))
        .await
        .unwrap();

    let k = kept.clone();
    wait_until("remaining listener hit", move || k.load(Ordering::SeqCst) == 1).await;
    assert_eq!(dropped.load(Ordering::SeqCst), 0);

    app.shutdown().await;
}

#[tokio::test]
async fn json_payloads_round_trip() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();

    handler.subscribe("brewcast/state/#").await.unwrap();
    let b = broker.clone();
    wait_until("subscription declared", move || b.declared().len() == 1).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    handler
        .listen(
            "brewcast/state/+",
            ListenerFn::arc(move |_topic: String, payload: Vec<u8>| {
                let sink = sink.clone();
                async move {
                    let value: serde_json::Value = serde_json::from_slice(&payload)
                        .map_err(|e| BusError::callback(e.to_string()))?;
                    sink.lock().unwrap().push(value);
                    Ok(())
                }
            }),
        )
        .await;

    handler
        .publish_json("brewcast/state/spark", &serde_json::json!({ "setpoint": 65.5 }))
        .await
        .unwrap();

    let s = seen.clone();
    wait_until("json payload dispatched", move || !s.lock().unwrap().is_empty()).await;
    assert_eq!(seen.lock().unwrap()[0]["setpoint"], 65.5);

    app.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_cleanly() {
    let broker = MemoryBroker::new();
    let app = started_app(broker.clone()).await;
    let handler = eventbus::get(&app).handler().clone();
    handler.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(broker.client_count(), 1);

    app.shutdown().await;

    assert_eq!(handler.state(), ConnectionState::Closed);
    assert!(!eventbus::get(&app).active().await);
    assert_eq!(broker.client_count(), 0);
}
