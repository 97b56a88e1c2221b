//! In-process event bus with per-subscriber retry and dead-lettering.
//!
//! ## Delivery model
//!
//! Publishers enqueue onto one bounded queue; when it is full they block,
//! which is the bus's back-pressure. A dispatcher task routes each event
//! to the queue of every subscriber registered for its kind. Each
//! subscriber runs in its own cooperative task, so one slow handler does
//! not stall the others.
//!
//! ## Ordering
//!
//! Events published from one task reach each subscriber in publish order
//! (per-subscriber FIFO). There is no cross-subscriber ordering.
//!
//! ## Failure handling
//!
//! A handler failure is any returned error. The failing subscriber is
//! retried with exponential backoff (initial delay, multiplier, attempt
//! cap from [`BusConfig`]); other subscribers of the same event are
//! unaffected. Once attempts are exhausted the event is persisted to the
//! dead-letter queue with the last error, and that subscriber moves on.
//! The business operation that produced the event is never rolled back;
//! the audit log already records it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::BusConfig;
use crate::dlq::DeadLetter;
use crate::error::{Error, Result};
use crate::events::{EventKind, FlowEvent};
use crate::metrics::{labels, names};
use crate::store::Store;

/// A subscriber invoked for every event of the kinds it registered for.
///
/// Handlers share this single signature; dynamic dispatch across
/// heterogeneous handlers happens through the [`FlowEvent`] tagged
/// variant, not through downcasting.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs, metrics, and dead letters.
    fn name(&self) -> &str;

    /// Handles one event. Returning an error triggers redelivery.
    async fn handle(&self, event: &FlowEvent) -> Result<()>;
}

struct Subscription {
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    subscriptions: Vec<Subscription>,
    publish_rx: Option<mpsc::Receiver<FlowEvent>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// Single-process publish/subscribe bus.
pub struct EventBus {
    publish_tx: mpsc::Sender<FlowEvent>,
    config: BusConfig,
    store: Arc<dyn Store>,
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Creates a bus over the given store (used for dead-lettering).
    #[must_use]
    pub fn new(config: BusConfig, store: Arc<dyn Store>) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(config.queue_size);
        Self {
            publish_tx,
            config,
            store,
            inner: Mutex::new(BusInner {
                subscriptions: Vec::new(),
                publish_rx: Some(publish_rx),
                tasks: Vec::new(),
                shutdown_tx: None,
            }),
        }
    }

    /// Registers a handler for one event kind.
    ///
    /// Multiple handlers per kind fan out independently. Must be called
    /// before [`EventBus::start`]; later registrations are ignored.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut inner = self.inner.lock().expect("bus registry lock poisoned");
        if inner.publish_rx.is_none() {
            tracing::warn!(
                kind = %kind,
                handler = handler.name(),
                "subscribe after start ignored"
            );
            return;
        }
        tracing::debug!(kind = %kind, handler = handler.name(), "event handler subscribed");
        inner.subscriptions.push(Subscription { kind, handler });
    }

    /// Publishes one event.
    ///
    /// Blocks while the bounded publish queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusClosed`] after shutdown.
    pub async fn publish(&self, event: FlowEvent) -> Result<()> {
        counter!(names::EVENTS_PUBLISHED_TOTAL, labels::KIND => event.kind.as_str())
            .increment(1);
        self.publish_tx
            .send(event)
            .await
            .map_err(|_| Error::BusClosed)
    }

    /// Publishes a batch in order, typically an outbox drained post-commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusClosed`] after shutdown.
    pub async fn publish_all(&self, events: Vec<FlowEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Starts the dispatcher and one worker task per subscription.
    ///
    /// Idempotent; the second and later calls do nothing.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("bus registry lock poisoned");
        let Some(publish_rx) = inner.publish_rx.take() else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // One bounded queue and one worker per subscription. The
        // dispatcher awaiting a full subscriber queue propagates
        // back-pressure to publishers through the main queue.
        let mut routes: Vec<(EventKind, mpsc::Sender<FlowEvent>)> = Vec::new();
        let subscriptions: Vec<_> = inner.subscriptions.drain(..).collect();
        for subscription in subscriptions {
            let (tx, rx) = mpsc::channel::<FlowEvent>(self.config.queue_size);
            routes.push((subscription.kind, tx));
            inner.tasks.push(tokio::spawn(subscriber_worker(
                subscription.handler,
                rx,
                self.config.clone(),
                Arc::clone(&self.store),
            )));
        }

        inner.tasks.push(tokio::spawn(dispatcher(
            publish_rx,
            routes,
            shutdown_rx,
        )));
        inner.shutdown_tx = Some(shutdown_tx);
        tracing::info!("event bus started");
    }

    /// Stops the bus: the dispatcher drains already-queued events, worker
    /// queues close, and all tasks are joined.
    pub async fn shutdown(&self) {
        let (shutdown_tx, tasks) = {
            let mut inner = self.inner.lock().expect("bus registry lock poisoned");
            (inner.shutdown_tx.take(), std::mem::take(&mut inner.tasks))
        };

        let Some(shutdown_tx) = shutdown_tx else {
            return;
        };
        let _ = shutdown_tx.send(true);

        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "bus task join failed");
            }
        }
        tracing::info!("event bus stopped");
    }
}

async fn dispatcher(
    mut publish_rx: mpsc::Receiver<FlowEvent>,
    routes: Vec<(EventKind, mpsc::Sender<FlowEvent>)>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = publish_rx.recv() => {
                let Some(event) = event else { break };
                dispatch_one(&routes, event).await;
            }
            _ = shutdown_rx.changed() => {
                // Drain whatever was already enqueued, then stop. Worker
                // queues close when the route senders drop below.
                while let Ok(event) = publish_rx.try_recv() {
                    dispatch_one(&routes, event).await;
                }
                break;
            }
        }
    }
}

async fn dispatch_one(routes: &[(EventKind, mpsc::Sender<FlowEvent>)], event: FlowEvent) {
    let sends = routes
        .iter()
        .filter(|(kind, _)| *kind == event.kind)
        .map(|(_, tx)| tx.send(event.clone()));

    let results = futures::future::join_all(sends).await;
    if results.is_empty() {
        tracing::debug!(kind = %event.kind, "no handlers registered for event");
        return;
    }
    for result in results {
        if result.is_err() {
            tracing::error!(kind = %event.kind, "subscriber queue closed; event dropped");
        }
    }
}

async fn subscriber_worker(
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::Receiver<FlowEvent>,
    config: BusConfig,
    store: Arc<dyn Store>,
) {
    while let Some(event) = rx.recv().await {
        deliver_with_retry(handler.as_ref(), &event, &config, store.as_ref()).await;
    }
}

/// Delivers one event to one handler, retrying with exponential backoff
/// and dead-lettering once attempts are exhausted.
async fn deliver_with_retry(
    handler: &dyn EventHandler,
    event: &FlowEvent,
    config: &BusConfig,
    store: &dyn Store,
) {
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.backoff_initial;

    for attempt in 1..=max_attempts {
        counter!(names::BUS_DELIVERIES_TOTAL, labels::HANDLER => handler.name().to_string())
            .increment(1);

        let error = match handler.handle(event).await {
            Ok(()) => return,
            Err(error) => error,
        };

        if attempt == max_attempts {
            tracing::error!(
                handler = handler.name(),
                kind = %event.kind,
                event_id = %event.id,
                attempts = attempt,
                error = %error,
                "event delivery exhausted retries; dead-lettering"
            );
            dead_letter(event, handler, attempt, &error, store).await;
            return;
        }

        tracing::warn!(
            handler = handler.name(),
            kind = %event.kind,
            event_id = %event.id,
            attempt,
            error = %error,
            retry_in = ?delay,
            "event handler failed; will retry"
        );
        counter!(names::BUS_RETRIES_TOTAL, labels::HANDLER => handler.name().to_string())
            .increment(1);
        tokio::time::sleep(delay).await;
        delay = delay.mul_f64(config.backoff_multiplier);
    }
}

async fn dead_letter(
    event: &FlowEvent,
    handler: &dyn EventHandler,
    attempts: u32,
    error: &Error,
    store: &dyn Store,
) {
    counter!(names::DEAD_LETTERS_TOTAL, labels::HANDLER => handler.name().to_string())
        .increment(1);

    let payload = match serde_json::to_value(event) {
        Ok(payload) => payload,
        Err(err) => serde_json::json!({"unserializable_event": err.to_string()}),
    };

    let entry = DeadLetter::new(
        event.kind.as_str(),
        payload,
        format!("{} (handler {})", error, handler.name()),
        attempts,
        Some(event.workflow_id()),
    );

    if let Err(err) = store.insert_dead_letter(&entry).await {
        tracing::error!(
            handler = handler.name(),
            event_id = %event.id,
            error = %err,
            "dead-letter write failed; event lost"
        );
    }
}
