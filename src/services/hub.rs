//! Event dispatch hub - fan-out of domain events to live subscribers
//!
//! Each subscriber owns a bounded queue. `publish` uses `try_send` so a slow
//! subscriber loses events instead of stalling the publisher or its peers.
//! The registry lock is held only for non-blocking queue operations.

use crate::domain::{epoch_ms, DomainEvent, PoleMapping, PoleState};
use crate::infra::metrics::Metrics;
use crate::io::wire;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Per-connection subscriber identity, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One event plus its wire encoding, serialized once per publish
#[derive(Debug)]
pub struct HubMessage {
    pub event: DomainEvent,
    pub json: String,
}

impl HubMessage {
    fn encode(event: DomainEvent) -> Option<Arc<Self>> {
        match wire::encode(&event, epoch_ms()) {
            Ok(json) => Some(Arc::new(Self { event, json })),
            Err(e) => {
                error!(error = %e, event = %event.name(), "hub_serialize_failed");
                None
            }
        }
    }
}

/// Receiving side handed to one subscriber connection
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<HubMessage>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next message; `None` once the subscriber was unregistered
    pub async fn recv(&mut self) -> Option<Arc<HubMessage>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<HubMessage>> {
        self.rx.try_recv().ok()
    }
}

pub struct EventDispatchHub {
    subscribers: Mutex<FxHashMap<SubscriberId, mpsc::Sender<Arc<HubMessage>>>>,
    /// Sent to every new subscriber before anything else
    baseline: Option<DomainEvent>,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl EventDispatchHub {
    pub fn new(buffer: usize, baseline: Option<DomainEvent>, metrics: Arc<Metrics>) -> Self {
        Self {
            subscribers: Mutex::new(FxHashMap::default()),
            baseline,
            buffer: buffer.max(1),
            metrics,
        }
    }

    /// Hub whose connect-time baseline reports the first mapped pole as nominal
    pub fn with_pole_baseline(poles: &PoleMapping, buffer: usize, metrics: Arc<Metrics>) -> Self {
        let baseline = poles.first().map(|id| DomainEvent::pole(id, PoleState::Ok));
        Self::new(buffer, baseline, metrics)
    }

    /// Register a subscriber.
    ///
    /// The baseline message is queued before the subscriber becomes visible
    /// to `publish`, so it always arrives first.
    pub fn register(&self) -> Subscription {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.buffer);

        if let Some(message) = self.baseline.clone().and_then(HubMessage::encode) {
            // Fresh queue with capacity >= 1 cannot be full
            let _ = tx.try_send(message);
        }

        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        self.metrics.set_subscribers(count);

        info!(subscriber = %id, subscribers = %count, "subscriber_registered");
        Subscription { id, rx }
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.subscribers.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };

        if removed {
            self.metrics.set_subscribers(count);
            info!(subscriber = %id, subscribers = %count, "subscriber_unregistered");
        }
        removed
    }

    /// Deliver an event to every registered subscriber, best effort.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: DomainEvent) -> usize {
        self.metrics.record_hub_published();

        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            debug!(event = %event.name(), "hub_publish_no_subscribers");
            return 0;
        }

        let Some(message) = HubMessage::encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed: Vec<SubscriberId> = Vec::new();

        for (id, tx) in subscribers.iter() {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_hub_dropped();
                    debug!(subscriber = %id, event = %message.event.name(), "hub_subscriber_lagging_dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in &closed {
            subscribers.remove(id);
            debug!(subscriber = %id, "hub_pruned_closed_subscriber");
        }
        if !closed.is_empty() {
            self.metrics.set_subscribers(subscribers.len());
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
