//! Notification hub - fans occupancy events out to live observers
//!
//! The registry maps each subscription to a queue drained by a dedicated
//! writer task that owns the observer's connection. Broadcasting never waits
//! on an observer. A burst only grows the queue; an observer is dropped when
//! it closes, fails a delivery, or leaves one delivery pending longer than
//! the stall timeout.
//!
//! The registry mutex is held for the whole of a broadcast pass, which keeps
//! register/unregister from interleaving with iteration.

mod worker;

pub use worker::{create_hub, DeliveryWorker};

use crate::domain::{OccupancyEvent, SubscriptionId};
use crate::infra::metrics::Metrics;
use crate::io::observer::ObserverConnection;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time a single delivery may take before the observer is dropped
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

struct ObserverSlot {
    tx: mpsc::UnboundedSender<OccupancyEvent>,
    writer: AbortHandle,
    label: String,
}

/// Why an observer left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Unregistered,
    Stalled,
    Closed,
    DeliveryFailed,
}

impl Removal {
    fn as_str(&self) -> &'static str {
        match self {
            Removal::Unregistered => "unregistered",
            Removal::Stalled => "stalled",
            Removal::Closed => "closed",
            Removal::DeliveryFailed => "delivery_failed",
        }
    }

    fn is_failure(&self) -> bool {
        *self != Removal::Unregistered
    }
}

/// Registry of live observers
pub struct NotificationHub {
    observers: Mutex<FxHashMap<SubscriptionId, ObserverSlot>>,
    next_id: AtomicU64,
    stall_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl NotificationHub {
    pub fn new(stall_timeout: Duration, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            observers: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            stall_timeout: stall_timeout.max(Duration::from_millis(1)),
            metrics,
        })
    }

    /// Register an observer. Must be called from within a tokio runtime.
    pub fn register<C: ObserverConnection>(self: &Arc<Self>, connection: C) -> SubscriptionId {
        self.register_with_snapshot(connection, Vec::new)
    }

    /// Register an observer and queue `snapshot()` ahead of any broadcast.
    ///
    /// The snapshot is taken while the registry is locked, so no event can be
    /// broadcast between reading it and the observer joining.
    pub fn register_with_snapshot<C, F>(self: &Arc<Self>, connection: C, snapshot: F) -> SubscriptionId
    where
        C: ObserverConnection,
        F: FnOnce() -> Vec<OccupancyEvent>,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = connection.label();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut observers = self.observers.lock();
        let initial = snapshot();
        let queued = initial.len();
        for event in initial {
            // rx is still held here, so the send cannot fail
            let _ = tx.send(event);
        }

        let writer = tokio::spawn(run_writer(
            Arc::downgrade(self),
            id,
            connection,
            rx,
            self.stall_timeout,
            self.metrics.clone(),
        ));
        observers.insert(id, ObserverSlot { tx, writer: writer.abort_handle(), label: label.clone() });
        let active = observers.len();
        drop(observers);

        self.metrics.record_observer_registered();
        info!(subscription_id = %id, observer = %label, snapshot = %queued, active = %active, "observer_registered");
        id
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.remove(id, Removal::Unregistered)
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Queue an event for every observer. Observers that have gone away are dropped.
    pub fn broadcast(&self, event: OccupancyEvent) {
        let mut failed: SmallVec<[(SubscriptionId, Removal); 4]> = SmallVec::new();

        let mut observers = self.observers.lock();
        for (id, slot) in observers.iter() {
            if slot.tx.send(event).is_err() {
                failed.push((*id, Removal::Closed));
            }
        }
        for (id, reason) in failed {
            if let Some(slot) = observers.remove(&id) {
                self.retire(id, slot, reason);
            }
        }
    }

    /// Drop every observer; writers finish what is already queued
    pub fn close_all(&self) {
        let drained: Vec<(SubscriptionId, ObserverSlot)> = self.observers.lock().drain().collect();
        let count = drained.len();
        for (id, slot) in drained {
            // Closing the queue lets the writer drain and exit on its own
            drop(slot.tx);
            self.metrics.record_observer_removed(false);
            debug!(subscription_id = %id, observer = %slot.label, "observer_closed");
        }
        if count > 0 {
            info!(observers = %count, "hub_closed");
        }
    }

    fn remove(&self, id: SubscriptionId, reason: Removal) -> bool {
        let slot = self.observers.lock().remove(&id);
        match slot {
            Some(slot) => {
                self.retire(id, slot, reason);
                true
            }
            None => false,
        }
    }

    fn retire(&self, id: SubscriptionId, slot: ObserverSlot, reason: Removal) {
        slot.writer.abort();
        self.metrics.record_observer_removed(reason.is_failure());
        if reason.is_failure() {
            warn!(subscription_id = %id, observer = %slot.label, reason = reason.as_str(), "observer_dropped");
        } else {
            info!(subscription_id = %id, observer = %slot.label, "observer_unregistered");
        }
    }
}

/// Drain one observer's queue in FIFO order until it closes, fails or stalls
async fn run_writer<C: ObserverConnection>(
    hub: Weak<NotificationHub>,
    id: SubscriptionId,
    mut connection: C,
    mut rx: mpsc::UnboundedReceiver<OccupancyEvent>,
    stall_timeout: Duration,
    metrics: Arc<Metrics>,
) {
    while let Some(event) = rx.recv().await {
        let reason = match timeout(stall_timeout, connection.deliver(&event)).await {
            Ok(Ok(())) => {
                metrics.record_event_delivered();
                continue;
            }
            Ok(Err(e)) => {
                debug!(subscription_id = %id, error = %e, "observer_delivery_failed");
                Removal::DeliveryFailed
            }
            Err(_) => {
                debug!(subscription_id = %id, timeout_ms = %stall_timeout.as_millis(), "observer_delivery_stalled");
                Removal::Stalled
            }
        };
        if let Some(hub) = hub.upgrade() {
            hub.remove(id, reason);
        }
        return;
    }
    debug!(subscription_id = %id, "observer_writer_stopped");
}
