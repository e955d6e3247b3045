//! Typed channel carrying occupancy events from the ledger to the hub
//!
//! Provides a non-blocking way to publish events. The queue is unbounded on
//! the publish side so the ledger never waits on observers and never drops an
//! event; per-observer backpressure is applied by the hub instead.

use crate::domain::OccupancyEvent;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Sender handle for occupancy events
///
/// Clone this to share across multiple producers.
#[derive(Clone)]
pub struct OccupancySender {
    tx: mpsc::UnboundedSender<OccupancyEvent>,
    metrics: Arc<Metrics>,
}

impl OccupancySender {
    pub fn new(tx: mpsc::UnboundedSender<OccupancyEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    /// Enqueue an event for delivery. Returns immediately.
    pub fn publish(&self, event: OccupancyEvent) {
        match self.tx.send(event) {
            Ok(()) => self.metrics.record_event_published(),
            Err(_) => {
                // Delivery worker has shut down; occupancy state is unaffected
                warn!(facility_id = %event.facility_id, "occupancy_channel_closed");
            }
        }
    }
}

/// Create a new occupancy channel pair
///
/// Returns (sender, receiver); the receiver is consumed by the hub's
/// delivery worker.
pub fn create_occupancy_channel(
    metrics: Arc<Metrics>,
) -> (OccupancySender, mpsc::UnboundedReceiver<OccupancyEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OccupancySender::new(tx, metrics), rx)
}
