//! Delivery worker - moves published events into observer queues
//!
//! The ledger publishes into an unbounded channel and never waits. This
//! worker is the channel's only consumer and hands each event to the hub in
//! publish order.

use super::NotificationHub;
use crate::domain::OccupancyEvent;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Worker that broadcasts occupancy events until shutdown
pub struct DeliveryWorker {
    hub: Arc<NotificationHub>,
    event_rx: mpsc::UnboundedReceiver<OccupancyEvent>,
}

impl DeliveryWorker {
    pub fn new(hub: Arc<NotificationHub>, event_rx: mpsc::UnboundedReceiver<OccupancyEvent>) -> Self {
        Self { hub, event_rx }
    }

    /// Run until shutdown is signalled or every publisher is gone
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("delivery_worker_started");
        let mut delivered: u64 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.hub.broadcast(event);
                            delivered += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        // Flush whatever was published before shutdown
        while let Ok(event) = self.event_rx.try_recv() {
            self.hub.broadcast(event);
            delivered += 1;
        }
        self.hub.close_all();
        info!(events = %delivered, "delivery_worker_stopped");
    }
}

/// Create the hub and the worker that feeds it
///
/// Returns the hub (for registering observers) and the worker (to be spawned)
pub fn create_hub(
    event_rx: mpsc::UnboundedReceiver<OccupancyEvent>,
    stall_timeout: Duration,
    metrics: Arc<Metrics>,
) -> (Arc<NotificationHub>, DeliveryWorker) {
    let hub = NotificationHub::new(stall_timeout, metrics);
    let worker = DeliveryWorker::new(hub.clone(), event_rx);
    (hub, worker)
}
