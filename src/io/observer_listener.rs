//! TCP observer endpoint for occupancy events
//!
//! Each accepted connection is registered with the hub and receives one JSON
//! object per line: first a snapshot event per facility, then every change.
//! Clients send nothing; reaching EOF on the read half unregisters them.

use crate::io::observer::JsonLinesObserver;
use crate::services::hub::NotificationHub;
use crate::services::ledger::SessionLedger;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Observer listener configuration
#[derive(Debug, Clone)]
pub struct ObserverListenerConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for ObserverListenerConfig {
    fn default() -> Self {
        Self { port: 9090, enabled: true }
    }
}

/// Start the observer TCP listener
pub async fn start_observer_listener(
    config: ObserverListenerConfig,
    hub: Arc<NotificationHub>,
    ledger: Arc<SessionLedger>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if !config.enabled {
        info!("observer_listener_disabled");
        return Ok(());
    }

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!(port = %config.port, "observer_listener_started");
    serve_observers(listener, hub, ledger, shutdown).await
}

/// Accept observers on an already bound listener until shutdown
pub async fn serve_observers(
    listener: TcpListener,
    hub: Arc<NotificationHub>,
    ledger: Arc<SessionLedger>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("observer_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let hub = hub.clone();
                        let ledger = ledger.clone();
                        tokio::spawn(async move {
                            handle_observer_connection(socket, addr, hub, ledger).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "observer_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_observer_connection(
    socket: TcpStream,
    addr: SocketAddr,
    hub: Arc<NotificationHub>,
    ledger: Arc<SessionLedger>,
) {
    let _ = socket.set_nodelay(true);
    let (mut read_half, write_half) = socket.into_split();

    let observer = JsonLinesObserver::new(write_half, &addr.to_string());
    let id = hub.register_with_snapshot(observer, || ledger.occupancy_snapshot());

    // Inbound bytes are ignored; only EOF or an error matters
    let mut buf = [0u8; 256];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => debug!(peer = %addr, bytes = %n, "observer_input_ignored"),
            Err(e) => {
                debug!(peer = %addr, error = %e, "observer_read_failed");
                break;
            }
        }
    }

    hub.unregister(id);
    debug!(peer = %addr, subscription_id = %id, "observer_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewFacility, OccupancyEvent, Tariff, VehicleId};
    use crate::infra::metrics::Metrics;
    use crate::io::journal::NullJournal;
    use crate::io::occupancy_channel::create_occupancy_channel;
    use crate::services::hub::{create_hub, DEFAULT_STALL_TIMEOUT};
    use crate::services::tariff::TariffResolver;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_tcp_observer_gets_snapshot_then_changes() {
        let metrics = Arc::new(Metrics::new());
        let (sender, event_rx) = create_occupancy_channel(metrics.clone());
        let (hub, worker) = create_hub(event_rx, DEFAULT_STALL_TIMEOUT, metrics.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(worker.run(shutdown_rx.clone()));

        let ledger = Arc::new(SessionLedger::new(
            TariffResolver::new("hourly", 250),
            Arc::new(NullJournal),
            metrics.clone(),
            Some(sender),
        ));
        let facility = ledger
            .register_facility(NewFacility {
                name: "North".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                capacity: 2,
                tariffs: vec![Tariff::new("hourly", 100)],
            })
            .unwrap();
        let spot = ledger.add_spot(facility.id, "N-1").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_observers(listener, hub.clone(), ledger.clone(), shutdown_rx));

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let next = |line: Option<String>| -> OccupancyEvent {
            serde_json::from_str(&line.unwrap()).unwrap()
        };

        let snapshot = next(timeout(Duration::from_secs(2), lines.next_line()).await.unwrap().unwrap());
        assert_eq!(snapshot.facility_id, facility.id);
        assert_eq!(snapshot.free_spots, 2);

        ledger.open_session(spot.id, VehicleId(1)).unwrap();
        // The spot_added event may still be in flight behind the snapshot
        let mut change = next(timeout(Duration::from_secs(2), lines.next_line()).await.unwrap().unwrap());
        if change.free_spots == 2 {
            change = next(timeout(Duration::from_secs(2), lines.next_line()).await.unwrap().unwrap());
        }
        assert_eq!(change.free_spots, 1);

        // Closing the client unregisters the observer
        assert_eq!(hub.observer_count(), 1);
        drop(write_half);
        drop(lines);
        let gone = timeout(Duration::from_secs(2), async {
            while hub.observer_count() != 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(gone.is_ok());
    }

    async fn next_free(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> u32 {
        let line = timeout(Duration::from_secs(5), lines.next_line()).await.unwrap().unwrap();
        serde_json::from_str::<OccupancyEvent>(&line.unwrap()).unwrap().free_spots
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tcp_observer_keeps_up_with_burst() {
        let metrics = Arc::new(Metrics::new());
        let (sender, event_rx) = create_occupancy_channel(metrics.clone());
        let (hub, worker) = create_hub(event_rx, DEFAULT_STALL_TIMEOUT, metrics.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(worker.run(shutdown_rx.clone()));

        let ledger = Arc::new(SessionLedger::new(
            TariffResolver::new("hourly", 250),
            Arc::new(NullJournal),
            metrics.clone(),
            Some(sender),
        ));
        let facility = ledger
            .register_facility(NewFacility {
                name: "Burst".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                capacity: 1,
                tariffs: Vec::new(),
            })
            .unwrap();
        let spot = ledger.add_spot(facility.id, "B-1").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_observers(listener, hub.clone(), ledger.clone(), shutdown_rx));

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, _write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // The snapshot arrives once the observer is registered
        assert_eq!(next_free(&mut lines).await, 1);

        let burst = {
            let ledger = ledger.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..1000 {
                    let session = ledger.open_session(spot.id, VehicleId(i)).unwrap();
                    ledger.close_session(session.id, "card").unwrap();
                }
            })
        };

        // A spot_added event may still trail the snapshot
        let mut received = Vec::with_capacity(2000);
        let mut free = next_free(&mut lines).await;
        if free == 1 {
            free = next_free(&mut lines).await;
        }
        received.push(free);
        while received.len() < 2000 {
            received.push(next_free(&mut lines).await);
        }
        burst.await.unwrap();

        let expected: Vec<u32> = (0..1000).flat_map(|_| [0, 1]).collect();
        assert_eq!(received, expected);
        assert_eq!(metrics.observers_dropped(), 0);
        assert_eq!(hub.observer_count(), 1);
    }
}
