//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `occupancy_channel` - Typed channel from the ledger to the hub
//! - `journal` - Write-through ledger journal (JSONL format)
//! - `observer` - Observer connections (in-process channel, JSON lines)
//! - `observer_listener` - TCP listener for occupancy observers
//! - `api` - HTTP facade for facilities, sessions and charges
//! - `prometheus` - Prometheus text exposition

pub mod api;
pub mod journal;
pub mod observer;
pub mod observer_listener;
pub mod occupancy_channel;
pub mod prometheus;

// Re-export commonly used types
pub use api::{start_api_server, ApiState};
pub use journal::{Journal, JournalError, JournalRecord, JsonlJournal, NullJournal};
pub use observer::{ChannelObserver, DeliveryError, JsonLinesObserver, ObserverConnection};
pub use observer_listener::{start_observer_listener, ObserverListenerConfig};
pub use occupancy_channel::{create_occupancy_channel, OccupancySender};
