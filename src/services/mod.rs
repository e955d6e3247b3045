//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `tariff` - Hourly billing with a fallback rate
//! - `ledger` - Spot occupancy and session lifecycle
//! - `hub` - Observer registry and event delivery

pub mod hub;
pub mod ledger;
pub mod tariff;

// Re-export commonly used types
pub use hub::{create_hub, DeliveryWorker, NotificationHub};
pub use ledger::{SessionLedger, Settlement};
pub use tariff::{billable_hours, Quote, TariffResolver};
