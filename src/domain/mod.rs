//! Domain models - core parking types and errors
//!
//! This module contains the canonical data types used throughout the system:
//! - `Facility`, `Spot`, `Tariff` - the physical layout and its pricing
//! - `Session`, `Exit`, `Charge` - one vehicle's stay and what it costs
//! - `OccupancyEvent` - free-spot snapshot pushed to observers
//! - `LedgerError` - structured failures returned to callers

pub mod error;
pub mod types;

// Re-export commonly used types at module level
pub use error::{LedgerError, LedgerResult};
pub use types::{
    Charge, ChargeId, Exit, Facility, FacilityId, NewFacility, OccupancyEvent, PaymentStatus,
    Session, SessionId, Spot, SpotId, SubscriptionId, Tariff, VehicleId,
};
