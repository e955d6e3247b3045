//! Shared types for the parking ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable (UUIDv7) id
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Newtype wrapper for facility IDs
    FacilityId
);
uuid_id!(
    /// Newtype wrapper for spot IDs
    SpotId
);
uuid_id!(
    /// Newtype wrapper for session IDs
    SessionId
);
uuid_id!(
    /// Newtype wrapper for charge IDs
    ChargeId
);

/// Vehicle id as verified by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct VehicleId(pub u64);

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observer registration handle, assigned by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A billing rate attached to a facility. Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    /// Rate type, e.g. "hourly" or "daily"
    pub kind: String,
    pub price_per_hour: u64,
}

impl Tariff {
    pub fn new(kind: &str, price_per_hour: u64) -> Self {
        Self { kind: kind.to_string(), price_per_hour }
    }
}

/// Input for registering a facility
#[derive(Debug, Clone, Deserialize)]
pub struct NewFacility {
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    pub capacity: u32,
    #[serde(default)]
    pub tariffs: Vec<Tariff>,
}

/// A parking location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Facility {
    pub id: FacilityId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Advisory upper bound on spots; free count is derived from it
    pub capacity: u32,
    pub tariffs: Vec<Tariff>,
    pub created_at: DateTime<Utc>,
}

impl Facility {
    /// First tariff whose kind matches, in configured order
    pub fn tariff(&self, kind: &str) -> Option<&Tariff> {
        self.tariffs.iter().find(|t| t.kind == kind)
    }
}

/// An individually occupiable space within a facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Spot {
    pub id: SpotId,
    pub facility_id: FacilityId,
    pub number: String,
    pub occupied: bool,
    /// Open session, present iff `occupied`
    pub open_session: Option<SessionId>,
}

/// One vehicle's occupancy of one spot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub spot_id: SpotId,
    pub facility_id: FacilityId,
    pub vehicle_id: VehicleId,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub charge_id: Option<ChargeId>,
}

impl Session {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

/// Exit record returned when a session closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exit {
    pub session_id: SessionId,
    pub exit_time: DateTime<Utc>,
    pub duration_secs: u64,
}

/// Charge settlement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Settled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Settled => "settled",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// Monetary obligation for a closed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Charge {
    pub id: ChargeId,
    pub session_id: SessionId,
    pub amount: u64,
    pub billed_hours: u64,
    pub rate_per_hour: u64,
    /// Tariff kind used, `None` when the fallback rate applied
    pub tariff_kind: Option<String>,
    pub method: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Free-spot snapshot for a facility, pushed to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEvent {
    pub facility_id: FacilityId,
    pub free_spots: u32,
}
