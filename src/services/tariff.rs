//! Tariff resolution - turns a session duration into a charge amount
//!
//! Billing is per started hour: any partial hour counts as a full hour, an
//! exact multiple of an hour is not rounded further, and a zero-length stay
//! still bills one hour. The facility's own tariff of the configured kind is
//! used; when it has none, a fixed fallback rate applies so that billing
//! never blocks an exit.

use crate::domain::Facility;
use tracing::debug;

const SECS_PER_HOUR: u64 = 3600;

/// Billed hours for a duration: `ceil(secs / 3600)`, minimum one
#[inline]
pub fn billable_hours(duration_secs: u64) -> u64 {
    duration_secs.div_ceil(SECS_PER_HOUR).max(1)
}

/// Priced result of a tariff lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub billed_hours: u64,
    pub rate_per_hour: u64,
    pub amount: u64,
    /// Matched tariff kind, `None` when the fallback rate was used
    pub tariff_kind: Option<String>,
}

impl Quote {
    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.tariff_kind.is_none()
    }
}

/// Pure tariff resolver
#[derive(Debug, Clone)]
pub struct TariffResolver {
    default_kind: String,
    fallback_rate: u64,
}

impl TariffResolver {
    pub fn new(default_kind: &str, fallback_rate: u64) -> Self {
        Self { default_kind: default_kind.to_string(), fallback_rate }
    }

    /// Charge amount for a stay of `duration_secs` at `facility`
    pub fn resolve(&self, facility: &Facility, duration_secs: u64) -> u64 {
        self.quote(facility, duration_secs).amount
    }

    /// Full pricing breakdown for a stay of `duration_secs` at `facility`
    pub fn quote(&self, facility: &Facility, duration_secs: u64) -> Quote {
        let billed_hours = billable_hours(duration_secs);

        let (rate_per_hour, tariff_kind) = match facility.tariff(&self.default_kind) {
            Some(tariff) => (tariff.price_per_hour, Some(tariff.kind.clone())),
            None => {
                debug!(
                    facility_id = %facility.id,
                    tariff_kind = %self.default_kind,
                    fallback_rate = %self.fallback_rate,
                    "tariff_fallback"
                );
                (self.fallback_rate, None)
            }
        };

        Quote {
            billed_hours,
            rate_per_hour,
            amount: billed_hours.saturating_mul(rate_per_hour),
            tariff_kind,
        }
    }

    #[inline]
    pub fn default_kind(&self) -> &str {
        &self.default_kind
    }

    #[inline]
    pub fn fallback_rate(&self) -> u64 {
        self.fallback_rate
    }
}

impl Default for TariffResolver {
    fn default() -> Self {
        Self::new("hourly", 250)
    }
}
