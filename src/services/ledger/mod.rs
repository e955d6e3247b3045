//! Session ledger - spot occupancy and session lifecycle
//!
//! The ledger is the single owner of spot occupancy flags and sessions.
//! Each spot and each session sits behind its own mutex, so operations on
//! different spots never wait on each other. A facility's occupied count is
//! guarded by a small per-facility mutex that is always taken last; occupancy
//! events are published while it is held so their order matches the order
//! of the count changes.
//!
//! Lock order: spot -> session -> facility occupancy. Registry maps are only
//! held long enough to clone an `Arc` or insert one.
//!
//! Every mutation is journaled before it is applied. A journal failure is
//! reported as `Transient` and leaves state untouched.

#[cfg(test)]
mod tests;

use crate::domain::{
    Charge, ChargeId, Exit, Facility, FacilityId, LedgerError, LedgerResult, NewFacility,
    OccupancyEvent, PaymentStatus, Session, SessionId, Spot, SpotId, VehicleId,
};
use crate::infra::metrics::Metrics;
use crate::io::journal::{Journal, JournalError, JournalRecord};
use crate::io::occupancy_channel::OccupancySender;
use crate::services::tariff::TariffResolver;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Occupancy bookkeeping for one facility
#[derive(Debug, Default)]
struct Occupancy {
    spot_ids: Vec<SpotId>,
    occupied: u32,
}

struct FacilityEntry {
    facility: Facility,
    occupancy: Mutex<Occupancy>,
}

impl FacilityEntry {
    #[inline]
    fn free_spots(&self, occupancy: &Occupancy) -> u32 {
        self.facility.capacity.saturating_sub(occupancy.occupied)
    }
}

struct SpotEntry {
    facility_id: FacilityId,
    state: Mutex<Spot>,
}

struct SessionEntry {
    spot_id: SpotId,
    state: Mutex<Session>,
}

/// Outcome reported by the payment collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Settled,
    Failed,
}

fn transient(err: JournalError) -> LedgerError {
    LedgerError::Transient(err.to_string())
}

/// Authoritative in-memory ledger with write-through journaling
pub struct SessionLedger {
    facilities: RwLock<FxHashMap<FacilityId, Arc<FacilityEntry>>>,
    spots: RwLock<FxHashMap<SpotId, Arc<SpotEntry>>>,
    sessions: RwLock<FxHashMap<SessionId, Arc<SessionEntry>>>,
    charges: RwLock<FxHashMap<ChargeId, Arc<Mutex<Charge>>>>,
    resolver: TariffResolver,
    journal: Arc<dyn Journal>,
    metrics: Arc<Metrics>,
    /// Occupancy event publisher (optional)
    events: Option<OccupancySender>,
}

impl SessionLedger {
    pub fn new(
        resolver: TariffResolver,
        journal: Arc<dyn Journal>,
        metrics: Arc<Metrics>,
        events: Option<OccupancySender>,
    ) -> Self {
        Self {
            facilities: RwLock::new(FxHashMap::default()),
            spots: RwLock::new(FxHashMap::default()),
            sessions: RwLock::new(FxHashMap::default()),
            charges: RwLock::new(FxHashMap::default()),
            resolver,
            journal,
            metrics,
            events,
        }
    }

    // ------------------------------------------------------------------
    // Facilities and spots
    // ------------------------------------------------------------------

    /// Register a new facility with its tariffs
    pub fn register_facility(&self, input: NewFacility) -> LedgerResult<Facility> {
        self.register_facility_at(input, Utc::now())
    }

    pub fn register_facility_at(
        &self,
        input: NewFacility,
        now: DateTime<Utc>,
    ) -> LedgerResult<Facility> {
        if input.capacity == 0 {
            return Err(LedgerError::InvalidInput("capacity must be at least 1".to_string()));
        }
        if input.name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("facility name is empty".to_string()));
        }
        if input.tariffs.iter().any(|t| t.kind.trim().is_empty()) {
            return Err(LedgerError::InvalidInput("tariff kind is empty".to_string()));
        }

        let facility = Facility {
            id: FacilityId::new(),
            name: input.name,
            latitude: input.latitude,
            longitude: input.longitude,
            capacity: input.capacity,
            tariffs: input.tariffs,
            created_at: now,
        };

        self.journal
            .append(&JournalRecord::FacilityRegistered { facility: &facility })
            .map_err(transient)?;

        let entry = Arc::new(FacilityEntry {
            facility: facility.clone(),
            occupancy: Mutex::new(Occupancy::default()),
        });
        self.facilities.write().insert(facility.id, entry);

        info!(
            facility_id = %facility.id,
            name = %facility.name,
            capacity = %facility.capacity,
            tariffs = %facility.tariffs.len(),
            "facility_registered"
        );
        Ok(facility)
    }

    /// Add a free spot to a facility
    pub fn add_spot(&self, facility_id: FacilityId, number: &str) -> LedgerResult<Spot> {
        let facility = self.facility_entry(facility_id)?;
        if number.trim().is_empty() {
            return Err(LedgerError::InvalidInput("spot number is empty".to_string()));
        }

        let spot = Spot {
            id: SpotId::new(),
            facility_id,
            number: number.to_string(),
            occupied: false,
            open_session: None,
        };

        self.journal.append(&JournalRecord::SpotAdded { spot: &spot }).map_err(transient)?;

        self.spots.write().insert(
            spot.id,
            Arc::new(SpotEntry { facility_id, state: Mutex::new(spot.clone()) }),
        );

        let mut occupancy = facility.occupancy.lock();
        occupancy.spot_ids.push(spot.id);
        let spot_count = occupancy.spot_ids.len();
        if spot_count > facility.facility.capacity as usize {
            warn!(
                facility_id = %facility_id,
                spots = %spot_count,
                capacity = %facility.facility.capacity,
                "facility_spots_exceed_capacity"
            );
        }
        self.publish(facility_id, facility.free_spots(&occupancy));
        drop(occupancy);

        info!(facility_id = %facility_id, spot_id = %spot.id, number = %spot.number, "spot_added");
        Ok(spot)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Occupy a free spot. Fails with `Conflict` if it is already occupied.
    pub fn open_session(&self, spot_id: SpotId, vehicle_id: VehicleId) -> LedgerResult<Session> {
        self.open_session_at(spot_id, vehicle_id, Utc::now())
    }

    pub fn open_session_at(
        &self,
        spot_id: SpotId,
        vehicle_id: VehicleId,
        now: DateTime<Utc>,
    ) -> LedgerResult<Session> {
        let start = Instant::now();
        let result = self.try_open_session(spot_id, vehicle_id, now);
        self.observe(start, &result);
        result
    }

    fn try_open_session(
        &self,
        spot_id: SpotId,
        vehicle_id: VehicleId,
        now: DateTime<Utc>,
    ) -> LedgerResult<Session> {
        let spot_entry = self.spot_entry(spot_id)?;
        let facility = self.owning_facility(spot_entry.facility_id)?;

        let mut spot = spot_entry.state.lock();
        if spot.occupied != spot.open_session.is_some() {
            return Err(LedgerError::InvariantViolation(format!(
                "spot {spot_id} occupancy flag disagrees with its open session"
            )));
        }
        if let Some(open) = spot.open_session {
            debug!(spot_id = %spot_id, session_id = %open, vehicle_id = %vehicle_id, "spot_already_occupied");
            return Err(LedgerError::Conflict(format!("spot {spot_id} is already occupied")));
        }

        let session = Session {
            id: SessionId::new(),
            spot_id,
            facility_id: spot_entry.facility_id,
            vehicle_id,
            entry_time: now,
            exit_time: None,
            charge_id: None,
        };

        self.journal
            .append(&JournalRecord::SessionOpened { session: &session })
            .map_err(transient)?;

        self.sessions.write().insert(
            session.id,
            Arc::new(SessionEntry { spot_id, state: Mutex::new(session.clone()) }),
        );
        spot.occupied = true;
        spot.open_session = Some(session.id);

        let free_spots = self.adjust_occupancy(&facility, 1);
        drop(spot);

        self.metrics.record_session_opened();
        info!(
            session_id = %session.id,
            spot_id = %spot_id,
            facility_id = %session.facility_id,
            vehicle_id = %vehicle_id,
            free_spots = %free_spots,
            "session_opened"
        );
        Ok(session)
    }

    /// Close an open session, bill it and free its spot as one unit.
    ///
    /// Returns the exit record and a pending charge. Fails with `Conflict` if
    /// the session is already closed.
    pub fn close_session(
        &self,
        session_id: SessionId,
        payment_method: &str,
    ) -> LedgerResult<(Exit, Charge)> {
        self.close_session_at(session_id, payment_method, Utc::now())
    }

    pub fn close_session_at(
        &self,
        session_id: SessionId,
        payment_method: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<(Exit, Charge)> {
        let start = Instant::now();
        let result = self.try_close_session(session_id, payment_method, now);
        self.observe(start, &result);
        result
    }

    fn try_close_session(
        &self,
        session_id: SessionId,
        payment_method: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<(Exit, Charge)> {
        let session_entry = self.session_entry(session_id)?;
        let spot_entry = self.spot_entry(session_entry.spot_id).map_err(|_| {
            LedgerError::InvariantViolation(format!("session {session_id} references a missing spot"))
        })?;
        let facility = self.owning_facility(spot_entry.facility_id)?;

        let mut spot = spot_entry.state.lock();
        let mut session = session_entry.state.lock();

        if !session.is_open() {
            return Err(LedgerError::Conflict(format!("session {session_id} is already closed")));
        }
        if spot.open_session != Some(session_id) || !spot.occupied {
            return Err(LedgerError::InvariantViolation(format!(
                "open session {session_id} is not recorded on spot {}",
                spot.id
            )));
        }

        // Exit never precedes entry
        let exit_time = now.max(session.entry_time);
        let duration_secs =
            u64::try_from((exit_time - session.entry_time).num_seconds()).unwrap_or(0);
        let quote = self.resolver.quote(&facility.facility, duration_secs);

        let charge = Charge {
            id: ChargeId::new(),
            session_id,
            amount: quote.amount,
            billed_hours: quote.billed_hours,
            rate_per_hour: quote.rate_per_hour,
            tariff_kind: quote.tariff_kind.clone(),
            method: payment_method.to_string(),
            status: PaymentStatus::Pending,
            created_at: exit_time,
            settled_at: None,
        };
        let closed = Session { exit_time: Some(exit_time), charge_id: Some(charge.id), ..session.clone() };

        self.journal
            .append(&JournalRecord::SessionClosed { session: &closed, charge: &charge })
            .map_err(transient)?;

        // Commit: nothing below can fail
        self.charges.write().insert(charge.id, Arc::new(Mutex::new(charge.clone())));
        *session = closed;
        spot.occupied = false;
        spot.open_session = None;

        let free_spots = self.adjust_occupancy(&facility, -1);
        drop(session);
        drop(spot);

        self.metrics.record_session_closed(charge.amount, quote.is_fallback());
        info!(
            session_id = %session_id,
            spot_id = %session_entry.spot_id,
            facility_id = %facility.facility.id,
            duration_secs = %duration_secs,
            billed_hours = %charge.billed_hours,
            amount = %charge.amount,
            fallback_rate = %quote.is_fallback(),
            free_spots = %free_spots,
            "session_closed"
        );

        let exit = Exit { session_id, exit_time, duration_secs };
        Ok((exit, charge))
    }

    /// Record the payment collaborator's verdict on a pending charge
    pub fn settle_charge(&self, charge_id: ChargeId, outcome: Settlement) -> LedgerResult<Charge> {
        self.settle_charge_at(charge_id, outcome, Utc::now())
    }

    pub fn settle_charge_at(
        &self,
        charge_id: ChargeId,
        outcome: Settlement,
        now: DateTime<Utc>,
    ) -> LedgerResult<Charge> {
        let start = Instant::now();
        let result = self.try_settle_charge(charge_id, outcome, now);
        self.observe(start, &result);
        result
    }

    fn try_settle_charge(
        &self,
        charge_id: ChargeId,
        outcome: Settlement,
        now: DateTime<Utc>,
    ) -> LedgerResult<Charge> {
        let entry = self
            .charges
            .read()
            .get(&charge_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("charge", charge_id))?;

        let mut charge = entry.lock();
        if charge.status != PaymentStatus::Pending {
            return Err(LedgerError::Conflict(format!(
                "charge {charge_id} is already {}",
                charge.status.as_str()
            )));
        }

        let status = match outcome {
            Settlement::Settled => PaymentStatus::Settled,
            Settlement::Failed => PaymentStatus::Failed,
        };
        let updated = Charge { status, settled_at: Some(now), ..charge.clone() };

        self.journal
            .append(&JournalRecord::ChargeSettled { charge: &updated })
            .map_err(transient)?;
        *charge = updated.clone();

        self.metrics.record_settlement(outcome == Settlement::Settled);
        info!(charge_id = %charge_id, status = %status.as_str(), amount = %updated.amount, "charge_settled");
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Free spots at a facility: capacity minus spots with an open session
    pub fn free_spot_count(&self, facility_id: FacilityId) -> LedgerResult<u32> {
        let facility = self.facility_entry(facility_id)?;
        let occupancy = facility.occupancy.lock();
        Ok(facility.free_spots(&occupancy))
    }

    pub fn facility(&self, facility_id: FacilityId) -> LedgerResult<Facility> {
        Ok(self.facility_entry(facility_id)?.facility.clone())
    }

    /// All facilities, oldest first
    pub fn facilities(&self) -> Vec<Facility> {
        let mut facilities: Vec<Facility> =
            self.facilities.read().values().map(|entry| entry.facility.clone()).collect();
        facilities.sort_by_key(|f| f.id);
        facilities
    }

    /// Spots of a facility in the order they were added
    pub fn spots(&self, facility_id: FacilityId) -> LedgerResult<Vec<Spot>> {
        let facility = self.facility_entry(facility_id)?;
        // Copy ids and release the facility lock before taking spot locks
        let spot_ids = facility.occupancy.lock().spot_ids.clone();

        let entries: Vec<Arc<SpotEntry>> = {
            let spots = self.spots.read();
            spot_ids.iter().filter_map(|id| spots.get(id).cloned()).collect()
        };
        Ok(entries.iter().map(|entry| entry.state.lock().clone()).collect())
    }

    pub fn spot(&self, spot_id: SpotId) -> LedgerResult<Spot> {
        Ok(self.spot_entry(spot_id)?.state.lock().clone())
    }

    pub fn session(&self, session_id: SessionId) -> LedgerResult<Session> {
        Ok(self.session_entry(session_id)?.state.lock().clone())
    }

    pub fn charge(&self, charge_id: ChargeId) -> LedgerResult<Charge> {
        let entry = self
            .charges
            .read()
            .get(&charge_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("charge", charge_id))?;
        let charge = entry.lock().clone();
        Ok(charge)
    }

    /// Current free-spot event for every facility
    pub fn occupancy_snapshot(&self) -> Vec<OccupancyEvent> {
        let entries: Vec<Arc<FacilityEntry>> = self.facilities.read().values().cloned().collect();
        let mut events: Vec<OccupancyEvent> = entries
            .iter()
            .map(|entry| {
                let occupancy = entry.occupancy.lock();
                OccupancyEvent { facility_id: entry.facility.id, free_spots: entry.free_spots(&occupancy) }
            })
            .collect();
        events.sort_by_key(|e| e.facility_id);
        events
    }

    #[inline]
    pub fn resolver(&self) -> &TariffResolver {
        &self.resolver
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn facility_entry(&self, facility_id: FacilityId) -> LedgerResult<Arc<FacilityEntry>> {
        self.facilities
            .read()
            .get(&facility_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("facility", facility_id))
    }

    /// Facility of an existing spot; absence means the ledger is corrupt
    fn owning_facility(&self, facility_id: FacilityId) -> LedgerResult<Arc<FacilityEntry>> {
        self.facility_entry(facility_id).map_err(|_| {
            LedgerError::InvariantViolation(format!("spot references missing facility {facility_id}"))
        })
    }

    fn spot_entry(&self, spot_id: SpotId) -> LedgerResult<Arc<SpotEntry>> {
        self.spots
            .read()
            .get(&spot_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("spot", spot_id))
    }

    fn session_entry(&self, session_id: SessionId) -> LedgerResult<Arc<SessionEntry>> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("session", session_id))
    }

    /// Apply an occupancy delta and publish the resulting free count.
    /// Caller holds the spot lock.
    fn adjust_occupancy(&self, facility: &FacilityEntry, delta: i32) -> u32 {
        let mut occupancy = facility.occupancy.lock();
        occupancy.occupied = occupancy.occupied.saturating_add_signed(delta);
        let free_spots = facility.free_spots(&occupancy);
        self.publish(facility.facility.id, free_spots);
        free_spots
    }

    #[inline]
    fn publish(&self, facility_id: FacilityId, free_spots: u32) {
        if let Some(ref events) = self.events {
            events.publish(OccupancyEvent { facility_id, free_spots });
        }
    }

    fn observe<T>(&self, start: Instant, result: &LedgerResult<T>) {
        self.metrics.record_op_latency(start.elapsed().as_micros() as u64);
        match result {
            Ok(_) => {}
            Err(e @ LedgerError::InvariantViolation(_)) => {
                self.metrics.record_ledger_error(e);
                error!(error = %e, "ledger_invariant_violation");
            }
            Err(e @ LedgerError::Transient(_)) => {
                self.metrics.record_ledger_error(e);
                warn!(error = %e, "ledger_storage_unavailable");
            }
            Err(e) => {
                self.metrics.record_ledger_error(e);
                debug!(error = %e, kind = e.kind(), "ledger_request_rejected");
            }
        }
    }
}
