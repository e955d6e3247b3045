//! Tests for the SessionLedger module

use super::*;
use crate::domain::Tariff;
use crate::io::journal::NullJournal;
use crate::io::occupancy_channel::create_occupancy_channel;
use chrono::{Duration, TimeZone};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;
use tokio::sync::mpsc;

const HOURLY: u64 = 120;

/// Test harness that keeps the event receiver alive
struct TestLedger {
    ledger: Arc<SessionLedger>,
    events_rx: mpsc::UnboundedReceiver<OccupancyEvent>,
}

impl std::ops::Deref for TestLedger {
    type Target = SessionLedger;
    fn deref(&self) -> &Self::Target {
        &self.ledger
    }
}

impl TestLedger {
    fn drain_events(&mut self) -> Vec<OccupancyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Journal whose appends can be made to fail on demand
#[derive(Default)]
struct FlakyJournal {
    failing: AtomicBool,
}

impl Journal for FlakyJournal {
    fn append(&self, _record: &JournalRecord<'_>) -> Result<(), JournalError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(JournalError::Unavailable("disk detached".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Journal that holds session_opened appends for one spot until released
#[derive(Default)]
struct GatedJournal {
    gated_spot: Mutex<Option<SpotId>>,
    entered: AtomicBool,
    released: parking_lot::Mutex<bool>,
    release_signal: parking_lot::Condvar,
}

impl GatedJournal {
    fn release(&self) {
        *self.released.lock() = true;
        self.release_signal.notify_all();
    }
}

impl Journal for GatedJournal {
    fn append(&self, record: &JournalRecord<'_>) -> Result<(), JournalError> {
        if let JournalRecord::SessionOpened { session } = record {
            if *self.gated_spot.lock() == Some(session.spot_id) {
                self.entered.store(true, Ordering::SeqCst);
                let mut released = self.released.lock();
                while !*released {
                    self.release_signal.wait(&mut released);
                }
            }
        }
        Ok(())
    }
}

fn create_test_ledger() -> TestLedger {
    create_test_ledger_with_journal(Arc::new(NullJournal))
}

fn create_test_ledger_with_journal(journal: Arc<dyn Journal>) -> TestLedger {
    let metrics = Arc::new(Metrics::new());
    let (sender, events_rx) = create_occupancy_channel(metrics.clone());
    let ledger = SessionLedger::new(TariffResolver::new("hourly", 250), journal, metrics, Some(sender));
    TestLedger { ledger: Arc::new(ledger), events_rx }
}

fn new_facility(capacity: u32, tariffs: Vec<Tariff>) -> NewFacility {
    NewFacility {
        name: "Central".to_string(),
        latitude: 55.7558,
        longitude: 37.6173,
        capacity,
        tariffs,
    }
}

fn facility_with_spots(ledger: &SessionLedger, spots: usize) -> (Facility, Vec<Spot>) {
    let facility = ledger
        .register_facility(new_facility(spots as u32, vec![Tariff::new("hourly", HOURLY)]))
        .unwrap();
    let spots = (0..spots).map(|i| ledger.add_spot(facility.id, &format!("A-{i}")).unwrap()).collect();
    (facility, spots)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

#[test]
fn test_open_marks_spot_occupied() {
    let ledger = create_test_ledger();
    let (facility, spots) = facility_with_spots(&ledger, 2);

    let session = ledger.open_session_at(spots[0].id, VehicleId(7), t0()).unwrap();

    assert!(session.is_open());
    assert_eq!(session.entry_time, t0());
    assert_eq!(session.facility_id, facility.id);
    let spot = ledger.spot(spots[0].id).unwrap();
    assert!(spot.occupied);
    assert_eq!(spot.open_session, Some(session.id));
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 1);
}

#[test]
fn test_open_occupied_spot_conflicts() {
    let ledger = create_test_ledger();
    let (_, spots) = facility_with_spots(&ledger, 1);

    ledger.open_session(spots[0].id, VehicleId(1)).unwrap();
    let err = ledger.open_session(spots[0].id, VehicleId(2)).unwrap_err();

    assert!(matches!(err, LedgerError::Conflict(_)));
    assert_eq!(ledger.metrics.conflicts(), 1);
}

#[test]
fn test_open_unknown_spot_not_found() {
    let ledger = create_test_ledger();
    let err = ledger.open_session(SpotId::new(), VehicleId(1)).unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "spot", .. }));
}

#[test]
fn test_concurrent_opens_single_winner() {
    let ledger = create_test_ledger();
    let (facility, spots) = facility_with_spots(&ledger, 1);
    let spot_id = spots[0].id;

    let contenders = 16;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let ledger = ledger.ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.open_session(spot_id, VehicleId(i as u64))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts =
        results.iter().filter(|r| matches!(r, Err(LedgerError::Conflict(_)))).count();

    assert_eq!(winners, 1);
    assert_eq!(conflicts, contenders - 1);
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 0);
}

#[test]
fn test_close_bills_started_hours() {
    let ledger = create_test_ledger();
    let (_, spots) = facility_with_spots(&ledger, 3);

    let cases = [(3661, 2), (3600, 1), (0, 1)];
    for (spot, (elapsed, hours)) in spots.iter().zip(cases) {
        let session = ledger.open_session_at(spot.id, VehicleId(1), t0()).unwrap();
        let (exit, charge) = ledger
            .close_session_at(session.id, "card", t0() + Duration::seconds(elapsed))
            .unwrap();

        assert_eq!(exit.duration_secs, elapsed as u64);
        assert_eq!(charge.billed_hours, hours, "elapsed {elapsed}s");
        assert_eq!(charge.amount, hours * HOURLY);
        assert_eq!(charge.status, PaymentStatus::Pending);
        assert_eq!(charge.tariff_kind.as_deref(), Some("hourly"));
    }
}

#[test]
fn test_close_frees_spot_and_records_charge() {
    let ledger = create_test_ledger();
    let (facility, spots) = facility_with_spots(&ledger, 1);

    let session = ledger.open_session_at(spots[0].id, VehicleId(1), t0()).unwrap();
    let (exit, charge) = ledger
        .close_session_at(session.id, "card", t0() + Duration::minutes(90))
        .unwrap();

    let closed = ledger.session(session.id).unwrap();
    assert_eq!(closed.exit_time, Some(exit.exit_time));
    assert_eq!(closed.charge_id, Some(charge.id));
    assert_eq!(ledger.charge(charge.id).unwrap(), charge);
    assert_eq!(charge.method, "card");

    let spot = ledger.spot(spots[0].id).unwrap();
    assert!(!spot.occupied);
    assert!(spot.open_session.is_none());
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 1);
}

#[test]
fn test_close_twice_conflicts_without_second_charge() {
    let ledger = create_test_ledger();
    let (_, spots) = facility_with_spots(&ledger, 1);

    let session = ledger.open_session(spots[0].id, VehicleId(1)).unwrap();
    let (_, charge) = ledger.close_session(session.id, "cash").unwrap();
    let err = ledger.close_session(session.id, "cash").unwrap_err();

    assert!(matches!(err, LedgerError::Conflict(_)));
    assert_eq!(ledger.session(session.id).unwrap().charge_id, Some(charge.id));
    assert_eq!(ledger.metrics.sessions_closed(), 1);
}

#[test]
fn test_close_unknown_session_not_found() {
    let ledger = create_test_ledger();
    let err = ledger.close_session(SessionId::new(), "card").unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "session", .. }));
}

#[test]
fn test_concurrent_closes_single_charge() {
    let ledger = create_test_ledger();
    let (_, spots) = facility_with_spots(&ledger, 1);
    let session = ledger.open_session(spots[0].id, VehicleId(1)).unwrap();

    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let ledger = ledger.ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.close_session(session.id, "card")
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(ledger.metrics.sessions_closed(), 1);
}

#[test]
fn test_fallback_rate_when_facility_has_no_hourly_tariff() {
    let ledger = create_test_ledger();
    let facility = ledger
        .register_facility(new_facility(1, vec![Tariff::new("daily", 2000)]))
        .unwrap();
    let spot = ledger.add_spot(facility.id, "B-1").unwrap();

    let session = ledger.open_session_at(spot.id, VehicleId(3), t0()).unwrap();
    let (_, charge) = ledger
        .close_session_at(session.id, "card", t0() + Duration::minutes(150))
        .unwrap();

    assert_eq!(charge.billed_hours, 3);
    assert_eq!(charge.rate_per_hour, 250);
    assert_eq!(charge.amount, 750);
    assert!(charge.tariff_kind.is_none());
}

#[test]
fn test_exit_before_entry_is_clamped() {
    let ledger = create_test_ledger();
    let (_, spots) = facility_with_spots(&ledger, 1);

    let session = ledger.open_session_at(spots[0].id, VehicleId(1), t0()).unwrap();
    let (exit, charge) = ledger
        .close_session_at(session.id, "card", t0() - Duration::seconds(30))
        .unwrap();

    assert_eq!(exit.exit_time, t0());
    assert_eq!(exit.duration_secs, 0);
    assert_eq!(charge.billed_hours, 1);
}

#[test]
fn test_storage_failure_on_close_leaves_session_open() {
    let journal = Arc::new(FlakyJournal::default());
    let ledger = create_test_ledger_with_journal(journal.clone());
    let (facility, spots) = facility_with_spots(&ledger, 1);
    let session = ledger.open_session(spots[0].id, VehicleId(1)).unwrap();

    journal.failing.store(true, Ordering::SeqCst);
    let err = ledger.close_session(session.id, "card").unwrap_err();
    assert!(matches!(err, LedgerError::Transient(_)));

    // Nothing applied
    assert!(ledger.session(session.id).unwrap().is_open());
    assert!(ledger.spot(spots[0].id).unwrap().occupied);
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 0);
    assert_eq!(ledger.metrics.sessions_closed(), 0);

    // Retry succeeds once storage is back
    journal.failing.store(false, Ordering::SeqCst);
    let (_, charge) = ledger.close_session(session.id, "card").unwrap();
    assert_eq!(ledger.charge(charge.id).unwrap().status, PaymentStatus::Pending);
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 1);
}

#[test]
fn test_storage_failure_on_open_leaves_spot_free() {
    let journal = Arc::new(FlakyJournal::default());
    let ledger = create_test_ledger_with_journal(journal.clone());
    let (facility, spots) = facility_with_spots(&ledger, 1);

    journal.failing.store(true, Ordering::SeqCst);
    let err = ledger.open_session(spots[0].id, VehicleId(1)).unwrap_err();

    assert!(matches!(err, LedgerError::Transient(_)));
    assert!(!ledger.spot(spots[0].id).unwrap().occupied);
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 1);
}

#[test]
fn test_events_follow_occupancy_changes() {
    let mut ledger = create_test_ledger();
    let (facility, spots) = facility_with_spots(&ledger, 2);

    let a = ledger.open_session(spots[0].id, VehicleId(1)).unwrap();
    let _b = ledger.open_session(spots[1].id, VehicleId(2)).unwrap();
    let _ = ledger.open_session(spots[1].id, VehicleId(3)).unwrap_err();
    ledger.close_session(a.id, "card").unwrap();

    let free: Vec<u32> = ledger
        .drain_events()
        .into_iter()
        .inspect(|e| assert_eq!(e.facility_id, facility.id))
        .map(|e| e.free_spots)
        .collect();

    // Two spot additions, two opens, one close; the rejected open emits nothing
    assert_eq!(free, vec![2, 2, 1, 0, 1]);
}

#[test]
fn test_free_count_consistent_under_concurrency() {
    let ledger = create_test_ledger();
    let (facility, spots) = facility_with_spots(&ledger, 8);

    let handles: Vec<_> = spots
        .iter()
        .map(|spot| {
            let ledger = ledger.ledger.clone();
            let spot_id = spot.id;
            thread::spawn(move || {
                for round in 0..50u64 {
                    let session = ledger.open_session(spot_id, VehicleId(round)).unwrap();
                    ledger.close_session(session.id, "card").unwrap();
                }
                // Finish with the spot occupied
                ledger.open_session(spot_id, VehicleId(999)).unwrap()
            })
        })
        .collect();

    let sessions: Vec<Session> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 0);

    for session in sessions.iter().step_by(2) {
        ledger.close_session(session.id, "card").unwrap();
    }

    let occupied = ledger.spots(facility.id).unwrap().iter().filter(|s| s.occupied).count();
    assert_eq!(occupied, 4);
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), facility.capacity - occupied as u32);
}

#[test]
fn test_settle_charge_transitions_once() {
    let ledger = create_test_ledger();
    let (_, spots) = facility_with_spots(&ledger, 1);
    let session = ledger.open_session(spots[0].id, VehicleId(1)).unwrap();
    let (_, charge) = ledger.close_session(session.id, "card").unwrap();

    let settled = ledger.settle_charge(charge.id, Settlement::Settled).unwrap();
    assert_eq!(settled.status, PaymentStatus::Settled);
    assert!(settled.settled_at.is_some());

    let err = ledger.settle_charge(charge.id, Settlement::Failed).unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
    assert_eq!(ledger.charge(charge.id).unwrap().status, PaymentStatus::Settled);

    let err = ledger.settle_charge(ChargeId::new(), Settlement::Settled).unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "charge", .. }));
}

#[test]
fn test_register_facility_validates_input() {
    let ledger = create_test_ledger();

    let err = ledger.register_facility(new_facility(0, Vec::new())).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let mut unnamed = new_facility(5, Vec::new());
    unnamed.name = "  ".to_string();
    assert!(ledger.register_facility(unnamed).is_err());

    assert!(ledger.facilities().is_empty());
}

#[test]
fn test_add_spot_unknown_facility_not_found() {
    let ledger = create_test_ledger();
    let err = ledger.add_spot(FacilityId::new(), "A-1").unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { entity: "facility", .. }));
}

#[test]
fn test_free_count_uses_capacity() {
    let ledger = create_test_ledger();
    let facility = ledger.register_facility(new_facility(10, Vec::new())).unwrap();
    let spot = ledger.add_spot(facility.id, "A-1").unwrap();

    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 10);
    ledger.open_session(spot.id, VehicleId(1)).unwrap();
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 9);
}

#[test]
fn test_occupancy_snapshot_covers_all_facilities() {
    let ledger = create_test_ledger();
    let (first, spots) = facility_with_spots(&ledger, 2);
    let (second, _) = facility_with_spots(&ledger, 3);
    ledger.open_session(spots[0].id, VehicleId(1)).unwrap();

    let snapshot = ledger.occupancy_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.contains(&OccupancyEvent { facility_id: first.id, free_spots: 1 }));
    assert!(snapshot.contains(&OccupancyEvent { facility_id: second.id, free_spots: 3 }));
}

#[test]
fn test_spots_listed_in_insertion_order() {
    let ledger = create_test_ledger();
    let (facility, spots) = facility_with_spots(&ledger, 3);

    let listed: Vec<SpotId> = ledger.spots(facility.id).unwrap().iter().map(|s| s.id).collect();
    let expected: Vec<SpotId> = spots.iter().map(|s| s.id).collect();
    assert_eq!(listed, expected);
}

#[test]
fn test_blocked_journal_append_does_not_stall_other_spots() {
    let journal = Arc::new(GatedJournal::default());
    let ledger = create_test_ledger_with_journal(journal.clone());
    let (facility, spots) = facility_with_spots(&ledger, 2);
    *journal.gated_spot.lock() = Some(spots[0].id);

    let held = {
        let ledger = ledger.ledger.clone();
        let spot_id = spots[0].id;
        thread::spawn(move || ledger.open_session(spot_id, VehicleId(1)))
    };
    while !journal.entered.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    // The other spot opens while the first append is still in progress
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let other = {
        let ledger = ledger.ledger.clone();
        let spot_id = spots[1].id;
        thread::spawn(move || {
            let result = ledger.open_session(spot_id, VehicleId(2));
            let _ = done_tx.send(());
            result
        })
    };
    let finished = done_rx.recv_timeout(std::time::Duration::from_secs(2));
    journal.release();

    assert!(finished.is_ok(), "open on an unrelated spot waited for the blocked append");
    assert!(other.join().unwrap().is_ok());
    assert!(held.join().unwrap().is_ok());
    assert_eq!(ledger.free_spot_count(facility.id).unwrap(), 0);
}
