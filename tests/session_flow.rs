//! End-to-end session lifecycle tests over mock device links

use chrono::{TimeZone, Utc};
use parkgate::domain::rates::{compute_fee, RateSchedule};
use parkgate::domain::session::SessionStatus;
use parkgate::domain::types::{GateId, PaymentMethod, Plate, VehicleClass};
use parkgate::infra::Metrics;
use parkgate::io::events::create_event_channel;
use parkgate::io::serial_link::MockLink;
use parkgate::services::hardware::{CoordinatorSettings, HardwareCoordinator};
use parkgate::services::session_manager::{ManagerSettings, SessionError, SessionManager};
use parkgate::services::store::{MemoryStore, ParkingStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    manager: Arc<SessionManager>,
    store: Arc<MemoryStore>,
    entry_gate: Arc<MockLink>,
    _rx: tokio::sync::mpsc::Receiver<parkgate::io::events::ParkingEvent>,
}

fn car_schedule() -> RateSchedule {
    RateSchedule {
        class: VehicleClass::Car,
        version: 1,
        base_rate: 5000,
        hourly_rate: 5000,
        additional_hour_rate: 5000,
        additional_hour_threshold: 24,
        base_covers_first_hour: true,
        daily_cap: 100_000,
        weekly_rate: 500_000,
        monthly_rate: 1_500_000,
        penalty_rate: 50_000,
        max_stay_hours: 720,
        effective_from: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        effective_to: None,
    }
}

async fn rig(car_spaces: u32) -> Rig {
    let store = Arc::new(MemoryStore::new());
    store.seed_spaces(VehicleClass::Car, car_spaces);
    store.seed_spaces(VehicleClass::Motorcycle, 2);
    store.add_schedule(car_schedule());

    let mut motorcycle = car_schedule();
    motorcycle.class = VehicleClass::Motorcycle;
    motorcycle.base_rate = 2000;
    motorcycle.hourly_rate = 2000;
    store.add_schedule(motorcycle);

    let (events, rx) = create_event_channel(1024, "test".to_string());
    let metrics = Arc::new(Metrics::new());
    let entry_gate = Arc::new(MockLink::new());

    let hardware = Arc::new(HardwareCoordinator::new(
        CoordinatorSettings {
            ack_timeout: Duration::from_millis(50),
            slot_timeout: Duration::from_millis(200),
            retry_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            failed_threshold: 50,
            ..Default::default()
        },
        Arc::new(MockLink::new()),
        Arc::new(MockLink::new()),
        vec![(GateId(1), entry_gate.clone()), (GateId(2), Arc::new(MockLink::new()))],
        events.clone(),
        metrics.clone(),
    ));
    hardware.initialize_all().await;

    let manager = Arc::new(SessionManager::new(
        store.clone(),
        hardware,
        events,
        metrics,
        ManagerSettings {
            capture_timeout: Duration::from_millis(50),
            print_timeout: Duration::from_millis(50),
            actuate_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    ));
    Rig { manager, store, entry_gate, _rx: rx }
}

fn plate(s: &str) -> Plate {
    Plate::new(s).unwrap()
}

#[tokio::test]
async fn immediate_exit_bills_one_hour() {
    // Scenario A shape: a minutes-long stay bills as one hour, covered by base
    let r = rig(2).await;
    let sid = r.manager.request_entry(plate("B1234XY"), VehicleClass::Car).await.unwrap();
    let ticket = r.store.load_session(&sid).await.unwrap().unwrap().ticket.unwrap();

    let quote = r.manager.request_exit(ticket.as_str()).await.unwrap();
    assert_eq!(quote.fee, 5000);
    assert_eq!(quote.schedule_version, 1);
}

#[test]
fn four_billed_hours_fee_composition() {
    // Scenario B: entry 10:00, exit 13:01 -> 4 billed hours -> base + 3 x hourly
    let schedule = car_schedule();
    let entry = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
    let exit = Utc.with_ymd_and_hms(2025, 3, 1, 13, 1, 0).unwrap();
    assert_eq!(compute_fee(&schedule, entry, exit).unwrap(), 5000 + 3 * 5000);
}

#[tokio::test]
async fn simultaneous_same_plate_entries_one_wins() {
    // Scenario C: two simultaneous entries for one plate - exactly one session
    let r = rig(4).await;

    let (a, b) = tokio::join!(
        r.manager.request_entry(plate("B1234XY"), VehicleClass::Car),
        r.manager.request_entry(plate("B1234XY"), VehicleClass::Car),
    );

    let oks = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
    assert_eq!(oks, 1, "exactly one entry must win");

    let duplicate = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(duplicate, SessionError::DuplicateActiveSession { .. }));

    // Only one space occupied
    assert_eq!(r.store.occupancy().await.unwrap().0, 1);
}

#[tokio::test]
async fn entry_gate_timeout_rejects_and_frees_space() {
    // Scenario D: actuation times out during entry
    let r = rig(1).await;
    r.entry_gate.drop_acks.store(true, Ordering::Relaxed);

    let err = r.manager.request_entry(plate("B1234XY"), VehicleClass::Car).await.unwrap_err();
    assert!(matches!(err, SessionError::Hardware(_)));

    // Space returned to the pool, session terminal, ticket unusable
    assert_eq!(r.store.occupancy().await.unwrap().0, 0);
    let rejected = r.store.sessions_in_status(SessionStatus::Rejected).await.unwrap();
    assert_eq!(rejected.len(), 1);
    let ticket = rejected[0].ticket.clone().unwrap();
    let exit = r.manager.request_exit(ticket.as_str()).await.unwrap_err();
    assert!(matches!(exit, SessionError::InvalidTicket));

    // The lane recovers once the gate answers again
    r.entry_gate.drop_acks.store(false, Ordering::Relaxed);
    r.manager.request_entry(plate("B1234XY"), VehicleClass::Car).await.unwrap();
}

#[tokio::test]
async fn unknown_ticket_mutates_nothing() {
    // Scenario E
    let r = rig(2).await;
    let sid = r.manager.request_entry(plate("B1234XY"), VehicleClass::Car).await.unwrap();

    let err = r.manager.request_exit("TKT-UNKNOWN").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidTicket));

    let session = r.store.load_session(&sid).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(r.store.occupancy().await.unwrap().0, 1);
}

#[tokio::test]
async fn concurrent_entries_never_share_a_space() {
    let r = rig(8).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = r.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.request_entry(plate(&format!("B{i}AA")), VehicleClass::Car).await
        }));
    }

    let mut sids = Vec::new();
    for handle in handles {
        sids.push(handle.await.unwrap().unwrap());
    }

    let mut spaces = std::collections::HashSet::new();
    for sid in &sids {
        let session = r.store.load_session(sid).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(spaces.insert(session.space.unwrap()), "space allocated twice");
    }
    assert_eq!(r.store.occupancy().await.unwrap().0, 8);
}

#[tokio::test]
async fn completed_session_round_trip_frees_space() {
    let r = rig(2).await;
    let sid = r.manager.request_entry(plate("B1234XY"), VehicleClass::Car).await.unwrap();
    let session = r.store.load_session(&sid).await.unwrap().unwrap();
    let space = session.space.unwrap();
    let ticket = session.ticket.unwrap();

    let quote = r.manager.request_exit(ticket.as_str()).await.unwrap();
    r.manager.confirm_payment(&sid, quote.fee, PaymentMethod::Cash).await.unwrap();

    let done = r.store.load_session(&sid).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.space, Some(space)); // record keeps the reference for audit
    assert_eq!(r.store.occupancy().await.unwrap().0, 0);

    // No non-terminal session references the space: the same plate can
    // re-enter and receives the lowest id again
    let sid2 = r.manager.request_entry(plate("B1234XY"), VehicleClass::Car).await.unwrap();
    let session2 = r.store.load_session(&sid2).await.unwrap().unwrap();
    assert_eq!(session2.space, Some(space));
}

#[tokio::test]
async fn exit_then_reentry_after_completion() {
    let r = rig(1).await;
    for round in 0..3 {
        let sid = r.manager.request_entry(plate("B77CC"), VehicleClass::Car).await.unwrap();
        let ticket = r.store.load_session(&sid).await.unwrap().unwrap().ticket.unwrap();
        let quote = r.manager.request_exit(ticket.as_str()).await.unwrap();
        r.manager.confirm_payment(&sid, quote.fee, PaymentMethod::Card).await.unwrap();
        assert_eq!(r.store.occupancy().await.unwrap().0, 0, "round {round}");
    }
}

#[tokio::test]
async fn classes_allocate_from_their_own_pools() {
    let r = rig(1).await;

    r.manager.request_entry(plate("B1CAR"), VehicleClass::Car).await.unwrap();
    // Car pool exhausted
    let err = r.manager.request_entry(plate("B2CAR"), VehicleClass::Car).await.unwrap_err();
    assert!(matches!(err, SessionError::NoSpaceAvailable { class: VehicleClass::Car }));

    // Motorcycle pool unaffected
    let sid = r.manager.request_entry(plate("D1MC"), VehicleClass::Motorcycle).await.unwrap();
    let session = r.store.load_session(&sid).await.unwrap().unwrap();
    assert!(session.space.is_some());
}
