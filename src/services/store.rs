//! Persistence gateway contract and the in-memory reference store
//!
//! The core only ever talks to durable storage through the narrow
//! `ParkingStore` trait; the relational store behind it is an external
//! collaborator. `MemoryStore` is the reference implementation used by the
//! binary and the tests: spaces are seeded from config, schedules are kept
//! versioned, and sessions are only ever upserted - finished sessions stay
//! around as the audit trail.

use crate::domain::rates::RateSchedule;
use crate::domain::session::{ParkingSession, SessionId, SessionStatus, TicketCode};
use crate::domain::types::{Plate, SpaceId, VehicleClass};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

/// Failures surfaced by the persistence gateway
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("no space available for {class}")]
    NoSpaceAvailable { class: VehicleClass },
    #[error("unknown space {id}")]
    SpaceNotFound { id: SpaceId },
    #[error("no rate schedule for {class} at {at}")]
    ScheduleNotFound { class: VehicleClass, at: DateTime<Utc> },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A physical parking space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceRecord {
    pub id: SpaceId,
    pub label: String,
    pub class: VehicleClass,
    pub occupied: bool,
    /// Disabled spaces (maintenance) are never allocated
    pub active: bool,
}

/// Narrow repository contract consumed by the session manager
#[async_trait]
pub trait ParkingStore: Send + Sync {
    /// Atomically reserve the first free compatible space (lowest id wins,
    /// keeping allocation deterministic).
    async fn reserve_space(&self, class: VehicleClass) -> Result<SpaceRecord, StoreError>;

    /// Return a space to the free pool
    async fn release_space(&self, id: SpaceId) -> Result<(), StoreError>;

    /// Whether any non-terminal session exists for this plate
    async fn has_active_session(&self, plate: &Plate) -> Result<bool, StoreError>;

    /// Upsert a session (sessions are archived, never deleted)
    async fn save_session(&self, session: &ParkingSession) -> Result<(), StoreError>;

    async fn load_session(&self, id: &SessionId) -> Result<Option<ParkingSession>, StoreError>;

    async fn find_by_ticket(&self, code: &str) -> Result<Option<ParkingSession>, StoreError>;

    /// Generate a ticket code unique across all sessions ever issued
    async fn generate_ticket_code(&self) -> Result<TicketCode, StoreError>;

    /// The schedule in effect for a class at a point in time
    async fn active_schedule(
        &self,
        class: VehicleClass,
        at: DateTime<Utc>,
    ) -> Result<RateSchedule, StoreError>;

    /// Sessions currently in a given lifecycle state (for the sweep)
    async fn sessions_in_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<ParkingSession>, StoreError>;

    /// (occupied, total) over active spaces
    async fn occupancy(&self) -> Result<(usize, usize), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    /// Kept sorted by id so reservation scans are deterministic
    spaces: Vec<SpaceRecord>,
    sessions: FxHashMap<String, ParkingSession>,
    ticket_index: FxHashMap<String, SessionId>,
    issued_codes: FxHashSet<String>,
    schedules: Vec<RateSchedule>,
}

/// In-memory `ParkingStore`
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: parking_lot::Mutex::new(MemoryInner::default()) }
    }

    /// Append `count` spaces for a class, labeled `C01..`/`M01..`/`O01..`
    pub fn seed_spaces(&self, class: VehicleClass, count: u32) {
        let mut inner = self.inner.lock();
        let next_id = inner.spaces.iter().map(|s| s.id.0).max().map_or(1, |m| m + 1);
        let per_class = inner.spaces.iter().filter(|s| s.class == class).count() as u32;
        for i in 0..count {
            inner.spaces.push(SpaceRecord {
                id: SpaceId(next_id + i),
                label: format!("{}{:02}", class.label_prefix(), per_class + i + 1),
                class,
                occupied: false,
                active: true,
            });
        }
        inner.spaces.sort_by_key(|s| s.id);
    }

    /// Register a schedule version. Existing versions are never edited in
    /// place - historical fees stay reproducible.
    pub fn add_schedule(&self, schedule: RateSchedule) {
        self.inner.lock().schedules.push(schedule);
    }

    /// Disable a space for maintenance
    pub fn set_space_active(&self, id: SpaceId, active: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.spaces.iter_mut().find(|s| s.id == id) {
            Some(space) => {
                space.active = active;
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ParkingStore for MemoryStore {
    async fn reserve_space(&self, class: VehicleClass) -> Result<SpaceRecord, StoreError> {
        let mut inner = self.inner.lock();
        let space = inner
            .spaces
            .iter_mut()
            .find(|s| s.active && !s.occupied && s.class == class)
            .ok_or(StoreError::NoSpaceAvailable { class })?;
        space.occupied = true;
        Ok(space.clone())
    }

    async fn release_space(&self, id: SpaceId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let space = inner
            .spaces
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SpaceNotFound { id })?;
        space.occupied = false;
        Ok(())
    }

    async fn has_active_session(&self, plate: &Plate) -> Result<bool, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .any(|s| &s.plate == plate && !s.status.is_terminal()))
    }

    async fn save_session(&self, session: &ParkingSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(ticket) = &session.ticket {
            inner.ticket_index.insert(ticket.0.clone(), session.id.clone());
        }
        inner.sessions.insert(session.id.0.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Option<ParkingSession>, StoreError> {
        Ok(self.inner.lock().sessions.get(&id.0).cloned())
    }

    async fn find_by_ticket(&self, code: &str) -> Result<Option<ParkingSession>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .ticket_index
            .get(code)
            .and_then(|sid| inner.sessions.get(&sid.0))
            .cloned())
    }

    async fn generate_ticket_code(&self) -> Result<TicketCode, StoreError> {
        let mut inner = self.inner.lock();
        loop {
            let suffix = Uuid::now_v7().simple().to_string();
            let code =
                format!("TKT{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[suffix.len() - 6..]);
            if inner.issued_codes.insert(code.clone()) {
                return Ok(TicketCode(code));
            }
        }
    }

    async fn active_schedule(
        &self,
        class: VehicleClass,
        at: DateTime<Utc>,
    ) -> Result<RateSchedule, StoreError> {
        let inner = self.inner.lock();
        inner
            .schedules
            .iter()
            .filter(|s| s.class == class && s.is_active_at(at))
            .max_by_key(|s| s.version)
            .cloned()
            .ok_or(StoreError::ScheduleNotFound { class, at })
    }

    async fn sessions_in_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<ParkingSession>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.sessions.values().filter(|s| s.status == status).cloned().collect())
    }

    async fn occupancy(&self) -> Result<(usize, usize), StoreError> {
        let inner = self.inner.lock();
        let total = inner.spaces.iter().filter(|s| s.active).count();
        let occupied = inner.spaces.iter().filter(|s| s.active && s.occupied).count();
        Ok((occupied, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_with_spaces() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed_spaces(VehicleClass::Car, 2);
        store.seed_spaces(VehicleClass::Motorcycle, 1);
        store
    }

    #[tokio::test]
    async fn test_reserve_lowest_id_first() {
        let store = store_with_spaces();

        let first = store.reserve_space(VehicleClass::Car).await.unwrap();
        assert_eq!(first.id, SpaceId(1));
        assert_eq!(first.label, "C01");

        let second = store.reserve_space(VehicleClass::Car).await.unwrap();
        assert_eq!(second.id, SpaceId(2));

        let err = store.reserve_space(VehicleClass::Car).await.unwrap_err();
        assert!(matches!(err, StoreError::NoSpaceAvailable { class: VehicleClass::Car }));
    }

    #[tokio::test]
    async fn test_release_returns_space_to_pool() {
        let store = store_with_spaces();
        let space = store.reserve_space(VehicleClass::Motorcycle).await.unwrap();

        store.release_space(space.id).await.unwrap();
        let again = store.reserve_space(VehicleClass::Motorcycle).await.unwrap();
        assert_eq!(again.id, space.id);
    }

    #[tokio::test]
    async fn test_inactive_space_never_allocated() {
        let store = MemoryStore::new();
        store.seed_spaces(VehicleClass::Car, 1);
        assert!(store.set_space_active(SpaceId(1), false));

        let err = store.reserve_space(VehicleClass::Car).await.unwrap_err();
        assert!(matches!(err, StoreError::NoSpaceAvailable { .. }));
    }

    #[tokio::test]
    async fn test_ticket_codes_unique() {
        let store = MemoryStore::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let code = store.generate_ticket_code().await.unwrap();
            assert!(code.as_str().starts_with("TKT"));
            assert!(seen.insert(code.0));
        }
    }

    #[tokio::test]
    async fn test_has_active_session_ignores_terminal() {
        let store = store_with_spaces();
        let plate = Plate::new("B1234XY").unwrap();

        let mut session = ParkingSession::new(plate.clone(), VehicleClass::Car);
        store.save_session(&session).await.unwrap();
        assert!(store.has_active_session(&plate).await.unwrap());

        session.transition(SessionStatus::Rejected).unwrap();
        store.save_session(&session).await.unwrap();
        assert!(!store.has_active_session(&plate).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_ticket() {
        let store = store_with_spaces();
        let mut session =
            ParkingSession::new(Plate::new("B1234XY").unwrap(), VehicleClass::Car);
        session.ticket = Some(TicketCode("TKT-X".to_string()));
        store.save_session(&session).await.unwrap();

        let found = store.find_by_ticket("TKT-X").await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert!(store.find_by_ticket("TKT-MISSING").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_schedule_picks_highest_active_version() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let cut = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let mut v1 = crate::domain::rates::RateSchedule {
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
            effective_from: t0,
            effective_to: Some(cut),
        };
        store.add_schedule(v1.clone());
        v1.version = 2;
        v1.hourly_rate = 6000;
        v1.effective_from = cut;
        v1.effective_to = None;
        store.add_schedule(v1);

        let before = store
            .active_schedule(VehicleClass::Car, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(before.version, 1);

        let after = store
            .active_schedule(VehicleClass::Car, Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.hourly_rate, 6000);

        let err = store
            .active_schedule(
                VehicleClass::Motorcycle,
                Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ScheduleNotFound { .. }));
    }
}
