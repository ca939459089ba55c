//! Per-facility connectivity state machine
//!
//! Lifecycle: `Uninitialized -> Initializing -> Ready <-> Busy`, with
//! `Degraded` entered on an operation failure and `Failed` entered once
//! consecutive failures reach the configured threshold. `Degraded` still
//! accepts operations best-effort; `Failed` rejects everything until an
//! explicit re-initialization succeeds.

use crate::domain::session::epoch_ms;
use crate::domain::types::FacilityId;
use crate::io::serial_link::DeviceLink;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Facility connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilityStatus {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Degraded,
    Failed,
}

impl FacilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityStatus::Uninitialized => "uninitialized",
            FacilityStatus::Initializing => "initializing",
            FacilityStatus::Ready => "ready",
            FacilityStatus::Busy => "busy",
            FacilityStatus::Degraded => "degraded",
            FacilityStatus::Failed => "failed",
        }
    }

    /// Whether new operations are accepted in this state
    pub fn accepts_operations(&self) -> bool {
        matches!(self, FacilityStatus::Ready | FacilityStatus::Busy | FacilityStatus::Degraded)
    }
}

impl std::fmt::Display for FacilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change worth broadcasting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub prev: FacilityStatus,
    pub new: FacilityStatus,
    pub error: Option<String>,
}

/// Mutable bookkeeping guarded by the status mutex
struct StatusCell {
    status: FacilityStatus,
    last_error: Option<String>,
    last_ok_at: Option<u64>,
    consecutive_failures: u32,
}

/// Read-only view of a facility's health
#[derive(Debug, Clone)]
pub struct FacilitySnapshot {
    pub id: FacilityId,
    pub status: FacilityStatus,
    pub last_error: Option<String>,
    pub last_ok_at: Option<u64>,
    pub consecutive_failures: u32,
}

/// One hardware facility: its device link, exclusive slot and health state
pub struct Facility {
    pub id: FacilityId,
    pub link: Arc<dyn DeviceLink>,
    /// Exclusive operation slot. The tokio mutex queues waiters in FIFO
    /// order; the guarded value is the next frame sequence number, which may
    /// only advance while the slot is held.
    pub slot: Mutex<u8>,
    cell: parking_lot::Mutex<StatusCell>,
    failed_threshold: u32,
}

impl Facility {
    pub fn new(id: FacilityId, link: Arc<dyn DeviceLink>, failed_threshold: u32) -> Self {
        Self {
            id,
            link,
            slot: Mutex::new(0),
            cell: parking_lot::Mutex::new(StatusCell {
                status: FacilityStatus::Uninitialized,
                last_error: None,
                last_ok_at: None,
                consecutive_failures: 0,
            }),
            failed_threshold,
        }
    }

    pub fn status(&self) -> FacilityStatus {
        self.cell.lock().status
    }

    pub fn snapshot(&self) -> FacilitySnapshot {
        let cell = self.cell.lock();
        FacilitySnapshot {
            id: self.id,
            status: cell.status,
            last_error: cell.last_error.clone(),
            last_ok_at: cell.last_ok_at,
            consecutive_failures: cell.consecutive_failures,
        }
    }

    /// Force a status, returning the transition if the state actually changed
    pub fn set_status(&self, new: FacilityStatus) -> Option<Transition> {
        let mut cell = self.cell.lock();
        if cell.status == new {
            return None;
        }
        let prev = cell.status;
        cell.status = new;
        Some(Transition { prev, new, error: cell.last_error.clone() })
    }

    /// Record a successful operation: resets the failure streak and returns
    /// to `Ready` (surfacing the recovery transition if it left `Degraded`).
    pub fn record_success(&self) -> Option<Transition> {
        let mut cell = self.cell.lock();
        cell.consecutive_failures = 0;
        cell.last_error = None;
        cell.last_ok_at = Some(epoch_ms());
        if cell.status == FacilityStatus::Ready {
            return None;
        }
        let prev = cell.status;
        cell.status = FacilityStatus::Ready;
        Some(Transition { prev, new: FacilityStatus::Ready, error: None })
    }

    /// Record a failed operation: `Degraded` on the first failures, `Failed`
    /// once the consecutive-failure threshold is reached.
    pub fn record_failure(&self, error: &str) -> Option<Transition> {
        let mut cell = self.cell.lock();
        cell.consecutive_failures += 1;
        cell.last_error = Some(error.to_string());

        let next = if cell.consecutive_failures >= self.failed_threshold {
            FacilityStatus::Failed
        } else {
            FacilityStatus::Degraded
        };
        if cell.status == next {
            return None;
        }
        let prev = cell.status;
        cell.status = next;
        Some(Transition { prev, new: next, error: cell.last_error.clone() })
    }

    /// Initialization failure always lands in `Failed`
    pub fn record_init_failure(&self, error: &str) -> Option<Transition> {
        let mut cell = self.cell.lock();
        cell.consecutive_failures += 1;
        cell.last_error = Some(error.to_string());
        if cell.status == FacilityStatus::Failed {
            return None;
        }
        let prev = cell.status;
        cell.status = FacilityStatus::Failed;
        Some(Transition { prev, new: FacilityStatus::Failed, error: cell.last_error.clone() })
    }
}
