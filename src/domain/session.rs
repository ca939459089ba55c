//! Parking session data model - one vehicle's stay from entry request to completion

use crate::domain::types::{
    ImageRef, PaymentMethod, PaymentStatus, Plate, SpaceId, VehicleClass,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for session ids (UUIDv7)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(new_uuid_v7())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for ticket codes printed on entry receipts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct TicketCode(pub String);

impl TicketCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TicketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Requested,
    Allocating,
    Active,
    ExitPending,
    AwaitingPayment,
    Completing,
    Completed,
    Rejected,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Requested => "requested",
            SessionStatus::Allocating => "allocating",
            SessionStatus::Active => "active",
            SessionStatus::ExitPending => "exit_pending",
            SessionStatus::AwaitingPayment => "awaiting_payment",
            SessionStatus::Completing => "completing",
            SessionStatus::Completed => "completed",
            SessionStatus::Rejected => "rejected",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Rejected | SessionStatus::Cancelled
        )
    }

    /// States an operator may cancel from
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Allocating
                | SessionStatus::Active
                | SessionStatus::ExitPending
                | SessionStatus::AwaitingPayment
        )
    }

    /// Whether a transition to `next` is legal
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Requested, Allocating)
                | (Requested, Rejected)
                | (Allocating, Active)
                | (Allocating, Rejected)
                | (Allocating, Cancelled)
                | (Active, ExitPending)
                | (Active, Cancelled)
                | (ExitPending, AwaitingPayment)
                | (ExitPending, Cancelled)
                | (AwaitingPayment, Completing)
                | (AwaitingPayment, Cancelled)
                | (Completing, Completed)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted transition not permitted by the lifecycle graph
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Event types that can occur during a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventType {
    Created,
    SpaceReserved,
    SpaceReleased,
    TicketIssued,
    ImageCaptured,
    TicketPrinted,
    GateCmd,
    GateOpen,
    FeeQuoted,
    PaymentConfirmed,
    OperatorOverride,
}

impl SessionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventType::Created => "created",
            SessionEventType::SpaceReserved => "space_reserved",
            SessionEventType::SpaceReleased => "space_released",
            SessionEventType::TicketIssued => "ticket_issued",
            SessionEventType::ImageCaptured => "image_captured",
            SessionEventType::TicketPrinted => "ticket_printed",
            SessionEventType::GateCmd => "gate_cmd",
            SessionEventType::GateOpen => "gate_open",
            SessionEventType::FeeQuoted => "fee_quoted",
            SessionEventType::PaymentConfirmed => "payment_confirmed",
            SessionEventType::OperatorOverride => "operator_override",
        }
    }
}

/// A single event in a session's append-only log
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub t: SessionEventType,   // event type
    pub ts: u64,               // epoch ms
    pub extra: Option<String>, // additional data
}

impl SessionEvent {
    pub fn new(event_type: SessionEventType, ts: u64) -> Self {
        Self { t: event_type, ts, extra: None }
    }

    pub fn with_extra(mut self, extra: &str) -> Self {
        self.extra = Some(extra.to_string());
        self
    }

    /// Convert to JSON value for short-key format
    fn to_json_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("t".to_string(), serde_json::Value::String(self.t.as_str().to_string()));
        obj.insert("ts".to_string(), serde_json::Value::Number(self.ts.into()));
        if let Some(x) = &self.extra {
            obj.insert("x".to_string(), serde_json::Value::String(x.clone()));
        }
        serde_json::Value::Object(obj)
    }
}

/// Complete record of one vehicle's occupancy
#[derive(Debug, Clone)]
pub struct ParkingSession {
    pub id: SessionId,
    pub plate: Plate,
    pub class: VehicleClass,
    pub space: Option<SpaceId>,
    pub ticket: Option<TicketCode>,
    pub entry_at: DateTime<Utc>,
    pub exit_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Fee in minor currency units, set when the exit quote is computed
    pub fee: Option<i64>,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub entry_image: Option<ImageRef>,
    /// Rate schedule version the fee was computed against
    pub schedule_version: Option<u32>,
    pub events: Vec<SessionEvent>,
}

impl ParkingSession {
    /// Create a new session in `Requested` state.
    ///
    /// # Example
    ///
    /// ```
    /// use parkgate::domain::session::{ParkingSession, SessionStatus};
    /// use parkgate::domain::types::{Plate, VehicleClass};
    ///
    /// let session = ParkingSession::new(Plate::new("B1234XY").unwrap(), VehicleClass::Car);
    /// assert_eq!(session.status, SessionStatus::Requested);
    /// assert!(session.space.is_none());
    /// ```
    pub fn new(plate: Plate, class: VehicleClass) -> Self {
        let mut session = Self {
            id: SessionId::generate(),
            plate,
            class,
            space: None,
            ticket: None,
            entry_at: Utc::now(),
            exit_at: None,
            status: SessionStatus::Requested,
            fee: None,
            payment_status: PaymentStatus::Pending,
            payment_method: None,
            entry_image: None,
            schedule_version: None,
            events: Vec::with_capacity(8),
        };
        session.record(SessionEvent::new(SessionEventType::Created, epoch_ms()));
        session
    }

    /// Append an event to the session log
    pub fn record(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Advance the lifecycle. Returns the previous status on success.
    pub fn transition(&mut self, next: SessionStatus) -> Result<SessionStatus, InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }
        let previous = self.status;
        self.status = next;
        if next.is_terminal() && self.exit_at.is_none() {
            self.exit_at = Some(Utc::now());
        }
        Ok(previous)
    }

    /// Convert to short-key JSON string (without site)
    pub fn to_json(&self) -> String {
        self.to_json_with_site_opt(None)
    }

    /// Convert to short-key JSON string with site_id included
    pub fn to_json_with_site(&self, site_id: &str) -> String {
        self.to_json_with_site_opt(Some(site_id))
    }

    fn to_json_with_site_opt(&self, site_id: Option<&str>) -> String {
        let mut obj = serde_json::Map::new();

        if let Some(site) = site_id {
            obj.insert("site".to_string(), serde_json::Value::String(site.to_string()));
        }

        obj.insert("sid".to_string(), serde_json::Value::String(self.id.0.clone()));
        obj.insert("plate".to_string(), serde_json::Value::String(self.plate.as_str().to_string()));
        obj.insert("cls".to_string(), serde_json::Value::String(self.class.as_str().to_string()));
        obj.insert("st".to_string(), serde_json::Value::String(self.status.as_str().to_string()));

        if let Some(space) = self.space {
            obj.insert("space".to_string(), serde_json::Value::Number(space.0.into()));
        }
        if let Some(ticket) = &self.ticket {
            obj.insert("tkt".to_string(), serde_json::Value::String(ticket.0.clone()));
        }

        obj.insert(
            "t0".to_string(),
            serde_json::Value::Number(self.entry_at.timestamp_millis().into()),
        );
        if let Some(exit_at) = self.exit_at {
            obj.insert(
                "t1".to_string(),
                serde_json::Value::Number(exit_at.timestamp_millis().into()),
            );
        }

        if let Some(fee) = self.fee {
            obj.insert("fee".to_string(), serde_json::Value::Number(fee.into()));
        }
        obj.insert(
            "pay".to_string(),
            serde_json::Value::String(self.payment_status.as_str().to_string()),
        );
        if let Some(method) = self.payment_method {
            obj.insert("method".to_string(), serde_json::Value::String(method.as_str().to_string()));
        }
        if let Some(image) = &self.entry_image {
            obj.insert("img".to_string(), serde_json::Value::String(image.0.clone()));
        }
        if let Some(ver) = self.schedule_version {
            obj.insert("rate_ver".to_string(), serde_json::Value::Number(ver.into()));
        }

        let events: Vec<serde_json::Value> =
            self.events.iter().map(|e| e.to_json_value()).collect();
        obj.insert("ev".to_string(), serde_json::Value::Array(events));

        serde_json::Value::Object(obj).to_string()
    }
}
