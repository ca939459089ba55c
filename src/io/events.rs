//! Typed channel for state-change notifications
//!
//! The core only enqueues events; the broadcaster that fans them out to
//! operator dashboards and lane displays is an external consumer of the
//! receiver half. Sends never block: if the channel is full the event is
//! dropped, and delivery downstream is at-least-once, so consumers
//! de-duplicate by (session id, new state).

use crate::domain::session::{epoch_ms, SessionId, SessionStatus};
use crate::domain::types::FacilityId;
use crate::services::hardware::FacilityStatus;
use serde::Serialize;
use tokio::sync::mpsc;

/// Messages emitted by the core
#[derive(Debug)]
pub enum ParkingEvent {
    /// A session advanced through its lifecycle
    SessionState(SessionStatePayload),
    /// A hardware facility changed connectivity state
    FacilityState(FacilityStatePayload),
}

/// Payload for session lifecycle transitions
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatePayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub sid: String,
    /// Previous lifecycle state
    pub prev: &'static str,
    /// New lifecycle state
    pub new: &'static str,
    /// Timestamp (epoch ms)
    pub ts: u64,
}

impl SessionStatePayload {
    pub fn new(id: &SessionId, prev: SessionStatus, new: SessionStatus) -> Self {
        Self { site: None, sid: id.0.clone(), prev: prev.as_str(), new: new.as_str(), ts: epoch_ms() }
    }
}

/// Payload for facility connectivity transitions
#[derive(Debug, Clone, Serialize)]
pub struct FacilityStatePayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub facility: String,
    pub prev: &'static str,
    pub new: &'static str,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Last device error, present on Degraded/Failed transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FacilityStatePayload {
    pub fn new(
        facility: FacilityId,
        prev: FacilityStatus,
        new: FacilityStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            site: None,
            facility: facility.to_string(),
            prev: prev.as_str(),
            new: new.as_str(),
            ts: epoch_ms(),
            error,
        }
    }
}

/// Sender handle for core events
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, events are dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ParkingEvent>,
    site_id: String,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<ParkingEvent>, site_id: String) -> Self {
        Self { tx, site_id }
    }

    /// Enqueue a session state change, injecting the site id
    pub fn send_session_state(&self, mut payload: SessionStatePayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(ParkingEvent::SessionState(payload));
    }

    /// Enqueue a facility state change, injecting the site id
    pub fn send_facility_state(&self, mut payload: FacilityStatePayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(ParkingEvent::FacilityState(payload));
    }
}

/// Create a new event channel pair
///
/// Returns (sender, receiver) where the sender can be cloned and shared and
/// the receiver is handed to the external broadcaster.
pub fn create_event_channel(
    buffer_size: usize,
    site_id: String,
) -> (EventSender, mpsc::Receiver<ParkingEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EventSender::new(tx, site_id), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_payload_serializes() {
        let id = SessionId("0195f7e2-demo".to_string());
        let mut payload =
            SessionStatePayload::new(&id, SessionStatus::Requested, SessionStatus::Allocating);
        payload.site = Some("lot-a".to_string());

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["site"], "lot-a");
        assert_eq!(json["sid"], "0195f7e2-demo");
        assert_eq!(json["prev"], "requested");
        assert_eq!(json["new"], "allocating");
    }

    #[tokio::test]
    async fn test_sender_injects_site_and_never_blocks() {
        let (sender, mut rx) = create_event_channel(1, "lot-a".to_string());
        let id = SessionId("s1".to_string());

        sender.send_session_state(SessionStatePayload::new(
            &id,
            SessionStatus::Active,
            SessionStatus::ExitPending,
        ));
        // Channel full: this one is dropped, not blocked on
        sender.send_session_state(SessionStatePayload::new(
            &id,
            SessionStatus::ExitPending,
            SessionStatus::AwaitingPayment,
        ));

        let ParkingEvent::SessionState(payload) = rx.recv().await.unwrap() else {
            panic!("expected session event");
        };
        assert_eq!(payload.site.as_deref(), Some("lot-a"));
        assert_eq!(payload.new, "exit_pending");
        assert!(rx.try_recv().is_err());
    }
}
