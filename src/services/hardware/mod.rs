//! Hardware coordinator - serialized access to camera, barriers and printer
//!
//! Each facility owns a strict FIFO exclusive slot, so concurrent sessions
//! never interleave frames destined for the same device, while operations on
//! different facilities (capturing for one lane, opening a barrier for
//! another) proceed concurrently. Capture and print retry transient failures
//! with linear backoff; barrier actuation is never retried internally - a
//! second open command to a gate that may already have opened is unsafe, so
//! an ack timeout surfaces as "physical state unknown" and the caller runs a
//! verifying status poll.

mod facility;

pub use facility::{Facility, FacilitySnapshot, FacilityStatus, Transition};

use crate::domain::types::{BarrierState, FacilityId, GateCommand, GateId, ImageRef};
use crate::infra::metrics::Metrics;
use crate::io::events::{EventSender, FacilityStatePayload};
use crate::io::protocol::{
    build_frame, facility_address, ACK_OK, CMD_CAPTURE, CMD_CLOSE, CMD_INIT, CMD_OPEN, CMD_PRINT,
    CMD_STATUS,
};
use crate::io::serial_link::{DeviceLink, LinkError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::MutexGuard;
use tracing::{info, warn};

/// Hardware failure taxonomy surfaced to the session layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum HardwareError {
    #[error("{facility} unavailable: {reason}")]
    Unavailable { facility: FacilityId, reason: String },
    #[error("{facility} busy: slot wait timed out")]
    Busy { facility: FacilityId },
    #[error("capture timed out")]
    CaptureTimeout,
    #[error("capture failed: {reason}")]
    CaptureFailed { reason: String },
    #[error("gate {gate} acknowledgment timed out, physical state unknown")]
    ActuationTimeout { gate: GateId },
    #[error("gate {gate} actuation failed: {reason}")]
    ActuationFailed { gate: GateId, reason: String },
    #[error("printer offline")]
    PrinterOffline,
    #[error("print failed: {reason}")]
    PrintFailed { reason: String },
    #[error("unknown gate {gate}")]
    UnknownGate { gate: GateId },
}

impl HardwareError {
    /// The outer layer may simply ask the caller to retry later
    pub fn is_retry_later(&self) -> bool {
        matches!(self, HardwareError::Busy { .. })
    }

    /// Physical state unknown - an operator must verify before proceeding
    pub fn needs_operator(&self) -> bool {
        matches!(self, HardwareError::ActuationTimeout { .. })
    }
}

/// Coordinator tuning knobs, filled from config
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Device acknowledgment window per command
    pub ack_timeout: Duration,
    /// How long a caller queues for a facility slot before `Busy`
    pub slot_timeout: Duration,
    /// Attempts for capture/print (actuation is single-shot)
    pub retry_attempts: u32,
    /// Linear backoff step between attempts
    pub retry_backoff: Duration,
    /// Consecutive failures before a facility is `Failed`
    pub failed_threshold: u32,
    /// Base path composed into image references
    pub image_base: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1000),
            slot_timeout: Duration::from_millis(2000),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            failed_threshold: 5,
            image_base: "images".to_string(),
        }
    }
}

/// Owns exclusive access to the imaging, barrier and printing facilities
pub struct HardwareCoordinator {
    camera: Facility,
    printer: Facility,
    gates: HashMap<GateId, Facility>,
    /// Serializes initialization across all facilities so a cold start
    /// cannot race a mid-flight reconfiguration
    init_lock: tokio::sync::Mutex<()>,
    events: EventSender,
    metrics: Arc<Metrics>,
    settings: CoordinatorSettings,
}

impl HardwareCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        camera_link: Arc<dyn DeviceLink>,
        printer_link: Arc<dyn DeviceLink>,
        gate_links: Vec<(GateId, Arc<dyn DeviceLink>)>,
        events: EventSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        let threshold = settings.failed_threshold;
        let gates = gate_links
            .into_iter()
            .map(|(id, link)| (id, Facility::new(FacilityId::Gate(id), link, threshold)))
            .collect();

        Self {
            camera: Facility::new(FacilityId::Camera, camera_link, threshold),
            printer: Facility::new(FacilityId::Printer, printer_link, threshold),
            gates,
            init_lock: tokio::sync::Mutex::new(()),
            events,
            metrics,
            settings,
        }
    }

    fn gate(&self, id: GateId) -> Result<&Facility, HardwareError> {
        self.gates.get(&id).ok_or(HardwareError::UnknownGate { gate: id })
    }

    /// Broadcast a facility transition, if there was one
    fn emit(&self, facility: FacilityId, transition: Option<Transition>) {
        let Some(t) = transition else { return };
        info!(
            facility = %facility,
            prev = %t.prev,
            new = %t.new,
            error = t.error.as_deref().unwrap_or(""),
            "facility_state_changed"
        );
        self.events.send_facility_state(FacilityStatePayload::new(
            facility,
            t.prev,
            t.new,
            t.error,
        ));
    }

    /// Queue for the facility's exclusive slot, bounded by the slot timeout
    async fn acquire_slot<'a>(
        &self,
        facility: &'a Facility,
    ) -> Result<MutexGuard<'a, u8>, HardwareError> {
        match tokio::time::timeout(self.settings.slot_timeout, facility.slot.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(facility = %facility.id, "facility_slot_wait_timeout");
                Err(HardwareError::Busy { facility: facility.id })
            }
        }
    }

    fn check_accepts(&self, facility: &Facility) -> Result<(), HardwareError> {
        let status = facility.status();
        if !status.accepts_operations() {
            return Err(HardwareError::Unavailable {
                facility: facility.id,
                reason: format!("facility is {status}"),
            });
        }
        Ok(())
    }

    /// Busy is bookkeeping only; Ready<->Busy flips are not broadcast
    fn mark_busy(facility: &Facility) {
        if facility.status() == FacilityStatus::Ready {
            facility.set_status(FacilityStatus::Busy);
        }
    }

    /// Initialize one facility. Idempotent: safe to call while `Ready`.
    pub async fn initialize(&self, id: FacilityId) -> Result<(), HardwareError> {
        let _cold_start = self.init_lock.lock().await;
        let facility = match id {
            FacilityId::Camera => &self.camera,
            FacilityId::Printer => &self.printer,
            FacilityId::Gate(g) => self.gate(g)?,
        };

        if facility.status() == FacilityStatus::Ready {
            return Ok(());
        }

        self.emit(id, facility.set_status(FacilityStatus::Initializing));

        if let Err(e) = facility.link.open().await {
            self.emit(id, facility.record_init_failure(&e.to_string()));
            return Err(HardwareError::Unavailable { facility: id, reason: e.to_string() });
        }

        // Init handshake confirms the device answers on the line
        let mut seq = self.acquire_slot(facility).await?;
        let s = *seq;
        *seq = seq.wrapping_add(1);
        let frame = build_frame(s, facility_address(id), CMD_INIT, &[]);

        match facility.link.transact(&frame, self.settings.ack_timeout).await {
            Ok(ack) if ack.ack_status() == Some(ACK_OK) => {
                self.emit(id, facility.record_success());
                info!(facility = %id, "facility_initialized");
                Ok(())
            }
            Ok(ack) => {
                let reason = format!("init rejected, status 0x{:02X}", ack.ack_status().unwrap_or(0xFF));
                self.emit(id, facility.record_init_failure(&reason));
                Err(HardwareError::Unavailable { facility: id, reason })
            }
            Err(e) => {
                self.emit(id, facility.record_init_failure(&e.to_string()));
                Err(HardwareError::Unavailable { facility: id, reason: e.to_string() })
            }
        }
    }

    /// Initialize every facility, logging failures and carrying on; facilities
    /// left `Failed` reject operations until re-initialized.
    pub async fn initialize_all(&self) {
        let mut ids = vec![FacilityId::Camera];
        let mut gate_ids: Vec<GateId> = self.gates.keys().copied().collect();
        gate_ids.sort();
        ids.extend(gate_ids.into_iter().map(FacilityId::Gate));
        ids.push(FacilityId::Printer);

        for id in ids {
            if let Err(e) = self.initialize(id).await {
                warn!(facility = %id, error = %e, "facility_init_failed");
            }
        }
    }

    /// Capture an image on the imaging facility.
    ///
    /// Queues FIFO behind the camera's single slot; transient failures are
    /// retried internally with linear backoff before surfacing.
    pub async fn capture(
        &self,
        session_hint: &str,
        timeout: Duration,
    ) -> Result<ImageRef, HardwareError> {
        let facility = &self.camera;
        self.check_accepts(facility)?;
        let mut seq = self.acquire_slot(facility).await?;
        Self::mark_busy(facility);

        let start = Instant::now();
        let mut last_err = HardwareError::CaptureFailed { reason: "no attempts".to_string() };

        for attempt in 1..=self.settings.retry_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.retry_backoff * (attempt - 1)).await;
            }
            let s = *seq;
            *seq = seq.wrapping_add(1);
            let frame =
                build_frame(s, facility_address(facility.id), CMD_CAPTURE, session_hint.as_bytes());

            match facility.link.transact(&frame, timeout).await {
                Ok(ack) if ack.ack_status() == Some(ACK_OK) => {
                    self.emit(facility.id, facility.record_success());
                    let latency_us = start.elapsed().as_micros() as u64;
                    self.metrics.record_capture(latency_us, true);

                    let image = if ack.ack_data().is_empty() {
                        format!(
                            "{}/entry/{}_{}.jpg",
                            self.settings.image_base,
                            session_hint,
                            Utc::now().format("%Y%m%d_%H%M%S")
                        )
                    } else {
                        String::from_utf8_lossy(ack.ack_data()).to_string()
                    };
                    info!(hint = %session_hint, image = %image, latency_us, "capture_ok");
                    return Ok(ImageRef(image));
                }
                Ok(ack) => {
                    let reason =
                        format!("device status 0x{:02X}", ack.ack_status().unwrap_or(0xFF));
                    warn!(hint = %session_hint, attempt, reason = %reason, "capture_attempt_failed");
                    last_err = HardwareError::CaptureFailed { reason };
                }
                Err(LinkError::AckTimeout) => {
                    warn!(hint = %session_hint, attempt, "capture_attempt_timeout");
                    last_err = HardwareError::CaptureTimeout;
                }
                Err(e) => {
                    warn!(hint = %session_hint, attempt, error = %e, "capture_attempt_failed");
                    last_err = HardwareError::CaptureFailed { reason: e.to_string() };
                }
            }
        }

        self.emit(facility.id, facility.record_failure(&last_err.to_string()));
        self.metrics.record_capture(start.elapsed().as_micros() as u64, false);
        Err(last_err)
    }

    /// Actuate one barrier. Single-shot: never retried internally.
    ///
    /// On `ActuationTimeout` the physical state is unknown - run `poll_gate`
    /// before deciding anything; do not assume success or failure.
    pub async fn actuate(
        &self,
        gate: GateId,
        command: GateCommand,
        timeout: Duration,
    ) -> Result<(), HardwareError> {
        let facility = self.gate(gate)?;
        self.check_accepts(facility)?;
        let mut seq = self.acquire_slot(facility).await?;
        Self::mark_busy(facility);

        let start = Instant::now();
        let s = *seq;
        *seq = seq.wrapping_add(1);
        let cmd_byte = match command {
            GateCommand::Open => CMD_OPEN,
            GateCommand::Close => CMD_CLOSE,
        };
        let frame = build_frame(s, facility_address(facility.id), cmd_byte, &[]);

        info!(gate = %gate, command = %command.as_str(), "gate_cmd_sent");

        match facility.link.transact(&frame, timeout).await {
            Ok(ack) if ack.ack_status() == Some(ACK_OK) => {
                self.emit(facility.id, facility.record_success());
                let latency_us = start.elapsed().as_micros() as u64;
                self.metrics.record_actuation(latency_us, true);
                info!(gate = %gate, command = %command.as_str(), latency_us, "gate_cmd_acked");
                Ok(())
            }
            Ok(ack) => {
                let reason = format!("device status 0x{:02X}", ack.ack_status().unwrap_or(0xFF));
                self.emit(facility.id, facility.record_failure(&reason));
                self.metrics.record_actuation(start.elapsed().as_micros() as u64, false);
                Err(HardwareError::ActuationFailed { gate, reason })
            }
            Err(LinkError::AckTimeout) => {
                self.emit(facility.id, facility.record_failure("ack timeout"));
                self.metrics.record_actuation(start.elapsed().as_micros() as u64, false);
                warn!(gate = %gate, command = %command.as_str(), "gate_ack_timeout");
                Err(HardwareError::ActuationTimeout { gate })
            }
            Err(e) => {
                self.emit(facility.id, facility.record_failure(&e.to_string()));
                self.metrics.record_actuation(start.elapsed().as_micros() as u64, false);
                Err(HardwareError::ActuationFailed { gate, reason: e.to_string() })
            }
        }
    }

    /// Verifying status poll, used to reconcile an unknown barrier state
    /// after an actuation timeout.
    pub async fn poll_gate(&self, gate: GateId) -> Result<BarrierState, HardwareError> {
        let facility = self.gate(gate)?;
        self.check_accepts(facility)?;
        let mut seq = self.acquire_slot(facility).await?;

        let s = *seq;
        *seq = seq.wrapping_add(1);
        let frame = build_frame(s, facility_address(facility.id), CMD_STATUS, &[]);

        match facility.link.transact(&frame, self.settings.ack_timeout).await {
            Ok(ack) if ack.ack_status() == Some(ACK_OK) => {
                self.emit(facility.id, facility.record_success());
                let state =
                    ack.ack_data().first().map(|&b| BarrierState::from_code(b)).unwrap_or(BarrierState::Unknown);
                info!(gate = %gate, state = %state.as_str(), "gate_status_polled");
                Ok(state)
            }
            Ok(ack) => {
                let reason = format!("device status 0x{:02X}", ack.ack_status().unwrap_or(0xFF));
                self.emit(facility.id, facility.record_failure(&reason));
                Err(HardwareError::Unavailable { facility: facility.id, reason })
            }
            Err(e) => {
                self.emit(facility.id, facility.record_failure(&e.to_string()));
                Err(HardwareError::Unavailable { facility: facility.id, reason: e.to_string() })
            }
        }
    }

    /// Print a ticket body on the printer facility. Retries like capture.
    pub async fn print(&self, content: &str, timeout: Duration) -> Result<(), HardwareError> {
        let facility = &self.printer;
        self.check_accepts(facility)?;
        let mut seq = self.acquire_slot(facility).await?;
        Self::mark_busy(facility);

        let start = Instant::now();
        let mut last_err = HardwareError::PrintFailed { reason: "no attempts".to_string() };

        for attempt in 1..=self.settings.retry_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.retry_backoff * (attempt - 1)).await;
            }
            let s = *seq;
            *seq = seq.wrapping_add(1);
            let frame = build_frame(s, facility_address(facility.id), CMD_PRINT, content.as_bytes());

            match facility.link.transact(&frame, timeout).await {
                Ok(ack) if ack.ack_status() == Some(ACK_OK) => {
                    self.emit(facility.id, facility.record_success());
                    let latency_us = start.elapsed().as_micros() as u64;
                    self.metrics.record_print(latency_us, true);
                    info!(bytes = content.len(), latency_us, "print_ok");
                    return Ok(());
                }
                Ok(ack) => {
                    let reason =
                        format!("device status 0x{:02X}", ack.ack_status().unwrap_or(0xFF));
                    warn!(attempt, reason = %reason, "print_attempt_failed");
                    last_err = HardwareError::PrintFailed { reason };
                }
                Err(LinkError::NotOpen) | Err(LinkError::Open(_)) => {
                    warn!(attempt, "print_attempt_offline");
                    last_err = HardwareError::PrinterOffline;
                }
                Err(LinkError::AckTimeout) => {
                    warn!(attempt, "print_attempt_timeout");
                    last_err = HardwareError::PrintFailed { reason: "ack timeout".to_string() };
                }
                Err(e) => {
                    warn!(attempt, error = %e, "print_attempt_failed");
                    last_err = HardwareError::PrintFailed { reason: e.to_string() };
                }
            }
        }

        self.emit(facility.id, facility.record_failure(&last_err.to_string()));
        self.metrics.record_print(start.elapsed().as_micros() as u64, false);
        Err(last_err)
    }

    /// Current status of one facility
    pub fn status(&self, id: FacilityId) -> FacilityStatus {
        match id {
            FacilityId::Camera => self.camera.status(),
            FacilityId::Printer => self.printer.status(),
            FacilityId::Gate(g) => {
                self.gates.get(&g).map(|f| f.status()).unwrap_or(FacilityStatus::Uninitialized)
            }
        }
    }

    /// Health snapshot of every facility (camera, gates by id, printer)
    pub fn snapshots(&self) -> Vec<FacilitySnapshot> {
        let mut out = vec![self.camera.snapshot()];
        let mut gate_ids: Vec<GateId> = self.gates.keys().copied().collect();
        gate_ids.sort();
        for id in gate_ids {
            out.push(self.gates[&id].snapshot());
        }
        out.push(self.printer.snapshot());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::events::create_event_channel;
    use crate::io::protocol::{CMD_OPEN, CMD_PRINT};
    use crate::io::serial_link::MockLink;
    use std::sync::atomic::Ordering;

    struct Rig {
        coordinator: HardwareCoordinator,
        camera: Arc<MockLink>,
        printer: Arc<MockLink>,
        gate_a: Arc<MockLink>,
        _rx: tokio::sync::mpsc::Receiver<crate::io::events::ParkingEvent>,
    }

    fn rig(settings: CoordinatorSettings) -> Rig {
        let camera = Arc::new(MockLink::new());
        let printer = Arc::new(MockLink::new());
        let gate_a = Arc::new(MockLink::new());
        let (events, rx) = create_event_channel(64, "test".to_string());

        let coordinator = HardwareCoordinator::new(
            settings,
            camera.clone(),
            printer.clone(),
            vec![(GateId(1), gate_a.clone()), (GateId(2), Arc::new(MockLink::new()))],
            events,
            Arc::new(Metrics::new()),
        );
        Rig { coordinator, camera, printer, gate_a, _rx: rx }
    }

    fn fast_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            ack_timeout: Duration::from_millis(50),
            slot_timeout: Duration::from_millis(100),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            failed_threshold: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();
        assert_eq!(r.coordinator.status(FacilityId::Camera), FacilityStatus::Ready);

        // Second init is a no-op, not an error
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();
        assert_eq!(r.camera.sent_count(CMD_INIT), 1);
    }

    #[tokio::test]
    async fn test_initialize_failure_is_failed_state() {
        let r = rig(fast_settings());
        r.camera.fail_open.store(true, Ordering::Relaxed);

        let err = r.coordinator.initialize(FacilityId::Camera).await.unwrap_err();
        assert!(matches!(err, HardwareError::Unavailable { .. }));
        assert_eq!(r.coordinator.status(FacilityId::Camera), FacilityStatus::Failed);

        // Failed facilities reject operations until re-initialized
        let err = r.coordinator.capture("S1", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, HardwareError::Unavailable { .. }));

        // Re-initialization recovers
        r.camera.fail_open.store(false, Ordering::Relaxed);
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();
        assert_eq!(r.coordinator.status(FacilityId::Camera), FacilityStatus::Ready);
    }

    #[tokio::test]
    async fn test_capture_returns_image_ref() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();

        let image = r.coordinator.capture("TKT1", Duration::from_millis(50)).await.unwrap();
        assert!(image.0.contains("TKT1"));
    }

    #[tokio::test]
    async fn test_capture_retries_then_succeeds() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();
        r.camera.fail_next.store(2, Ordering::Relaxed);

        r.coordinator.capture("TKT1", Duration::from_millis(50)).await.unwrap();
        // 3 capture attempts: 2 failed, 1 ok
        assert_eq!(r.camera.sent_count(CMD_CAPTURE), 3);
        assert_eq!(r.coordinator.status(FacilityId::Camera), FacilityStatus::Ready);
    }

    #[tokio::test]
    async fn test_capture_exhausts_retries_and_degrades() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();
        r.camera.fail_next.store(10, Ordering::Relaxed);

        let err = r.coordinator.capture("TKT1", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, HardwareError::CaptureFailed { .. }));
        assert_eq!(r.camera.sent_count(CMD_CAPTURE), 3);
        assert_eq!(r.coordinator.status(FacilityId::Camera), FacilityStatus::Degraded);
    }

    #[tokio::test]
    async fn test_actuate_is_single_shot() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Gate(GateId(1))).await.unwrap();
        r.gate_a.drop_acks.store(true, Ordering::Relaxed);

        let err = r
            .coordinator
            .actuate(GateId(1), GateCommand::Open, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::ActuationTimeout { gate: GateId(1) }));
        assert!(err.needs_operator());
        // Exactly one open frame: never retried internally
        assert_eq!(r.gate_a.sent_count(CMD_OPEN), 1);
    }

    #[tokio::test]
    async fn test_poll_gate_reconciles_state() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Gate(GateId(1))).await.unwrap();

        assert_eq!(r.coordinator.poll_gate(GateId(1)).await.unwrap(), BarrierState::Closed);
        r.coordinator.actuate(GateId(1), GateCommand::Open, Duration::from_millis(50)).await.unwrap();
        assert_eq!(r.coordinator.poll_gate(GateId(1)).await.unwrap(), BarrierState::Open);
    }

    #[tokio::test]
    async fn test_unknown_gate() {
        let r = rig(fast_settings());
        let err = r
            .coordinator
            .actuate(GateId(9), GateCommand::Open, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::UnknownGate { gate: GateId(9) }));
    }

    #[tokio::test]
    async fn test_facility_failed_after_threshold() {
        let r = rig(fast_settings());
        r.coordinator.initialize(FacilityId::Printer).await.unwrap();
        r.printer.fail_next.store(100, Ordering::Relaxed);

        for _ in 0..3 {
            let _ = r.coordinator.print("x", Duration::from_millis(20)).await;
        }
        assert_eq!(r.coordinator.status(FacilityId::Printer), FacilityStatus::Failed);

        let err = r.coordinator.print("x", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, HardwareError::Unavailable { .. }));
        assert_eq!(r.printer.sent_count(CMD_PRINT), 9); // 3 ops x 3 attempts, none after Failed
    }

    #[tokio::test]
    async fn test_different_facilities_do_not_block_each_other() {
        let r = rig(CoordinatorSettings {
            ack_timeout: Duration::from_millis(500),
            slot_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            ..fast_settings()
        });
        r.coordinator.initialize_all().await;

        // Camera holds its slot for the whole ack window...
        r.camera.drop_acks.store(true, Ordering::Relaxed);
        let coordinator = Arc::new(r.coordinator);
        let slow = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.capture("SLOW", Duration::from_millis(400)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // ...while the gate actuates immediately
        let start = Instant::now();
        coordinator.actuate(GateId(1), GateCommand::Open, Duration::from_millis(100)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));

        let _ = slow.await;
    }

    #[tokio::test]
    async fn test_same_facility_slot_times_out_as_busy() {
        let r = rig(CoordinatorSettings {
            ack_timeout: Duration::from_millis(500),
            slot_timeout: Duration::from_millis(30),
            retry_attempts: 1,
            ..fast_settings()
        });
        r.coordinator.initialize(FacilityId::Camera).await.unwrap();
        r.camera.drop_acks.store(true, Ordering::Relaxed);

        let coordinator = Arc::new(r.coordinator);
        let slow = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.capture("SLOW", Duration::from_millis(400)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = coordinator.capture("FAST", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, HardwareError::Busy { facility: FacilityId::Camera }));
        assert!(err.is_retry_later());

        let _ = slow.await;
    }

    #[tokio::test]
    async fn test_snapshots_ordered() {
        let r = rig(fast_settings());
        let snaps = r.coordinator.snapshots();
        assert_eq!(snaps.len(), 4); // camera, gate-1, gate-2, printer
        assert_eq!(snaps[0].id, FacilityId::Camera);
        assert_eq!(snaps[1].id, FacilityId::Gate(GateId(1)));
        assert_eq!(snaps[3].id, FacilityId::Printer);
    }
}
