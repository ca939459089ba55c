//! Session manager - drives each vehicle's session through its lifecycle
//!
//! Entry and exit flows translate hardware and rate outcomes into session
//! state while enforcing the global invariants: at most one non-terminal
//! session per plate, at most one active session per space. The duplicate
//! check and space reservation run as one short critical section under the
//! allocation lock (never any hardware I/O inside it); everything touching an
//! existing session is sequenced through that session's own lock.

use crate::domain::rates::{compute_fee, RateError};
use crate::domain::session::{
    InvalidTransition, ParkingSession, SessionEvent, SessionEventType, SessionId, SessionStatus,
    epoch_ms,
};
use crate::domain::ticket::TicketContent;
use crate::domain::types::{
    BarrierState, GateCommand, GateId, PaymentMethod, PaymentStatus, Plate, VehicleClass,
};
use crate::infra::metrics::Metrics;
use crate::io::events::{EventSender, SessionStatePayload};
use crate::services::hardware::{HardwareCoordinator, HardwareError};
use crate::services::store::{ParkingStore, SpaceRecord, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Failures surfaced by session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("plate {plate} already has an active session")]
    DuplicateActiveSession { plate: Plate },
    #[error("no space available for {class}")]
    NoSpaceAvailable { class: VehicleClass },
    #[error("unknown or invalid ticket")]
    InvalidTicket,
    #[error("session already completed")]
    AlreadyCompleted,
    #[error("payment mismatch: quoted {expected}, offered {offered}")]
    PaymentMismatch { expected: i64, offered: i64 },
    #[error("session not found")]
    SessionNotFound,
    #[error("operation not valid while session is {actual}")]
    InvalidState { actual: SessionStatus },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Rate(#[from] RateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// What the outer layer should tell the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Transient contention - try again shortly
    RetryLater,
    /// The request cannot succeed as stated
    NotPossible,
    /// An operator must intervene before this can proceed
    OperatorRequired,
    /// Persistence or internal fault
    Fatal,
}

impl SessionError {
    pub fn user_action(&self) -> UserAction {
        match self {
            SessionError::Hardware(e) if e.is_retry_later() => UserAction::RetryLater,
            SessionError::Hardware(e) if e.needs_operator() => UserAction::OperatorRequired,
            SessionError::Rate(_) => UserAction::OperatorRequired,
            SessionError::Hardware(_)
            | SessionError::DuplicateActiveSession { .. }
            | SessionError::NoSpaceAvailable { .. }
            | SessionError::InvalidTicket
            | SessionError::AlreadyCompleted
            | SessionError::PaymentMismatch { .. }
            | SessionError::SessionNotFound
            | SessionError::InvalidState { .. } => UserAction::NotPossible,
            SessionError::Store(_) | SessionError::Transition(_) => UserAction::Fatal,
        }
    }
}

/// Fee quote returned on exit request
#[derive(Debug, Clone)]
pub struct FeeQuote {
    pub session_id: SessionId,
    pub fee: i64,
    pub entry_at: chrono::DateTime<Utc>,
    pub exit_at: chrono::DateTime<Utc>,
    pub schedule_version: u32,
}

/// Session manager tuning, filled from config
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub entry_gate: GateId,
    pub exit_gate: GateId,
    pub capture_timeout: Duration,
    pub print_timeout: Duration,
    pub actuate_timeout: Duration,
    /// Sessions stuck in `Allocating` beyond this are swept to `Cancelled`
    pub allocating_ttl: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            entry_gate: GateId(1),
            exit_gate: GateId(2),
            capture_timeout: Duration::from_millis(2000),
            print_timeout: Duration::from_millis(2000),
            actuate_timeout: Duration::from_millis(1000),
            allocating_ttl: Duration::from_secs(120),
        }
    }
}

/// Orchestrates the per-vehicle state machine over hardware, rates and store
pub struct SessionManager {
    store: Arc<dyn ParkingStore>,
    hardware: Arc<HardwareCoordinator>,
    events: EventSender,
    metrics: Arc<Metrics>,
    settings: ManagerSettings,
    /// The single global serialization point: duplicate check + reservation
    alloc_lock: tokio::sync::Mutex<()>,
    /// Per-session sequencing locks, created on demand
    session_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn ParkingStore>,
        hardware: Arc<HardwareCoordinator>,
        events: EventSender,
        metrics: Arc<Metrics>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            hardware,
            events,
            metrics,
            settings,
            alloc_lock: tokio::sync::Mutex::new(()),
            session_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(&self, id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks.lock().entry(id.0.clone()).or_default().clone()
    }

    /// Transition, persist, broadcast. The store write is the commit point.
    async fn persist_transition(
        &self,
        session: &mut ParkingSession,
        next: SessionStatus,
    ) -> Result<(), SessionError> {
        let prev = session.transition(next)?;
        self.store.save_session(session).await?;
        info!(
            sid = %session.id,
            plate = %session.plate,
            prev = %prev,
            new = %next,
            "session_state_changed"
        );
        self.events.send_session_state(SessionStatePayload::new(&session.id, prev, next));
        if next.is_terminal() {
            // Terminal sessions take no further operations; drop their lock
            self.session_locks.lock().remove(&session.id.0);
        }
        Ok(())
    }

    /// Handle an entry request: allocate, issue the ticket, open the gate.
    ///
    /// Returns the new session id, or a structured refusal.
    pub async fn request_entry(
        &self,
        plate: Plate,
        class: VehicleClass,
    ) -> Result<SessionId, SessionError> {
        // Atomic duplicate-check + reservation. No hardware I/O in here.
        let (mut session, space) = {
            let _alloc = self.alloc_lock.lock().await;

            if self.store.has_active_session(&plate).await? {
                warn!(plate = %plate, "entry_rejected_duplicate");
                self.metrics.record_entry_rejected();
                return Err(SessionError::DuplicateActiveSession { plate });
            }

            let mut session = ParkingSession::new(plate, class);
            let space = match self.store.reserve_space(class).await {
                Ok(space) => space,
                Err(StoreError::NoSpaceAvailable { class }) => {
                    // Rejections are archived too
                    self.persist_transition(&mut session, SessionStatus::Rejected).await?;
                    self.metrics.record_entry_rejected();
                    return Err(SessionError::NoSpaceAvailable { class });
                }
                Err(e) => return Err(e.into()),
            };

            session.space = Some(space.id);
            session.record(
                SessionEvent::new(SessionEventType::SpaceReserved, epoch_ms())
                    .with_extra(&format!("space={}", space.label)),
            );
            if let Err(e) = self.persist_transition(&mut session, SessionStatus::Allocating).await {
                // Persistence faults roll the reservation back before surfacing
                self.release_space_for(&mut session).await;
                return Err(e);
            }
            (session, space)
        };

        // Hold the session lock through provisioning so the stale sweep
        // cannot cancel a session that is mid-handshake.
        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;

        match self.provision_entry(&mut session, &space).await {
            Ok(()) => {
                self.persist_transition(&mut session, SessionStatus::Active).await?;
                self.metrics.record_entry_ok();
                info!(
                    sid = %session.id,
                    plate = %session.plate,
                    space = %space.label,
                    ticket = %session.ticket.as_ref().map(|t| t.as_str()).unwrap_or(""),
                    "entry_completed"
                );
                Ok(session.id.clone())
            }
            Err(e) => {
                // Roll the reservation back before surfacing the error
                self.release_space_for(&mut session).await;
                if let Err(persist_err) =
                    self.persist_transition(&mut session, SessionStatus::Rejected).await
                {
                    warn!(sid = %session.id, error = %persist_err, "entry_rollback_persist_failed");
                }
                self.metrics.record_entry_rejected();
                warn!(sid = %session.id, error = %e, "entry_rejected_hardware");
                Err(e)
            }
        }
    }

    /// Ticket issuance and hardware choreography for one entry.
    ///
    /// Capture and print go out concurrently (different facility slots); the
    /// gate is actuated strictly after the ticket content is final, so the
    /// lane display always matches the printed ticket.
    async fn provision_entry(
        &self,
        session: &mut ParkingSession,
        space: &SpaceRecord,
    ) -> Result<(), SessionError> {
        let ticket = self.store.generate_ticket_code().await?;
        session.ticket = Some(ticket.clone());
        session.record(
            SessionEvent::new(SessionEventType::TicketIssued, epoch_ms())
                .with_extra(&format!("code={}", ticket)),
        );

        let content = TicketContent {
            code: ticket.clone(),
            plate: session.plate.clone(),
            class: session.class,
            space_label: space.label.clone(),
            entry_at: session.entry_at,
        };

        let rendered = content.render();
        let (capture_res, print_res) = tokio::join!(
            self.hardware.capture(ticket.as_str(), self.settings.capture_timeout),
            self.hardware.print(&rendered, self.settings.print_timeout),
        );

        let image = capture_res?;
        session.record(
            SessionEvent::new(SessionEventType::ImageCaptured, epoch_ms())
                .with_extra(&format!("ref={}", image)),
        );
        session.entry_image = Some(image);

        print_res?;
        session.record(SessionEvent::new(SessionEventType::TicketPrinted, epoch_ms()));

        self.actuate_verified(session, self.settings.entry_gate).await?;
        Ok(())
    }

    /// Open a gate, reconciling an ack timeout with a verifying status poll
    /// instead of assuming either outcome.
    async fn actuate_verified(
        &self,
        session: &mut ParkingSession,
        gate: GateId,
    ) -> Result<(), SessionError> {
        session.record(
            SessionEvent::new(SessionEventType::GateCmd, epoch_ms())
                .with_extra(&format!("gate={gate}")),
        );

        match self.hardware.actuate(gate, GateCommand::Open, self.settings.actuate_timeout).await {
            Ok(()) => {
                session.record(SessionEvent::new(SessionEventType::GateOpen, epoch_ms()));
                Ok(())
            }
            Err(HardwareError::ActuationTimeout { gate }) => {
                warn!(sid = %session.id, gate = %gate, "gate_ack_timeout_verifying");
                match self.hardware.poll_gate(gate).await {
                    Ok(BarrierState::Open) => {
                        info!(sid = %session.id, gate = %gate, "gate_open_verified_by_poll");
                        session.record(
                            SessionEvent::new(SessionEventType::GateOpen, epoch_ms())
                                .with_extra("verified_by_poll"),
                        );
                        Ok(())
                    }
                    Ok(state) => {
                        warn!(sid = %session.id, gate = %gate, state = %state.as_str(), "gate_poll_not_open");
                        Err(HardwareError::ActuationTimeout { gate }.into())
                    }
                    Err(poll_err) => {
                        warn!(sid = %session.id, gate = %gate, error = %poll_err, "gate_poll_failed");
                        Err(HardwareError::ActuationTimeout { gate }.into())
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the space a session holds, if any. Best effort during
    /// rollback; a store fault here is logged, not propagated.
    async fn release_space_for(&self, session: &mut ParkingSession) {
        let Some(space_id) = session.space else { return };
        match self.store.release_space(space_id).await {
            Ok(()) => {
                session.record(
                    SessionEvent::new(SessionEventType::SpaceReleased, epoch_ms())
                        .with_extra(&format!("space={space_id}")),
                );
            }
            Err(e) => {
                warn!(sid = %session.id, space = %space_id, error = %e, "space_release_failed");
            }
        }
    }

    /// Handle an exit request: quote the fee for the presented ticket.
    pub async fn request_exit(&self, ticket_code: &str) -> Result<FeeQuote, SessionError> {
        let found =
            self.store.find_by_ticket(ticket_code).await?.ok_or(SessionError::InvalidTicket)?;

        let lock = self.session_lock(&found.id);
        let _guard = lock.lock().await;

        // Reload under the lock; the session may have moved on meanwhile
        let mut session =
            self.store.load_session(&found.id).await?.ok_or(SessionError::SessionNotFound)?;

        match session.status {
            SessionStatus::Active => {
                self.persist_transition(&mut session, SessionStatus::ExitPending).await?;
            }
            // Re-quote attempts after a rate fault land here
            SessionStatus::ExitPending => {}
            // Ticket re-scanned while awaiting payment: repeat the quote
            SessionStatus::AwaitingPayment => {
                return Ok(FeeQuote {
                    session_id: session.id.clone(),
                    fee: session.fee.unwrap_or(0),
                    entry_at: session.entry_at,
                    exit_at: session.exit_at.unwrap_or_else(Utc::now),
                    schedule_version: session.schedule_version.unwrap_or(0),
                });
            }
            SessionStatus::Completed => return Err(SessionError::AlreadyCompleted),
            SessionStatus::Rejected | SessionStatus::Cancelled => {
                return Err(SessionError::InvalidTicket)
            }
            other => return Err(SessionError::InvalidState { actual: other }),
        }

        // Rate faults leave the session held in ExitPending for an operator
        let schedule = match self.store.active_schedule(session.class, session.entry_at).await {
            Ok(schedule) => schedule,
            Err(StoreError::ScheduleNotFound { class, at }) => {
                warn!(sid = %session.id, class = %class, "exit_held_no_rate_schedule");
                return Err(RateError::NoActiveRateSchedule { class, at }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let exit_at = Utc::now();
        let fee = compute_fee(&schedule, session.entry_at, exit_at)?;

        session.exit_at = Some(exit_at);
        session.fee = Some(fee);
        session.schedule_version = Some(schedule.version);
        session.record(
            SessionEvent::new(SessionEventType::FeeQuoted, epoch_ms())
                .with_extra(&format!("fee={fee},rate_ver={}", schedule.version)),
        );
        self.persist_transition(&mut session, SessionStatus::AwaitingPayment).await?;

        info!(sid = %session.id, plate = %session.plate, fee, "exit_fee_quoted");
        Ok(FeeQuote {
            session_id: session.id.clone(),
            fee,
            entry_at: session.entry_at,
            exit_at,
            schedule_version: schedule.version,
        })
    }

    /// Confirm payment and open the exit gate.
    ///
    /// The session reaches `Completed` (and frees its space) only once the
    /// gate acknowledges - or an operator overrides. A gate fault leaves the
    /// session in `Completing`; calling this again retries the gate without
    /// re-charging.
    pub async fn confirm_payment(
        &self,
        id: &SessionId,
        amount: i64,
        method: PaymentMethod,
    ) -> Result<(), SessionError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session =
            self.store.load_session(id).await?.ok_or(SessionError::SessionNotFound)?;

        match session.status {
            SessionStatus::AwaitingPayment => {
                let expected = session.fee.unwrap_or(0);
                if amount != expected {
                    warn!(sid = %session.id, expected, offered = amount, "payment_mismatch");
                    return Err(SessionError::PaymentMismatch { expected, offered: amount });
                }
                session.payment_status = PaymentStatus::Paid;
                session.payment_method = Some(method);
                session.record(
                    SessionEvent::new(SessionEventType::PaymentConfirmed, epoch_ms())
                        .with_extra(&format!("amount={amount},method={}", method.as_str())),
                );
                self.persist_transition(&mut session, SessionStatus::Completing).await?;
            }
            // Gate retry after an earlier actuation fault
            SessionStatus::Completing => {}
            SessionStatus::Completed => return Err(SessionError::AlreadyCompleted),
            other => return Err(SessionError::InvalidState { actual: other }),
        }

        if let Err(e) = self.actuate_verified(&mut session, self.settings.exit_gate).await {
            // Session stays Completing; the caller retries or overrides
            if let Err(save_err) = self.store.save_session(&session).await {
                warn!(sid = %session.id, error = %save_err, "completing_save_failed");
            }
            return Err(e);
        }

        self.complete(&mut session).await
    }

    /// Operator override: complete an exit whose gate never acknowledged.
    pub async fn operator_override_exit(&self, id: &SessionId) -> Result<(), SessionError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session =
            self.store.load_session(id).await?.ok_or(SessionError::SessionNotFound)?;
        if session.status != SessionStatus::Completing {
            return Err(SessionError::InvalidState { actual: session.status });
        }

        info!(sid = %session.id, "exit_operator_override");
        session.record(SessionEvent::new(SessionEventType::OperatorOverride, epoch_ms()));
        self.complete(&mut session).await
    }

    /// Final transition: release the space exactly at `Completed`
    async fn complete(&self, session: &mut ParkingSession) -> Result<(), SessionError> {
        self.release_space_for(session).await;
        self.persist_transition(session, SessionStatus::Completed).await?;
        self.metrics.record_completed();
        info!(sid = %session.id, plate = %session.plate, fee = session.fee.unwrap_or(0), "session_completed");
        Ok(())
    }

    /// Operator cancel. Releases the space if the session holds one.
    pub async fn cancel(&self, id: &SessionId) -> Result<(), SessionError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session =
            self.store.load_session(id).await?.ok_or(SessionError::SessionNotFound)?;
        if !session.status.is_cancellable() {
            return Err(SessionError::InvalidState { actual: session.status });
        }

        self.release_space_for(&mut session).await;
        self.persist_transition(&mut session, SessionStatus::Cancelled).await?;
        self.metrics.record_cancelled();
        info!(sid = %session.id, plate = %session.plate, "session_cancelled");
        Ok(())
    }

    /// Cancel sessions stuck in `Allocating` beyond the configured TTL and
    /// release their spaces. Sessions whose lock is held (provisioning in
    /// flight) are skipped. Returns how many were swept.
    pub async fn sweep_stale(&self) -> usize {
        let stale = match self.store.sessions_in_status(SessionStatus::Allocating).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "sweep_load_failed");
                return 0;
            }
        };

        let ttl = chrono::Duration::from_std(self.settings.allocating_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let cutoff = Utc::now() - ttl;
        let mut swept = 0;

        for candidate in stale {
            if candidate.entry_at > cutoff {
                continue;
            }
            let lock = self.session_lock(&candidate.id);
            let Ok(_guard) = lock.try_lock() else { continue };

            // Reload under the lock and re-check
            let Ok(Some(mut session)) = self.store.load_session(&candidate.id).await else {
                continue;
            };
            if session.status != SessionStatus::Allocating || session.entry_at > cutoff {
                continue;
            }

            warn!(sid = %session.id, plate = %session.plate, "session_swept_stale");
            self.release_space_for(&mut session).await;
            if self.persist_transition(&mut session, SessionStatus::Cancelled).await.is_ok() {
                self.metrics.record_cancelled();
                swept += 1;
            }
        }
        swept
    }
}
