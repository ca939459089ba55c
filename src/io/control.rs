//! Control TCP listener for lane triggers and operator commands
//!
//! Listens for line-oriented commands from push-button stations, kiosks and
//! the operator console:
//!
//! - `ENTRY <plate> <class>`   -> `OK <session_id>`
//! - `EXIT <ticket>`           -> `FEE <session_id> <amount>`
//! - `PAY <session_id> <amount> <method>` -> `OK COMPLETED`
//! - `CANCEL <session_id>`     -> `OK CANCELLED`
//! - `OVERRIDE <session_id>`   -> `OK COMPLETED`
//! - `STATUS`                  -> facility health and occupancy
//!
//! Errors answer `ERR <RETRY_LATER|NOT_POSSIBLE|OPERATOR_REQUIRED|FATAL> <detail>`
//! so the station can choose its messaging without knowing internals.

use crate::domain::session::SessionId;
use crate::domain::types::{PaymentMethod, Plate, VehicleClass};
use crate::services::hardware::HardwareCoordinator;
use crate::services::session_manager::{SessionError, SessionManager, UserAction};
use crate::services::store::ParkingStore;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Control listener configuration
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { port: 25803, enabled: true }
    }
}

/// Shared dependencies for command handling
#[derive(Clone)]
pub struct ControlDeps {
    pub manager: Arc<SessionManager>,
    pub hardware: Arc<HardwareCoordinator>,
    pub store: Arc<dyn ParkingStore>,
}

fn action_tag(action: UserAction) -> &'static str {
    match action {
        UserAction::RetryLater => "RETRY_LATER",
        UserAction::NotPossible => "NOT_POSSIBLE",
        UserAction::OperatorRequired => "OPERATOR_REQUIRED",
        UserAction::Fatal => "FATAL",
    }
}

fn err_line(e: &SessionError) -> String {
    format!("ERR {} {}", action_tag(e.user_action()), e)
}

/// Execute one command line and render the response
pub async fn handle_command(line: &str, deps: &ControlDeps) -> String {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();

    match verb.as_str() {
        "ENTRY" => {
            let (Some(raw_plate), Some(raw_class)) = (parts.next(), parts.next()) else {
                return "ERR NOT_POSSIBLE usage: ENTRY <plate> <class>".to_string();
            };
            let Some(plate) = Plate::new(raw_plate) else {
                return "ERR NOT_POSSIBLE empty plate".to_string();
            };
            let class: VehicleClass = match raw_class.parse() {
                Ok(class) => class,
                Err(e) => return format!("ERR NOT_POSSIBLE {e}"),
            };
            match deps.manager.request_entry(plate, class).await {
                Ok(sid) => format!("OK {sid}"),
                Err(e) => err_line(&e),
            }
        }
        "EXIT" => {
            let Some(ticket) = parts.next() else {
                return "ERR NOT_POSSIBLE usage: EXIT <ticket>".to_string();
            };
            match deps.manager.request_exit(ticket).await {
                Ok(quote) => format!("FEE {} {}", quote.session_id, quote.fee),
                Err(e) => err_line(&e),
            }
        }
        "PAY" => {
            let (Some(sid), Some(raw_amount), Some(raw_method)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return "ERR NOT_POSSIBLE usage: PAY <session_id> <amount> <method>".to_string();
            };
            let Ok(amount) = raw_amount.parse::<i64>() else {
                return "ERR NOT_POSSIBLE amount must be an integer".to_string();
            };
            let method: PaymentMethod = match raw_method.parse() {
                Ok(method) => method,
                Err(e) => return format!("ERR NOT_POSSIBLE {e}"),
            };
            match deps
                .manager
                .confirm_payment(&SessionId(sid.to_string()), amount, method)
                .await
            {
                Ok(()) => "OK COMPLETED".to_string(),
                Err(e) => err_line(&e),
            }
        }
        "CANCEL" => {
            let Some(sid) = parts.next() else {
                return "ERR NOT_POSSIBLE usage: CANCEL <session_id>".to_string();
            };
            match deps.manager.cancel(&SessionId(sid.to_string())).await {
                Ok(()) => "OK CANCELLED".to_string(),
                Err(e) => err_line(&e),
            }
        }
        "OVERRIDE" => {
            let Some(sid) = parts.next() else {
                return "ERR NOT_POSSIBLE usage: OVERRIDE <session_id>".to_string();
            };
            match deps.manager.operator_override_exit(&SessionId(sid.to_string())).await {
                Ok(()) => "OK COMPLETED".to_string(),
                Err(e) => err_line(&e),
            }
        }
        "STATUS" => {
            let mut out = String::new();
            for snap in deps.hardware.snapshots() {
                out.push_str(&format!(
                    "FACILITY {} {} failures={}\n",
                    snap.id,
                    snap.status.as_str(),
                    snap.consecutive_failures
                ));
            }
            match deps.store.occupancy().await {
                Ok((occupied, total)) => {
                    out.push_str(&format!("OCCUPANCY {occupied}/{total}"));
                }
                Err(e) => out.push_str(&format!("ERR FATAL {e}")),
            }
            out
        }
        "" => "ERR NOT_POSSIBLE empty command".to_string(),
        other => format!("ERR NOT_POSSIBLE unknown command {other}"),
    }
}

/// Start the control TCP listener.
///
/// One task per connection; commands run sequentially per connection while
/// separate stations proceed concurrently.
pub async fn start_control_listener(
    config: ControlConfig,
    deps: ControlDeps,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        info!("control_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(port = %config.port, "control_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("control_listener_shutdown");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "control_accept_failed");
                        continue;
                    }
                };
                debug!(peer = %peer, "control_connected");

                let deps = deps.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer, deps, conn_shutdown).await {
                        debug!(peer = %peer, error = %e, "control_connection_closed");
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    deps: ControlDeps,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                info!(peer = %peer, command = %trimmed, "control_command");
                let response = handle_command(trimmed, &deps).await;
                write_half.write_all(response.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
            }
        }
    }
}
