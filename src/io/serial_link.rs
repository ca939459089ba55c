//! Serial transport for facility devices
//!
//! Each facility device hangs off a serial line (8N1). The link writes one
//! command frame and waits for its acknowledgment: responses can arrive in
//! chunks, so a persistent accumulation buffer is kept across reads and
//! re-synchronized to STX. Acks whose sequence number does not match the
//! in-flight command are duplicates from an earlier (timed-out) command and
//! are drained without being delivered.

use crate::io::protocol::{Frame, MIN_FRAME_SIZE};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

/// Maximum read attempts per transaction (prevents infinite loop)
const MAX_READ_ATTEMPTS: usize = 50;

/// Transport-level failures, below the hardware error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("device not open")]
    NotOpen,
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no acknowledgment within deadline")]
    AckTimeout,
}

/// One bidirectional command/ack transport shared by a facility
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Open the underlying transport. Idempotent.
    async fn open(&self) -> Result<(), LinkError>;

    /// Write a command frame and await the matching acknowledgment.
    ///
    /// The returned frame is guaranteed valid and to echo the command's
    /// sequence number; stale acks are discarded internally.
    async fn transact(&self, frame: &[u8], timeout: Duration) -> Result<Frame, LinkError>;
}

struct SerialState {
    port: Option<tokio_serial::SerialStream>,
    /// Persistent read buffer accumulating bytes across reads.
    /// Responses can arrive in chunks, so partial data is kept for the
    /// next read.
    read_buffer: Vec<u8>,
}

/// `DeviceLink` over a serial port (tokio-serial)
pub struct SerialLink {
    device: String,
    baud: u32,
    state: Mutex<SerialState>,
}

impl SerialLink {
    pub fn new(device: &str, baud: u32) -> Self {
        Self {
            device: device.to_string(),
            baud,
            state: Mutex::new(SerialState { port: None, read_buffer: Vec::with_capacity(256) }),
        }
    }
}

/// Discard bytes before the first STX
fn synchronize_buffer(buffer: &mut Vec<u8>) {
    if buffer.is_empty() || buffer[0] == crate::io::protocol::STX {
        return;
    }
    if let Some(start_idx) = buffer.iter().position(|&b| b == crate::io::protocol::STX) {
        if start_idx > 0 {
            debug!(discarded = start_idx, "serial_sync_discarded_bytes");
            buffer.drain(..start_idx);
        }
    } else {
        debug!(discarded = buffer.len(), "serial_sync_no_stx");
        buffer.clear();
    }
}

impl SerialLink {
    /// Read frames until one matches `seq` or the deadline passes
    async fn read_ack(
        state: &mut SerialState,
        seq: u8,
        deadline: Instant,
    ) -> Result<Frame, LinkError> {
        if state.port.is_none() {
            return Err(LinkError::NotOpen);
        }
        let mut temp_buf = [0u8; 128];
        let mut attempts = 0usize;

        loop {
            // Drain complete frames already buffered
            loop {
                synchronize_buffer(&mut state.read_buffer);
                if state.read_buffer.len() < MIN_FRAME_SIZE {
                    break;
                }
                let Some((frame, consumed)) = Frame::parse(&state.read_buffer) else {
                    break;
                };
                state.read_buffer.drain(..consumed);

                if !frame.valid {
                    if let Some(ref err) = frame.parse_err {
                        if err != "skipping to STX" {
                            warn!(error = %err, "serial_invalid_frame");
                        }
                    }
                    continue;
                }
                if frame.seq != seq {
                    // Ack for an earlier command that already timed out
                    debug!(got = frame.seq, expected = seq, "serial_stale_ack_dropped");
                    continue;
                }
                return Ok(frame);
            }

            if Instant::now() >= deadline {
                return Err(LinkError::AckTimeout);
            }
            attempts += 1;
            if attempts > MAX_READ_ATTEMPTS {
                return Err(LinkError::AckTimeout);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let read_window = remaining.min(Duration::from_millis(50));
            let port = state.port.as_mut().ok_or(LinkError::NotOpen)?;
            match tokio::time::timeout(read_window, port.read(&mut temp_buf)).await {
                Ok(Ok(0)) => {
                    // Zero bytes read, try again
                }
                Ok(Ok(n)) => {
                    state.read_buffer.extend_from_slice(&temp_buf[..n]);
                }
                Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {}
                Ok(Err(e)) => return Err(LinkError::Io(e)),
                Err(_) => {} // Window elapsed, loop re-checks deadline
            }
        }
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn open(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;
        if state.port.is_some() {
            return Ok(());
        }

        let port = tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| LinkError::Open(e.to_string()))?;

        debug!(device = %self.device, baud = %self.baud, "serial_port_opened");
        state.port = Some(port);
        state.read_buffer.clear();
        Ok(())
    }

    async fn transact(&self, frame: &[u8], timeout: Duration) -> Result<Frame, LinkError> {
        let mut state = self.state.lock().await;
        let seq = frame.get(1).copied().unwrap_or(0);
        let deadline = Instant::now() + timeout;

        {
            let port = state.port.as_mut().ok_or(LinkError::NotOpen)?;
            port.write_all(frame).await?;
        }

        Self::read_ack(&mut state, seq, deadline).await
    }
}

// ---------------------------------------------------------------------------
// In-memory link for tests and bench harnesses
// ---------------------------------------------------------------------------

/// Scriptable in-memory `DeviceLink`.
///
/// Acks every command with `ACK_OK` by default; tests flip the knobs to
/// simulate open failures, dropped acks and device-side error statuses.
pub struct MockLink {
    opened: AtomicBool,
    /// Refuse `open()` while set
    pub fail_open: AtomicBool,
    /// Swallow acks (every transact times out) while set
    pub drop_acks: AtomicBool,
    /// Fail the next N transactions with this ack status, then recover
    pub fail_next: AtomicU32,
    pub fail_status: std::sync::atomic::AtomicU8,
    /// Barrier state code reported to CMD_STATUS polls
    pub barrier_code: std::sync::atomic::AtomicU8,
    /// (facility, command) log of everything the coordinator sent
    pub sent: parking_lot::Mutex<Vec<(u8, u8)>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            opened: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            drop_acks: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            fail_status: std::sync::atomic::AtomicU8::new(0x01),
            barrier_code: std::sync::atomic::AtomicU8::new(0x00),
            sent: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Commands of a given kind seen so far
    pub fn sent_count(&self, command: u8) -> usize {
        self.sent.lock().iter().filter(|(_, c)| *c == command).count()
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn open(&self) -> Result<(), LinkError> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(LinkError::Open("mock open refused".to_string()));
        }
        self.opened.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn transact(&self, frame: &[u8], timeout: Duration) -> Result<Frame, LinkError> {
        use crate::io::protocol::{build_frame, ACK_OK, CMD_CLOSE, CMD_OPEN, CMD_STATUS};

        if !self.opened.load(Ordering::Relaxed) {
            return Err(LinkError::NotOpen);
        }
        let Some((cmd, _)) = Frame::parse(frame) else {
            return Err(LinkError::AckTimeout);
        };
        self.sent.lock().push((cmd.facility, cmd.command));

        if self.drop_acks.load(Ordering::Relaxed) {
            tokio::time::sleep(timeout).await;
            return Err(LinkError::AckTimeout);
        }

        let status = if self.fail_next.load(Ordering::Relaxed) > 0 {
            self.fail_next.fetch_sub(1, Ordering::Relaxed);
            self.fail_status.load(Ordering::Relaxed)
        } else {
            ACK_OK
        };

        let mut data = vec![status];
        match cmd.command {
            CMD_OPEN => {
                if status == ACK_OK {
                    self.barrier_code.store(0x02, Ordering::Relaxed);
                }
            }
            CMD_CLOSE => {
                if status == ACK_OK {
                    self.barrier_code.store(0x00, Ordering::Relaxed);
                }
            }
            CMD_STATUS => data.push(self.barrier_code.load(Ordering::Relaxed)),
            _ => {}
        }

        let ack = build_frame(cmd.seq, cmd.facility, cmd.command, &data);
        let (parsed, _) = Frame::parse(&ack).expect("mock ack parses");
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::protocol::{build_frame, facility_address, ACK_OK, CMD_CAPTURE, CMD_STATUS};
    use crate::domain::types::FacilityId;

    #[test]
    fn test_synchronize_buffer() {
        let mut buf = vec![0xAA, 0xBB, crate::io::protocol::STX, 0x01];
        synchronize_buffer(&mut buf);
        assert_eq!(buf[0], crate::io::protocol::STX);
        assert_eq!(buf.len(), 2);

        let mut junk = vec![0xAA, 0xBB];
        synchronize_buffer(&mut junk);
        assert!(junk.is_empty());
    }

    #[tokio::test]
    async fn test_mock_acks_commands() {
        let link = MockLink::new();
        link.open().await.unwrap();

        let frame = build_frame(7, facility_address(FacilityId::Camera), CMD_CAPTURE, b"hint");
        let ack = link.transact(&frame, Duration::from_millis(100)).await.unwrap();

        assert_eq!(ack.seq, 7);
        assert_eq!(ack.ack_status(), Some(ACK_OK));
        assert_eq!(link.sent_count(CMD_CAPTURE), 1);
    }

    #[tokio::test]
    async fn test_mock_requires_open() {
        let link = MockLink::new();
        let frame = build_frame(1, 0x01, CMD_STATUS, &[]);
        assert!(matches!(
            link.transact(&frame, Duration::from_millis(10)).await,
            Err(LinkError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let link = MockLink::new();
        link.open().await.unwrap();
        link.fail_next.store(2, Ordering::Relaxed);

        let frame = build_frame(1, 0x01, CMD_CAPTURE, &[]);
        let ack = link.transact(&frame, Duration::from_millis(10)).await.unwrap();
        assert_ne!(ack.ack_status(), Some(ACK_OK));
        let ack = link.transact(&frame, Duration::from_millis(10)).await.unwrap();
        assert_ne!(ack.ack_status(), Some(ACK_OK));
        let ack = link.transact(&frame, Duration::from_millis(10)).await.unwrap();
        assert_eq!(ack.ack_status(), Some(ACK_OK));
    }

    #[tokio::test]
    async fn test_mock_barrier_tracks_commands() {
        use crate::io::protocol::CMD_OPEN;
        let link = MockLink::new();
        link.open().await.unwrap();

        let open = build_frame(1, 0x11, CMD_OPEN, &[]);
        link.transact(&open, Duration::from_millis(10)).await.unwrap();

        let status = build_frame(2, 0x11, CMD_STATUS, &[]);
        let ack = link.transact(&status, Duration::from_millis(10)).await.unwrap();
        assert_eq!(ack.ack_data(), &[0x02]); // open
    }
}
