//! Session archive - appends finished sessions to file
//!
//! Sessions are archived, never deleted: every session that reaches a
//! terminal state is written in JSONL format (one JSON object per line) to
//! the file specified in config, preserving the audit trail.

use crate::domain::session::ParkingSession;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Archive writer for finished sessions
pub struct SessionArchive {
    file_path: String,
    site_id: String,
}

impl SessionArchive {
    pub fn new(file_path: &str, site_id: &str) -> Self {
        info!(file_path = %file_path, "archive_initialized");
        Self { file_path: file_path.to_string(), site_id: site_id.to_string() }
    }

    /// Append one session to the archive file.
    /// Returns true if successful, false otherwise.
    pub fn write_session(&self, session: &ParkingSession) -> bool {
        let json = session.to_json_with_site(&self.site_id);

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    sid = %session.id,
                    plate = %session.plate,
                    status = %session.status.as_str(),
                    events = %session.events.len(),
                    "session_archived"
                );
                true
            }
            Err(e) => {
                error!(
                    sid = %session.id,
                    error = %e,
                    "session_archive_failed"
                );
                false
            }
        }
    }

    /// Append a line to the archive file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "archive_written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SessionStatus;
    use crate::domain::types::{Plate, VehicleClass};

    #[test]
    fn test_write_session_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");
        let archive = SessionArchive::new(path.to_str().unwrap(), "lot-a");

        let mut session =
            ParkingSession::new(Plate::new("B1234XY").unwrap(), VehicleClass::Car);
        session.transition(SessionStatus::Rejected).unwrap();
        assert!(archive.write_session(&session));

        let mut second =
            ParkingSession::new(Plate::new("D5678EF").unwrap(), VehicleClass::Motorcycle);
        second.transition(SessionStatus::Rejected).unwrap();
        assert!(archive.write_session(&second));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["site"], "lot-a");
        assert_eq!(first["plate"], "B1234XY");
        assert_eq!(first["st"], "rejected");
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/sessions.jsonl");
        let archive = SessionArchive::new(path.to_str().unwrap(), "lot-a");

        let mut session =
            ParkingSession::new(Plate::new("B1A").unwrap(), VehicleClass::Other);
        session.transition(SessionStatus::Rejected).unwrap();
        assert!(archive.write_session(&session));
        assert!(path.exists());
    }
}
