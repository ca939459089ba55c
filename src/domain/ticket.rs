//! Entry ticket content rendered for the printer facility

use crate::domain::session::TicketCode;
use crate::domain::types::{Plate, VehicleClass};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};

/// Everything printed on an entry receipt.
///
/// The gate is only actuated after this content is final, so the number on
/// the lane display always matches the printed ticket.
#[derive(Debug, Clone)]
pub struct TicketContent {
    pub code: TicketCode,
    pub plate: Plate,
    pub class: VehicleClass,
    pub space_label: String,
    pub entry_at: DateTime<Utc>,
}

impl TicketContent {
    /// Machine-readable payload encoded into the ticket barcode:
    /// base64 of `PLATE|yyyymmddHHMMSS`.
    pub fn barcode_payload(&self) -> String {
        let raw = format!("{}|{}", self.plate, self.entry_at.format("%Y%m%d%H%M%S"));
        STANDARD.encode(raw.as_bytes())
    }

    /// Text block sent to the thermal printer
    pub fn render(&self) -> String {
        format!(
            "=== PARKING TICKET ===\n\
             TICKET : {}\n\
             PLATE  : {}\n\
             CLASS  : {}\n\
             SPACE  : {}\n\
             ENTRY  : {}\n\
             *{}*\n",
            self.code,
            self.plate,
            self.class,
            self.space_label,
            self.entry_at.format("%d/%m/%Y %H:%M:%S"),
            self.barcode_payload(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ticket() -> TicketContent {
        TicketContent {
            code: TicketCode("TKT20250301100000-a1b2c3".to_string()),
            plate: Plate::new("B1234XY").unwrap(),
            class: VehicleClass::Car,
            space_label: "C03".to_string(),
            entry_at: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_barcode_payload_round_trip() {
        let payload = ticket().barcode_payload();
        let decoded = STANDARD.decode(payload).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "B1234XY|20250301100000");
    }

    #[test]
    fn test_render_contains_fields() {
        let body = ticket().render();
        assert!(body.contains("TKT20250301100000-a1b2c3"));
        assert!(body.contains("B1234XY"));
        assert!(body.contains("C03"));
        assert!(body.contains("01/03/2025 10:00:00"));
    }
}
