//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `protocol` - request/acknowledge frame codec for facility devices
//! - `serial_link` - serial transport (and in-memory mock) behind `DeviceLink`
//! - `events` - typed channel feeding the external event broadcaster
//! - `archive` - session audit trail (JSONL format)
//! - `control` - TCP listener for lane triggers and operator commands
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod archive;
pub mod control;
pub mod events;
pub mod prometheus;
pub mod protocol;
pub mod serial_link;

// Re-export commonly used types
pub use archive::SessionArchive;
pub use control::{start_control_listener, ControlDeps};
pub use events::{
    create_event_channel, EventSender, FacilityStatePayload, ParkingEvent, SessionStatePayload,
};
pub use serial_link::{DeviceLink, MockLink, SerialLink};
