//! Domain models - core business types for the parking lifecycle
//!
//! This module contains the canonical data types used throughout the system:
//! - `ParkingSession` - one vehicle's stay from entry request to completion
//! - `RateSchedule` / `compute_fee` - versioned rate tables and fee math
//! - `TicketContent` - entry receipt body for the printer
//! - shared newtypes (`SpaceId`, `GateId`, `Plate`, `FacilityId`, ...)

pub mod rates;
pub mod session;
pub mod ticket;
pub mod types;
