//! Shared types for the parking core

use serde::{Deserialize, Serialize};

/// Newtype wrapper for parking space ids to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SpaceId(pub u32);

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for barrier gate ids to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GateId(pub u8);

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vehicle classification used for space compatibility and rate lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Motorcycle,
    Car,
    Other,
}

impl VehicleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Car => "car",
            VehicleClass::Other => "other",
        }
    }

    /// Single-letter prefix used for space labels (C01, M01, ...)
    pub fn label_prefix(&self) -> char {
        match self {
            VehicleClass::Motorcycle => 'M',
            VehicleClass::Car => 'C',
            VehicleClass::Other => 'O',
        }
    }
}

impl std::str::FromStr for VehicleClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "motorcycle" | "motor" => Ok(VehicleClass::Motorcycle),
            "car" => Ok(VehicleClass::Car),
            "other" => Ok(VehicleClass::Other),
            other => Err(format!("unknown vehicle class: {other}")),
        }
    }
}

impl std::fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized license plate (uppercase, no interior whitespace)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Plate(String);

impl Plate {
    /// Normalize a raw plate string. Rejects empty input.
    pub fn new(raw: &str) -> Option<Self> {
        let normalized: String =
            raw.chars().filter(|c| !c.is_whitespace()).map(|c| c.to_ascii_uppercase()).collect();
        if normalized.is_empty() {
            return None;
        }
        Some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Plate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a captured image (path or remote handle)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ImageRef(pub String);

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical hardware subsystem behind the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacilityId {
    Camera,
    Gate(GateId),
    Printer,
}

impl std::fmt::Display for FacilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacilityId::Camera => f.write_str("camera"),
            FacilityId::Gate(id) => write!(f, "gate-{id}"),
            FacilityId::Printer => f.write_str("printer"),
        }
    }
}

/// Barrier command sent to a gate facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateCommand {
    Open,
    Close,
}

impl GateCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateCommand::Open => "open",
            GateCommand::Close => "close",
        }
    }
}

/// Physical barrier state as reported by a gate status poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Closed,
    Moving,
    Open,
    Unknown,
}

impl BarrierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierState::Closed => "closed",
            BarrierState::Moving => "moving",
            BarrierState::Open => "open",
            BarrierState::Unknown => "unknown",
        }
    }

    /// Decode the status byte carried in a gate status ack payload
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => BarrierState::Closed,
            0x01 => BarrierState::Moving,
            0x02 => BarrierState::Open,
            _ => BarrierState::Unknown,
        }
    }
}

/// Payment settlement method, as reported by the outer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// Payment settlement status on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
        }
    }
}
