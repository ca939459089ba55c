//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::rates::RateSchedule;
use crate::domain::types::{GateId, VehicleClass};
use crate::services::hardware::CoordinatorSettings;
use crate::services::session_manager::ManagerSettings;
use anyhow::Context;
use chrono::TimeZone;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "lot-north")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "parkgate".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialDeviceConfig {
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateEntryConfig {
    pub id: u8,
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_slot_timeout_ms")]
    pub slot_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: u32,
    #[serde(default = "default_image_base")]
    pub image_base: String,
}

fn default_ack_timeout_ms() -> u64 {
    1000
}

fn default_slot_timeout_ms() -> u64 {
    2000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_failed_threshold() -> u32 {
    5
}

fn default_image_base() -> String {
    "images".to_string()
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            slot_timeout_ms: default_slot_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            failed_threshold: default_failed_threshold(),
            image_base: default_image_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_entry_gate")]
    pub entry_gate: u8,
    #[serde(default = "default_exit_gate")]
    pub exit_gate: u8,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    #[serde(default = "default_print_timeout_ms")]
    pub print_timeout_ms: u64,
    #[serde(default = "default_allocating_ttl_secs")]
    pub allocating_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_entry_gate() -> u8 {
    1
}

fn default_exit_gate() -> u8 {
    2
}

fn default_capture_timeout_ms() -> u64 {
    2000
}

fn default_print_timeout_ms() -> u64 {
    2000
}

fn default_allocating_ttl_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            entry_gate: default_entry_gate(),
            exit_gate: default_exit_gate(),
            capture_timeout_ms: default_capture_timeout_ms(),
            print_timeout_ms: default_print_timeout_ms(),
            allocating_ttl_secs: default_allocating_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SpacesConfig {
    #[serde(default)]
    pub car: u32,
    #[serde(default)]
    pub motorcycle: u32,
    #[serde(default)]
    pub other: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateEntryConfig {
    pub class: VehicleClass,
    pub base_rate: i64,
    pub hourly_rate: i64,
    #[serde(default)]
    pub additional_hour_rate: i64,
    #[serde(default = "default_additional_hour_threshold")]
    pub additional_hour_threshold: u32,
    #[serde(default = "default_base_covers_first_hour")]
    pub base_covers_first_hour: bool,
    #[serde(default)]
    pub daily_cap: i64,
    #[serde(default)]
    pub weekly_rate: i64,
    #[serde(default)]
    pub monthly_rate: i64,
    #[serde(default)]
    pub penalty_rate: i64,
    #[serde(default = "default_max_stay_hours")]
    pub max_stay_hours: u32,
}

fn default_additional_hour_threshold() -> u32 {
    24
}

fn default_base_covers_first_hour() -> bool {
    true
}

fn default_max_stay_hours() -> u32 {
    720
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

fn default_control_enabled() -> bool {
    true
}

fn default_control_port() -> u16 {
    25803
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { enabled: default_control_enabled(), port: default_control_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// File path for session archive (JSONL format)
    #[serde(default = "default_archive_file")]
    pub file: String,
}

fn default_archive_file() -> String {
    "sessions.jsonl".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { file: default_archive_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9464
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub camera: SerialDeviceConfig,
    pub printer: SerialDeviceConfig,
    pub gates: Vec<GateEntryConfig>,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub spaces: SpacesConfig,
    #[serde(default)]
    pub rates: Vec<RateEntryConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    camera: SerialDeviceConfig,
    printer: SerialDeviceConfig,
    gates: Vec<GateEntryConfig>,
    hardware: HardwareConfig,
    session: SessionConfig,
    spaces: SpacesConfig,
    rates: Vec<RateEntryConfig>,
    control: ControlConfig,
    archive_file: String,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            camera: SerialDeviceConfig { device: "/dev/ttyUSB0".to_string(), baud: 9600 },
            printer: SerialDeviceConfig { device: "/dev/ttyUSB1".to_string(), baud: 9600 },
            gates: vec![
                GateEntryConfig { id: 1, device: "/dev/ttyUSB2".to_string(), baud: 9600 },
                GateEntryConfig { id: 2, device: "/dev/ttyUSB3".to_string(), baud: 9600 },
            ],
            hardware: HardwareConfig::default(),
            session: SessionConfig::default(),
            spaces: SpacesConfig { car: 10, motorcycle: 20, other: 2 },
            rates: vec![RateEntryConfig {
                class: VehicleClass::Car,
                base_rate: 5000,
                hourly_rate: 5000,
                additional_hour_rate: 5000,
                additional_hour_threshold: 24,
                base_covers_first_hour: true,
                daily_cap: 100_000,
                weekly_rate: 500_000,
                monthly_rate: 1_500_000,
                penalty_rate: 50_000,
                max_stay_hours: 720,
            }],
            control: ControlConfig::default(),
            archive_file: default_archive_file(),
            metrics: MetricsConfig::default(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            site_id: toml_config.site.id,
            camera: toml_config.camera,
            printer: toml_config.printer,
            gates: toml_config.gates,
            hardware: toml_config.hardware,
            session: toml_config.session,
            spaces: toml_config.spaces,
            rates: toml_config.rates,
            control: toml_config.control,
            archive_file: toml_config.archive.file,
            metrics: toml_config.metrics,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn camera(&self) -> &SerialDeviceConfig {
        &self.camera
    }

    pub fn printer(&self) -> &SerialDeviceConfig {
        &self.printer
    }

    pub fn gates(&self) -> &[GateEntryConfig] {
        &self.gates
    }

    pub fn spaces(&self) -> &SpacesConfig {
        &self.spaces
    }

    pub fn control_enabled(&self) -> bool {
        self.control.enabled
    }

    pub fn control_port(&self) -> u16 {
        self.control.port
    }

    pub fn archive_file(&self) -> &str {
        &self.archive_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.metrics.prometheus_port
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.session.sweep_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Coordinator tuning derived from the `[hardware]` section
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            ack_timeout: Duration::from_millis(self.hardware.ack_timeout_ms),
            slot_timeout: Duration::from_millis(self.hardware.slot_timeout_ms),
            retry_attempts: self.hardware.retry_attempts,
            retry_backoff: Duration::from_millis(self.hardware.retry_backoff_ms),
            failed_threshold: self.hardware.failed_threshold,
            image_base: self.hardware.image_base.clone(),
        }
    }

    /// Session manager tuning derived from the `[session]` section
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            entry_gate: GateId(self.session.entry_gate),
            exit_gate: GateId(self.session.exit_gate),
            capture_timeout: Duration::from_millis(self.session.capture_timeout_ms),
            print_timeout: Duration::from_millis(self.session.print_timeout_ms),
            actuate_timeout: Duration::from_millis(self.hardware.ack_timeout_ms),
            allocating_ttl: Duration::from_secs(self.session.allocating_ttl_secs),
        }
    }

    /// Bootstrap schedules (version 1, open-ended) from the `[[rates]]` table
    pub fn bootstrap_schedules(&self) -> Vec<RateSchedule> {
        let epoch = chrono::Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        self.rates
            .iter()
            .map(|r| RateSchedule {
                class: r.class,
                version: 1,
                base_rate: r.base_rate,
                hourly_rate: r.hourly_rate,
                additional_hour_rate: if r.additional_hour_rate > 0 {
                    r.additional_hour_rate
                } else {
                    r.hourly_rate
                },
                additional_hour_threshold: r.additional_hour_threshold,
                base_covers_first_hour: r.base_covers_first_hour,
                daily_cap: r.daily_cap,
                weekly_rate: r.weekly_rate,
                monthly_rate: r.monthly_rate,
                penalty_rate: r.penalty_rate,
                max_stay_hours: r.max_stay_hours,
                effective_from: epoch,
                effective_to: None,
            })
            .collect()
    }
}
