//! Runtime configuration.
//!
//! Every field has a default matching the production image, so a
//! `NodeConfig::default()` is what ships. The simulator can load overrides
//! from JSON.

use crate::ds18b20::Resolution;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reserved at the end of every timeslot so a task never runs into the hard end.
pub const DEFAULT_END_MARGIN_US: u32 = 200;
/// Short waits at or below this are spun in place instead of arming the compare interrupt.
pub const DEFAULT_ACTIVE_WAIT_LIMIT_US: u32 = 30;

pub const DEFAULT_DRIVER_SLOT_US: u32 = 2_000;
pub const DEFAULT_EEPROM_SETTLE_US: u32 = 10_000;

pub const DEFAULT_UART_BAUD: u32 = 115_200;
pub const DEFAULT_UART_SLOT_US: u32 = 3_000;

pub const DEFAULT_MEASUREMENT_INTERVAL_MS: u32 = 60_000;
/// Decimal exponent handed to the advertiser with every reading pair.
pub const TEMPERATURE_EXPONENT: i8 = -4;

/// What happens when a fixed-capacity table overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Log a warning and drop the entry.
    #[default]
    LogAndIgnore,
    /// Treat the overflow as a contract violation and halt.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub end_margin_us: u32,
    pub active_wait_limit_us: u32,
    pub capacity_policy: CapacityPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            end_margin_us: DEFAULT_END_MARGIN_US,
            active_wait_limit_us: DEFAULT_ACTIVE_WAIT_LIMIT_US,
            capacity_policy: CapacityPolicy::LogAndIgnore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Write the resolution into every sensor after discovery.
    pub configure_sensors: bool,
    pub resolution: Resolution,
    pub eeprom_settle_us: u32,
    /// Timeslot length the driver asks for.
    pub slot_length_us: u32,
    pub capacity_policy: CapacityPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            configure_sensors: true,
            resolution: Resolution::Bits11,
            eeprom_settle_us: DEFAULT_EEPROM_SETTLE_US,
            slot_length_us: DEFAULT_DRIVER_SLOT_US,
            capacity_policy: CapacityPolicy::LogAndIgnore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartConfig {
    pub enabled: bool,
    pub baud_rate: u32,
    pub slot_length_us: u32,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            baud_rate: DEFAULT_UART_BAUD,
            slot_length_us: DEFAULT_UART_SLOT_US,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub measurement_interval_ms: u32,
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
    pub uart: UartConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            measurement_interval_ms: DEFAULT_MEASUREMENT_INTERVAL_MS,
            scheduler: SchedulerConfig::default(),
            driver: DriverConfig::default(),
            uart: UartConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_image() {
        let config = NodeConfig::default();
        assert_eq!(config.measurement_interval_ms, 60_000);
        assert_eq!(config.scheduler.end_margin_us, 200);
        assert_eq!(config.scheduler.active_wait_limit_us, 30);
        assert_eq!(config.driver.resolution, Resolution::Bits11);
        assert!(config.driver.configure_sensors);
        assert_eq!(config.driver.slot_length_us, 2_000);
        assert_eq!(config.uart.baud_rate, 115_200);
        assert_eq!(config.scheduler.capacity_policy, CapacityPolicy::LogAndIgnore);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{ "driver": { "resolution": "Bits12", "capacity_policy": "fault" } }"#,
        )
        .unwrap();

        assert_eq!(config.driver.resolution, Resolution::Bits12);
        assert_eq!(config.driver.capacity_policy, CapacityPolicy::Fault);
        assert_eq!(config.driver.eeprom_settle_us, DEFAULT_EEPROM_SETTLE_US);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let result = NodeConfig::from_json_str("{ \"driver\": 5 }");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
