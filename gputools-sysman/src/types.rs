/// Telemetry and control types for system resource management
///
/// Properties are static per component; state is sampled per call. All
/// structs serialize so reports and tooling can consume them directly.

use serde::{Deserialize, Serialize};

/// Frequency throttle reason bits, reported in `FreqState`.
pub const THROTTLE_AVERAGE_POWER_CAP: u32 = 1 << 0;
pub const THROTTLE_BURST_POWER_CAP: u32 = 1 << 1;
pub const THROTTLE_CURRENT_LIMIT: u32 = 1 << 2;
pub const THROTTLE_THERMAL_LIMIT: u32 = 1 << 3;
pub const THROTTLE_PSU_ALERT: u32 = 1 << 4;
pub const THROTTLE_SW_RANGE: u32 = 1 << 5;
pub const THROTTLE_HW_RANGE: u32 = 1 << 6;

/// Static identification of the managed device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysmanDeviceProperties {
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub driver_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerProperties {
    /// Whether software may change the limits.
    pub can_control: bool,
    pub default_limit_mw: u32,
    pub max_limit_mw: u32,
}

/// Monotonic energy counter; divide deltas for average power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyCounter {
    pub energy_uj: u64,
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSustainedLimit {
    pub enabled: bool,
    pub power_mw: u32,
    /// Averaging window for the limit.
    pub interval_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreqDomain {
    Gpu,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqProperties {
    pub domain: FreqDomain,
    pub can_control: bool,
    /// Hardware frequency floor in MHz.
    pub min_mhz: f64,
    /// Hardware frequency ceiling in MHz.
    pub max_mhz: f64,
}

/// Software-requested frequency window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqRange {
    pub min_mhz: f64,
    pub max_mhz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqState {
    /// Frequency the hardware was asked for.
    pub request_mhz: f64,
    /// Frequency actually delivered.
    pub actual_mhz: f64,
    /// Bit-vector of `THROTTLE_*` reasons; 0 when unthrottled.
    pub throttle_reasons: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempSensor {
    Global,
    Gpu,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempProperties {
    pub sensor: TempSensor,
    /// Temperature at which the hardware throttles, in Celsius.
    pub max_temp_c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanSpeedMode {
    /// Hardware-managed speed curve.
    Default,
    /// Pinned to the configured speed.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanSpeedUnits {
    Rpm,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanProperties {
    pub can_control: bool,
    pub max_rpm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanConfig {
    pub mode: FanSpeedMode,
    pub speed: u32,
    pub units: FanSpeedUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanState {
    pub speed_rpm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RasKind {
    /// Errors the hardware corrected; informational.
    Correctable,
    /// Errors that compromised computation.
    Uncorrectable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasProperties {
    pub kind: RasKind,
    pub enabled: bool,
}

/// Error counters broken down by subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasDetails {
    pub num_resets: u64,
    pub driver_errors: u64,
    pub compute_errors: u64,
    pub cache_errors: u64,
    pub memory_errors: u64,
    pub display_errors: u64,
}

impl RasDetails {
    pub fn total(&self) -> u64 {
        self.num_resets
            + self.driver_errors
            + self.compute_errors
            + self.cache_errors
            + self.memory_errors
            + self.display_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_bits_are_distinct() {
        let bits = [
            THROTTLE_AVERAGE_POWER_CAP,
            THROTTLE_BURST_POWER_CAP,
            THROTTLE_CURRENT_LIMIT,
            THROTTLE_THERMAL_LIMIT,
            THROTTLE_PSU_ALERT,
            THROTTLE_SW_RANGE,
            THROTTLE_HW_RANGE,
        ];
        let mut seen = 0u32;
        for bit in bits {
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
    }

    #[test]
    fn test_ras_total_sums_all_fields() {
        let details = RasDetails {
            num_resets: 1,
            driver_errors: 2,
            compute_errors: 3,
            cache_errors: 4,
            memory_errors: 5,
            display_errors: 6,
        };
        assert_eq!(details.total(), 21);
    }
}
