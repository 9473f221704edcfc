/// Telemetry backends
///
/// This module defines the trait a device's management firmware is driven
/// through, plus a simulated implementation with plausible readings for
/// the demo binary and tests.

use std::sync::Mutex;

use gpudebug::{DriverError, Result};

use crate::types::*;

/// Access to one device's management telemetry and controls.
///
/// Component indices are dense per domain; an index at or past the
/// domain's count fails with `InvalidArgument`. Mutating calls require
/// privilege and fail with `InsufficientPermissions` without it.
pub trait TelemetrySource: Send + Sync {
    fn device_properties(&self) -> Result<SysmanDeviceProperties>;

    fn power_count(&self) -> usize;
    fn power_properties(&self, index: usize) -> Result<PowerProperties>;
    fn power_energy(&self, index: usize) -> Result<EnergyCounter>;
    fn power_sustained_limit(&self, index: usize) -> Result<PowerSustainedLimit>;
    fn set_power_sustained_limit(&self, index: usize, limit: PowerSustainedLimit) -> Result<()>;

    fn freq_count(&self) -> usize;
    fn freq_properties(&self, index: usize) -> Result<FreqProperties>;
    fn freq_available_clocks(&self, index: usize) -> Result<Vec<f64>>;
    fn freq_range(&self, index: usize) -> Result<FreqRange>;
    fn set_freq_range(&self, index: usize, range: FreqRange) -> Result<()>;
    fn freq_state(&self, index: usize) -> Result<FreqState>;

    fn temp_count(&self) -> usize;
    fn temp_properties(&self, index: usize) -> Result<TempProperties>;
    fn temp_reading(&self, index: usize) -> Result<f64>;

    fn fan_count(&self) -> usize;
    fn fan_properties(&self, index: usize) -> Result<FanProperties>;
    fn fan_config(&self, index: usize) -> Result<FanConfig>;
    fn set_fan_config(&self, index: usize, config: FanConfig) -> Result<()>;
    fn fan_state(&self, index: usize) -> Result<FanState>;

    fn ras_count(&self) -> usize;
    fn ras_properties(&self, index: usize) -> Result<RasProperties>;
    /// Read the error counters, optionally resetting them (privileged).
    fn ras_counters(&self, index: usize, clear: bool) -> Result<RasDetails>;
}

/// Simulated management firmware: one power domain, GPU and memory
/// frequency domains, three temperature sensors, one fan, and both RAS
/// counter sets.
pub struct SimTelemetry {
    privileged: bool,
    state: Mutex<SimTelemetryState>,
}

struct SimTelemetryState {
    energy_uj: u64,
    timestamp_us: u64,
    sustained: PowerSustainedLimit,
    freq_ranges: [FreqRange; 2],
    throttle_reasons: u32,
    fan: FanConfig,
    ras: [RasDetails; 2],
}

const FREQ_PROPS: [FreqProperties; 2] = [
    FreqProperties {
        domain: FreqDomain::Gpu,
        can_control: true,
        min_mhz: 300.0,
        max_mhz: 1600.0,
    },
    FreqProperties {
        domain: FreqDomain::Memory,
        can_control: false,
        min_mhz: 1200.0,
        max_mhz: 1200.0,
    },
];

const TEMP_SENSORS: [TempProperties; 3] = [
    TempProperties {
        sensor: TempSensor::Global,
        max_temp_c: 100.0,
    },
    TempProperties {
        sensor: TempSensor::Gpu,
        max_temp_c: 95.0,
    },
    TempProperties {
        sensor: TempSensor::Memory,
        max_temp_c: 85.0,
    },
];

const MAX_POWER_MW: u32 = 180_000;
const MAX_FAN_RPM: u32 = 3800;

impl SimTelemetry {
    pub fn new() -> Self {
        SimTelemetry {
            privileged: false,
            state: Mutex::new(SimTelemetryState {
                energy_uj: 0,
                timestamp_us: 0,
                sustained: PowerSustainedLimit {
                    enabled: true,
                    power_mw: 150_000,
                    interval_ms: 1000,
                },
                freq_ranges: [
                    FreqRange {
                        min_mhz: 300.0,
                        max_mhz: 1600.0,
                    },
                    FreqRange {
                        min_mhz: 1200.0,
                        max_mhz: 1200.0,
                    },
                ],
                throttle_reasons: 0,
                fan: FanConfig {
                    mode: FanSpeedMode::Default,
                    speed: 0,
                    units: FanSpeedUnits::Percent,
                },
                ras: [RasDetails::default(); 2],
            }),
        }
    }

    /// Allow the privileged controls (limit changes, counter resets).
    pub fn with_privilege(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Report the GPU domain as thermally throttled.
    pub fn with_thermal_throttle(self) -> Self {
        self.state.lock().unwrap().throttle_reasons = THROTTLE_THERMAL_LIMIT;
        self
    }

    /// Accumulate RAS errors for tests and demos.
    pub fn record_ras_errors(&self, kind: RasKind, details: RasDetails) {
        let mut state = self.state.lock().unwrap();
        let slot = &mut state.ras[kind as usize];
        slot.num_resets += details.num_resets;
        slot.driver_errors += details.driver_errors;
        slot.compute_errors += details.compute_errors;
        slot.cache_errors += details.cache_errors;
        slot.memory_errors += details.memory_errors;
        slot.display_errors += details.display_errors;
    }

    fn check_privilege(&self) -> Result<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(DriverError::InsufficientPermissions)
        }
    }
}

impl Default for SimTelemetry {
    fn default() -> Self {
        SimTelemetry::new()
    }
}

fn check_index(index: usize, count: usize) -> Result<()> {
    if index < count {
        Ok(())
    } else {
        Err(DriverError::InvalidArgument)
    }
}

impl TelemetrySource for SimTelemetry {
    fn device_properties(&self) -> Result<SysmanDeviceProperties> {
        Ok(SysmanDeviceProperties {
            name: "simgpu".into(),
            vendor: "Acme Silicon".into(),
            model: "SG-1000".into(),
            serial_number: "SG1000-0001".into(),
            driver_version: env!("CARGO_PKG_VERSION").into(),
        })
    }

    fn power_count(&self) -> usize {
        1
    }

    fn power_properties(&self, index: usize) -> Result<PowerProperties> {
        check_index(index, 1)?;
        Ok(PowerProperties {
            can_control: true,
            default_limit_mw: 150_000,
            max_limit_mw: MAX_POWER_MW,
        })
    }

    fn power_energy(&self, index: usize) -> Result<EnergyCounter> {
        check_index(index, 1)?;
        // Advance the counters so deltas look like a live device.
        let mut state = self.state.lock().unwrap();
        state.energy_uj += 120_000;
        state.timestamp_us += 1_000;
        Ok(EnergyCounter {
            energy_uj: state.energy_uj,
            timestamp_us: state.timestamp_us,
        })
    }

    fn power_sustained_limit(&self, index: usize) -> Result<PowerSustainedLimit> {
        check_index(index, 1)?;
        Ok(self.state.lock().unwrap().sustained)
    }

    fn set_power_sustained_limit(&self, index: usize, limit: PowerSustainedLimit) -> Result<()> {
        check_index(index, 1)?;
        self.check_privilege()?;
        if limit.power_mw == 0 || limit.power_mw > MAX_POWER_MW {
            return Err(DriverError::InvalidArgument);
        }
        log::debug!("sustained power limit set to {} mW", limit.power_mw);
        self.state.lock().unwrap().sustained = limit;
        Ok(())
    }

    fn freq_count(&self) -> usize {
        FREQ_PROPS.len()
    }

    fn freq_properties(&self, index: usize) -> Result<FreqProperties> {
        check_index(index, FREQ_PROPS.len())?;
        Ok(FREQ_PROPS[index])
    }

    fn freq_available_clocks(&self, index: usize) -> Result<Vec<f64>> {
        let props = self.freq_properties(index)?;
        // 50 MHz steps across the hardware window.
        let mut clocks = Vec::new();
        let mut clock = props.min_mhz;
        while clock <= props.max_mhz {
            clocks.push(clock);
            clock += 50.0;
        }
        Ok(clocks)
    }

    fn freq_range(&self, index: usize) -> Result<FreqRange> {
        check_index(index, FREQ_PROPS.len())?;
        Ok(self.state.lock().unwrap().freq_ranges[index])
    }

    fn set_freq_range(&self, index: usize, range: FreqRange) -> Result<()> {
        let props = self.freq_properties(index)?;
        self.check_privilege()?;
        if !props.can_control {
            return Err(DriverError::UnsupportedFeature);
        }
        if range.min_mhz > range.max_mhz
            || range.min_mhz < props.min_mhz
            || range.max_mhz > props.max_mhz
        {
            return Err(DriverError::InvalidArgument);
        }
        log::debug!(
            "frequency range set to [{}, {}] MHz",
            range.min_mhz,
            range.max_mhz
        );
        self.state.lock().unwrap().freq_ranges[index] = range;
        Ok(())
    }

    fn freq_state(&self, index: usize) -> Result<FreqState> {
        check_index(index, FREQ_PROPS.len())?;
        let state = self.state.lock().unwrap();
        let range = state.freq_ranges[index];
        let throttled = index == 0 && state.throttle_reasons != 0;
        Ok(FreqState {
            request_mhz: range.max_mhz,
            actual_mhz: if throttled {
                (range.max_mhz - 200.0).max(range.min_mhz)
            } else {
                range.max_mhz
            },
            throttle_reasons: if throttled { state.throttle_reasons } else { 0 },
        })
    }

    fn temp_count(&self) -> usize {
        TEMP_SENSORS.len()
    }

    fn temp_properties(&self, index: usize) -> Result<TempProperties> {
        check_index(index, TEMP_SENSORS.len())?;
        Ok(TEMP_SENSORS[index])
    }

    fn temp_reading(&self, index: usize) -> Result<f64> {
        let props = self.temp_properties(index)?;
        let throttled = self.state.lock().unwrap().throttle_reasons & THROTTLE_THERMAL_LIMIT != 0;
        Ok(if throttled {
            props.max_temp_c
        } else {
            props.max_temp_c - 40.0
        })
    }

    fn fan_count(&self) -> usize {
        1
    }

    fn fan_properties(&self, index: usize) -> Result<FanProperties> {
        check_index(index, 1)?;
        Ok(FanProperties {
            can_control: true,
            max_rpm: MAX_FAN_RPM,
        })
    }

    fn fan_config(&self, index: usize) -> Result<FanConfig> {
        check_index(index, 1)?;
        Ok(self.state.lock().unwrap().fan)
    }

    fn set_fan_config(&self, index: usize, config: FanConfig) -> Result<()> {
        check_index(index, 1)?;
        self.check_privilege()?;
        let valid = match (config.mode, config.units) {
            (FanSpeedMode::Default, _) => true,
            (FanSpeedMode::Fixed, FanSpeedUnits::Percent) => config.speed <= 100,
            (FanSpeedMode::Fixed, FanSpeedUnits::Rpm) => config.speed <= MAX_FAN_RPM,
        };
        if !valid {
            return Err(DriverError::InvalidArgument);
        }
        self.state.lock().unwrap().fan = config;
        Ok(())
    }

    fn fan_state(&self, index: usize) -> Result<FanState> {
        check_index(index, 1)?;
        let fan = self.state.lock().unwrap().fan;
        let speed_rpm = match (fan.mode, fan.units) {
            (FanSpeedMode::Default, _) => MAX_FAN_RPM / 2,
            (FanSpeedMode::Fixed, FanSpeedUnits::Rpm) => fan.speed,
            (FanSpeedMode::Fixed, FanSpeedUnits::Percent) => MAX_FAN_RPM * fan.speed / 100,
        };
        Ok(FanState { speed_rpm })
    }

    fn ras_count(&self) -> usize {
        2
    }

    fn ras_properties(&self, index: usize) -> Result<RasProperties> {
        check_index(index, 2)?;
        Ok(RasProperties {
            kind: if index == 0 {
                RasKind::Correctable
            } else {
                RasKind::Uncorrectable
            },
            enabled: true,
        })
    }

    fn ras_counters(&self, index: usize, clear: bool) -> Result<RasDetails> {
        check_index(index, 2)?;
        if clear {
            self.check_privilege()?;
        }
        let mut state = self.state.lock().unwrap();
        let details = state.ras[index];
        if clear {
            state.ras[index] = RasDetails::default();
        }
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_counter_is_monotonic() {
        let sim = SimTelemetry::new();
        let first = sim.power_energy(0).unwrap();
        let second = sim.power_energy(0).unwrap();
        assert!(second.energy_uj > first.energy_uj);
        assert!(second.timestamp_us > first.timestamp_us);
    }

    #[test]
    fn test_component_index_bounds() {
        let sim = SimTelemetry::new();
        assert_eq!(
            sim.power_properties(1).unwrap_err(),
            DriverError::InvalidArgument
        );
        assert_eq!(
            sim.temp_reading(3).unwrap_err(),
            DriverError::InvalidArgument
        );
        assert_eq!(
            sim.ras_counters(2, false).unwrap_err(),
            DriverError::InvalidArgument
        );
    }

    #[test]
    fn test_sets_require_privilege() {
        let sim = SimTelemetry::new();
        let limit = PowerSustainedLimit {
            enabled: true,
            power_mw: 100_000,
            interval_ms: 500,
        };
        assert_eq!(
            sim.set_power_sustained_limit(0, limit).unwrap_err(),
            DriverError::InsufficientPermissions
        );
        assert_eq!(
            sim.ras_counters(0, true).unwrap_err(),
            DriverError::InsufficientPermissions
        );

        let sim = SimTelemetry::new().with_privilege();
        sim.set_power_sustained_limit(0, limit).unwrap();
        assert_eq!(sim.power_sustained_limit(0).unwrap(), limit);
    }

    #[test]
    fn test_power_limit_bounds() {
        let sim = SimTelemetry::new().with_privilege();
        let over = PowerSustainedLimit {
            enabled: true,
            power_mw: MAX_POWER_MW + 1,
            interval_ms: 500,
        };
        assert_eq!(
            sim.set_power_sustained_limit(0, over).unwrap_err(),
            DriverError::InvalidArgument
        );
    }

    #[test]
    fn test_freq_range_validation() {
        let sim = SimTelemetry::new().with_privilege();

        sim.set_freq_range(
            0,
            FreqRange {
                min_mhz: 600.0,
                max_mhz: 1200.0,
            },
        )
        .unwrap();
        assert_eq!(sim.freq_range(0).unwrap().max_mhz, 1200.0);

        // Outside the hardware window.
        let result = sim.set_freq_range(
            0,
            FreqRange {
                min_mhz: 100.0,
                max_mhz: 1200.0,
            },
        );
        assert_eq!(result.unwrap_err(), DriverError::InvalidArgument);

        // The memory domain is fixed-frequency.
        let result = sim.set_freq_range(
            1,
            FreqRange {
                min_mhz: 1200.0,
                max_mhz: 1200.0,
            },
        );
        assert_eq!(result.unwrap_err(), DriverError::UnsupportedFeature);
    }

    #[test]
    fn test_thermal_throttle_reflected_in_state() {
        let sim = SimTelemetry::new().with_thermal_throttle();
        let state = sim.freq_state(0).unwrap();
        assert_ne!(state.throttle_reasons & THROTTLE_THERMAL_LIMIT, 0);
        assert!(state.actual_mhz < state.request_mhz);
    }

    #[test]
    fn test_ras_clear_resets_counters() {
        let sim = SimTelemetry::new().with_privilege();
        sim.record_ras_errors(
            RasKind::Correctable,
            RasDetails {
                memory_errors: 5,
                ..Default::default()
            },
        );

        let read = sim.ras_counters(0, false).unwrap();
        assert_eq!(read.memory_errors, 5);

        // Clearing hands back the pre-clear counters once.
        let cleared = sim.ras_counters(0, true).unwrap();
        assert_eq!(cleared.memory_errors, 5);
        assert_eq!(sim.ras_counters(0, false).unwrap().total(), 0);
    }
}
