/// System resource management for GPU devices
///
/// This crate exposes the management facet of the tools driver: per-device
/// component handles for power, frequency, temperature, fan and RAS error
/// counters, each with the uniform get-properties / get-state / set-config
/// shape, plus a JSON telemetry report. Operations return the same result
/// taxonomy as the debug surface.

use std::sync::Arc;

pub mod report;
pub mod source;
pub mod types;

pub use gpudebug::{DriverError, Result};
pub use source::{SimTelemetry, TelemetrySource};
pub use types::*;

/// Entry point to the management surface of one device.
#[derive(Clone)]
pub struct Sysman {
    source: Arc<dyn TelemetrySource>,
}

impl Sysman {
    pub fn new(source: Arc<dyn TelemetrySource>) -> Self {
        Sysman { source }
    }

    pub fn device_properties(&self) -> Result<SysmanDeviceProperties> {
        self.source.device_properties()
    }

    pub fn power_domains(&self) -> Vec<Power> {
        (0..self.source.power_count())
            .map(|index| Power {
                source: self.source.clone(),
                index,
            })
            .collect()
    }

    pub fn frequency_domains(&self) -> Vec<Frequency> {
        (0..self.source.freq_count())
            .map(|index| Frequency {
                source: self.source.clone(),
                index,
            })
            .collect()
    }

    pub fn temperature_sensors(&self) -> Vec<Temperature> {
        (0..self.source.temp_count())
            .map(|index| Temperature {
                source: self.source.clone(),
                index,
            })
            .collect()
    }

    pub fn fans(&self) -> Vec<Fan> {
        (0..self.source.fan_count())
            .map(|index| Fan {
                source: self.source.clone(),
                index,
            })
            .collect()
    }

    pub fn ras_sets(&self) -> Vec<Ras> {
        (0..self.source.ras_count())
            .map(|index| Ras {
                source: self.source.clone(),
                index,
            })
            .collect()
    }
}

/// A power domain handle.
#[derive(Clone)]
pub struct Power {
    source: Arc<dyn TelemetrySource>,
    index: usize,
}

impl Power {
    pub fn properties(&self) -> Result<PowerProperties> {
        self.source.power_properties(self.index)
    }

    pub fn energy_counter(&self) -> Result<EnergyCounter> {
        self.source.power_energy(self.index)
    }

    pub fn sustained_limit(&self) -> Result<PowerSustainedLimit> {
        self.source.power_sustained_limit(self.index)
    }

    pub fn set_sustained_limit(&self, limit: PowerSustainedLimit) -> Result<()> {
        self.source.set_power_sustained_limit(self.index, limit)
    }
}

/// A frequency domain handle.
#[derive(Clone)]
pub struct Frequency {
    source: Arc<dyn TelemetrySource>,
    index: usize,
}

impl Frequency {
    pub fn properties(&self) -> Result<FreqProperties> {
        self.source.freq_properties(self.index)
    }

    pub fn available_clocks(&self) -> Result<Vec<f64>> {
        self.source.freq_available_clocks(self.index)
    }

    pub fn range(&self) -> Result<FreqRange> {
        self.source.freq_range(self.index)
    }

    pub fn set_range(&self, range: FreqRange) -> Result<()> {
        self.source.set_freq_range(self.index, range)
    }

    pub fn state(&self) -> Result<FreqState> {
        self.source.freq_state(self.index)
    }
}

/// A temperature sensor handle.
#[derive(Clone)]
pub struct Temperature {
    source: Arc<dyn TelemetrySource>,
    index: usize,
}

impl Temperature {
    pub fn properties(&self) -> Result<TempProperties> {
        self.source.temp_properties(self.index)
    }

    /// The current reading in Celsius.
    pub fn reading(&self) -> Result<f64> {
        self.source.temp_reading(self.index)
    }
}

/// A fan handle.
#[derive(Clone)]
pub struct Fan {
    source: Arc<dyn TelemetrySource>,
    index: usize,
}

impl Fan {
    pub fn properties(&self) -> Result<FanProperties> {
        self.source.fan_properties(self.index)
    }

    pub fn config(&self) -> Result<FanConfig> {
        self.source.fan_config(self.index)
    }

    pub fn set_config(&self, config: FanConfig) -> Result<()> {
        self.source.set_fan_config(self.index, config)
    }

    pub fn state(&self) -> Result<FanState> {
        self.source.fan_state(self.index)
    }
}

/// A RAS error-counter set handle.
#[derive(Clone)]
pub struct Ras {
    source: Arc<dyn TelemetrySource>,
    index: usize,
}

impl Ras {
    pub fn properties(&self) -> Result<RasProperties> {
        self.source.ras_properties(self.index)
    }

    /// Read the counters; `clear` resets them and requires privilege.
    pub fn counters(&self, clear: bool) -> Result<RasDetails> {
        self.source.ras_counters(self.index, clear)
    }
}
