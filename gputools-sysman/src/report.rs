/// Telemetry report
///
/// Renders a full snapshot of a device's management state as JSON, one
/// object per component, for tooling and the demo binary.

use serde_json::json;
use thiserror::Error;

use crate::Sysman;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("telemetry error: {0}")]
    Telemetry(#[from] gpudebug::DriverError),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// Snapshot every component of the device into one JSON value.
pub fn device_report(sysman: &Sysman) -> Result<serde_json::Value> {
    let mut powers = Vec::new();
    for power in sysman.power_domains() {
        powers.push(json!({
            "properties": power.properties()?,
            "energy": power.energy_counter()?,
            "sustained_limit": power.sustained_limit()?,
        }));
    }

    let mut frequencies = Vec::new();
    for frequency in sysman.frequency_domains() {
        frequencies.push(json!({
            "properties": frequency.properties()?,
            "range": frequency.range()?,
            "state": frequency.state()?,
        }));
    }

    let mut temperatures = Vec::new();
    for sensor in sysman.temperature_sensors() {
        temperatures.push(json!({
            "properties": sensor.properties()?,
            "celsius": sensor.reading()?,
        }));
    }

    let mut fans = Vec::new();
    for fan in sysman.fans() {
        fans.push(json!({
            "properties": fan.properties()?,
            "config": fan.config()?,
            "state": fan.state()?,
        }));
    }

    let mut ras = Vec::new();
    for counters in sysman.ras_sets() {
        let details = counters.counters(false)?;
        ras.push(json!({
            "properties": counters.properties()?,
            "total": details.total(),
            "details": details,
        }));
    }

    Ok(json!({
        "device": sysman.device_properties()?,
        "power": powers,
        "frequency": frequencies,
        "temperature": temperatures,
        "fans": fans,
        "ras": ras,
    }))
}

/// The report as pretty-printed JSON text.
pub fn render(sysman: &Sysman) -> Result<String> {
    Ok(serde_json::to_string_pretty(&device_report(sysman)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SimTelemetry;
    use std::sync::Arc;

    #[test]
    fn test_report_covers_every_domain() {
        let sysman = Sysman::new(Arc::new(SimTelemetry::new()));
        let report = device_report(&sysman).unwrap();

        assert!(report["device"]["name"].is_string());
        assert_eq!(report["power"].as_array().unwrap().len(), 1);
        assert_eq!(report["frequency"].as_array().unwrap().len(), 2);
        assert_eq!(report["temperature"].as_array().unwrap().len(), 3);
        assert_eq!(report["fans"].as_array().unwrap().len(), 1);
        assert_eq!(report["ras"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_render_is_valid_json() {
        let sysman = Sysman::new(Arc::new(SimTelemetry::new()));
        let text = render(&sysman).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["device"]["model"], "SG-1000");
    }
}
