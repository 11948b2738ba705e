// Sensor collaborators consumed by the sensing loop

use anyhow::Result;

pub mod frames;

/// One SHT31 measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub humidity_pct: u8,
}

impl ClimateReading {
    /// Relative humidity is clamped to 0..=100 and rounded.
    pub fn new(temperature_c: f32, humidity_pct: f32) -> Self {
        Self {
            temperature_c,
            humidity_pct: humidity_pct.clamp(0.0, 100.0).round() as u8,
        }
    }
}

/// NDIR CO2 sensor (MH-Z19B on the board).
///
/// `read_latest` returns `None` when the read failed; callers report that as
/// absent rather than reusing an older value.
pub trait Co2Sensor: Send {
    fn read_latest(&mut self) -> Option<u16>;

    fn calibrate_zero(&mut self) -> Result<()>;

    /// Automatic baseline correction.
    fn set_abc(&mut self, enabled: bool) -> Result<()>;
}

pub trait ClimateSensor: Send {
    fn read_latest(&mut self) -> Option<ClimateReading>;
}

pub trait BatteryMonitor: Send {
    /// Battery voltage in volts.
    fn read_latest(&mut self) -> Option<f32>;
}
