// Display collaborator and the view it renders

use anyhow::Result;

use crate::state::Snapshot;

pub const DEFAULT_BRIGHTNESS: u8 = 10;

/// What the screen shows, at display resolution.
///
/// Two snapshots that render the same view do not trigger a redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayView {
    pub co2_ppm: Option<u16>,
    /// Tenths of a degree
    pub temp_deci_c: Option<i32>,
    pub humidity_pct: Option<u8>,
    /// Hundredths of a volt
    pub battery_cv: Option<i32>,
    pub zero_calibrating: bool,
}

impl DisplayView {
    pub fn from_snapshot(snapshot: &Snapshot, zero_calibrating: bool) -> Self {
        Self {
            co2_ppm: snapshot.co2_ppm,
            temp_deci_c: snapshot.temp_c.map(|t| (t * 10.0).round() as i32),
            humidity_pct: snapshot.humidity_pct,
            battery_cv: snapshot.battery_v.map(|v| (v * 100.0).round() as i32),
            zero_calibrating,
        }
    }
}

pub trait Display: Send {
    /// Backlight in percent, 0..=100.
    fn set_brightness(&mut self, percent: u8) -> Result<()>;

    fn render(&mut self, view: &DisplayView) -> Result<()>;
}
