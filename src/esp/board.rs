// Board wiring for the ESP32-C6 Touch LCD 1.47 with MH-Z19B and SHT31

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::{AdcChannelConfig, Calibration};
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::delay::{TickType, BLOCK};
use esp_idf_hal::gpio::{AnyIOPin, Gpio0};
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::ledc::config::TimerConfig;
use esp_idf_hal::ledc::{LedcDriver, LedcTimerDriver};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::peripherals::Peripherals as HalPeripherals;
use esp_idf_hal::prelude::*;
use esp_idf_hal::uart::{UartConfig, UartDriver};
use log::{debug, info, warn};

use crate::display::{Display, DisplayView};
use crate::scheduler::Peripherals;
use crate::sensors::frames::{self, MHZ19_FRAME_LEN, SHT31_ADDR, SHT31_FRAME_LEN, SHT31_MEASURE};
use crate::sensors::{BatteryMonitor, ClimateReading, ClimateSensor, Co2Sensor};
use crate::system::SystemControl;

const MHZ19B_BAUD: u32 = 9_600;
const MHZ19B_TIMEOUT: Duration = Duration::from_millis(200);
/// Consecutive failed reads before the UART is reset
const MHZ19B_REINIT_AFTER: u32 = 3;
const SHT31_MEASURE_DELAY: Duration = Duration::from_millis(15);
/// Resistor divider on the battery sense pin
const BATTERY_SCALE: f32 = 3.0;
const BACKLIGHT_FREQ_KHZ: u32 = 25;

/// Peripherals the sensing loop owns, plus the radio for the Wi-Fi link.
pub struct Board {
    pub peripherals: Peripherals,
    pub modem: Modem,
}

impl Board {
    pub fn take() -> Result<Self> {
        let p = HalPeripherals::take()?;
        let pins = p.pins;

        let i2c = I2cDriver::new(p.i2c0, pins.gpio18, pins.gpio19, &I2cConfig::new().baudrate(100.kHz().into()))?;

        let uart = UartDriver::new(
            p.uart0,
            pins.gpio16,
            pins.gpio17,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &UartConfig::new().baudrate(MHZ19B_BAUD.Hz()),
        )?;

        let adc = AdcDriver::new(p.adc1)?;
        let adc_config = AdcChannelConfig {
            attenuation: DB_11,
            calibration: Calibration::Curve,
            ..Default::default()
        };
        let battery = AdcChannelDriver::new(adc, pins.gpio0, &adc_config)?;

        let timer = LedcTimerDriver::new(
            p.ledc.timer0,
            &TimerConfig::default().frequency(BACKLIGHT_FREQ_KHZ.kHz().into()),
        )?;
        let backlight = LedcDriver::new(p.ledc.channel0, timer, pins.gpio23)?;

        info!("Board peripherals initialized");
        Ok(Self {
            peripherals: Peripherals {
                co2: Box::new(Mhz19b::new(uart)),
                climate: Box::new(Sht31 { i2c }),
                battery: Box::new(Battery { channel: battery }),
                display: Box::new(BacklightDisplay { backlight }),
                system: Box::new(EspSystem),
            },
            modem: p.modem,
        })
    }
}

pub struct Mhz19b {
    uart: UartDriver<'static>,
    consecutive_errors: u32,
}

impl Mhz19b {
    fn new(uart: UartDriver<'static>) -> Self {
        Self {
            uart,
            consecutive_errors: 0,
        }
    }

    fn send(&mut self, frame: &[u8; MHZ19_FRAME_LEN]) -> Result<()> {
        self.uart.write(frame)?;
        self.uart.wait_tx_done(BLOCK)?;
        Ok(())
    }

    fn read_ppm(&mut self) -> Result<u16> {
        self.uart.clear_rx()?;
        self.send(&frames::mhz19_read_command())?;

        let mut buf = [0u8; MHZ19_FRAME_LEN];
        let mut received = 0;
        let deadline = Instant::now() + MHZ19B_TIMEOUT;
        while received < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!("timeout: got {}/{} bytes", received, buf.len()));
            }
            let ticks = TickType::new_millis(remaining.as_millis() as u64).ticks();
            received += self.uart.read(&mut buf[received..], ticks)?;
        }
        debug!("MH-Z19B frame: {:02X?}", buf);
        Ok(frames::mhz19_parse_response(&buf)?)
    }

    fn reinit(&mut self) -> Result<()> {
        self.uart.clear_rx()?;
        self.uart.change_baudrate(MHZ19B_BAUD.Hz())?;
        Ok(())
    }
}

impl Co2Sensor for Mhz19b {
    fn read_latest(&mut self) -> Option<u16> {
        match self.read_ppm() {
            Ok(ppm) => {
                self.consecutive_errors = 0;
                Some(ppm)
            }
            Err(e) => {
                self.consecutive_errors += 1;
                warn!("MH-Z19B read failed ({}x): {:?}", self.consecutive_errors, e);
                if self.consecutive_errors >= MHZ19B_REINIT_AFTER {
                    match self.reinit() {
                        Ok(()) => info!("MH-Z19B UART reinitialized"),
                        Err(e) => warn!("MH-Z19B reinit failed: {:?}", e),
                    }
                    self.consecutive_errors = 0;
                }
                None
            }
        }
    }

    fn calibrate_zero(&mut self) -> Result<()> {
        info!("MH-Z19B: zero point calibration (expects 400 ppm air)");
        self.send(&frames::mhz19_zero_command())
    }

    fn set_abc(&mut self, enabled: bool) -> Result<()> {
        self.send(&frames::mhz19_abc_command(enabled))
    }
}

pub struct Sht31 {
    i2c: I2cDriver<'static>,
}

impl Sht31 {
    fn measure(&mut self) -> Result<ClimateReading> {
        self.i2c.write(SHT31_ADDR, &SHT31_MEASURE, BLOCK)?;
        thread::sleep(SHT31_MEASURE_DELAY);
        let mut data = [0u8; SHT31_FRAME_LEN];
        self.i2c.read(SHT31_ADDR, &mut data, BLOCK)?;
        let (temperature, humidity) = frames::sht31_decode(&data)?;
        Ok(ClimateReading::new(temperature, humidity))
    }
}

impl ClimateSensor for Sht31 {
    fn read_latest(&mut self) -> Option<ClimateReading> {
        self.measure().map_err(|e| warn!("SHT31 read failed: {:?}", e)).ok()
    }
}

pub struct Battery {
    channel: AdcChannelDriver<'static, Gpio0, AdcDriver<'static, ADC1>>,
}

impl BatteryMonitor for Battery {
    fn read_latest(&mut self) -> Option<f32> {
        match self.channel.read() {
            Ok(mv) => Some(f32::from(mv) / 1000.0 * BATTERY_SCALE),
            Err(e) => {
                warn!("Battery ADC read failed: {}", e);
                None
            }
        }
    }
}

/// LCD backlight on LEDC. Drawing is left to the panel driver; the view is logged.
pub struct BacklightDisplay {
    backlight: LedcDriver<'static>,
}

impl Display for BacklightDisplay {
    fn set_brightness(&mut self, percent: u8) -> Result<()> {
        let max = self.backlight.get_max_duty();
        let duty = max * u32::from(percent.min(100)) / 100;
        self.backlight.set_duty(duty)?;
        debug!("Backlight {}% (duty {}/{})", percent, duty, max);
        Ok(())
    }

    fn render(&mut self, view: &DisplayView) -> Result<()> {
        info!("Display: {:?}", view);
        Ok(())
    }
}

pub struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        info!("Restarting...");
        esp_idf_hal::reset::restart();
    }
}
