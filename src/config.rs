use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::display::DEFAULT_BRIGHTNESS;
use crate::version::{DEFAULT_FILE_EXT, DEFAULT_FILE_PREFIX};

pub const CONFIG_NAMESPACE: &str = "c6node";
pub const CONFIG_KEY: &str = "config";

// Compiled-in defaults, exported by build.rs
const WIFI_SSID: &str = match option_env!("WIFI_SSID") {
    Some(v) => v,
    None => "",
};
const WIFI_PASS: &str = match option_env!("WIFI_PASS") {
    Some(v) => v,
    None => "",
};
const OTA_BASE_URL: &str = match option_env!("OTA_BASE_URL") {
    Some(v) => v,
    None => "http://192.168.1.18:8000/firmware",
};
const MQTT_HOST: &str = match option_env!("MQTT_HOST") {
    Some(v) => v,
    None => "homeassistant.local",
};
const MQTT_PORT: Option<&str> = option_env!("MQTT_PORT");
const MQTT_USER: &str = match option_env!("MQTT_USER") {
    Some(v) => v,
    None => "esp32-co",
};
const MQTT_PASS: &str = match option_env!("MQTT_PASS") {
    Some(v) => v,
    None => "esp32-co",
};
const MQTT_CLIENT_ID: &str = match option_env!("MQTT_CLIENT_ID") {
    Some(v) => v,
    None => "c6-demo",
};
const MQTT_PREFIX: &str = match option_env!("MQTT_PREFIX") {
    Some(v) => v,
    None => "c6-demo",
};

/// Persistent blob storage for the serialized config (NVS on the device).
pub trait ConfigStore {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&mut self) -> Result<Option<Vec<u8>>>;

    fn save(&mut self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub wifi: WifiConfig,
    pub ota: OtaConfig,
    pub mqtt: MqttConfig,
    pub cadence: CadenceConfig,
    pub display: DisplayConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaConfig {
    pub enabled: bool,
    pub base_url: String,
    pub file_prefix: String,
    pub file_ext: String,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub prefix: String,
    pub reconnect_secs: u64,
}

/// Task periods in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CadenceConfig {
    pub climate_ms: u64,
    pub co2_ms: u64,
    pub battery_ms: u64,
    pub telemetry_ms: u64,
    pub sensing_tick_ms: u64,
    pub network_tick_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub brightness: u8,
    /// ABC state applied to the CO2 sensor at boot
    pub abc_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wifi: WifiConfig {
                ssid: WIFI_SSID.to_string(),
                password: WIFI_PASS.to_string(),
            },
            ota: OtaConfig {
                enabled: true,
                base_url: OTA_BASE_URL.to_string(),
                file_prefix: DEFAULT_FILE_PREFIX.to_string(),
                file_ext: DEFAULT_FILE_EXT.to_string(),
                check_interval_secs: 900,
            },
            mqtt: MqttConfig {
                enabled: true,
                host: MQTT_HOST.to_string(),
                port: MQTT_PORT.and_then(|p| p.parse().ok()).unwrap_or(1883),
                username: non_empty(MQTT_USER),
                password: non_empty(MQTT_PASS),
                client_id: MQTT_CLIENT_ID.to_string(),
                prefix: MQTT_PREFIX.to_string(),
                reconnect_secs: 30,
            },
            cadence: CadenceConfig::default(),
            display: DisplayConfig {
                brightness: DEFAULT_BRIGHTNESS,
                abc_enabled: false,
            },
            log_level: if cfg!(debug_assertions) { "debug" } else { "info" }.to_string(),
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            climate_ms: 2_000,
            co2_ms: 5_000,
            battery_ms: 10_000,
            telemetry_ms: 10_000,
            sensing_tick_ms: 200,
            network_tick_ms: 100,
        }
    }
}

impl CadenceConfig {
    pub fn climate(&self) -> Duration {
        Duration::from_millis(self.climate_ms)
    }

    pub fn co2(&self) -> Duration {
        Duration::from_millis(self.co2_ms)
    }

    pub fn battery(&self) -> Duration {
        Duration::from_millis(self.battery_ms)
    }

    pub fn telemetry(&self) -> Duration {
        Duration::from_millis(self.telemetry_ms)
    }

    pub fn sensing_tick(&self) -> Duration {
        Duration::from_millis(self.sensing_tick_ms)
    }

    pub fn network_tick(&self) -> Duration {
        Duration::from_millis(self.network_tick_ms)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let c = &self.cadence;
        let periods = [
            ("climate_ms", c.climate_ms),
            ("co2_ms", c.co2_ms),
            ("battery_ms", c.battery_ms),
            ("telemetry_ms", c.telemetry_ms),
            ("sensing_tick_ms", c.sensing_tick_ms),
            ("network_tick_ms", c.network_tick_ms),
            ("ota.check_interval_secs", self.ota.check_interval_secs),
            ("mqtt.reconnect_secs", self.mqtt.reconnect_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.mqtt.prefix.trim().is_empty() {
            bail!("mqtt.prefix must not be empty");
        }
        if self.mqtt.client_id.trim().is_empty() {
            bail!("mqtt.client_id must not be empty");
        }
        if self.ota.file_prefix.is_empty() {
            bail!("ota.file_prefix must not be empty");
        }
        if self.display.brightness > 100 {
            bail!("display.brightness must be 0..=100, got {}", self.display.brightness);
        }
        Ok(())
    }

    pub fn ota_check_interval(&self) -> Duration {
        Duration::from_secs(self.ota.check_interval_secs)
    }

    pub fn mqtt_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.mqtt.reconnect_secs)
    }

    pub fn save(&self, store: &mut impl ConfigStore) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        store.save(&json)?;
        log::info!("Configuration saved");
        Ok(())
    }
}

pub fn load_or_default(store: &mut impl ConfigStore) -> Result<Config> {
    match load(store) {
        Ok(mut config) => {
            log::info!("Loaded configuration from storage");

            // If storage has empty WiFi credentials, use the compiled-in ones
            if config.wifi.ssid.is_empty() || config.wifi.password.is_empty() {
                let default_config = Config::default();
                log::warn!(
                    "Stored WiFi credentials empty, using compiled defaults: SSID='{}'",
                    default_config.wifi.ssid
                );
                config.wifi = default_config.wifi;

                if let Err(e) = config.save(store) {
                    log::warn!("Failed to save updated config with WiFi credentials: {:?}", e);
                }
            }

            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config: {:?}, using defaults", e);
            let config = Config::default();

            // Try to save default config for next time
            if let Err(save_err) = config.save(store) {
                log::warn!("Failed to save default config: {:?}", save_err);
            }

            Ok(config)
        }
    }
}

fn load(store: &mut impl ConfigStore) -> Result<Config> {
    let data = match store.load()? {
        Some(data) => data,
        None => bail!("no config stored"),
    };
    let config: Config = serde_json::from_slice(&data)?;
    config.validate()?;
    Ok(config)
}
