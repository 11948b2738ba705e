use anyhow::{bail, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};

use super::network_error;
use crate::error::NetworkError;
use crate::network::Link;

/// Wi-Fi station. Reconnects on demand from the network worker.
pub struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
}

impl WifiLink {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: &str,
        password: &str,
    ) -> Result<Self> {
        if ssid.is_empty() {
            bail!("WiFi SSID cannot be empty");
        }

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", ssid))?,
            password: password
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
            auth_method: if password.is_empty() {
                warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        esp_wifi.set_configuration(&cfg)?;

        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        info!("WiFi configured for SSID '{}'", ssid);
        Ok(Self {
            wifi,
            ssid: ssid.to_string(),
        })
    }
}

impl Link for WifiLink {
    fn ensure_up(&mut self) -> Result<(), NetworkError> {
        if self.is_up() {
            return Ok(());
        }
        if !self.wifi.is_started().map_err(|e| network_error("wifi start", e))? {
            self.wifi.start().map_err(|e| network_error("wifi start", e))?;
        }
        info!("WiFi: connecting to {}", self.ssid);
        self.wifi
            .connect()
            .map_err(|e| NetworkError::LinkDown(format!("connect to {}: {}", self.ssid, e)))?;
        self.wifi
            .wait_netif_up()
            .map_err(|e| network_error("dhcp", e))?;

        if let Ok(ip) = self.wifi.wifi().sta_netif().get_ip_info() {
            info!("WiFi connected, IP {}", ip.ip);
        }
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}
