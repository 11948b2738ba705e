// ESP-IDF backends for the portable collaborator traits

pub mod board;
pub mod http;
pub mod mqtt;
pub mod nvs;
pub mod partitions;
pub mod wifi;

pub use board::{Board, EspSystem};
pub use http::EspHttp;
pub use mqtt::EspMqttConnector;
pub use nvs::NvsConfigStore;
pub use partitions::EspPartitions;
pub use wifi::WifiLink;

use esp_idf_sys::EspError;

use crate::error::NetworkError;

/// Classify an ESP-IDF error from the network stack.
pub(crate) fn network_error(context: &str, err: EspError) -> NetworkError {
    match err.code() {
        esp_idf_sys::ESP_ERR_TIMEOUT | esp_idf_sys::ESP_ERR_HTTP_EAGAIN => NetworkError::Timeout(0),
        esp_idf_sys::ESP_ERR_HTTP_CONNECT => NetworkError::Unreachable(format!("{}: {}", context, err)),
        _ => NetworkError::LinkDown(format!("{}: {}", context, err)),
    }
}
