pub mod http;

pub use http::{join_url, BodyReader, HttpResponse, HttpTransport};

use crate::error::NetworkError;

/// The device's network link (Wi-Fi station on the board).
///
/// Called before every batch of network work; implementations reconnect if
/// needed and must return within their own bounded timeout.
pub trait Link: Send {
    fn ensure_up(&mut self) -> Result<(), NetworkError>;

    fn is_up(&self) -> bool;
}
