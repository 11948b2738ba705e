// Minimal blocking HTTP GET surface used by the firmware fetcher

use std::time::Duration;

use crate::error::NetworkError;

/// Streaming response body.
pub trait BodyReader {
    /// Returns 0 at end of body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError>;
}

pub struct HttpResponse<'a> {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn BodyReader + 'a>,
}

/// Blocking GET. The transport enforces `timeout` for the whole request,
/// body included, and reports it as `NetworkError::Timeout`.
pub trait HttpTransport: Send {
    fn get<'a>(&'a mut self, url: &str, timeout: Duration) -> Result<HttpResponse<'a>, NetworkError>;
}

/// `<base>/<name>` with exactly one separator.
pub fn join_url(base: &str, name: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        name.trim().trim_start_matches('/')
    )
}
