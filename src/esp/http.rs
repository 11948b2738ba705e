use std::time::{Duration, Instant};

use embedded_svc::http::client::Connection;
use embedded_svc::http::{Headers, Method, Status};
use embedded_svc::io::Read;
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use esp_idf_sys::EspError;

use super::network_error;
use crate::error::NetworkError;
use crate::network::{BodyReader, HttpResponse, HttpTransport};

const BUFFER_SIZE: usize = 1024;

/// Plain-HTTP client over `esp_http_client`. One connection per request.
#[derive(Default)]
pub struct EspHttp {
    conn: Option<EspHttpConnection>,
}

impl EspHttp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpTransport for EspHttp {
    fn get<'a>(&'a mut self, url: &str, timeout: Duration) -> Result<HttpResponse<'a>, NetworkError> {
        // Drop any previous connection before opening the next one
        self.conn = None;

        let config = Configuration {
            timeout: Some(timeout),
            buffer_size: Some(BUFFER_SIZE),
            ..Default::default()
        };
        let mut conn = EspHttpConnection::new(&config).map_err(|e| network_error("http client", e))?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(|e| request_error(url, e, timeout))?;
        conn.initiate_response()
            .map_err(|e| request_error(url, e, timeout))?;

        let status = conn.status();
        let content_length = conn.content_len();
        let conn = self.conn.insert(conn);

        Ok(HttpResponse {
            status,
            content_length,
            body: Box::new(EspBody {
                conn,
                deadline: Instant::now() + timeout,
                timeout,
            }),
        })
    }
}

struct EspBody<'a> {
    conn: &'a mut EspHttpConnection,
    deadline: Instant,
    timeout: Duration,
}

impl BodyReader for EspBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        if Instant::now() >= self.deadline {
            return Err(NetworkError::Timeout(self.timeout.as_millis() as u64));
        }
        let timeout = self.timeout;
        self.conn.read(buf).map_err(|e| request_error("http body", e.0, timeout))
    }
}

fn request_error(context: &str, err: EspError, timeout: Duration) -> NetworkError {
    match network_error(context, err) {
        NetworkError::Timeout(_) => NetworkError::Timeout(timeout.as_millis() as u64),
        other => other,
    }
}
