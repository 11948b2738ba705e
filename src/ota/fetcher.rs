// Two-stage firmware retrieval: manifest, then the image itself

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{IntegrityError, NetworkError, ParseError, UpdateError};
use crate::network::{join_url, HttpTransport};
use crate::version::{FilenamePattern, VersionNumber};

pub const MANIFEST_FILE: &str = "latest.txt";
pub const MANIFEST_CAPACITY: usize = 256;
pub const CHUNK_SIZE: usize = 1024;

pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const IMAGE_TIMEOUT: Duration = Duration::from_secs(60);

// Progress is logged every this many bytes
const PROGRESS_STEP: u64 = 64 * 1024;

/// The single line served as `latest.txt`: `<filename> [<sha256-hex>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub filename: String,
    pub version: VersionNumber,
    pub sha256: Option<[u8; 32]>,
}

impl Manifest {
    pub fn parse(text: &str, pattern: &FilenamePattern) -> Result<Self, ParseError> {
        let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        let mut tokens = line.split_whitespace();
        let name = tokens.next().unwrap_or("");
        let version = pattern.parse(name)?;

        let sha256 = match tokens.next() {
            None => None,
            Some(token) => Some(parse_digest(token).ok_or_else(|| ParseError {
                input: token.to_string(),
                expected: "64 hex digits".to_string(),
            })?),
        };

        Ok(Self {
            filename: name.to_string(),
            version,
            sha256,
        })
    }
}

fn parse_digest(token: &str) -> Option<[u8; 32]> {
    let mut digest = [0u8; 32];
    hex::decode_to_slice(token, &mut digest).ok()?;
    Some(digest)
}

/// Where downloaded bytes go. On the device this is the staging partition.
pub trait ImageSink {
    /// Called once, before the first chunk, with the declared content length.
    fn start(&mut self, declared_len: Option<u64>) -> Result<(), UpdateError>;

    fn write(&mut self, bytes: &[u8]) -> Result<(), UpdateError>;
}

/// Summary of a completed download. The bytes themselves live in the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub filename: String,
    pub declared_len: Option<u64>,
    pub received: u64,
}

pub struct FirmwareFetcher<T: HttpTransport> {
    transport: T,
    pattern: FilenamePattern,
}

impl<T: HttpTransport> FirmwareFetcher<T> {
    pub fn new(transport: T, pattern: FilenamePattern) -> Self {
        Self { transport, pattern }
    }

    pub fn pattern(&self) -> &FilenamePattern {
        &self.pattern
    }

    /// Fetch and parse the manifest.
    ///
    /// `Ok(None)` means the server answered but named nothing usable
    /// (oversized, not UTF-8, or not in the filename pattern).
    pub fn resolve_candidate(&mut self, base_url: &str) -> Result<Option<Manifest>, NetworkError> {
        let url = join_url(base_url, MANIFEST_FILE);
        debug!("OTA: GET {}", url);

        let mut response = self.transport.get(&url, MANIFEST_TIMEOUT)?;
        if response.status != 200 {
            return Err(NetworkError::Status(response.status));
        }

        let mut text: heapless::Vec<u8, MANIFEST_CAPACITY> = heapless::Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = response.body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if text.extend_from_slice(&buf[..n]).is_err() {
                warn!("OTA: manifest at {} exceeds {} bytes, ignoring", url, MANIFEST_CAPACITY);
                return Ok(None);
            }
        }

        let text = match std::str::from_utf8(&text) {
            Ok(text) => text,
            Err(_) => {
                warn!("OTA: manifest at {} is not valid UTF-8, ignoring", url);
                return Ok(None);
            }
        };

        match Manifest::parse(text, &self.pattern) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!("OTA: no usable candidate in manifest: {}", e);
                Ok(None)
            }
        }
    }

    /// Stream `<base>/<filename>` into `sink` in `CHUNK_SIZE` pieces.
    ///
    /// A body that times out before its first byte is `IntegrityError::Empty`;
    /// a timeout after that is a `NetworkError`.
    pub fn download(
        &mut self,
        base_url: &str,
        filename: &str,
        sink: &mut dyn ImageSink,
    ) -> Result<FirmwareImage, UpdateError> {
        let url = join_url(base_url, filename);
        info!("OTA download start: {}", url);

        let mut response = self.transport.get(&url, IMAGE_TIMEOUT)?;
        if response.status != 200 {
            return Err(NetworkError::Status(response.status).into());
        }

        let declared_len = response.content_length;
        sink.start(declared_len)?;

        let mut buf = [0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        let mut next_report = PROGRESS_STEP;
        loop {
            let n = match response.body.read(&mut buf) {
                Ok(n) => n,
                Err(NetworkError::Timeout(ms)) if received == 0 => {
                    warn!("OTA: no image bytes from {} within {} ms", url, ms);
                    return Err(IntegrityError::Empty.into());
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }
            sink.write(&buf[..n])?;
            received += n as u64;

            if received >= next_report {
                match declared_len {
                    Some(total) => debug!("OTA: {}/{} bytes", received, total),
                    None => debug!("OTA: {} bytes", received),
                }
                next_report += PROGRESS_STEP;
            }
        }

        if received == 0 {
            return Err(IntegrityError::Empty.into());
        }
        if let Some(declared) = declared_len {
            if declared != received {
                return Err(IntegrityError::LengthMismatch { declared, received }.into());
            }
        }

        info!("OTA download complete: {} bytes", received);
        Ok(FirmwareImage {
            filename: filename.to_string(),
            declared_len,
            received,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Reply, ScriptedHttp};

    const BASE: &str = "http://fw.local/firmware";

    #[derive(Default)]
    struct VecSink {
        declared: Option<Option<u64>>,
        chunks: Vec<usize>,
        bytes: Vec<u8>,
    }

    impl ImageSink for VecSink {
        fn start(&mut self, declared_len: Option<u64>) -> Result<(), UpdateError> {
            self.declared = Some(declared_len);
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), UpdateError> {
            self.chunks.push(bytes.len());
            self.bytes.extend_from_slice(bytes);
            Ok(())
        }
    }

    fn fetcher(http: &ScriptedHttp) -> FirmwareFetcher<ScriptedHttp> {
        FirmwareFetcher::new(http.clone(), FilenamePattern::default())
    }

    #[test]
    fn parses_manifest_with_digest() {
        let digest = "ab".repeat(32);
        let m = Manifest::parse(&format!("c6-co0012.bin {}\n", digest), &FilenamePattern::default()).unwrap();
        assert_eq!(m.filename, "c6-co0012.bin");
        assert_eq!(m.version, VersionNumber(12));
        assert_eq!(m.sha256, Some([0xab; 32]));

        assert!(Manifest::parse("c6-co0012.bin nothex", &FilenamePattern::default()).is_err());
    }

    #[test]
    fn manifest_keeps_relative_path() {
        let m = Manifest::parse("builds/c6-co0003.bin", &FilenamePattern::default()).unwrap();
        assert_eq!(m.filename, "builds/c6-co0003.bin");
        assert_eq!(m.version, VersionNumber(3));
    }

    #[test]
    fn relative_path_is_fetched_below_base() {
        let image = vec![0xE9; 300];
        let http = ScriptedHttp::new().with(&format!("{BASE}/builds/c6-co0003.bin"), Reply::ok(image.clone()));
        let mut sink = VecSink::default();

        let done = fetcher(&http).download(BASE, "builds/c6-co0003.bin", &mut sink).unwrap();
        assert_eq!(done.received, 300);
        assert_eq!(sink.bytes, image);
        assert_eq!(http.requests(), vec![format!("{BASE}/builds/c6-co0003.bin")]);
    }

    #[test]
    fn resolves_candidate() {
        let http = ScriptedHttp::new().with(&format!("{BASE}/latest.txt"), Reply::ok(b"c6-co0012.bin\n".to_vec()));
        let manifest = fetcher(&http).resolve_candidate(BASE).unwrap().unwrap();
        assert_eq!(manifest.version, VersionNumber(12));
        assert_eq!(manifest.sha256, None);
    }

    #[test]
    fn garbage_manifest_is_no_candidate() {
        let http = ScriptedHttp::new().with(&format!("{BASE}/latest.txt"), Reply::ok(b"<html>404</html>".to_vec()));
        assert_eq!(fetcher(&http).resolve_candidate(BASE), Ok(None));

        http.set(&format!("{BASE}/latest.txt"), Reply::ok(vec![b'9'; MANIFEST_CAPACITY + 1]));
        assert_eq!(fetcher(&http).resolve_candidate(BASE), Ok(None));
    }

    #[test]
    fn manifest_status_is_network_error() {
        let http = ScriptedHttp::new();
        assert_eq!(fetcher(&http).resolve_candidate(BASE), Err(NetworkError::Status(404)));

        http.set(&format!("{BASE}/latest.txt"), Reply::Fail(NetworkError::Timeout(30_000)));
        assert_eq!(fetcher(&http).resolve_candidate(BASE), Err(NetworkError::Timeout(30_000)));
    }

    #[test]
    fn download_streams_in_bounded_chunks() {
        let image: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let http = ScriptedHttp::new().with(&format!("{BASE}/c6-co0012.bin"), Reply::ok(image.clone()));
        let mut sink = VecSink::default();

        let done = fetcher(&http).download(BASE, "c6-co0012.bin", &mut sink).unwrap();
        assert_eq!(done.received, 5000);
        assert_eq!(sink.declared, Some(Some(5000)));
        assert_eq!(sink.bytes, image);
        assert!(sink.chunks.iter().all(|n| *n <= CHUNK_SIZE));
    }

    #[test]
    fn short_body_is_length_mismatch() {
        let http = ScriptedHttp::new().with(
            &format!("{BASE}/c6-co0012.bin"),
            Reply::Truncated {
                declared: 4096,
                body: vec![0xE9; 1000],
            },
        );
        let err = fetcher(&http)
            .download(BASE, "c6-co0012.bin", &mut VecSink::default())
            .unwrap_err();
        assert_eq!(
            err,
            UpdateError::Integrity(IntegrityError::LengthMismatch {
                declared: 4096,
                received: 1000
            })
        );
    }

    #[test]
    fn empty_body_is_integrity_error() {
        let http = ScriptedHttp::new().with(&format!("{BASE}/c6-co0012.bin"), Reply::undeclared(Vec::new()));
        let err = fetcher(&http)
            .download(BASE, "c6-co0012.bin", &mut VecSink::default())
            .unwrap_err();
        assert_eq!(err, UpdateError::Integrity(IntegrityError::Empty));
    }

    #[test]
    fn timeout_before_first_byte_is_empty_image() {
        let http = ScriptedHttp::new().with(
            &format!("{BASE}/c6-co0012.bin"),
            Reply::TimeoutAfter {
                body: vec![0xE9; 2048],
                after: 0,
            },
        );
        let mut sink = VecSink::default();
        let err = fetcher(&http).download(BASE, "c6-co0012.bin", &mut sink).unwrap_err();
        assert_eq!(err, UpdateError::Integrity(IntegrityError::Empty));
        assert!(sink.bytes.is_empty());
    }

    #[test]
    fn timeout_mid_body_stays_a_network_error() {
        let http = ScriptedHttp::new().with(
            &format!("{BASE}/c6-co0012.bin"),
            Reply::TimeoutAfter {
                body: vec![0xE9; 2048],
                after: 1000,
            },
        );
        let err = fetcher(&http)
            .download(BASE, "c6-co0012.bin", &mut VecSink::default())
            .unwrap_err();
        assert!(matches!(err, UpdateError::Network(NetworkError::Timeout(_))));
    }
}
