// Firmware version identifiers and the update decision

use std::cmp::Ordering;
use std::fmt;

use crate::error::ParseError;

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Build number baked in by build.rs (env or scripts/build-number.txt)
pub const OTA_BUILD: Option<&str> = option_env!("OTA_BUILD");

pub const DEFAULT_FILE_PREFIX: &str = "c6-co";
pub const DEFAULT_FILE_EXT: &str = ".bin";

/// Monotonic build number carried in firmware filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionNumber(pub u32);

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Newer,
    SameOrOlder,
}

/// `<prefix><digits><ext>`, e.g. `c6-co0012.bin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenamePattern {
    pub prefix: String,
    pub ext: String,
}

impl Default for FilenamePattern {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_PREFIX, DEFAULT_FILE_EXT)
    }
}

impl FilenamePattern {
    pub fn new(prefix: &str, ext: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ext: ext.to_string(),
        }
    }

    /// Extract the build number. Leading path components are ignored.
    pub fn parse(&self, filename: &str) -> Result<VersionNumber, ParseError> {
        let err = || ParseError {
            input: filename.to_string(),
            expected: format!("{}<digits>{}", self.prefix, self.ext),
        };

        let name = filename.trim();
        let name = name.rsplit('/').next().ok_or_else(err)?;
        let stem = name.strip_suffix(self.ext.as_str()).ok_or_else(err)?;
        let digits = stem.strip_prefix(self.prefix.as_str()).ok_or_else(err)?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        digits.parse::<u32>().map(VersionNumber).map_err(|_| err())
    }

    /// Inverse of `parse`, zero-padded to four digits.
    pub fn filename(&self, version: VersionNumber) -> String {
        format!("{}{}{}", self.prefix, version, self.ext)
    }
}

/// `Newer` only when the candidate is strictly greater.
pub fn compare(current: VersionNumber, candidate: VersionNumber) -> Comparison {
    match candidate.cmp(&current) {
        Ordering::Greater => Comparison::Newer,
        Ordering::Equal | Ordering::Less => Comparison::SameOrOlder,
    }
}

/// Build number of the running image. Without one every valid candidate is newer.
pub fn current_build() -> VersionNumber {
    resolve_build(OTA_BUILD, CARGO_VERSION)
}

/// Build number from an `OTA_BUILD` value, else from `+<build>` in the package version.
pub fn resolve_build(build: Option<&str>, package_version: &str) -> VersionNumber {
    if let Some(build) = build {
        return parse_build_suffix(build).unwrap_or_default();
    }
    match package_version.split_once('+') {
        Some((_, build)) => parse_build_suffix(build).unwrap_or_default(),
        None => VersionNumber(0),
    }
}

// First run of ASCII digits, e.g. "b0012" -> 12
fn parse_build_suffix(text: &str) -> Option<VersionNumber> {
    let digits: String = text
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok().map(VersionNumber)
}

// Version string reported in telemetry and discovery
pub fn firmware_version() -> String {
    match OTA_BUILD {
        Some(build) => format!("{}+{}", CARGO_VERSION, build.trim()),
        None => format!("{}+{}", CARGO_VERSION, current_build()),
    }
}
