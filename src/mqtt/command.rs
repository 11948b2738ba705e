// Remote command grammar

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ZeroCalibrate,
    SetAbc(bool),
    /// Always within 0..=100
    SetBrightness(u8),
    Reboot,
}

impl Command {
    /// Parse a raw `<prefix>/cmd` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        String::from_utf8_lossy(payload).parse()
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }

        match text.as_str() {
            "zero" | "zero_calibrate" => return Ok(Command::ZeroCalibrate),
            "reboot" => return Ok(Command::Reboot),
            _ => {}
        }

        if let Some(value) = argument(&text, "abc") {
            return parse_on_off(value)
                .map(Command::SetAbc)
                .ok_or_else(|| invalid("abc", value));
        }
        if let Some(value) = argument(&text, "brightness") {
            return parse_percent(value)
                .map(Command::SetBrightness)
                .ok_or_else(|| invalid("brightness", value));
        }

        Err(ProtocolError::Unknown(text))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ZeroCalibrate => write!(f, "zero_calibrate"),
            Command::SetAbc(on) => write!(f, "abc:{}", if *on { "on" } else { "off" }),
            Command::SetBrightness(pct) => write!(f, "brightness:{}", pct),
            Command::Reboot => write!(f, "reboot"),
        }
    }
}

// "<name>:<v>" or "<name>=<v>"
fn argument<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(name)?;
    rest.strip_prefix(':')
        .or_else(|| rest.strip_prefix('='))
        .map(str::trim)
}

fn parse_on_off(value: &str) -> Option<bool> {
    match value {
        "1" | "on" | "true" => Some(true),
        "0" | "off" | "false" => Some(false),
        _ => None,
    }
}

// Non-negative integer, clamped to 100
fn parse_percent(value: &str) -> Option<u8> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let raw = value.parse::<u64>().unwrap_or(u64::MAX);
    Some(raw.min(100) as u8)
}

fn invalid(command: &'static str, value: &str) -> ProtocolError {
    ProtocolError::InvalidArgument {
        command,
        value: value.to_string(),
    }
}
