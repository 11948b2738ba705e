// Wire formats of the MH-Z19B (UART) and SHT31 (I2C) sensors

use thiserror::Error;

pub const MHZ19_FRAME_LEN: usize = 9;

const MHZ19_START: u8 = 0xFF;
const MHZ19_SENSOR: u8 = 0x01;
const CMD_READ_CO2: u8 = 0x86;
const CMD_ZERO_POINT: u8 = 0x87;
const CMD_ABC: u8 = 0x79;
const ABC_ON: u8 = 0xA0;
const ABC_OFF: u8 = 0x00;

pub const SHT31_ADDR: u8 = 0x44;
/// Single shot, high repeatability, no clock stretching.
pub const SHT31_MEASURE: [u8; 2] = [0x24, 0x00];
pub const SHT31_FRAME_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("short frame: {0} bytes")]
    Short(usize),

    #[error("unexpected header {0:#04x} {1:#04x}")]
    Header(u8, u8),

    #[error("checksum mismatch: expected {expected:#04x}, got {found:#04x}")]
    Checksum { expected: u8, found: u8 },
}

/// Two's complement of the sum of bytes 1..=7.
pub fn mhz19_checksum(frame: &[u8; MHZ19_FRAME_LEN]) -> u8 {
    let sum = frame[1..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFFu8.wrapping_sub(sum).wrapping_add(1)
}

fn mhz19_command(cmd: u8, arg: u8) -> [u8; MHZ19_FRAME_LEN] {
    let mut frame = [MHZ19_START, MHZ19_SENSOR, cmd, arg, 0, 0, 0, 0, 0];
    frame[8] = mhz19_checksum(&frame);
    frame
}

pub fn mhz19_read_command() -> [u8; MHZ19_FRAME_LEN] {
    mhz19_command(CMD_READ_CO2, 0)
}

pub fn mhz19_zero_command() -> [u8; MHZ19_FRAME_LEN] {
    mhz19_command(CMD_ZERO_POINT, 0)
}

pub fn mhz19_abc_command(enabled: bool) -> [u8; MHZ19_FRAME_LEN] {
    mhz19_command(CMD_ABC, if enabled { ABC_ON } else { ABC_OFF })
}

/// Concentration in ppm from a read-CO2 response.
pub fn mhz19_parse_response(bytes: &[u8]) -> Result<u16, FrameError> {
    let frame: &[u8; MHZ19_FRAME_LEN] = bytes
        .get(..MHZ19_FRAME_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(FrameError::Short(bytes.len()))?;
    if frame[0] != MHZ19_START || frame[1] != CMD_READ_CO2 {
        return Err(FrameError::Header(frame[0], frame[1]));
    }
    let expected = mhz19_checksum(frame);
    if frame[8] != expected {
        return Err(FrameError::Checksum {
            expected,
            found: frame[8],
        });
    }
    Ok(u16::from_be_bytes([frame[2], frame[3]]))
}

/// CRC-8, polynomial 0x31, init 0xFF.
pub fn sht31_crc(data: &[u8]) -> u8 {
    let mut crc = 0xFFu8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

/// Temperature (°C) and relative humidity (%) from a measurement frame.
pub fn sht31_decode(frame: &[u8]) -> Result<(f32, f32), FrameError> {
    if frame.len() < SHT31_FRAME_LEN {
        return Err(FrameError::Short(frame.len()));
    }
    for word in [&frame[0..3], &frame[3..6]] {
        let expected = sht31_crc(&word[..2]);
        if word[2] != expected {
            return Err(FrameError::Checksum {
                expected,
                found: word[2],
            });
        }
    }
    let raw_t = u16::from_be_bytes([frame[0], frame[1]]) as f32;
    let raw_rh = u16::from_be_bytes([frame[3], frame[4]]) as f32;
    let temperature = -45.0 + 175.0 * raw_t / 65535.0;
    let humidity = 100.0 * raw_rh / 65535.0;
    Ok((temperature, humidity))
}
