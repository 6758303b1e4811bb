//! Raw ELD frame codec.
//!
//! Vehicle sample frames (device → host), big-endian:
//!
//! ```text
//! 0x7E | type | speed_mph*10 (u16) | rpm (u16) | fuel % (u8) | odometer mi (u32) | duty (u8) | checksum | 0x7F
//! ```
//!
//! Command frames (host → device):
//!
//! ```text
//! 0x7E | opcode | len (u8) | ascii payload | checksum | 0x7F
//! ```
//!
//! The checksum is the sum of every preceding byte, modulo 256.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map};
use thiserror::Error;

use crate::record::{DutyStatus, TelemetryRecord};

/// Frame start flag.
pub const START_FLAG: u8 = 0x7E;
/// Frame end flag.
pub const END_FLAG: u8 = 0x7F;
/// Frame type of a periodic vehicle sample.
pub const VEHICLE_SAMPLE: u8 = 0x01;
/// Total length of a vehicle sample frame.
pub const VEHICLE_FRAME_LEN: usize = 14;

/// Host → device command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Authenticate with `<imei>,<passcode>`.
    Authenticate = 0x10,
    /// Query history with `<kind>,<start>,<end>`.
    QueryHistory = 0x20,
}

impl Opcode {
    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::Authenticate),
            0x20 => Some(Self::QueryHistory),
            _ => None,
        }
    }
}

/// Frame decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Wrong length for the frame type.
    #[error("frame length {actual} does not match expected {expected}")]
    Length {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },
    /// Missing start or end flag.
    #[error("frame is not delimited by 0x7E/0x7F")]
    Delimiters,
    /// Checksum byte does not match the content.
    #[error("checksum mismatch: frame says {found:#04x}, computed {computed:#04x}")]
    Checksum {
        /// Checksum carried by the frame.
        found: u8,
        /// Checksum computed over the frame.
        computed: u8,
    },
    /// Unknown frame type or opcode.
    #[error("unsupported frame type {0:#04x}")]
    UnsupportedType(u8),
    /// Command payload is not valid text.
    #[error("command payload is not valid UTF-8")]
    Payload,
}

/// A decoded periodic vehicle sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleSample {
    /// Frame type byte.
    pub frame_type: u8,
    /// Road speed in mph.
    pub speed_mph: f64,
    /// Engine RPM.
    pub rpm: u16,
    /// Fuel level in percent.
    pub fuel_level: u8,
    /// Odometer in miles.
    pub odometer_miles: u32,
    /// Raw duty status code.
    pub duty_status: u8,
}

/// Sum of `bytes` modulo 256.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn check_delimited(frame: &[u8]) -> Result<(), FrameError> {
    if frame.first() != Some(&START_FLAG) || frame.last() != Some(&END_FLAG) {
        return Err(FrameError::Delimiters);
    }
    let body_end = frame.len() - 2;
    let computed = checksum(&frame[..body_end]);
    let found = frame[body_end];
    if computed != found {
        return Err(FrameError::Checksum { found, computed });
    }
    Ok(())
}

impl VehicleSample {
    /// Decode a vehicle sample frame.
    ///
    /// # Errors
    ///
    /// Returns an error for bad length, delimiters, checksum or type.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != VEHICLE_FRAME_LEN {
            return Err(FrameError::Length {
                expected: VEHICLE_FRAME_LEN,
                actual: frame.len(),
            });
        }
        check_delimited(frame)?;
        if frame[1] != VEHICLE_SAMPLE {
            return Err(FrameError::UnsupportedType(frame[1]));
        }

        Ok(Self {
            frame_type: frame[1],
            speed_mph: f64::from(u16::from_be_bytes([frame[2], frame[3]])) / 10.0,
            rpm: u16::from_be_bytes([frame[4], frame[5]]),
            fuel_level: frame[6],
            odometer_miles: u32::from_be_bytes([frame[7], frame[8], frame[9], frame[10]]),
            duty_status: frame[11],
        })
    }

    /// Encode this sample as a frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Speeds are carried in tenths of a mph and saturate at the field width.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = (self.speed_mph * 10.0).round().clamp(0.0, f64::from(u16::MAX)) as u16;

        let mut frame = Vec::with_capacity(VEHICLE_FRAME_LEN);
        frame.extend_from_slice(&[START_FLAG, self.frame_type]);
        frame.extend_from_slice(&speed.to_be_bytes());
        frame.extend_from_slice(&self.rpm.to_be_bytes());
        frame.push(self.fuel_level);
        frame.extend_from_slice(&self.odometer_miles.to_be_bytes());
        frame.push(self.duty_status);
        frame.push(checksum(&frame));
        frame.push(END_FLAG);
        frame
    }

    /// Turn the sample into a timeline record.
    ///
    /// Frames carry no clock, so the receipt time doubles as the record's
    /// generic timestamp (microsecond precision keeps consecutive frames
    /// distinct).
    #[must_use]
    pub fn into_record(self, device_id: Option<String>, received_at: DateTime<Utc>) -> TelemetryRecord {
        let mut payload = Map::new();
        payload.insert("speedMph".into(), json!(self.speed_mph));
        payload.insert("rpm".into(), json!(self.rpm));
        payload.insert("fuelLevel".into(), json!(self.fuel_level));
        payload.insert("odometerMiles".into(), json!(self.odometer_miles));
        if DutyStatus::from_code(self.duty_status).is_some() {
            payload.insert("dutyStatus".into(), json!(self.duty_status));
        }

        TelemetryRecord {
            device_id,
            timestamp: Some(received_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
            received_at: Some(received_at),
            event_type: Some(i64::from(self.frame_type)),
            payload,
            ..TelemetryRecord::default()
        }
    }
}

/// A host → device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// What to do.
    pub opcode: Opcode,
    /// ASCII arguments.
    pub payload: String,
}

impl Command {
    /// Authentication command.
    #[must_use]
    pub fn authenticate(imei: &str, passcode: &str) -> Self {
        Self {
            opcode: Opcode::Authenticate,
            payload: format!("{imei},{passcode}"),
        }
    }

    /// History query command.
    #[must_use]
    pub fn query_history(kind_code: u8, formatted_start: &str, formatted_end: &str) -> Self {
        Self {
            opcode: Opcode::QueryHistory,
            payload: format!("{kind_code},{formatted_start},{formatted_end}"),
        }
    }

    /// Encode as a frame. Payloads longer than 255 bytes are truncated.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let bytes = self.payload.as_bytes();
        let len = bytes.len().min(usize::from(u8::MAX));

        let mut frame = Vec::with_capacity(len + 5);
        frame.push(START_FLAG);
        frame.push(self.opcode as u8);
        #[allow(clippy::cast_possible_truncation)]
        frame.push(len as u8);
        frame.extend_from_slice(&bytes[..len]);
        frame.push(checksum(&frame));
        frame.push(END_FLAG);
        frame
    }

    /// Decode a command frame.
    ///
    /// # Errors
    ///
    /// Returns an error for bad length, delimiters, checksum, opcode or text.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < 5 {
            return Err(FrameError::Length {
                expected: 5,
                actual: frame.len(),
            });
        }
        let expected = usize::from(frame[2]) + 5;
        if frame.len() != expected {
            return Err(FrameError::Length {
                expected,
                actual: frame.len(),
            });
        }
        check_delimited(frame)?;
        let opcode = Opcode::from_byte(frame[1]).ok_or(FrameError::UnsupportedType(frame[1]))?;
        let payload = std::str::from_utf8(&frame[3..expected - 2])
            .map_err(|_| FrameError::Payload)?
            .to_string();
        Ok(Self { opcode, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VehicleSample {
        VehicleSample {
            frame_type: VEHICLE_SAMPLE,
            speed_mph: 55.5,
            rpm: 1620,
            fuel_level: 74,
            odometer_miles: 125_010,
            duty_status: DutyStatus::Driving.code(),
        }
    }

    #[test]
    fn test_vehicle_frame_layout() {
        let frame = sample().encode();
        assert_eq!(frame.len(), VEHICLE_FRAME_LEN);
        assert_eq!(frame[0], START_FLAG);
        assert_eq!(frame[1], VEHICLE_SAMPLE);
        assert_eq!(&frame[2..4], &555u16.to_be_bytes());
        assert_eq!(&frame[4..6], &1620u16.to_be_bytes());
        assert_eq!(frame[6], 74);
        assert_eq!(&frame[7..11], &125_010u32.to_be_bytes());
        assert_eq!(frame[11], DutyStatus::Driving.code());
        assert_eq!(frame[12], checksum(&frame[..12]));
        assert_eq!(frame[13], END_FLAG);
        assert_eq!(VehicleSample::decode(&frame).unwrap(), sample());
    }

    #[test]
    fn test_decode_rejects_corrupted_checksum() {
        let mut frame = sample().encode();
        frame[5] ^= 0xFF;
        assert!(matches!(
            VehicleSample::decode(&frame),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_framing() {
        let mut frame = sample().encode();
        frame[13] = 0x00;
        assert_eq!(VehicleSample::decode(&frame), Err(FrameError::Delimiters));
        assert!(matches!(
            VehicleSample::decode(&frame[..10]),
            Err(FrameError::Length { actual: 10, .. })
        ));
    }

    #[test]
    fn test_sample_becomes_record() {
        let received_at = Utc::now();
        let record = sample().into_record(Some("PT30-ELD-001".into()), received_at);

        assert_eq!(record.event_type, Some(1));
        assert_eq!(record.received_at, Some(received_at));
        assert_eq!(record.duty_status(), Some(DutyStatus::Driving));
        assert_eq!(record.payload["rpm"], json!(1620));
        assert_eq!(record.resolved_time().timestamp_micros(), received_at.timestamp_micros());
    }

    #[test]
    fn test_command_frames() {
        let cmd = Command::query_history(0, "250115080000", "250115090000");
        let frame = cmd.encode();
        assert_eq!(frame[1], Opcode::QueryHistory as u8);
        assert_eq!(usize::from(frame[2]), "0,250115080000,250115090000".len());
        assert_eq!(Command::decode(&frame).unwrap(), cmd);

        let auth = Command::authenticate("356938035643809", "0000");
        assert_eq!(Command::decode(&auth.encode()).unwrap(), auth);
    }
}
