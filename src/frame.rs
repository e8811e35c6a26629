//! Fixed 24-byte binary measurement frames, as sent by firmware gateways.
//!
//! ```text
//! ┌────────┬──────────────────────┬────────────────┬────────┐
//! │ Code   │ Values (3 x f32)     │ Timestamp      │ CRC    │
//! │ 2 bytes│ 12 bytes             │ 8 bytes (u64)  │ 2 bytes│
//! └────────┴──────────────────────┴────────────────┴────────┘
//! ```
//!
//! All fields are little-endian. The CRC is CRC-16/XMODEM over the first
//! 22 bytes. Valid frames are rewritten as tagged JSON envelopes so they flow
//! through the same decoder as text payloads.

use crc::{Crc, CRC_16_XMODEM};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub const FRAME_SIZE: usize = 24;

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC_OFFSET: usize = FRAME_SIZE - 2;

/// Measurement type carried in the first two bytes of a frame.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Accel = 0xACC1,
    Gyro = 0x6E50,
    Mag = 0x9A61,
    /// Values are temperature, pressure and altitude.
    Baro = 0xB480,
}

impl FrameKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0xACC1 => Some(FrameKind::Accel),
            0x6E50 => Some(FrameKind::Gyro),
            0x9A61 => Some(FrameKind::Mag),
            0xB480 => Some(FrameKind::Baro),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Envelope tag understood by the decoder.
    pub fn tag(self) -> &'static str {
        match self {
            FrameKind::Accel => "Accel",
            FrameKind::Gyro => "Gyro",
            FrameKind::Mag => "Mag",
            FrameKind::Baro => "Baro",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected {FRAME_SIZE} bytes, got {0}")]
    Length(usize),

    #[error("unknown measurement code {0:#06x}")]
    UnknownCode(u16),

    #[error("CRC mismatch: frame says {expected:#06x}, computed {computed:#06x}")]
    Crc { expected: u16, computed: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub values: [f32; 3],
    /// Device clock, passed through as-is.
    pub timestamp: u64,
}

#[derive(Serialize)]
struct Envelope {
    timestamp: u64,
    measurement: BTreeMap<&'static str, [f32; 3]>,
}

impl Frame {
    pub fn parse(bytes: &[u8]) -> Result<Frame, FrameError> {
        let bytes: &[u8; FRAME_SIZE] = bytes
            .try_into()
            .map_err(|_| FrameError::Length(bytes.len()))?;

        let expected = u16::from_le_bytes([bytes[CRC_OFFSET], bytes[CRC_OFFSET + 1]]);
        let computed = XMODEM.checksum(&bytes[..CRC_OFFSET]);
        if expected != computed {
            return Err(FrameError::Crc { expected, computed });
        }

        let code = u16::from_le_bytes([bytes[0], bytes[1]]);
        let kind = FrameKind::from_code(code).ok_or(FrameError::UnknownCode(code))?;

        let mut values = [0f32; 3];
        for (i, value) in values.iter_mut().enumerate() {
            let at = 2 + i * 4;
            *value = f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[14..CRC_OFFSET]);

        Ok(Frame {
            kind,
            values,
            timestamp: u64::from_le_bytes(ts),
        })
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out[..2].copy_from_slice(&self.kind.code().to_le_bytes());
        for (i, value) in self.values.iter().enumerate() {
            let at = 2 + i * 4;
            out[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[14..CRC_OFFSET].copy_from_slice(&self.timestamp.to_le_bytes());
        let crc = XMODEM.checksum(&out[..CRC_OFFSET]);
        out[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// `{"timestamp":…,"measurement":{"Accel":[x,y,z]}}`
    pub fn to_envelope(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            timestamp: self.timestamp,
            measurement: BTreeMap::from([(self.kind.tag(), self.values)]),
        })
    }
}

/// True when `bytes` opens with a known measurement code. Text payloads
/// never do: every code is either invalid UTF-8 or not valid JSON.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && FrameKind::from_code(u16::from_le_bytes([bytes[0], bytes[1]])).is_some()
}

/// Split a datagram of back-to-back frames into a JSON list of envelopes.
///
/// Bad frames are logged and skipped. `None` when no frame survives.
pub fn frames_to_payload(bytes: &[u8]) -> Option<String> {
    if bytes.len() % FRAME_SIZE != 0 {
        log::warn!("[FRAME] Skipping datagram: {}", FrameError::Length(bytes.len()));
        return None;
    }

    let envelopes: Vec<String> = bytes
        .chunks_exact(FRAME_SIZE)
        .filter_map(|chunk| match Frame::parse(chunk) {
            Ok(frame) => frame
                .to_envelope()
                .inspect_err(|e| log::warn!("[FRAME] Failed to re-encode frame: {e}"))
                .ok(),
            Err(e) => {
                log::warn!("[FRAME] Received invalid measurement: {e}");
                None
            }
        })
        .collect();

    (!envelopes.is_empty()).then(|| format!("[{}]", envelopes.join(",")))
}
