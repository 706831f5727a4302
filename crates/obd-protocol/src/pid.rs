//! OBD-II PID Definitions and Decoding
//!
//! Only the PIDs this link actually reads carry a formula. Anything else
//! decodes as its first data byte.

use serde::{Deserialize, Serialize};

/// Mode 01 PIDs with a known width or formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Supported PIDs 01-20 bitmap (0x00), used as the canary request
    SupportedPids = 0x00,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        data_len(self.as_hex())
    }
}

impl From<Pid> for u8 {
    fn from(pid: Pid) -> Self {
        pid.as_hex()
    }
}

/// Number of data bytes that follow the `41 <pid>` header
pub fn data_len(pid: u8) -> usize {
    match pid {
        // Supported-PID bitmaps: 00, 20, 40, 60, 80, A0, C0
        0x00 | 0x20 | 0x40 | 0x60 | 0x80 | 0xA0 | 0xC0 => 4,
        0x0C => 2,
        _ => 1,
    }
}

/// Decode data bytes into the integer metric for `pid`
///
/// Returns `None` when fewer bytes are present than the PID needs.
pub fn decode_value(pid: u8, bytes: &[u8]) -> Option<u32> {
    match pid {
        // RPM: ((A*256)+B)/4, integer division
        0x0C => match bytes {
            [a, b, ..] => Some((u32::from(*a) * 256 + u32::from(*b)) / 4),
            _ => None,
        },
        // Bitmaps: big-endian 32 bits
        0x00 | 0x20 | 0x40 | 0x60 | 0x80 | 0xA0 | 0xC0 => match bytes {
            [a, b, c, d, ..] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        },
        // Speed (km/h) and everything else: A
        _ => bytes.first().map(|a| u32::from(*a)),
    }
}

/// A decoded Mode 01 reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidResponse {
    /// The PID echoed by the adapter
    pub pid: u8,
    /// Timestamp when the response was decoded (Unix ms)
    pub timestamp_ms: u64,
    /// Decoded value
    pub value: u32,
    /// Data bytes following the header, in order
    pub raw_bytes: Vec<u8>,
}

impl PidResponse {
    /// Decode data bytes for `pid`, or `None` if there are too few
    pub fn decode(pid: u8, raw_bytes: Vec<u8>, timestamp_ms: u64) -> Option<Self> {
        let value = decode_value(pid, &raw_bytes)?;
        Some(Self {
            pid,
            timestamp_ms,
            value,
            raw_bytes,
        })
    }
}

/// Current wall-clock time in Unix milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
