//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Vehicle bus protocols selectable on an ELM327
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

/// Negotiation order used when none is configured. Order is significant.
pub const DEFAULT_CANDIDATES: [ObdProtocol; 3] = [
    ObdProtocol::Auto,
    ObdProtocol::Iso15765_4Can11bit500,
    ObdProtocol::Iso15765_4Can11bit250,
];

impl ObdProtocol {
    /// Protocol number as used by `ATSPn` and reported by `ATDPN`
    pub fn number(&self) -> char {
        match self {
            ObdProtocol::Auto => '0',
            ObdProtocol::J1850Pwm => '1',
            ObdProtocol::J1850Vpw => '2',
            ObdProtocol::Iso9141_2 => '3',
            ObdProtocol::Iso14230_4Kwp => '4',
            ObdProtocol::Iso14230_4KwpFast => '5',
            ObdProtocol::Iso15765_4Can11bit500 => '6',
            ObdProtocol::Iso15765_4Can29bit500 => '7',
            ObdProtocol::Iso15765_4Can11bit250 => '8',
            ObdProtocol::Iso15765_4Can29bit250 => '9',
        }
    }

    /// Look up a protocol by its ELM327 number
    pub fn from_number(number: char) -> Option<Self> {
        let protocol = match number {
            '0' => ObdProtocol::Auto,
            '1' => ObdProtocol::J1850Pwm,
            '2' => ObdProtocol::J1850Vpw,
            '3' => ObdProtocol::Iso9141_2,
            '4' => ObdProtocol::Iso14230_4Kwp,
            '5' => ObdProtocol::Iso14230_4KwpFast,
            '6' => ObdProtocol::Iso15765_4Can11bit500,
            '7' => ObdProtocol::Iso15765_4Can29bit500,
            '8' => ObdProtocol::Iso15765_4Can11bit250,
            '9' => ObdProtocol::Iso15765_4Can29bit250,
            _ => return None,
        };
        Some(protocol)
    }

    /// Parse an `ATDPN` reply such as `6` or `A6` (auto-detected 6)
    pub fn from_dpn_reply(reply: &str) -> Option<Self> {
        let code = reply.trim().trim_start_matches(['A', 'a']);
        let mut chars = code.chars();
        match (chars.next(), chars.next()) {
            (Some(number), None) => Self::from_number(number),
            _ => None,
        }
    }

    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{}", self.number())
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObdProtocol::Auto => "automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141_2 => "ISO 9141-2",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 KWP (5 baud init)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 KWP (fast init)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 CAN 11/500",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 CAN 29/500",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 CAN 11/250",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 CAN 29/250",
        };
        f.write_str(name)
    }
}
