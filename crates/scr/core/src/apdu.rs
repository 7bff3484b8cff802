//! Command APDU classification and status words

use std::fmt;

use derive_more::Display;

use crate::error::{ProtocolError, Result};

/// Size of the command header (CLA INS P1 P2)
pub const HEADER_LEN: usize = 4;
/// INS of GET RESPONSE
pub const INS_GET_RESPONSE: u8 = 0xC0;
/// INS of ENVELOPE
pub const INS_ENVELOPE: u8 = 0xC2;

/// ISO/IEC 7816-4 command case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ApduCase {
    /// No command data, no response data
    #[display("CASE1")]
    Case1,
    /// Short Le
    #[display("CASE2S")]
    Case2Short,
    /// Short Lc
    #[display("CASE3S")]
    Case3Short,
    /// Short Lc and Le
    #[display("CASE4S")]
    Case4Short,
    /// Extended Le
    #[display("CASE2E")]
    Case2Extended,
    /// Extended Lc
    #[display("CASE3E")]
    Case3Extended,
    /// Extended Lc and Le
    #[display("CASE4E")]
    Case4Extended,
}

impl ApduCase {
    /// Whether the command carries data
    pub const fn has_command_data(self) -> bool {
        matches!(
            self,
            Self::Case3Short | Self::Case4Short | Self::Case3Extended | Self::Case4Extended
        )
    }

    /// Whether the command expects response data
    pub const fn expects_response_data(self) -> bool {
        matches!(
            self,
            Self::Case2Short | Self::Case4Short | Self::Case2Extended | Self::Case4Extended
        )
    }
}

/// Result of classifying a command APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Command case
    pub case: ApduCase,
    /// Length of the command data
    pub lc: usize,
    /// Expected response length (0 when none, 256/65536 for a zero Le)
    pub le: usize,
    /// Offset of the command data within the APDU
    pub data_offset: usize,
}

/// Classify a command APDU by its length and length fields
pub fn classify(apdu: &[u8]) -> Result<Classification> {
    let len = apdu.len();
    if len < HEADER_LEN {
        return Err(ProtocolError::InvalidApdu("shorter than header"));
    }
    let short = |case, lc, le| Classification {
        case,
        lc,
        le,
        data_offset: HEADER_LEN + 1,
    };
    if len == HEADER_LEN {
        return Ok(short(ApduCase::Case1, 0, 0));
    }

    let p3 = usize::from(apdu[HEADER_LEN]);
    if len == HEADER_LEN + 1 {
        return Ok(if p3 == 0 {
            short(ApduCase::Case1, 0, 0)
        } else {
            short(ApduCase::Case2Short, 0, p3)
        });
    }

    if p3 != 0 {
        if len == HEADER_LEN + 1 + p3 {
            return Ok(short(ApduCase::Case3Short, p3, 0));
        }
        if len == HEADER_LEN + 2 + p3 {
            let le = match apdu[len - 1] {
                0 => 256,
                n => usize::from(n),
            };
            return Ok(short(ApduCase::Case4Short, p3, le));
        }
        return Err(ProtocolError::InvalidApdu("length does not match Lc"));
    }

    // Extended forms: a zero byte followed by a two byte length
    let extended = |case, lc, le| Classification {
        case,
        lc,
        le,
        data_offset: HEADER_LEN + 3,
    };
    let word = |at: usize| (usize::from(apdu[at]) << 8) | usize::from(apdu[at + 1]);
    if len == HEADER_LEN + 3 {
        let le = match word(HEADER_LEN + 1) {
            0 => 65536,
            n => n,
        };
        return Ok(extended(ApduCase::Case2Extended, 0, le));
    }
    if len < HEADER_LEN + 3 {
        return Err(ProtocolError::InvalidApdu("truncated extended length"));
    }
    let lc = word(HEADER_LEN + 1);
    if lc == 0 {
        return Err(ProtocolError::InvalidApdu("zero extended Lc"));
    }
    if len == HEADER_LEN + 3 + lc {
        return Ok(extended(ApduCase::Case3Extended, lc, 0));
    }
    if len == HEADER_LEN + 5 + lc {
        let le = match word(len - 2) {
            0 => 65536,
            n => n,
        };
        return Ok(extended(ApduCase::Case4Extended, lc, le));
    }
    Err(ProtocolError::InvalidApdu("length does not match extended Lc"))
}

/// Status Word (SW1-SW2) ending every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Trailing status word of a response
    pub fn from_response(response: &[u8]) -> Option<Self> {
        match response {
            [.., sw1, sw2] => Some(Self::new(*sw1, *sw2)),
            _ => None,
        }
    }

    /// Normal completion (90 00)
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// More data available (61 XX); XX bytes can be fetched with GET RESPONSE
    pub const fn remaining_bytes(&self) -> Option<u8> {
        if self.sw1 == 0x61 { Some(self.sw2) } else { None }
    }

    /// Wrong Le (6C XX); XX is the exact length to use
    pub const fn corrected_le(&self) -> Option<u8> {
        if self.sw1 == 0x6C { Some(self.sw2) } else { None }
    }

    /// Whether SW1 is a valid status byte (6X except 60, or 9X)
    pub const fn is_sw1(byte: u8) -> bool {
        (byte & 0xF0 == 0x60 && byte != 0x60) || byte & 0xF0 == 0x90
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}
