//! T=1 block layout
//!
//! ```text
//! | NAD | PCB | LEN | INF (0..=254) | LRC (1) or CRC (2) |
//! ```
//!
//! The CRC is transmitted most significant byte first and covers the
//! prologue and the information field, as does the LRC.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::Display;

use crate::error::{ProtocolError, Result};

/// Size of NAD, PCB and LEN
pub const PROLOGUE_LEN: usize = 3;
/// Largest information field
pub const MAX_INF_LEN: usize = 254;

const PCB_TYPE_MASK: u8 = 0xC0;
const PCB_R_BLOCK: u8 = 0x80;
const PCB_S_BLOCK: u8 = 0xC0;
const I_SEQUENCE_BIT: u8 = 0x40;
const I_CHAINING_BIT: u8 = 0x20;
const R_SEQUENCE_BIT: u8 = 0x10;
const R_ERROR_MASK: u8 = 0x0F;
const S_RESPONSE_BIT: u8 = 0x20;
const S_TYPE_MASK: u8 = 0x1F;

/// Error detection code appended to every block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EpilogueKind {
    /// One byte XOR
    #[display("LRC")]
    Lrc,
    /// Two byte CRC
    #[display("CRC")]
    Crc,
}

impl EpilogueKind {
    /// Epilogue length in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::Lrc => 1,
            Self::Crc => 2,
        }
    }

    /// Epilogue for `bytes`
    pub fn compute(self, bytes: &[u8]) -> EpilogueValue {
        match self {
            Self::Lrc => EpilogueValue::Lrc(lrc(bytes)),
            Self::Crc => EpilogueValue::Crc(crc16(bytes)),
        }
    }
}

/// Computed epilogue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpilogueValue {
    /// LRC byte
    Lrc(u8),
    /// CRC word
    Crc(u16),
}

impl EpilogueValue {
    fn put(self, out: &mut BytesMut) {
        match self {
            Self::Lrc(v) => out.put_u8(v),
            Self::Crc(v) => out.put_u16(v),
        }
    }
}

/// Longitudinal redundancy check
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// CRC-16 used by T=1 (CCITT polynomial 0x1021, zero preset)
///
/// This is the CRC-16/XMODEM variant: preset 0, no reflection, no final XOR.
/// The high byte is shifted out before each input byte is folded in.
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &b| {
        let mut crc = crc.rotate_left(8) ^ u16::from(b);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
        crc
    })
}

/// Error code carried by an R-block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RCode {
    /// Acknowledgement
    #[display("ok")]
    NoError,
    /// Checksum or parity error
    #[display("EDC error")]
    EdcError,
    /// Any other error
    #[display("other error")]
    OtherError,
}

impl RCode {
    const fn bits(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::EdcError => 1,
            Self::OtherError => 2,
        }
    }
}

/// Supervisory function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SType {
    /// Resynchronisation
    #[display("RESYNCH")]
    Resynch,
    /// Information field size
    #[display("IFS")]
    Ifs,
    /// Chain abortion
    #[display("ABORT")]
    Abort,
    /// Waiting time extension
    #[display("WTX")]
    Wtx,
}

impl SType {
    const fn bits(self) -> u8 {
        match self {
            Self::Resynch => 0,
            Self::Ifs => 1,
            Self::Abort => 2,
            Self::Wtx => 3,
        }
    }
}

/// Decoded PCB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Information block
    Information {
        /// N(S)
        sequence: u8,
        /// More data follows in another block
        chaining: bool,
    },
    /// Receive-ready block
    Receive {
        /// N(R), the sequence number expected next
        sequence: u8,
        /// Error indication
        code: RCode,
    },
    /// Supervisory block
    Supervisory {
        /// Function
        kind: SType,
        /// Response rather than request
        response: bool,
    },
}

/// One T=1 block
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    /// Node address
    pub nad: u8,
    /// Protocol control byte
    pub pcb: u8,
    /// Information field
    pub data: Bytes,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("nad", &format!("{:#04x}", self.nad))
            .field("pcb", &format!("{:#04x}", self.pcb))
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

impl Block {
    /// I-block with send sequence `sequence`
    pub fn information(nad: u8, sequence: u8, chaining: bool, data: Bytes) -> Self {
        let mut pcb = 0;
        if sequence & 1 != 0 {
            pcb |= I_SEQUENCE_BIT;
        }
        if chaining {
            pcb |= I_CHAINING_BIT;
        }
        Self { nad, pcb, data }
    }

    /// R-block expecting `sequence` next
    pub fn receive_ready(nad: u8, sequence: u8, code: RCode) -> Self {
        let mut pcb = PCB_R_BLOCK | code.bits();
        if sequence & 1 != 0 {
            pcb |= R_SEQUENCE_BIT;
        }
        Self {
            nad,
            pcb,
            data: Bytes::new(),
        }
    }

    /// S-block
    pub fn supervisory(nad: u8, kind: SType, response: bool, data: Bytes) -> Self {
        let mut pcb = PCB_S_BLOCK | kind.bits();
        if response {
            pcb |= S_RESPONSE_BIT;
        }
        Self { nad, pcb, data }
    }

    /// The response matching this S request, carrying the same data
    pub fn response_to(&self) -> Self {
        Self {
            nad: self.nad,
            pcb: self.pcb | S_RESPONSE_BIT,
            data: self.data.clone(),
        }
    }

    /// Decode the PCB
    pub fn kind(&self) -> Result<BlockKind> {
        match self.pcb & PCB_TYPE_MASK {
            PCB_R_BLOCK => {
                let code = match self.pcb & R_ERROR_MASK {
                    0 => RCode::NoError,
                    1 => RCode::EdcError,
                    _ => RCode::OtherError,
                };
                Ok(BlockKind::Receive {
                    sequence: u8::from(self.pcb & R_SEQUENCE_BIT != 0),
                    code,
                })
            }
            PCB_S_BLOCK => {
                let kind = match self.pcb & S_TYPE_MASK {
                    0 => SType::Resynch,
                    1 => SType::Ifs,
                    2 => SType::Abort,
                    3 => SType::Wtx,
                    _ => return Err(ProtocolError::ChecksumError),
                };
                Ok(BlockKind::Supervisory {
                    kind,
                    response: self.pcb & S_RESPONSE_BIT != 0,
                })
            }
            _ => Ok(BlockKind::Information {
                sequence: u8::from(self.pcb & I_SEQUENCE_BIT != 0),
                chaining: self.pcb & I_CHAINING_BIT != 0,
            }),
        }
    }

    /// Serialise with the given epilogue
    pub fn encode(&self, epilogue: EpilogueKind) -> Bytes {
        let mut out = BytesMut::with_capacity(PROLOGUE_LEN + self.data.len() + epilogue.size());
        out.put_u8(self.nad);
        out.put_u8(self.pcb);
        out.put_u8(self.data.len() as u8);
        out.extend_from_slice(&self.data);
        epilogue.compute(&out).put(&mut out);
        out.freeze()
    }

    /// Parse and check a complete frame
    pub fn decode(frame: &[u8], epilogue: EpilogueKind) -> Result<Self> {
        let epi_len = epilogue.size();
        if frame.len() < PROLOGUE_LEN + epi_len {
            return Err(ProtocolError::ChecksumError);
        }
        let len = usize::from(frame[2]);
        if len > MAX_INF_LEN || frame.len() != PROLOGUE_LEN + len + epi_len {
            return Err(ProtocolError::ChecksumError);
        }
        let (body, trailer) = frame.split_at(PROLOGUE_LEN + len);
        let valid = match epilogue.compute(body) {
            EpilogueValue::Lrc(v) => trailer == [v],
            EpilogueValue::Crc(v) => trailer == v.to_be_bytes(),
        };
        if !valid {
            return Err(ProtocolError::ChecksumError);
        }
        Ok(Self {
            nad: frame[0],
            pcb: frame[1],
            data: Bytes::copy_from_slice(&body[PROLOGUE_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_reference_value() {
        // CRC-16/XMODEM check value
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_crc_single_byte_table() {
        // With a zero preset the first byte needs no rotation, so these
        // match a plain shift-and-xor table without the byte swap
        assert_eq!(crc16(&[0x01]), 0x1021);
        assert_eq!(crc16(&[0x41]), 0x58E5);
        assert_eq!(crc16(&[0xC1]), 0xC96D);
        assert_eq!(crc16(&[0xFF]), 0x1EF0);
    }

    #[test]
    fn test_crc_ifs_request_block() {
        let block = Block::supervisory(0, SType::Ifs, false, Bytes::from_static(&[0xFE]));
        let frame = block.encode(EpilogueKind::Crc);
        assert_eq!(&frame[..4], &[0x00, 0xC1, 0x01, 0xFE]);
        assert_eq!(&frame[4..], &[0x2C, 0x27]);
    }

    #[test]
    fn test_pcb_encoding() {
        let i = Block::information(0, 1, true, Bytes::from_static(&[1, 2]));
        assert_eq!(i.pcb, 0x60);
        assert_eq!(
            i.kind().unwrap(),
            BlockKind::Information {
                sequence: 1,
                chaining: true
            }
        );

        let r = Block::receive_ready(0, 1, RCode::EdcError);
        assert_eq!(r.pcb, 0x91);
        assert_eq!(
            r.kind().unwrap(),
            BlockKind::Receive {
                sequence: 1,
                code: RCode::EdcError
            }
        );

        let wtx = Block::supervisory(0, SType::Wtx, false, Bytes::from_static(&[2]));
        assert_eq!(wtx.pcb, 0xC3);
        assert_eq!(wtx.response_to().pcb, 0xE3);
        assert_eq!(Block::supervisory(0, SType::Ifs, false, Bytes::new()).pcb, 0xC1);
    }

    #[test]
    fn test_encode_lrc() {
        let block = Block::information(0, 0, false, Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00]));
        let frame = block.encode(EpilogueKind::Lrc);
        assert_eq!(frame.as_ref(), &[0x00, 0x00, 0x04, 0x00, 0xA4, 0x04, 0x00, 0xA4]);
        assert_eq!(Block::decode(&frame, EpilogueKind::Lrc).unwrap(), block);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let frame = Block::information(0, 0, false, Bytes::from_static(&[0x90, 0x00])).encode(EpilogueKind::Crc);
        let mut bad = frame.to_vec();
        bad[3] ^= 0x01;
        assert_eq!(Block::decode(&bad, EpilogueKind::Crc), Err(ProtocolError::ChecksumError));
        assert_eq!(Block::decode(&frame[..4], EpilogueKind::Crc), Err(ProtocolError::ChecksumError));
    }
}
