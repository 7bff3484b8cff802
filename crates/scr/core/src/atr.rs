//! Answer-To-Reset decoding
//!
//! [`parse_atr`] turns the raw bytes read after a reset into a [`ParsedAtr`].
//! The parser is a pure function: it validates structure and the check byte
//! and records every parameter the card announced, leaving the derivation of
//! working parameters to [`crate::capabilities`].

use bytes::Bytes;
use derive_more::Display;
use tracing::trace;

use crate::error::{AtrError, ProtocolError, Result};

/// Maximum ATR length allowed by ISO/IEC 7816-3
pub const MAX_ATR_LEN: usize = 33;

/// TS for the direct convention
pub const TS_DIRECT: u8 = 0x3B;
/// TS for the inverse convention
pub const TS_INVERSE: u8 = 0x3F;
/// Inverse TS as sampled by a UART still in direct mode
pub const TS_INVERSE_AS_DIRECT: u8 = 0x03;

/// Default information field size of the card
pub const DEFAULT_IFSC: u8 = 32;
/// Default character waiting integer
pub const DEFAULT_CWI: u8 = 13;
/// Default block waiting integer
pub const DEFAULT_BWI: u8 = 4;
/// Default waiting time integer
pub const DEFAULT_WI: u8 = 10;

const TA_PRESENT: u8 = 0x10;
const TB_PRESENT: u8 = 0x20;
const TC_PRESENT: u8 = 0x40;
const TD_PRESENT: u8 = 0x80;

/// Logic level encoding announced by TS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BitConvention {
    /// High level is logic one, LSB first
    #[display("direct")]
    Direct,
    /// Low level is logic one, MSB first
    #[display("inverse")]
    Inverse,
}

impl BitConvention {
    /// Determine the convention from the first character
    ///
    /// Accepts the inverse TS both decoded (`3F`) and as sampled in direct
    /// mode (`03`).
    pub const fn from_initial(ts: u8) -> Option<Self> {
        match ts {
            TS_DIRECT => Some(Self::Direct),
            TS_INVERSE | TS_INVERSE_AS_DIRECT => Some(Self::Inverse),
            _ => None,
        }
    }

    /// Map characters between their line form and their value in place
    ///
    /// The inverse mapping is an involution, so the same call encodes bytes
    /// for transmission and decodes received ones.
    pub fn transcode(self, bytes: &mut [u8]) {
        if self == Self::Inverse {
            for byte in bytes {
                *byte = decode_inverse(*byte);
            }
        }
    }
}

/// Convert a byte sampled in direct mode to its inverse convention value
pub const fn decode_inverse(byte: u8) -> u8 {
    !byte.reverse_bits()
}

/// Transmission protocols driven by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Protocol {
    /// Character oriented half duplex
    #[display("T=0")]
    T0,
    /// Block oriented half duplex
    #[display("T=1")]
    T1,
    /// Vendor framed byte protocol
    #[display("T=14")]
    T14,
}

impl Protocol {
    /// Protocol type number as carried in TDi and PPS0
    pub const fn number(self) -> u8 {
        match self {
            Self::T0 => 0,
            Self::T1 => 1,
            Self::T14 => 14,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::T0),
            1 => Ok(Self::T1),
            14 => Ok(Self::T14),
            other => Err(ProtocolError::UnsupportedProtocol(other)),
        }
    }
}

/// Set of protocol types offered by the card, one bit per T value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProtocolSet(u16);

impl ProtocolSet {
    /// The set containing only T=0
    pub const T0_ONLY: Self = Self(1);

    /// Add a protocol type
    pub const fn insert(&mut self, t: u8) {
        if t < 16 {
            self.0 |= 1 << t;
        }
    }

    /// Whether protocol type `t` is offered
    pub const fn contains(&self, t: u8) -> bool {
        t < 16 && self.0 & (1 << t) != 0
    }

    /// Whether nothing is offered
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw bitmap
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Lowest offered protocol type
    pub const fn first(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    /// Offered protocol types in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..16u8).filter(|t| self.contains(*t))
    }
}

/// One TAi/TBi/TCi/TDi group as transmitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceGroup {
    /// TAi
    pub ta: Option<u8>,
    /// TBi
    pub tb: Option<u8>,
    /// TCi
    pub tc: Option<u8>,
    /// TDi
    pub td: Option<u8>,
}

/// Specific mode announced by TA2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecificMode {
    /// Protocol the card is locked to
    pub protocol: u8,
    /// Parameters are implicit: TA1 must not be applied
    pub implicit: bool,
}

/// Clock stop behaviour from the first T=15 TA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ClockStop {
    /// Clock stop not supported
    #[display("not supported")]
    NotSupported,
    /// Clock may be stopped in state L
    #[display("state L")]
    Low,
    /// Clock may be stopped in state H
    #[display("state H")]
    High,
    /// Clock may be stopped in either state
    #[display("no preference")]
    NoPreference,
}

impl ClockStop {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::NotSupported,
            1 => Self::Low,
            2 => Self::High,
            _ => Self::NoPreference,
        }
    }
}

/// Decoded Answer-To-Reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAtr {
    /// Bit convention from TS
    pub convention: BitConvention,
    /// Format byte T0
    pub t0: u8,
    /// Interface groups in transmission order
    pub groups: Vec<InterfaceGroup>,
    /// Historical bytes
    pub history: Bytes,
    /// Clock rate conversion index (TA1 high nibble)
    pub fi_index: u8,
    /// Baud rate adjustment index (TA1 low nibble)
    pub di_index: u8,
    /// Whether TA1 was transmitted
    pub ta1_present: bool,
    /// Extra guard time (TC1)
    pub extra_guard: Option<u8>,
    /// Specific mode (TA2)
    pub specific_mode: Option<SpecificMode>,
    /// Waiting time integer (TC2)
    pub wi: u8,
    /// Offered protocol types
    pub protocols: ProtocolSet,
    /// T=1 information field size of the card
    pub ifsc: u8,
    /// T=1 character waiting integer
    pub cwi: u8,
    /// T=1 block waiting integer
    pub bwi: u8,
    /// T=1 error detection code is CRC instead of LRC
    pub crc: bool,
    /// Clock stop indicator (T=15)
    pub clock_stop: Option<ClockStop>,
    /// Supported voltage classes bitmap (T=15)
    pub class_support: Option<u8>,
    /// Standard or proprietary use contact (T=15)
    pub spu: Option<u8>,
    /// Check byte, when transmitted
    pub tck: Option<u8>,
    /// XOR from T0 to TCK is zero (trivially true without TCK)
    pub checksum_valid: bool,
}

impl ParsedAtr {
    /// Number of historical bytes announced in T0
    pub const fn history_len(&self) -> usize {
        (self.t0 & 0x0F) as usize
    }

    /// Whether the card only speaks T=0
    pub fn is_t0_only(&self) -> bool {
        self.protocols == ProtocolSet::T0_ONLY
    }
}

/// ATR as received together with its decoded form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtrResponse {
    /// Raw bytes including any non-ISO trailing bytes
    pub raw: Bytes,
    /// Decoded ISO part
    pub parsed: ParsedAtr,
}

/// Whether the protocol bitmap announced so far requires a TCK
pub fn tck_required(protocols: ProtocolSet) -> bool {
    protocols != ProtocolSet::T0_ONLY
}

/// Number of interface bytes flagged in the high nibble of T0 or TDi
pub const fn interface_bytes_flagged(y: u8) -> usize {
    (y & 0xF0).count_ones() as usize
}

/// Decode an ATR
///
/// A malformed ATR whose bytes also fail the check is reported as a checksum
/// fault, since the structure cannot be trusted once a byte is corrupt.
pub fn parse_atr(raw: &[u8]) -> Result<ParsedAtr> {
    if raw.len() > MAX_ATR_LEN {
        return Err(AtrError::TooLong(raw.len()).into());
    }
    if raw.len() < 2 {
        return Err(AtrError::Truncated {
            needed: 2,
            actual: raw.len(),
        }
        .into());
    }
    let convention = match raw[0] {
        TS_DIRECT => BitConvention::Direct,
        TS_INVERSE => BitConvention::Inverse,
        other => return Err(AtrError::InvalidTs(other).into()),
    };

    let residue = raw[1..].iter().fold(0u8, |acc, b| acc ^ b);
    let checked = |err: AtrError| -> ProtocolError {
        if residue != 0 {
            AtrError::Checksum(residue).into()
        } else {
            err.into()
        }
    };

    let t0 = raw[1];
    let k = (t0 & 0x0F) as usize;
    let mut atr = ParsedAtr {
        convention,
        t0,
        groups: Vec::new(),
        history: Bytes::new(),
        fi_index: 1,
        di_index: 1,
        ta1_present: false,
        extra_guard: None,
        specific_mode: None,
        wi: DEFAULT_WI,
        protocols: ProtocolSet::default(),
        ifsc: DEFAULT_IFSC,
        cwi: DEFAULT_CWI,
        bwi: DEFAULT_BWI,
        crc: false,
        clock_stop: None,
        class_support: None,
        spu: None,
        tck: None,
        checksum_valid: true,
    };

    let mut pos = 2;
    let mut y = t0;
    let mut mode = 0u8;
    let mut t1_seen = false;
    let mut t14_timing = None;
    let mut t15_seen = false;
    for i in 1.. {
        let mut group = InterfaceGroup::default();
        for (mask, slot) in [
            (TA_PRESENT, &mut group.ta),
            (TB_PRESENT, &mut group.tb),
            (TC_PRESENT, &mut group.tc),
            (TD_PRESENT, &mut group.td),
        ] {
            if y & mask != 0 {
                let Some(byte) = raw.get(pos) else {
                    return Err(checked(AtrError::Truncated {
                        needed: pos + 1,
                        actual: raw.len(),
                    }));
                };
                *slot = Some(*byte);
                pos += 1;
            }
        }

        match (i, mode) {
            (1, _) => {
                if let Some(ta1) = group.ta {
                    atr.ta1_present = true;
                    atr.fi_index = ta1 >> 4;
                    atr.di_index = ta1 & 0x0F;
                }
                atr.extra_guard = group.tc;
            }
            (2, _) => {
                if let Some(ta2) = group.ta {
                    atr.specific_mode = Some(SpecificMode {
                        protocol: ta2 & 0x0F,
                        implicit: ta2 & 0x10 != 0,
                    });
                }
                if let Some(tc2) = group.tc {
                    atr.wi = tc2;
                }
            }
            (_, 1) if !t1_seen => {
                t1_seen = true;
                if let Some(ta) = group.ta {
                    atr.ifsc = ta;
                }
                if let Some(tb) = group.tb {
                    atr.cwi = tb & 0x0F;
                    atr.bwi = tb >> 4;
                }
                if let Some(tc) = group.tc {
                    atr.crc = tc & 0x01 != 0;
                }
            }
            (_, 14) => {
                if t14_timing.is_none() {
                    t14_timing = group.tb;
                }
            }
            (_, 15) if !t15_seen => {
                t15_seen = true;
                if let Some(ta) = group.ta {
                    atr.clock_stop = Some(ClockStop::from_bits(ta >> 6));
                    atr.class_support = Some(ta & 0x3F);
                }
                atr.spu = group.tb;
            }
            _ => {}
        }

        atr.groups.push(group);
        let Some(td) = group.td else { break };
        mode = td & 0x0F;
        if mode != 15 {
            atr.protocols.insert(mode);
        }
        y = td;
    }

    if atr.protocols.is_empty() {
        atr.protocols.insert(0);
    }
    if !t1_seen {
        if let Some(tb) = t14_timing {
            atr.cwi = tb & 0x0F;
            atr.bwi = tb >> 4;
        }
    }

    let remaining = raw.len() - pos;
    let required = tck_required(atr.protocols);
    let has_tck = required || remaining > k;
    if has_tck && residue != 0 {
        return Err(AtrError::Checksum(residue).into());
    }
    if remaining < k {
        return Err(checked(AtrError::Truncated {
            needed: pos + k + usize::from(required),
            actual: raw.len(),
        }));
    }
    if remaining > k + 1 {
        return Err(AtrError::LengthMismatch { remaining, history: k }.into());
    }
    if required && remaining == k {
        return Err(AtrError::MissingTck.into());
    }

    atr.history = Bytes::copy_from_slice(&raw[pos..pos + k]);
    if remaining == k + 1 {
        atr.tck = raw.last().copied();
        atr.checksum_valid = residue == 0;
    }

    trace!(
        convention = %atr.convention,
        protocols = atr.protocols.bits(),
        history = %hex::encode(&atr.history),
        "Parsed ATR"
    );
    Ok(atr)
}
