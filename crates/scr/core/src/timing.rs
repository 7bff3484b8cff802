//! Elementary time unit and waiting time computation
//!
//! All durations handed to the byte I/O layer are whole milliseconds, rounded
//! up so that a budget is never shorter than what ISO/IEC 7816-3 allows.

use crate::atr::{DEFAULT_BWI, DEFAULT_CWI, DEFAULT_WI, ParsedAtr};
use crate::error::{AtrError, Result};

/// Baud rate used while the ATR is read (F=372, D=1 at 3.57 MHz)
pub const INITIAL_BAUD_RATE: u32 = 9600;
/// Default character frame stop bits
pub const DEFAULT_N: u32 = 2;
/// Default clock rate conversion factor
pub const INITIAL_FI: u32 = 372;
/// Default baud rate adjustment factor
pub const INITIAL_DI: u32 = 1;
/// Fi/Di index pair selected when TA1 is absent
pub const DEFAULT_FD_INDEX: u8 = 1;
/// Block guard time
pub const BGT_ETU: u32 = 22;
/// Character guard time for the default N
pub const CGT_ETU: u32 = 12;
/// Maximum delay between two ATR characters
pub const ATR_CHAR_TIMEOUT_ETU: u32 = 9600;
/// Margin added to the work waiting time
pub const WWT_TOLERANCE_MS: u32 = 11;
/// Largest clock divider programmable in the reader
pub const MAX_CLOCK_DIVIDER: u32 = 63;

/// Clock rate conversion factors by TA1 high nibble
pub const FI_TABLE: [Option<u32>; 16] = [
    Some(372),
    Some(372),
    Some(558),
    Some(744),
    Some(1116),
    Some(1488),
    Some(1860),
    None,
    None,
    Some(512),
    Some(768),
    Some(1024),
    Some(1536),
    Some(2048),
    None,
    None,
];

/// Maximum card clock frequencies in Hz by TA1 high nibble
pub const FMAX_TABLE: [Option<u32>; 16] = [
    Some(4_000_000),
    Some(5_000_000),
    Some(6_000_000),
    Some(8_000_000),
    Some(12_000_000),
    Some(16_000_000),
    Some(20_000_000),
    None,
    None,
    Some(5_000_000),
    Some(7_500_000),
    Some(10_000_000),
    Some(15_000_000),
    Some(20_000_000),
    None,
    None,
];

/// Baud rate adjustment factors by TA1 low nibble
pub const DI_TABLE: [Option<u32>; 16] = [
    None,
    Some(1),
    Some(2),
    Some(4),
    Some(8),
    Some(16),
    Some(32),
    Some(64),
    Some(12),
    Some(20),
    None,
    None,
    None,
    None,
    None,
    None,
];

/// Clock rate conversion factor for `index`
pub fn fi_value(index: u8) -> Result<u32> {
    FI_TABLE
        .get(usize::from(index))
        .copied()
        .flatten()
        .ok_or_else(|| AtrError::RfuFi(index).into())
}

/// Baud rate adjustment factor for `index`
pub fn di_value(index: u8) -> Result<u32> {
    DI_TABLE
        .get(usize::from(index))
        .copied()
        .flatten()
        .ok_or_else(|| AtrError::RfuDi(index).into())
}

/// Maximum clock frequency for `index`
pub fn fmax_value(index: u8) -> Result<u32> {
    FMAX_TABLE
        .get(usize::from(index))
        .copied()
        .flatten()
        .ok_or_else(|| AtrError::RfuFi(index).into())
}

/// Baud rate for a card clock and conversion factors
pub const fn baud_rate(clock_freq: u32, fi: u32, di: u32) -> u32 {
    ((clock_freq as u64 * di as u64) / fi as u64) as u32
}

/// Milliseconds taken by `etu` elementary time units, rounded up
pub const fn etu_to_ms(etu: u64, baud_rate: u32) -> u32 {
    if baud_rate == 0 {
        return u32::MAX;
    }
    let ms = (etu * 1000).div_ceil(baud_rate as u64);
    if ms > u32::MAX as u64 { u32::MAX } else { ms as u32 }
}

/// Delay allowed between two ATR characters at the reset baud rate
pub const fn atr_char_timeout_ms(baud_rate: u32) -> u32 {
    etu_to_ms(ATR_CHAR_TIMEOUT_ETU as u64, baud_rate) + 1
}

/// Clock divider used while the card is reset
///
/// Picks the divider that brings `clock_freq / (2 * div)` closest to
/// `baud_rate * etu`, clamped to what the reader can program.
pub const fn reset_clock_divider(clock_freq: u32, baud_rate: u32, etu: u32) -> u32 {
    let target = baud_rate as u64 * etu as u64;
    if target == 0 {
        return MAX_CLOCK_DIVIDER;
    }
    let div = (clock_freq as u64 + target) / (2 * target);
    if div < 1 {
        1
    } else if div > MAX_CLOCK_DIVIDER as u64 {
        MAX_CLOCK_DIVIDER
    } else {
        div as u32
    }
}

/// Card clock produced by a divider
pub const fn working_frequency(clock_freq: u32, divider: u32) -> u32 {
    if divider == 0 {
        clock_freq
    } else {
        clock_freq / (2 * divider)
    }
}

/// Divider that best approaches a requested card clock without exceeding `fmax`
pub fn closest_divider(clock_freq: u32, requested: u32, fmax: u32) -> u32 {
    (1..=MAX_CLOCK_DIVIDER)
        .filter(|div| working_frequency(clock_freq, *div) <= fmax)
        .min_by_key(|div| working_frequency(clock_freq, *div).abs_diff(requested))
        .unwrap_or(MAX_CLOCK_DIVIDER)
}

/// Character framing derived from TC1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardTime {
    /// Stop bits programmed in the UART (N)
    pub stop_bits: u32,
    /// TC1 was 0xFF
    pub minimum: bool,
    /// Extra guard ETUs inserted between characters
    pub delay_etu: u32,
}

impl GuardTime {
    /// Guard time for an announced TC1 and the selected protocol
    ///
    /// For T=1 and T=14 the minimum guard time reduces the character frame
    /// to 11 ETU (one stop bit).
    pub const fn from_tc1(tc1: Option<u8>, block_protocol: bool) -> Self {
        match tc1 {
            None => Self {
                stop_bits: DEFAULT_N,
                minimum: false,
                delay_etu: 0,
            },
            Some(0xFF) if block_protocol => Self {
                stop_bits: 1,
                minimum: true,
                delay_etu: 0,
            },
            Some(0xFF) => Self {
                stop_bits: DEFAULT_N,
                minimum: true,
                delay_etu: 0,
            },
            Some(n) => Self {
                stop_bits: DEFAULT_N + n as u32,
                minimum: false,
                delay_etu: n as u32,
            },
        }
    }

    /// Character guard time in ETU
    pub const fn cgt_etu(&self) -> u32 {
        if self.stop_bits == 1 { CGT_ETU - 1 } else { CGT_ETU + self.delay_etu }
    }
}

/// Timing budgets for one set of transmission parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Clock cycles per bit (Fi/Di, truncated)
    pub etu: u32,
    /// Bits per second
    pub baud_rate: u32,
    /// Character waiting time in ETU (2^CWI + 11)
    pub cwt_etu: u32,
    /// Character waiting time
    pub cwt_ms: u32,
    /// Block waiting time
    pub bwt_ms: u32,
    /// Block guard time
    pub bgt_ms: u32,
    /// Work waiting time including tolerance
    pub wwt_ms: u32,
    /// Character framing
    pub guard: GuardTime,
}

impl Timeouts {
    /// Budgets in force while the ATR is read, before anything is known about the card
    pub fn for_reset(baud_rate: u32) -> Self {
        let baud = baud_rate.max(1);
        let cwt_etu = (1u32 << DEFAULT_CWI) + 11;
        Self {
            etu: INITIAL_FI / INITIAL_DI,
            baud_rate: baud,
            cwt_etu,
            cwt_ms: cwt_ms(cwt_etu, baud),
            bwt_ms: bwt_ms(DEFAULT_BWI, baud),
            bgt_ms: bgt_ms(baud),
            wwt_ms: wwt_ms(DEFAULT_WI, INITIAL_DI, baud),
            guard: GuardTime::from_tc1(None, false),
        }
    }
}

fn cwt_ms(cwt_etu: u32, baud: u32) -> u32 {
    (1000 * u64::from(cwt_etu) / u64::from(baud)) as u32 + 1
}

fn bwt_ms(bwi: u8, baud: u32) -> u32 {
    ((1u64 << bwi.min(15)) * 100 + 1000 * 11 / u64::from(baud)) as u32
}

fn bgt_ms(baud: u32) -> u32 {
    (1000 * u64::from(BGT_ETU) / u64::from(baud)) as u32 + 1
}

fn wwt_ms(wi: u8, di: u32, baud: u32) -> u32 {
    let wi = if wi == 0 { DEFAULT_WI } else { wi };
    etu_to_ms(960 * u64::from(wi) * u64::from(di), baud).saturating_add(WWT_TOLERANCE_MS)
}

/// Compute all waiting times for a card clock and Fi/Di indices
///
/// `clock_freq` is the frequency on the card's CLK contact. The baud rate is
/// derived from it; RFU indices are rejected.
pub fn compute_timeouts(clock_freq: u32, fi_index: u8, di_index: u8, atr: &ParsedAtr) -> Result<Timeouts> {
    let fi = fi_value(fi_index)?;
    let di = di_value(di_index)?;
    let baud = baud_rate(clock_freq, fi, di).max(1);
    let cwt_etu = (1u32 << atr.cwi.min(15)) + 11;

    Ok(Timeouts {
        etu: fi / di,
        baud_rate: baud,
        cwt_etu,
        cwt_ms: cwt_ms(cwt_etu, baud),
        bwt_ms: bwt_ms(atr.bwi, baud),
        bgt_ms: bgt_ms(baud),
        wwt_ms: wwt_ms(atr.wi, di, baud),
        guard: GuardTime::from_tc1(atr.extra_guard, !atr.is_t0_only()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::parse_atr;

    #[test]
    fn test_tables_reject_rfu() {
        assert_eq!(fi_value(1), Ok(372));
        assert_eq!(fi_value(9), Ok(512));
        assert_eq!(di_value(8), Ok(12));
        assert!(matches!(fi_value(7), Err(crate::ProtocolError::InvalidAtr(AtrError::RfuFi(7)))));
        assert!(matches!(di_value(0), Err(crate::ProtocolError::InvalidAtr(AtrError::RfuDi(0)))));
        assert!(fi_value(16).is_err());
    }

    #[test]
    fn test_default_timeouts() {
        let atr = parse_atr(&hex::decode("3B6500009C11010103").unwrap()).unwrap();
        let t = compute_timeouts(3_571_200, 1, 1, &atr).unwrap();
        assert_eq!(t.etu, 372);
        assert_eq!(t.baud_rate, 9600);
        assert_eq!(t.wwt_ms, 1000 + WWT_TOLERANCE_MS);
        // 2^13 + 11 ETU at 9600 baud
        assert_eq!(t.cwt_etu, 8203);
        assert_eq!(t.cwt_ms, 855);
        assert_eq!(t.bwt_ms, 1601);
        assert_eq!(t.bgt_ms, 3);
        assert_eq!(t.guard.stop_bits, 2);
    }

    #[test]
    fn test_rfu_index_rejected() {
        let atr = parse_atr(&hex::decode("3B6500009C11010103").unwrap()).unwrap();
        assert!(compute_timeouts(3_571_200, 8, 1, &atr).is_err());
        assert!(compute_timeouts(3_571_200, 1, 10, &atr).is_err());
    }

    #[test]
    fn test_guard_time() {
        assert_eq!(GuardTime::from_tc1(None, false).stop_bits, 2);
        assert_eq!(GuardTime::from_tc1(Some(3), false).stop_bits, 5);
        let min_t0 = GuardTime::from_tc1(Some(0xFF), false);
        assert_eq!((min_t0.stop_bits, min_t0.minimum), (2, true));
        let min_t1 = GuardTime::from_tc1(Some(0xFF), true);
        assert_eq!((min_t1.stop_bits, min_t1.delay_etu, min_t1.cgt_etu()), (1, 0, 11));
    }

    #[test]
    fn test_clock_divider() {
        // 27 MHz down to roughly 3.57 MHz for 9600 baud at 372 clocks per ETU
        let div = reset_clock_divider(27_000_000, INITIAL_BAUD_RATE, INITIAL_FI);
        assert_eq!(div, 4);
        assert_eq!(working_frequency(27_000_000, div), 3_375_000);
        assert_eq!(reset_clock_divider(1_000, 9600, 372), 1);
        assert_eq!(closest_divider(27_000_000, 5_000_000, 5_000_000), 3);
        assert_eq!(atr_char_timeout_ms(9600), 1001);
    }

    #[test]
    fn test_reset_budgets() {
        let t = Timeouts::for_reset(INITIAL_BAUD_RATE);
        assert_eq!((t.etu, t.cwt_ms, t.bwt_ms, t.bgt_ms), (372, 855, 1601, 3));
        assert_eq!(t.wwt_ms, 1000 + WWT_TOLERANCE_MS);
    }
}
