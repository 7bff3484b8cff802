//! Session parameters derived from the ATR and PPS
//!
//! Before the first reset the [`Capabilities`] describe the ISO defaults
//! (F=372, D=1, T=0). Once the ATR is parsed the protocol and Fi/Di are
//! selected:
//!
//! - specific mode (TA2 present): the TA2 protocol with the TA1 parameters,
//!   or the defaults when TA2 requests implicit parameters;
//! - negotiable mode: the first offered protocol with the default
//!   parameters until a PPS exchange changes them.

use tracing::debug;

use crate::atr::{BitConvention, ParsedAtr, Protocol, ProtocolSet};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::io::UartConfig;
use crate::pps::PpsInfo;
use crate::timing::{
    DEFAULT_FD_INDEX, GuardTime, INITIAL_FI, Timeouts, WWT_TOLERANCE_MS, atr_char_timeout_ms, baud_rate,
    compute_timeouts, di_value, fi_value, fmax_value, reset_clock_divider, working_frequency,
};

/// Derived transmission parameters of the active card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Protocol in use
    pub protocol: Protocol,
    /// Protocols offered by the card
    pub supported: ProtocolSet,
    /// Bit convention
    pub convention: BitConvention,
    /// Reader clock feeding the divider (Hz)
    pub clock_frequency: u32,
    /// Programmed clock divider
    pub clock_divider: u32,
    /// Frequency on the card's CLK contact (Hz)
    pub working_frequency: u32,
    /// Highest card clock allowed by TA1 (Hz)
    pub max_clock_frequency: u32,
    /// Baud rate at the highest card clock
    pub max_baud_rate: u32,
    /// Clock rate conversion index in use
    pub fi_index: u8,
    /// Baud rate adjustment index in use
    pub di_index: u8,
    /// Timing budgets
    pub timeouts: Timeouts,
    /// T=1 information field size of the card
    pub ifsc: usize,
    /// Margin added to the work waiting time
    pub wwt_tolerance_ms: u32,
}

impl Capabilities {
    /// Parameters in force while the card is reset
    pub fn initial(config: &SessionConfig) -> Self {
        let clock_divider = reset_clock_divider(config.clock_frequency, config.initial_baud_rate, INITIAL_FI);
        let mut timeouts = Timeouts::for_reset(config.initial_baud_rate);
        timeouts.wwt_ms = adjust_tolerance(timeouts.wwt_ms, config.wwt_tolerance_ms);
        Self {
            protocol: Protocol::T0,
            supported: ProtocolSet::T0_ONLY,
            convention: BitConvention::Direct,
            clock_frequency: config.clock_frequency,
            clock_divider,
            working_frequency: working_frequency(config.clock_frequency, clock_divider),
            max_clock_frequency: fmax_value(DEFAULT_FD_INDEX).unwrap_or(5_000_000),
            max_baud_rate: config.initial_baud_rate,
            fi_index: DEFAULT_FD_INDEX,
            di_index: DEFAULT_FD_INDEX,
            timeouts,
            ifsc: usize::from(crate::atr::DEFAULT_IFSC),
            wwt_tolerance_ms: config.wwt_tolerance_ms,
        }
    }

    /// Protocol and Fi/Di indices to start with after `atr`
    pub fn selection(atr: &ParsedAtr) -> Result<(Protocol, u8, u8)> {
        let (protocol, fi, di) = match atr.specific_mode {
            Some(mode) if mode.implicit => (mode.protocol, DEFAULT_FD_INDEX, DEFAULT_FD_INDEX),
            Some(mode) => (mode.protocol, atr.fi_index, atr.di_index),
            None => (atr.protocols.first().unwrap_or(0), DEFAULT_FD_INDEX, DEFAULT_FD_INDEX),
        };
        Ok((Protocol::try_from(protocol)?, fi, di))
    }

    /// Reprogram for `protocol` at the given Fi/Di indices
    pub fn apply(&mut self, protocol: Protocol, fi_index: u8, di_index: u8, atr: &ParsedAtr) -> Result<()> {
        let mut timeouts = compute_timeouts(self.working_frequency, fi_index, di_index, atr)?;
        timeouts.guard = GuardTime::from_tc1(atr.extra_guard, protocol != Protocol::T0);
        timeouts.wwt_ms = adjust_tolerance(timeouts.wwt_ms, self.wwt_tolerance_ms);

        self.max_clock_frequency = fmax_value(fi_index)?;
        self.max_baud_rate = baud_rate(self.max_clock_frequency, fi_value(fi_index)?, di_value(di_index)?);
        self.protocol = protocol;
        self.supported = atr.protocols;
        self.convention = atr.convention;
        self.fi_index = fi_index;
        self.di_index = di_index;
        self.ifsc = usize::from(atr.ifsc);
        self.timeouts = timeouts;

        debug!(
            %protocol,
            fi_index,
            di_index,
            baud = timeouts.baud_rate,
            stop_bits = timeouts.guard.stop_bits,
            "Capabilities updated"
        );
        Ok(())
    }

    /// Fold a confirmed PPS into the parameters
    pub fn apply_pps(&mut self, info: &PpsInfo, atr: &ParsedAtr) -> Result<()> {
        self.apply(Protocol::try_from(info.protocol)?, info.f_int, info.d_int, atr)
    }

    /// Change the clock divider and recompute the timing
    pub fn set_clock_divider(&mut self, divider: u32, atr: &ParsedAtr) -> Result<()> {
        self.clock_divider = divider;
        self.working_frequency = working_frequency(self.clock_frequency, divider);
        self.apply(self.protocol, self.fi_index, self.di_index, atr)
    }

    /// Current baud rate
    pub const fn baud_rate(&self) -> u32 {
        self.timeouts.baud_rate
    }

    /// Maximum delay between two ATR characters
    pub const fn atr_char_timeout_ms(&self) -> u32 {
        atr_char_timeout_ms(self.timeouts.baud_rate)
    }

    /// Serial line parameters with ISO parity and stop bits
    pub const fn uart_config(&self) -> UartConfig {
        UartConfig {
            baud_rate: self.timeouts.baud_rate,
            stop_bits: self.timeouts.guard.stop_bits,
            nack: matches!(self.protocol, Protocol::T0),
            convention: self.convention,
        }
    }
}

const fn adjust_tolerance(wwt_ms: u32, tolerance_ms: u32) -> u32 {
    wwt_ms.saturating_sub(WWT_TOLERANCE_MS).saturating_add(tolerance_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::parse_atr;

    fn atr(hex_str: &str) -> ParsedAtr {
        parse_atr(&hex::decode(hex_str).unwrap()).unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig::new().with_clock_frequency(7_142_400)
    }

    #[test]
    fn test_initial() {
        let caps = Capabilities::initial(&config());
        assert_eq!(caps.protocol, Protocol::T0);
        assert_eq!(caps.clock_divider, 1);
        assert_eq!(caps.working_frequency, 3_571_200);
        assert_eq!(caps.baud_rate(), 9600);
        assert_eq!(caps.atr_char_timeout_ms(), 1001);
    }

    #[test]
    fn test_negotiable_mode_uses_defaults() {
        // TA1 = 96 offered, no TA2: first protocol (T=1) at F/D 1/1 until PPS
        let parsed = atr("3BF89600008131FE454A434F507632343132");
        let (protocol, fi, di) = Capabilities::selection(&parsed).unwrap();
        assert_eq!((protocol, fi, di), (Protocol::T1, 1, 1));

        let mut caps = Capabilities::initial(&config());
        caps.apply(protocol, fi, di, &parsed).unwrap();
        assert_eq!(caps.baud_rate(), 9600);
        assert_eq!(caps.ifsc, 254);
        assert!(!caps.uart_config().nack);
    }

    #[test]
    fn test_specific_mode_uses_ta1() {
        // TA1 = 18, TA2 = 01 (T=1, explicit parameters)
        let parsed = atr("3B901891011FC3C4");
        let (protocol, fi, di) = Capabilities::selection(&parsed).unwrap();
        assert_eq!((protocol, fi, di), (Protocol::T1, 1, 8));

        // TA2 = 11 asks for the implicit defaults instead
        let implicit = atr("3B901891111FC3D4");
        assert_eq!(Capabilities::selection(&implicit).unwrap(), (Protocol::T1, 1, 1));

        let mut caps = Capabilities::initial(&config());
        caps.apply(protocol, fi, di, &parsed).unwrap();
        assert_eq!(caps.baud_rate(), 115_200);
        assert_eq!(caps.max_clock_frequency, 5_000_000);
    }

    #[test]
    fn test_pps_updates_rate() {
        let parsed = atr("3BF89600008131FE454A434F507632343132");
        let mut caps = Capabilities::initial(&config());
        let info = PpsInfo {
            protocol: 1,
            f_int: 9,
            d_int: 6,
            spu: None,
        };
        caps.apply_pps(&info, &parsed).unwrap();
        assert_eq!((caps.fi_index, caps.di_index), (9, 6));
        // 3.5712 MHz * 32 / 512
        assert_eq!(caps.baud_rate(), 223_200);
        assert_eq!(caps.timeouts.etu, 16);
    }
}
