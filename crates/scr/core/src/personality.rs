//! Card personalities
//!
//! A personality adjusts how the session derives interface parameters from
//! the ATR. [`IsoPersonality`] follows ISO/IEC 7816-3; conditional access
//! cards that need vendor tweaks plug in their own implementation. The
//! Fi/Di and ETU hooks are only consulted for [`DeviceType::Ca`].

use std::fmt;

use crate::atr::Protocol;
use crate::capabilities::Capabilities;
use crate::config::{DeviceType, SessionConfig};
use crate::timing::GuardTime;

/// Strategy consulted by the session while it programs the interface
pub trait CardPersonality: Send + fmt::Debug {
    /// Adjust the session defaults before the first reset
    fn populate_init_params(&self, _config: &mut SessionConfig) {}

    /// Adjust the capabilities after Fi/Di changed
    fn recalc_etu(&self, _caps: &mut Capabilities, _fi_index: u8, _di_index: u8) {}

    /// Whether the UART signals parity errors and repeats characters
    fn set_parity(&self, protocol: Protocol) -> bool {
        protocol == Protocol::T0
    }

    /// Stop bits programmed in the UART
    fn set_stopbits(&self, guard: &GuardTime, _protocol: Protocol) -> u32 {
        guard.stop_bits
    }

    /// Map the Fi/Di indices the card announced to the ones actually used
    fn update_fi_di(&self, fi_index: u8, di_index: u8) -> (u8, u8) {
        (fi_index, di_index)
    }
}

/// Plain ISO/IEC 7816-3 behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoPersonality;

impl CardPersonality for IsoPersonality {}

/// Personality used when none is injected explicitly
///
/// [`DeviceType::Ca`] gets the ISO behaviour as well: vendor adjustments are
/// supplied by the integrator through `Session::with_personality`.
pub fn default_personality(device_type: DeviceType) -> Box<dyn CardPersonality> {
    match device_type {
        DeviceType::Iso | DeviceType::Ca => Box::new(IsoPersonality),
    }
}
