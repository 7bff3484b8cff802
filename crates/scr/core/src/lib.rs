//! Smart card reader protocol engine for ISO/IEC 7816-3 cards
//!
//! This crate drives a contact card over a half-duplex byte channel: it
//! activates the card, reads and parses the Answer-To-Reset, negotiates
//! transmission parameters and exchanges APDUs with T=0, T=1 or T=14.
//!
//! ## Overview
//!
//! - [`atr`], [`pps`] and [`timing`] are pure functions over bytes and integers
//! - [`t0`], [`t1`] and [`t14`] run the transmission protocols over a [`ByteIo`]
//! - [`Session`] owns one slot and enforces the session state machine
//! - [`SessionWorker`] moves a session onto its own thread behind a [`SessionHandle`]
//! - [`sim`] provides a simulated card for tests and demonstrations
//!
//! The hardware is reached through two traits: [`ByteIo`] for the serial
//! line and [`CardContacts`] for VCC, RST, CLK and card detection.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod apdu;
pub mod atr;
pub mod capabilities;
pub mod config;
pub mod contacts;
pub mod error;
pub mod io;
pub mod personality;
pub mod pps;
pub mod session;
pub mod sim;
pub mod t0;
pub mod t1;
pub mod t14;
pub mod timing;

pub use apdu::{ApduCase, StatusWord, classify};
pub use atr::{AtrResponse, ParsedAtr, Protocol, parse_atr};
pub use capabilities::Capabilities;
pub use config::{DeviceType, ResetTiming, SessionConfig};
pub use contacts::{CardContacts, StaticContacts, VoltageClass};
pub use error::{AtrError, ProtocolError, Result, ResultExt};
pub use io::{AbortHandle, ByteIo, IoError, UartConfig};
pub use personality::CardPersonality;
pub use pps::{PpsParams, build_pps_request};
pub use session::{PresenceEvent, ResetKind, Session, SessionHandle, SessionWorker, State};
pub use timing::{Timeouts, compute_timeouts};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    // Core types
    pub use crate::{Bytes, ProtocolError, Result, ResultExt};

    // Parsing
    pub use crate::apdu::{ApduCase, StatusWord, classify};
    pub use crate::atr::{AtrResponse, ParsedAtr, Protocol, parse_atr};
    pub use crate::pps::{PpsParams, build_pps_request};

    // Hardware seams
    pub use crate::contacts::CardContacts;
    pub use crate::io::ByteIo;

    // Sessions
    pub use crate::capabilities::Capabilities;
    pub use crate::config::SessionConfig;
    pub use crate::session::{PresenceEvent, ResetKind, Session, SessionHandle, SessionWorker, State};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports() {
        let parsed = parse_atr(&sim::T1_ATR).unwrap();
        assert_eq!(parsed.protocols.first(), Some(1));
        assert_eq!(classify(&[0x00, 0xA4, 0x04, 0x00, 0x00]).unwrap().case, ApduCase::Case1);
        assert_eq!(StatusWord::new(0x90, 0x00).to_string(), "90 00");
    }
}
