//! T=1 block protocol
//!
//! [`block`] holds the frame layout and the error detection codes,
//! [`engine`] drives the half duplex exchange with chaining, waiting time
//! extension and error recovery. The [`T1BlockContext`] outlives single
//! transfers: the session owns it so the send and receive sequence numbers
//! carry over from one APDU to the next.

pub mod block;
pub mod engine;

pub use block::{Block, BlockKind, EpilogueKind, RCode, SType};
pub use engine::T1Engine;

use crate::atr::ParsedAtr;
use crate::timing::Timeouts;

/// Information field size the reader accepts by default
pub const DEFAULT_IFSD: u8 = 254;
/// Retransmissions attempted before resynchronising
pub const MAX_RETRIES: usize = 2;
/// RESYNCH requests attempted before giving up
pub const MAX_RESYNCH: usize = 3;

/// Link state of a T=1 session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct T1BlockContext {
    /// N(S) of the next I-block we send
    pub our_sequence: u8,
    /// N(S) expected on the next I-block from the card
    pub their_sequence: u8,
    /// Largest information field the card accepts
    pub ifsc: usize,
    /// Largest information field we accept
    pub ifsd: usize,
    /// Node address byte
    pub nad: u8,
    /// Error detection code
    pub epilogue: EpilogueKind,
    /// No block has been exchanged since the last reset or resynchronisation
    pub first_block: bool,
    /// Response bytes received in the current transfer
    pub bytes_read: usize,
    /// Command bytes acknowledged in the current transfer
    pub bytes_written: usize,
    /// BWT multiplier requested by WTX, applies to the next block only
    pub bwt_multiplier: u32,
    /// Waiting times
    pub timeouts: Timeouts,
}

impl T1BlockContext {
    /// Initial link state for a card
    pub fn new(atr: &ParsedAtr, timeouts: Timeouts, nad: u8, ifsd: u8) -> Self {
        Self {
            our_sequence: 0,
            their_sequence: 0,
            ifsc: usize::from(atr.ifsc.clamp(1, block::MAX_INF_LEN as u8)),
            ifsd: usize::from(ifsd.clamp(1, block::MAX_INF_LEN as u8)),
            nad,
            epilogue: if atr.crc { EpilogueKind::Crc } else { EpilogueKind::Lrc },
            first_block: true,
            bytes_read: 0,
            bytes_written: 0,
            bwt_multiplier: 1,
            timeouts,
        }
    }

    /// State after a successful RESYNCH exchange
    pub const fn resynchronised(&mut self) {
        self.our_sequence = 0;
        self.their_sequence = 0;
        self.first_block = true;
        self.bwt_multiplier = 1;
    }
}
