//! Messages processed by the session worker

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};

use super::{ResetKind, State};
use crate::atr::AtrResponse;
use crate::capabilities::Capabilities;
use crate::error::{ProtocolError, Result};
use crate::pps::MAX_PPS_LEN;

/// One-shot reply channel
pub(crate) type Reply<T> = Sender<Result<T>>;

/// Create a reply channel
pub(crate) fn reply_channel<T>() -> (Reply<T>, Receiver<Result<T>>) {
    bounded(1)
}

/// Request queued to the worker
#[derive(Debug)]
pub(crate) enum Request {
    /// Reset the card
    Reset(ResetKind, Reply<AtrResponse>),
    /// Negotiate protocol parameters
    Pps([u8; MAX_PPS_LEN], Reply<[u8; MAX_PPS_LEN]>),
    /// Exchange an APDU or T=14 frame
    Transfer(Bytes, u32, Reply<Bytes>),
    /// Announce the reader IFSD
    NegotiateIfsd(u8, Reply<u8>),
    /// Change the card clock
    ChangeClock(u32, Reply<u32>),
    /// Release the contacts
    Deactivate(Reply<()>),
    /// Power down
    Suspend(Reply<()>),
    /// Leave low power
    Resume(Reply<()>),
    /// Current parameters
    Capabilities(Sender<Capabilities>),
    /// Current state
    State(Sender<State>),
    /// Last unrecovered error
    LastError(Sender<Option<ProtocolError>>),
    /// Card detect changed
    Presence(PresenceEvent),
    /// Close the session and stop the worker
    Close(Reply<()>),
}

/// Card detect notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A card was inserted
    Inserted,
    /// The card was removed
    Removed,
}

impl PresenceEvent {
    /// Whether a card is in the slot after the event
    pub const fn is_present(self) -> bool {
        matches!(self, Self::Inserted)
    }
}
