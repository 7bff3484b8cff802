//! Session lifecycle states

use derive_more::Display;

use crate::error::{ProtocolError, Result};

/// Lifecycle state of a card session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum State {
    /// Created, card presence not yet known
    #[display("open")]
    Open,
    /// Slot is empty
    #[display("card not present")]
    CardNotPresent,
    /// Card inserted but not (successfully) reset
    #[display("card present")]
    CardPresent,
    /// Reset done, commands accepted
    #[display("ready")]
    Ready,
    /// A command is being exchanged
    #[display("process")]
    Process,
    /// Contacts being released
    #[display("deactivate")]
    Deactivate,
    /// Powered down, waiting to be resumed
    #[display("low power")]
    LowPower,
    /// Closed, terminal
    #[display("delete")]
    Delete,
}

impl State {
    /// Whether the state machine allows moving from `self` to `to`
    pub const fn can_transition(self, to: Self) -> bool {
        use State::*;
        match (self, to) {
            (Delete, _) => false,
            (_, Delete) => true,
            (_, CardNotPresent) => true,
            (LowPower, CardPresent) => true,
            (LowPower, _) => false,
            (_, Open) => false,
            (_, Process) => matches!(self, Ready),
            (_, Deactivate) => !matches!(self, Open | CardNotPresent),
            (_, Ready) => matches!(self, CardPresent | Ready | Process),
            (_, CardPresent) => true,
            (_, LowPower) => matches!(self, CardNotPresent | CardPresent | Ready),
        }
    }

    /// Validate a transition
    pub const fn transition(self, to: Self) -> Result<Self> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(ProtocolError::InvalidTransition { from: self, to })
        }
    }

    /// Whether commands for the card are accepted
    pub const fn accepts_commands(self) -> bool {
        matches!(self, Self::Ready | Self::Process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_only_from_ready() {
        assert!(State::Ready.can_transition(State::Process));
        for from in [State::Open, State::CardNotPresent, State::CardPresent, State::Deactivate, State::LowPower] {
            assert!(!from.can_transition(State::Process), "{from}");
        }
    }

    #[test]
    fn test_deactivate_rules() {
        assert!(State::Ready.can_transition(State::Deactivate));
        assert!(State::CardPresent.can_transition(State::Deactivate));
        assert!(!State::Open.can_transition(State::Deactivate));
        assert!(!State::CardNotPresent.can_transition(State::Deactivate));
        assert_eq!(
            State::Open.transition(State::Deactivate),
            Err(ProtocolError::InvalidTransition {
                from: State::Open,
                to: State::Deactivate
            })
        );
    }

    #[test]
    fn test_removal_and_delete() {
        for from in [State::Open, State::CardPresent, State::Ready, State::Process, State::LowPower] {
            assert!(from.can_transition(State::CardNotPresent));
        }
        assert!(!State::Delete.can_transition(State::CardNotPresent));
        assert!(!State::Delete.can_transition(State::Ready));
        assert!(!State::LowPower.can_transition(State::Ready));
        assert!(State::LowPower.can_transition(State::CardPresent));
    }
}
