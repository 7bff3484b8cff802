//! Electrical contacts of the card slot
//!
//! VCC, RST, CLK and the class selection line are driven through
//! [`CardContacts`] by the reset and deactivation sequences.

use std::fmt;

use derive_more::Display;
use tracing::trace;

use crate::io::IoError;

/// Operating voltage class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum VoltageClass {
    /// 5 V
    #[default]
    #[display("class A")]
    A,
    /// 3 V
    #[display("class B")]
    B,
    /// 1.8 V
    #[display("class C")]
    C,
}

impl VoltageClass {
    /// The class tried when a dual-class slot retries a failed reset
    pub const fn toggled(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B | Self::C => Self::A,
        }
    }
}

/// Control of the slot's contacts
pub trait CardContacts: Send + fmt::Debug {
    /// Card detect switch
    fn card_present(&self) -> bool;

    /// Power the card
    fn set_vcc(&mut self, on: bool) -> Result<(), IoError>;

    /// Drive RST high (`true`) or low
    fn set_reset(&mut self, high: bool) -> Result<(), IoError>;

    /// Run the card clock at `frequency` or stop it
    fn set_clock(&mut self, frequency: Option<u32>) -> Result<(), IoError>;

    /// Select the supply voltage
    fn select_class(&mut self, class: VoltageClass) -> Result<(), IoError>;
}

/// A single contact operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactEvent {
    /// VCC switched
    Vcc(bool),
    /// RST driven
    Reset(bool),
    /// Clock started or stopped
    Clock(Option<u32>),
    /// Voltage class selected
    Class(VoltageClass),
}

/// In-memory contacts that record every operation
#[derive(Debug, Clone, Default)]
pub struct StaticContacts {
    present: bool,
    events: Vec<ContactEvent>,
}

impl StaticContacts {
    /// Contacts for a slot with or without a card
    pub const fn new(present: bool) -> Self {
        Self {
            present,
            events: Vec::new(),
        }
    }

    /// Change the detect switch
    pub const fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    /// Operations performed so far
    pub fn events(&self) -> &[ContactEvent] {
        &self.events
    }

    fn record(&mut self, event: ContactEvent) {
        trace!(?event, "Contact");
        self.events.push(event);
    }
}

impl CardContacts for StaticContacts {
    fn card_present(&self) -> bool {
        self.present
    }

    fn set_vcc(&mut self, on: bool) -> Result<(), IoError> {
        self.record(ContactEvent::Vcc(on));
        Ok(())
    }

    fn set_reset(&mut self, high: bool) -> Result<(), IoError> {
        self.record(ContactEvent::Reset(high));
        Ok(())
    }

    fn set_clock(&mut self, frequency: Option<u32>) -> Result<(), IoError> {
        self.record(ContactEvent::Clock(frequency));
        Ok(())
    }

    fn select_class(&mut self, class: VoltageClass) -> Result<(), IoError> {
        self.record(ContactEvent::Class(class));
        Ok(())
    }
}

impl<T: CardContacts + ?Sized> CardContacts for Box<T> {
    fn card_present(&self) -> bool {
        (**self).card_present()
    }

    fn set_vcc(&mut self, on: bool) -> Result<(), IoError> {
        (**self).set_vcc(on)
    }

    fn set_reset(&mut self, high: bool) -> Result<(), IoError> {
        (**self).set_reset(high)
    }

    fn set_clock(&mut self, frequency: Option<u32>) -> Result<(), IoError> {
        (**self).set_clock(frequency)
    }

    fn select_class(&mut self, class: VoltageClass) -> Result<(), IoError> {
        (**self).select_class(class)
    }
}
