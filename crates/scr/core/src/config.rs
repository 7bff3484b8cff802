//! Configuration options for a card session

use crate::t1::DEFAULT_IFSD;
use crate::timing::{INITIAL_BAUD_RATE, WWT_TOLERANCE_MS};

/// Source clock of a typical set-top box smart-card interface
pub const DEFAULT_CLOCK_FREQUENCY: u32 = 27_000_000;
/// Transfer timeout used when the caller passes zero
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u32 = 3000;
/// Pending requests accepted by the session worker
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Which personality drives the interface parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// Plain ISO/IEC 7816-3 behaviour
    #[default]
    Iso,
    /// Conditional access card with vendor adjustments
    ///
    /// No vendor personality ships with this crate. The type only enables the
    /// Fi/Di and ETU hooks of the personality injected through
    /// [`Session::with_personality`](crate::Session::with_personality).
    Ca,
}

/// Delays of the activation sequence in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTiming {
    /// Minimum time the card stays unpowered before a cold reset
    pub deactivation_ms: u64,
    /// VCC settling time before the clock starts
    pub vcc_settle_ms: u64,
    /// Time RST is held low with the clock running
    pub rst_low_ms: u64,
}

impl ResetTiming {
    /// No delays, for simulated cards
    pub const IMMEDIATE: Self = Self {
        deactivation_ms: 0,
        vcc_settle_ms: 0,
        rst_low_ms: 0,
    };
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            deactivation_ms: 10,
            vcc_settle_ms: 2,
            rst_low_ms: 11,
        }
    }
}

/// Configuration options for a card session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Frequency of the reader clock feeding the card clock divider (Hz)
    pub clock_frequency: u32,

    /// Baud rate while the ATR is read
    pub initial_baud_rate: u32,

    /// Personality selection
    pub device_type: DeviceType,

    /// The slot can switch between voltage classes
    pub dual_class: bool,

    /// T=1 node address
    pub nad: u8,

    /// Information field size announced by the reader
    pub ifsd: u8,

    /// Non-ISO bytes some card families append to the ATR
    pub extra_atr_bytes: usize,

    /// Activation sequence delays
    pub reset_timing: ResetTiming,

    /// Depth of the worker request queue
    pub queue_depth: usize,

    /// Margin added to the work waiting time
    pub wwt_tolerance_ms: u32,

    /// Timeout used when a transfer passes zero
    pub default_timeout_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock_frequency: DEFAULT_CLOCK_FREQUENCY,
            initial_baud_rate: INITIAL_BAUD_RATE,
            device_type: DeviceType::Iso,
            dual_class: false,
            nad: 0,
            ifsd: DEFAULT_IFSD,
            extra_atr_bytes: 0,
            reset_timing: ResetTiming::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            wwt_tolerance_ms: WWT_TOLERANCE_MS,
            default_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reader clock frequency
    pub const fn with_clock_frequency(mut self, hz: u32) -> Self {
        self.clock_frequency = hz;
        self
    }

    /// Set the baud rate used during reset
    pub const fn with_initial_baud_rate(mut self, baud_rate: u32) -> Self {
        self.initial_baud_rate = baud_rate;
        self
    }

    /// Set the device type
    pub const fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Enable retrying a failed reset in the other voltage class
    pub const fn with_dual_class(mut self, dual_class: bool) -> Self {
        self.dual_class = dual_class;
        self
    }

    /// Set the T=1 node address
    pub const fn with_nad(mut self, nad: u8) -> Self {
        self.nad = nad;
        self
    }

    /// Set the reader information field size
    pub const fn with_ifsd(mut self, ifsd: u8) -> Self {
        self.ifsd = ifsd;
        self
    }

    /// Set the number of non-ISO trailing ATR bytes
    pub const fn with_extra_atr_bytes(mut self, count: usize) -> Self {
        self.extra_atr_bytes = count;
        self
    }

    /// Set the activation delays
    pub const fn with_reset_timing(mut self, timing: ResetTiming) -> Self {
        self.reset_timing = timing;
        self
    }

    /// Set the worker queue depth
    pub const fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the work waiting time tolerance
    pub const fn with_wwt_tolerance(mut self, ms: u32) -> Self {
        self.wwt_tolerance_ms = ms;
        self
    }

    /// Set the transfer timeout used when none is given
    pub const fn with_default_timeout(mut self, ms: u32) -> Self {
        self.default_timeout_ms = ms;
        self
    }
}
