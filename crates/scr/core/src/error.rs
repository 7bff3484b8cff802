//! Core error type for all protocol operations
//!
//! Every engine in the crate reports through [`ProtocolError`]. Recoverable
//! conditions (T=1 checksum errors and timeouts) are retried inside the engine
//! that produced them; only exhausted recovery ever reaches the caller.

use crate::io::IoError;
use crate::session::State;

/// Faults found while decoding an Answer-To-Reset
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum AtrError {
    /// TS is neither direct (3B) nor inverse (3F) convention
    #[error("invalid initial character {0:#04x}")]
    InvalidTs(u8),

    /// The interface bytes announce more bytes than were received
    #[error("ATR truncated: needed {needed} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the announced structure
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Trailing bytes do not match the historical count plus TCK
    #[error("ATR length mismatch: {remaining} trailing bytes for {history} historical bytes")]
    LengthMismatch {
        /// Bytes left after the interface bytes
        remaining: usize,
        /// Declared number of historical bytes (K)
        history: usize,
    },

    /// TCK is required but absent
    #[error("ATR check byte missing")]
    MissingTck,

    /// XOR over T0..TCK is not zero
    #[error("ATR checksum mismatch (residue {0:#04x})")]
    Checksum(u8),

    /// Reserved clock rate conversion index
    #[error("reserved Fi index {0}")]
    RfuFi(u8),

    /// Reserved baud rate adjustment index
    #[error("reserved Di index {0}")]
    RfuDi(u8),

    /// More than the ISO maximum of 33 bytes
    #[error("ATR too long ({0} bytes)")]
    TooLong(usize),
}

/// Core error type that encompasses all protocol failures
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    //
    // ATR / PPS
    //
    /// Malformed or badly checksummed ATR
    #[error("Invalid ATR: {0}")]
    InvalidAtr(#[from] AtrError),

    /// PPS response does not confirm the request
    #[error("PPS rejected: {0}")]
    PpsRejected(&'static str),

    //
    // Transmission protocols
    //
    /// T=0 procedure byte that is neither ACK, NULL nor SW1
    #[error("Invalid procedure byte {0:#04x}")]
    InvalidProcedureByte(u8),

    /// EDC (CRC or LRC) mismatch
    #[error("Checksum error")]
    ChecksumError,

    /// Character or block waiting time exceeded
    #[error("Operation timed out")]
    Timeout,

    /// T=1 resynchronisation exhausted
    #[error("Unrecoverable protocol error")]
    Unrecoverable,

    /// Cancelled by the user or by the card
    #[error("Operation aborted")]
    Aborted,

    /// The APDU cannot be mapped to any ISO 7816-4 case
    #[error("Invalid APDU: {0}")]
    InvalidApdu(&'static str),

    /// The protocol is not implemented by this engine
    #[error("Unsupported protocol T={0}")]
    UnsupportedProtocol(u8),

    //
    // Session
    //
    /// Command issued while the session cannot accept it
    #[error("Session not ready (state {0})")]
    NotReady(State),

    /// Rejected state machine transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: State,
        /// Requested state
        to: State,
    },

    /// No card in the slot
    #[error("No card present")]
    NoCard,

    /// Byte I/O failure other than timeout or abort
    #[error("I/O error: {0}")]
    Io(IoError),

    //
    // General errors
    //
    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },
}

impl ProtocolError {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the card may have lost track of the protocol state
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self.root(), Self::Unrecoverable | Self::NoCard)
    }
}

impl From<IoError> for ProtocolError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Timeout => Self::Timeout,
            IoError::Aborted => Self::Aborted,
            other => Self::Io(other),
        }
    }
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Extension trait for Result with protocol errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<S: Into<String>>(self, context: S) -> Self {
        self.map_err(|e| e.with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        assert_eq!(ProtocolError::from(IoError::Timeout), ProtocolError::Timeout);
        assert_eq!(ProtocolError::from(IoError::Aborted), ProtocolError::Aborted);
        assert_eq!(
            ProtocolError::from(IoError::Disconnected),
            ProtocolError::Io(IoError::Disconnected)
        );
    }

    #[test]
    fn test_context_root() {
        let err: Result<()> = Err(ProtocolError::Unrecoverable);
        let err = err.context("T=1 transfer").unwrap_err();
        assert_eq!(err.root(), &ProtocolError::Unrecoverable);
        assert!(err.is_fatal_to_session());
        assert_eq!(err.to_string(), "T=1 transfer: Unrecoverable protocol error");
    }
}
