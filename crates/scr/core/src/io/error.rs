//! Error types specific to the byte I/O channel

use thiserror::Error;

/// Byte I/O error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// The requested bytes did not arrive within the timeout
    #[error("Operation timed out")]
    Timeout,

    /// The pending operation was interrupted by an abort request
    #[error("Operation aborted")]
    Aborted,

    /// The other end of the channel has gone away
    #[error("Channel disconnected")]
    Disconnected,

    /// Device level failure reported by the UART driver
    #[error("Device error: {0}")]
    Device(String),
}

impl IoError {
    /// Create a new device error
    pub fn device<S: Into<String>>(message: S) -> Self {
        Self::Device(message.into())
    }

    /// Check if this is a timeout
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
