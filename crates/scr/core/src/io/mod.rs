//! Byte I/O traits for the UART connected to the card
//!
//! The engines in this crate never touch hardware. Every byte goes through a
//! [`ByteIo`] implementation which owns the timeout and abort semantics of the
//! underlying serial line.

pub mod channel;
pub mod error;
pub mod script;

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
pub use error::IoError;
use tracing::{debug, trace};

use crate::atr::BitConvention;

/// Serial line parameters programmed by the session worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    /// Bits per second
    pub baud_rate: u32,
    /// Guard ETUs appended to each character (N)
    pub stop_bits: u32,
    /// Parity error signalling and character repetition (T=0 only)
    pub nack: bool,
    /// Bit convention used to decode received characters
    pub convention: BitConvention,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baud_rate: crate::timing::INITIAL_BAUD_RATE,
            stop_bits: crate::timing::DEFAULT_N,
            nack: false,
            convention: BitConvention::Direct,
        }
    }
}

/// Cancels the operation currently blocked on a [`ByteIo`]
///
/// The handle can be cloned and moved to any thread.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Sender<()>,
}

impl AbortHandle {
    /// Create a handle/receiver pair. The receiver is polled by the I/O side.
    pub fn pair() -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(1);
        (Self { tx }, rx)
    }

    /// Interrupt the pending read or write
    pub fn abort(&self) {
        match self.tx.try_send(()) {
            Ok(()) => debug!("Abort requested"),
            // An abort is already pending
            Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => trace!("Abort after I/O was dropped"),
        }
    }
}

/// Trait for the byte level serial channel to the card
///
/// Implementations block until `exact_len` bytes have been received or the
/// timeout expires. Data that arrives after `d` milliseconds satisfies a read
/// with `timeout_ms` if and only if `d < timeout_ms`; partial data on timeout
/// is discarded by the caller.
pub trait ByteIo: Send + fmt::Debug {
    /// Read exactly `exact_len` bytes into `buf`
    fn read(&mut self, buf: &mut [u8], exact_len: usize, timeout_ms: u32) -> Result<usize, IoError> {
        if exact_len > buf.len() {
            return Err(IoError::device("read length exceeds buffer"));
        }
        let result = self.do_read(buf, exact_len, timeout_ms);
        match &result {
            Ok(n) => trace!(rx = %hex::encode(&buf[..*n]), "Received bytes"),
            Err(e) => debug!(error = ?e, exact_len, timeout_ms, "Read failed"),
        }
        result
    }

    /// Write all of `buf`
    fn write(&mut self, buf: &[u8], timeout_ms: u32) -> Result<usize, IoError> {
        trace!(tx = %hex::encode(buf), "Transmitting bytes");
        let result = self.do_write(buf, timeout_ms);
        if let Err(e) = &result {
            debug!(error = ?e, "Write failed");
        }
        result
    }

    /// Read a single byte
    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, IoError> {
        let mut byte = [0u8; 1];
        self.read(&mut byte, 1, timeout_ms)?;
        Ok(byte[0])
    }

    /// Implementation of [`ByteIo::read`]
    fn do_read(&mut self, buf: &mut [u8], exact_len: usize, timeout_ms: u32) -> Result<usize, IoError>;

    /// Implementation of [`ByteIo::write`]
    fn do_write(&mut self, buf: &[u8], timeout_ms: u32) -> Result<usize, IoError>;

    /// Discard pending input and any stale abort request
    fn flush(&mut self) -> Result<(), IoError>;

    /// Reprogram the serial line
    fn configure(&mut self, config: &UartConfig) -> Result<(), IoError>;

    /// Handle that interrupts a blocked read or write from another thread
    fn abort_handle(&self) -> AbortHandle;

    /// Current time as seen by the line
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Keep the line idle for `duration`
    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

impl<T: ByteIo + ?Sized> ByteIo for Box<T> {
    fn do_read(&mut self, buf: &mut [u8], exact_len: usize, timeout_ms: u32) -> Result<usize, IoError> {
        (**self).do_read(buf, exact_len, timeout_ms)
    }

    fn do_write(&mut self, buf: &[u8], timeout_ms: u32) -> Result<usize, IoError> {
        (**self).do_write(buf, timeout_ms)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        (**self).flush()
    }

    fn configure(&mut self, config: &UartConfig) -> Result<(), IoError> {
        (**self).configure(config)
    }

    fn abort_handle(&self) -> AbortHandle {
        (**self).abort_handle()
    }

    fn now(&self) -> Instant {
        (**self).now()
    }

    fn pause(&mut self, duration: Duration) {
        (**self).pause(duration);
    }
}
