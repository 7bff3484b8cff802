//! Deterministic byte wire with a virtual clock
//!
//! [`ScriptedIo`] replays queued card output and lets a responder closure
//! react to every frame the reader writes. Time only advances through the
//! per-chunk arrival delays, write stalls and [`ByteIo::pause`], so timeout
//! behaviour is exact and tests never sleep.
//!
//! Once the reader programs the inverse convention, written frames are
//! recorded and handed to the responder in their line form and queued card
//! output is decoded on the way in.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use super::{AbortHandle, ByteIo, IoError, UartConfig};
use crate::atr::BitConvention;

/// Bytes sent by the card after a delay measured from the previous arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    /// Milliseconds before the first byte is available
    pub delay_ms: u32,
    /// The bytes themselves
    pub data: Vec<u8>,
}

impl Arrival {
    /// Bytes available immediately
    pub fn now(data: impl Into<Vec<u8>>) -> Self {
        Self {
            delay_ms: 0,
            data: data.into(),
        }
    }

    /// Bytes available after `delay_ms`
    pub fn after(delay_ms: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            delay_ms,
            data: data.into(),
        }
    }
}

/// Card side behaviour: called with every written frame, returns the card's reply
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Arrival> + Send>;

/// Scripted implementation of [`ByteIo`]
pub struct ScriptedIo {
    pending: VecDeque<Arrival>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    configs: Vec<UartConfig>,
    abort: AbortHandle,
    abort_rx: Receiver<()>,
    origin: Instant,
    elapsed_ms: u64,
    write_stall_ms: u32,
}

impl fmt::Debug for ScriptedIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedIo")
            .field("pending", &self.pending)
            .field("written", &self.written.len())
            .field("has_responder", &self.responder.is_some())
            .field("elapsed_ms", &self.elapsed_ms)
            .field("write_stall_ms", &self.write_stall_ms)
            .finish()
    }
}

impl Default for ScriptedIo {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedIo {
    /// Create an empty wire
    pub fn new() -> Self {
        let (abort, abort_rx) = AbortHandle::pair();
        Self {
            pending: VecDeque::new(),
            written: Vec::new(),
            responder: None,
            configs: Vec::new(),
            abort,
            abort_rx,
            origin: Instant::now(),
            elapsed_ms: 0,
            write_stall_ms: 0,
        }
    }

    /// Create a wire driven by a card responder
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Arrival> + Send + 'static,
    {
        let mut io = Self::new();
        io.responder = Some(Box::new(responder));
        io
    }

    /// Queue bytes that are available immediately
    pub fn push(&mut self, data: impl Into<Vec<u8>>) -> &mut Self {
        self.pending.push_back(Arrival::now(data));
        self
    }

    /// Queue bytes that arrive after `delay_ms`
    pub fn push_after(&mut self, delay_ms: u32, data: impl Into<Vec<u8>>) -> &mut Self {
        self.pending.push_back(Arrival::after(delay_ms, data));
        self
    }

    /// Make every following write take `ms` to leave the reader
    ///
    /// A write whose timeout is not longer than the stall fails with
    /// [`IoError::Timeout`] and never reaches the card.
    pub const fn stall_writes(&mut self, ms: u32) -> &mut Self {
        self.write_stall_ms = ms;
        self
    }

    /// Every frame written so far, one entry per write call, in line form
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    /// Serial configurations applied so far
    pub fn configs(&self) -> &[UartConfig] {
        &self.configs
    }

    /// Virtual milliseconds spent waiting, writing or pausing
    pub const fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Bytes still queued on the card side
    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(|a| a.data.len()).sum()
    }

    fn convention(&self) -> BitConvention {
        self.configs.last().map_or(BitConvention::Direct, |config| config.convention)
    }

    /// Let `ms` pass on the virtual clock; the next arrival gets closer
    fn advance(&mut self, ms: u32) {
        self.elapsed_ms += u64::from(ms);
        if let Some(front) = self.pending.front_mut() {
            front.delay_ms = front.delay_ms.saturating_sub(ms);
        }
    }
}

impl ByteIo for ScriptedIo {
    fn do_read(&mut self, buf: &mut [u8], exact_len: usize, timeout_ms: u32) -> Result<usize, IoError> {
        if self.abort_rx.try_recv().is_ok() {
            return Err(IoError::Aborted);
        }

        let mut waited: u32 = 0;
        let mut collected = 0;
        while collected < exact_len {
            let Some(front) = self.pending.front_mut() else {
                self.elapsed_ms += u64::from(timeout_ms.saturating_sub(waited));
                return Err(IoError::Timeout);
            };

            if front.delay_ms > 0 {
                let budget = timeout_ms.saturating_sub(waited);
                if front.delay_ms >= budget {
                    // The bytes are still in flight when the reader gives up
                    front.delay_ms -= budget;
                    self.elapsed_ms += u64::from(budget);
                    return Err(IoError::Timeout);
                }
                waited += front.delay_ms;
                self.elapsed_ms += u64::from(front.delay_ms);
                front.delay_ms = 0;
            }

            let take = (exact_len - collected).min(front.data.len());
            buf[collected..collected + take].copy_from_slice(&front.data[..take]);
            front.data.drain(..take);
            collected += take;
            if front.data.is_empty() {
                self.pending.pop_front();
            }
        }
        self.convention().transcode(&mut buf[..collected]);
        Ok(collected)
    }

    fn do_write(&mut self, buf: &[u8], timeout_ms: u32) -> Result<usize, IoError> {
        if self.abort_rx.try_recv().is_ok() {
            return Err(IoError::Aborted);
        }
        if self.write_stall_ms > 0 && self.write_stall_ms >= timeout_ms {
            self.advance(timeout_ms);
            return Err(IoError::Timeout);
        }
        self.advance(self.write_stall_ms);

        let mut line = buf.to_vec();
        self.convention().transcode(&mut line);
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(&line);
            self.pending.extend(replies);
        }
        self.written.push(line);
        Ok(buf.len())
    }

    /// Queued arrivals model future card output, so only stale aborts are dropped
    fn flush(&mut self) -> Result<(), IoError> {
        while self.abort_rx.try_recv().is_ok() {}
        Ok(())
    }

    fn configure(&mut self, config: &UartConfig) -> Result<(), IoError> {
        self.configs.push(*config);
        Ok(())
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn now(&self) -> Instant {
        self.origin + Duration::from_millis(self.elapsed_ms)
    }

    fn pause(&mut self, duration: Duration) {
        let ms = duration.as_micros().div_ceil(1000);
        self.advance(u32::try_from(ms).unwrap_or(u32::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_just_inside_timeout() {
        let mut io = ScriptedIo::new();
        io.push_after(99, [0x90, 0x00]);
        let mut buf = [0u8; 2];
        assert_eq!(io.read(&mut buf, 2, 100), Ok(2));
        assert_eq!(buf, [0x90, 0x00]);
        assert_eq!(io.elapsed_ms(), 99);
    }

    #[test]
    fn test_read_past_timeout() {
        let mut io = ScriptedIo::new();
        io.push_after(101, [0x90]);
        let mut buf = [0u8; 1];
        assert_eq!(io.read(&mut buf, 1, 100), Err(IoError::Timeout));
        // The byte is still on its way and shows up on the next read
        assert_eq!(io.read(&mut buf, 1, 100), Ok(1));
        assert_eq!(buf[0], 0x90);
    }

    #[test]
    fn test_read_spans_chunks() {
        let mut io = ScriptedIo::new();
        io.push([0x01]).push_after(10, [0x02, 0x03]);
        let mut buf = [0u8; 3];
        assert_eq!(io.read(&mut buf, 3, 50), Ok(3));
        assert_eq!(buf, [0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_responder_and_abort() {
        let mut io = ScriptedIo::with_responder(|frame| vec![Arrival::now(frame.to_vec())]);
        io.write(&[0xAA, 0x55], 10).unwrap();
        assert_eq!(io.written(), &[vec![0xAA, 0x55]]);

        io.abort_handle().abort();
        let mut buf = [0u8; 2];
        assert_eq!(io.read(&mut buf, 2, 10), Err(IoError::Aborted));
        assert_eq!(io.read(&mut buf, 2, 10), Ok(2));
    }

    #[test]
    fn test_stalled_write_times_out() {
        let mut io = ScriptedIo::with_responder(|_| vec![Arrival::now([0x90, 0x00])]);
        io.stall_writes(40);
        assert_eq!(io.write(&[0x00, 0xA4], 40), Err(IoError::Timeout));
        assert!(io.written().is_empty());
        assert_eq!(io.elapsed_ms(), 40);

        assert_eq!(io.write(&[0x00, 0xA4], 41), Ok(2));
        assert_eq!(io.elapsed_ms(), 80);
        assert_eq!(io.pending_len(), 2);
    }

    #[test]
    fn test_pause_moves_virtual_clock() {
        let mut io = ScriptedIo::new();
        io.push_after(30, [0x61]);
        let start = io.now();
        io.pause(Duration::from_millis(20));
        assert_eq!(io.now() - start, Duration::from_millis(20));
        assert_eq!(io.elapsed_ms(), 20);

        // Only 10 ms of the delay are left
        let mut buf = [0u8; 1];
        assert_eq!(io.read(&mut buf, 1, 11), Ok(1));
        assert_eq!(io.elapsed_ms(), 30);
    }

    #[test]
    fn test_inverse_line_is_transcoded() {
        let mut io = ScriptedIo::with_responder(|frame| vec![Arrival::now(frame.to_vec())]);
        io.configure(&UartConfig {
            convention: BitConvention::Inverse,
            ..UartConfig::default()
        })
        .unwrap();
        io.write(&[0x3F, 0x00], 10).unwrap();
        assert_eq!(io.written(), &[vec![0x03, 0xFF]]);

        let mut buf = [0u8; 2];
        assert_eq!(io.read(&mut buf, 2, 10), Ok(2));
        assert_eq!(buf, [0x3F, 0x00]);
    }
}
