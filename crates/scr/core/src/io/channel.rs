//! In-process wire backed by crossbeam channels
//!
//! [`channel_pair`] returns the reader side ([`ChannelIo`], which implements
//! [`ByteIo`]) and the card side ([`CardLink`]). The card side can run on its
//! own thread, which makes this the wire of choice for the CLI simulator and
//! for exercising the session worker with real blocking reads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use tracing::trace;

use super::{AbortHandle, ByteIo, IoError, UartConfig};

/// Reader end of an in-process wire
#[derive(Debug)]
pub struct ChannelIo {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    buffered: VecDeque<u8>,
    abort: AbortHandle,
    abort_rx: Receiver<()>,
    config: UartConfig,
}

/// Card end of an in-process wire
#[derive(Debug, Clone)]
pub struct CardLink {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Create a connected reader/card pair
pub fn channel_pair() -> (ChannelIo, CardLink) {
    let (to_card, from_reader) = unbounded();
    let (to_reader, from_card) = unbounded();
    let (abort, abort_rx) = AbortHandle::pair();
    (
        ChannelIo {
            tx: to_card,
            rx: from_card,
            buffered: VecDeque::new(),
            abort,
            abort_rx,
            config: UartConfig::default(),
        },
        CardLink {
            tx: to_reader,
            rx: from_reader,
        },
    )
}

impl ChannelIo {
    /// Most recently applied serial configuration
    pub const fn config(&self) -> &UartConfig {
        &self.config
    }
}

impl CardLink {
    /// Send bytes towards the reader
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), IoError> {
        self.tx.send(data.into()).map_err(|_| IoError::Disconnected)
    }

    /// Wait for the next frame written by the reader
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, IoError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => IoError::Timeout,
            RecvTimeoutError::Disconnected => IoError::Disconnected,
        })
    }

    /// Wait for the next frame written by the reader with no deadline
    pub fn recv(&self) -> Result<Vec<u8>, IoError> {
        self.rx.recv().map_err(|_| IoError::Disconnected)
    }
}

impl ByteIo for ChannelIo {
    fn do_read(&mut self, buf: &mut [u8], exact_len: usize, timeout_ms: u32) -> Result<usize, IoError> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));

        while self.buffered.len() < exact_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(IoError::Timeout);
            }
            select! {
                recv(self.abort_rx) -> _ => return Err(IoError::Aborted),
                recv(self.rx) -> msg => match msg {
                    Ok(chunk) => self.buffered.extend(chunk),
                    Err(_) => return Err(IoError::Disconnected),
                },
                default(remaining) => return Err(IoError::Timeout),
            }
        }

        for (slot, byte) in buf.iter_mut().zip(self.buffered.drain(..exact_len)) {
            *slot = byte;
        }
        self.config.convention.transcode(&mut buf[..exact_len]);
        Ok(exact_len)
    }

    fn do_write(&mut self, buf: &[u8], _timeout_ms: u32) -> Result<usize, IoError> {
        if self.abort_rx.try_recv().is_ok() {
            return Err(IoError::Aborted);
        }
        let mut line = buf.to_vec();
        self.config.convention.transcode(&mut line);
        self.tx.send(line).map_err(|_| IoError::Disconnected)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        let mut stale = self.buffered.len();
        self.buffered.clear();
        while let Ok(chunk) = self.rx.try_recv() {
            stale += chunk.len();
        }
        while self.abort_rx.try_recv().is_ok() {}
        if stale > 0 {
            trace!(stale, "Discarded stale input");
        }
        Ok(())
    }

    fn configure(&mut self, config: &UartConfig) -> Result<(), IoError> {
        self.config = *config;
        Ok(())
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_echo_across_threads() {
        let (mut io, card) = channel_pair();
        let card_thread = thread::spawn(move || {
            let frame = card.recv().unwrap();
            card.send(frame).unwrap();
        });

        io.write(&[0x00, 0xA4, 0x04, 0x00], 100).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf, 4, 1000), Ok(4));
        assert_eq!(buf, [0x00, 0xA4, 0x04, 0x00]);
        card_thread.join().unwrap();
    }

    #[test]
    fn test_timeout_and_flush() {
        let (mut io, card) = channel_pair();
        let mut buf = [0u8; 2];
        card.send([0x90]).unwrap();
        assert_eq!(io.read(&mut buf, 2, 20), Err(IoError::Timeout));

        card.send([0x6A, 0x82]).unwrap();
        io.flush().unwrap();
        assert_eq!(io.read(&mut buf, 1, 20), Err(IoError::Timeout));
    }

    #[test]
    fn test_abort_interrupts_read() {
        let (mut io, _card) = channel_pair();
        let handle = io.abort_handle();
        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.abort();
        });
        let mut buf = [0u8; 1];
        assert_eq!(io.read(&mut buf, 1, 10_000), Err(IoError::Aborted));
        aborter.join().unwrap();
    }
}
