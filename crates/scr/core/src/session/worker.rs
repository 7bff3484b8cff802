//! Session worker thread
//!
//! All requests for a slot are processed in order on one thread. Aborts
//! bypass the queue: they go straight to the [`AbortHandle`] of the byte
//! channel so that a blocked read returns immediately.

use std::thread;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, trace};

use super::event::{PresenceEvent, Reply, Request, reply_channel};
use super::{ResetKind, Session, State};
use crate::atr::AtrResponse;
use crate::capabilities::Capabilities;
use crate::contacts::CardContacts;
use crate::error::{ProtocolError, Result};
use crate::io::{AbortHandle, ByteIo, IoError};
use crate::pps::MAX_PPS_LEN;

/// Spawns session workers
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionWorker;

impl SessionWorker {
    /// Move `session` onto a dedicated thread
    pub fn spawn<I, C>(session: Session<I, C>) -> Result<SessionHandle>
    where
        I: ByteIo + 'static,
        C: CardContacts + 'static,
    {
        let (tx, rx) = bounded(session.config().queue_depth.max(1));
        let abort = session.abort_handle();
        thread::Builder::new()
            .name("scr-session".into())
            .spawn(move || run(session, rx))
            .map_err(|e| ProtocolError::Io(IoError::device(e.to_string())))?;
        Ok(SessionHandle { tx, abort })
    }
}

fn run<I: ByteIo, C: CardContacts>(mut session: Session<I, C>, rx: Receiver<Request>) {
    debug!("Session worker started");
    while let Ok(request) = rx.recv() {
        trace!(?request, "Processing request");
        match request {
            Request::Reset(kind, reply) => {
                let _ = reply.send(session.reset(kind));
            }
            Request::Pps(frame, reply) => {
                let _ = reply.send(session.negotiate_pps(frame));
            }
            Request::Transfer(apdu, timeout_ms, reply) => {
                let _ = reply.send(session.transfer(&apdu, timeout_ms));
            }
            Request::NegotiateIfsd(ifsd, reply) => {
                let _ = reply.send(session.negotiate_ifsd(ifsd));
            }
            Request::ChangeClock(frequency, reply) => {
                let _ = reply.send(session.change_clock_frequency(frequency));
            }
            Request::Deactivate(reply) => {
                let _ = reply.send(session.deactivate());
            }
            Request::Suspend(reply) => {
                let _ = reply.send(session.suspend());
            }
            Request::Resume(reply) => {
                let _ = reply.send(session.resume());
            }
            Request::Capabilities(reply) => {
                let _ = reply.send(session.capabilities().clone());
            }
            Request::State(reply) => {
                let _ = reply.send(session.state());
            }
            Request::LastError(reply) => {
                let _ = reply.send(session.last_error().cloned());
            }
            Request::Presence(event) => {
                if let Err(err) = session.presence(event) {
                    debug!(%err, ?event, "Presence change rejected");
                }
            }
            Request::Close(reply) => {
                let _ = reply.send(session.close());
                break;
            }
        }
    }
    debug!("Session worker stopped");
}

/// Client side of a session worker
///
/// Handles are cheap to clone; every clone talks to the same worker.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: Sender<Request>,
    abort: AbortHandle,
}

impl SessionHandle {
    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, rx) = reply_channel();
        self.tx.send(build(reply)).map_err(|_| ProtocolError::Io(IoError::Disconnected))?;
        rx.recv().map_err(|_| ProtocolError::Io(IoError::Disconnected))?
    }

    fn query<T>(&self, build: impl FnOnce(Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = bounded(1);
        self.tx.send(build(reply)).map_err(|_| ProtocolError::Io(IoError::Disconnected))?;
        rx.recv().map_err(|_| ProtocolError::Io(IoError::Disconnected))
    }

    /// Reset the card
    pub fn reset(&self, kind: ResetKind) -> Result<AtrResponse> {
        self.call(|reply| Request::Reset(kind, reply))
    }

    /// Negotiate protocol parameters
    pub fn negotiate_pps(&self, request: [u8; MAX_PPS_LEN]) -> Result<[u8; MAX_PPS_LEN]> {
        self.call(|reply| Request::Pps(request, reply))
    }

    /// Exchange an APDU or T=14 frame
    pub fn transfer(&self, apdu: &[u8], timeout_ms: u32) -> Result<Bytes> {
        let apdu = Bytes::copy_from_slice(apdu);
        self.call(|reply| Request::Transfer(apdu, timeout_ms, reply))
    }

    /// Announce the reader IFSD (T=1)
    pub fn negotiate_ifsd(&self, ifsd: u8) -> Result<u8> {
        self.call(|reply| Request::NegotiateIfsd(ifsd, reply))
    }

    /// Change the card clock
    pub fn change_clock_frequency(&self, frequency: u32) -> Result<u32> {
        self.call(|reply| Request::ChangeClock(frequency, reply))
    }

    /// Release the contacts
    pub fn deactivate(&self) -> Result<()> {
        self.call(Request::Deactivate)
    }

    /// Power the slot down
    pub fn suspend(&self) -> Result<()> {
        self.call(Request::Suspend)
    }

    /// Leave low power
    pub fn resume(&self) -> Result<()> {
        self.call(Request::Resume)
    }

    /// Current parameters
    pub fn get_capabilities(&self) -> Result<Capabilities> {
        self.query(Request::Capabilities)
    }

    /// Current state
    pub fn state(&self) -> Result<State> {
        self.query(Request::State)
    }

    /// Last unrecovered error
    pub fn last_error(&self) -> Result<Option<ProtocolError>> {
        self.query(Request::LastError)
    }

    /// Interrupt the operation in progress without queueing
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Deliver a card detect change
    ///
    /// A removal aborts any I/O in flight before the event is queued.
    pub fn notify_presence(&self, event: PresenceEvent) -> Result<()> {
        if !event.is_present() {
            self.abort.abort();
        }
        self.tx
            .send(Request::Presence(event))
            .map_err(|_| ProtocolError::Io(IoError::Disconnected))
    }

    /// Close the session and stop the worker
    pub fn close(&self) -> Result<()> {
        self.call(Request::Close)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ResetTiming, SessionConfig};
    use crate::contacts::StaticContacts;
    use crate::io::channel::{CardLink, channel_pair};

    fn spawn() -> (SessionHandle, CardLink) {
        let (io, card) = channel_pair();
        let config = SessionConfig::new()
            .with_clock_frequency(7_142_400)
            .with_reset_timing(ResetTiming::IMMEDIATE);
        let handle = SessionWorker::spawn(Session::new(io, StaticContacts::new(true), config)).unwrap();
        (handle, card)
    }

    /// The card answers once RST has been released
    fn reset_t0_card(handle: &SessionHandle, card: &CardLink) {
        let card = card.clone();
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            card.send([0x3B, 0x00]).unwrap();
        });
        handle.reset(ResetKind::Cold).unwrap();
        feeder.join().unwrap();
    }

    #[test]
    fn test_abort_interrupts_transfer() {
        let (handle, card) = spawn();
        reset_t0_card(&handle, &card);

        let worker = handle.clone();
        let pending = thread::spawn(move || worker.transfer(&[0x00, 0xA4, 0x04, 0x00, 0x00], 5000));
        // The command header reaches the card, which never answers
        assert_eq!(card.recv_timeout(Duration::from_secs(2)).unwrap(), vec![0x00, 0xA4, 0x04, 0x00, 0x00]);
        handle.abort();

        assert_eq!(pending.join().unwrap(), Err(ProtocolError::Aborted));
        assert_eq!(handle.state().unwrap(), State::Ready);
        assert_eq!(handle.last_error().unwrap(), None);
        handle.close().unwrap();
    }

    #[test]
    fn test_presence_reaches_worker() {
        let (handle, card) = spawn();
        reset_t0_card(&handle, &card);

        handle.notify_presence(PresenceEvent::Removed).unwrap();
        assert_eq!(handle.state().unwrap(), State::CardNotPresent);
        assert_eq!(
            handle.transfer(&[0x00, 0xA4, 0x04, 0x00, 0x00], 100),
            Err(ProtocolError::NoCard)
        );
        assert_eq!(handle.last_error().unwrap(), Some(ProtocolError::NoCard));

        handle.notify_presence(PresenceEvent::Inserted).unwrap();
        assert_eq!(handle.state().unwrap(), State::CardPresent);
        handle.close().unwrap();
    }
}
