//! T=1 exchange engine
//!
//! One [`T1Engine::transfer`] sends a command APDU as a chain of I-blocks and
//! collects the card's chained answer. Transmission errors are handled here
//! and never reach the caller while recovery is still possible:
//!
//! 1. a corrupt block is answered with R(EDC error), a missing one with
//!    R(other error), up to [`MAX_RETRIES`] times per block;
//! 2. then the link is resynchronised with S(RESYNCH), up to
//!    [`MAX_RESYNCH`] requests;
//! 3. after a successful resynchronisation the command is sent once more
//!    from its first block. Exhausting recovery again is
//!    [`ProtocolError::Unrecoverable`].

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, instrument, trace, warn};

use super::block::{Block, BlockKind, MAX_INF_LEN, PROLOGUE_LEN, RCode, SType};
use super::{MAX_RESYNCH, MAX_RETRIES, T1BlockContext};
use crate::error::{ProtocolError, Result};
use crate::io::ByteIo;

/// Why an exchange stopped
#[derive(Debug)]
enum Failure {
    /// Recovery reset the link; the command has to start over
    Resynchronised,
    /// Nothing more can be done for this command
    Fatal(ProtocolError),
}

impl From<ProtocolError> for Failure {
    fn from(err: ProtocolError) -> Self {
        Self::Fatal(err)
    }
}

impl From<crate::io::IoError> for Failure {
    fn from(err: crate::io::IoError) -> Self {
        Self::Fatal(err.into())
    }
}

type Step<T> = std::result::Result<T, Failure>;

/// Drives T=1 over a byte channel using a persistent link context
#[derive(Debug)]
pub struct T1Engine<'a, I: ByteIo + ?Sized> {
    io: &'a mut I,
    ctx: &'a mut T1BlockContext,
    timeout_ms: u32,
    last_rx: Option<Instant>,
}

impl<'a, I: ByteIo + ?Sized> T1Engine<'a, I> {
    /// Create an engine
    pub const fn new(io: &'a mut I, ctx: &'a mut T1BlockContext) -> Self {
        Self {
            io,
            ctx,
            timeout_ms: 0,
            last_rx: None,
        }
    }

    /// Bound every block transmission by `timeout_ms`
    ///
    /// Zero falls back to the work waiting time.
    pub const fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Exchange a command APDU and return the complete response
    #[instrument(level = "trace", skip_all, fields(len = apdu.len()))]
    pub fn transfer(&mut self, apdu: &[u8]) -> Result<Bytes> {
        match self.run(apdu) {
            Ok(response) => Ok(response),
            Err(Failure::Fatal(err)) => Err(err),
            Err(Failure::Resynchronised) => {
                warn!("Link resynchronised, restarting command");
                match self.run(apdu) {
                    Ok(response) => Ok(response),
                    Err(Failure::Fatal(err)) => Err(err),
                    Err(Failure::Resynchronised) => {
                        error!("Link lost again after resynchronisation");
                        Err(ProtocolError::Unrecoverable)
                    }
                }
            }
        }
    }

    /// Announce the reader's information field size with S(IFS)
    pub fn negotiate_ifsd(&mut self, ifsd: u8) -> Result<u8> {
        let ifsd = ifsd.clamp(1, MAX_INF_LEN as u8);
        let request = Block::supervisory(self.ctx.nad, SType::Ifs, false, Bytes::copy_from_slice(&[ifsd]));
        for attempt in 0..=MAX_RETRIES {
            match self.exchange(&request) {
                Ok(reply)
                    if matches!(
                        reply.kind(),
                        Ok(BlockKind::Supervisory {
                            kind: SType::Ifs,
                            response: true
                        })
                    ) && reply.data == request.data =>
                {
                    self.ctx.ifsd = usize::from(ifsd);
                    debug!(ifsd, "IFSD accepted");
                    return Ok(ifsd);
                }
                Ok(reply) => debug!(?reply, attempt, "Unexpected answer to S(IFS)"),
                Err(Failure::Resynchronised) => debug!(attempt, "Resynchronised during S(IFS)"),
                Err(Failure::Fatal(err)) => return Err(err),
            }
        }
        Err(ProtocolError::Unrecoverable)
    }

    fn run(&mut self, apdu: &[u8]) -> Step<Bytes> {
        self.ctx.bytes_read = 0;
        self.ctx.bytes_written = 0;
        let first = self.send_command(apdu)?;
        self.receive_response(first)
    }

    /// Send the command chain, returning the card's first I-block
    fn send_command(&mut self, apdu: &[u8]) -> Step<Block> {
        let mut offset = 0;
        loop {
            // IFSC may change between blocks through S(IFS)
            let end = (offset + self.ctx.ifsc).min(apdu.len());
            let chaining = end < apdu.len();
            let block = Block::information(
                self.ctx.nad,
                self.ctx.our_sequence,
                chaining,
                Bytes::copy_from_slice(&apdu[offset..end]),
            );

            let mut attempts = 0;
            loop {
                let answer = self.exchange(&block)?;
                match answer.kind()? {
                    BlockKind::Receive { sequence, .. } if chaining && sequence != self.ctx.our_sequence => {
                        trace!(sequence, "Chained block acknowledged");
                        break;
                    }
                    BlockKind::Information { .. } if !chaining => {
                        self.acknowledged(end - offset);
                        return Ok(answer);
                    }
                    kind => {
                        attempts += 1;
                        if attempts > MAX_RETRIES {
                            return Err(self.resynchronise());
                        }
                        debug!(?kind, attempts, "Retransmitting I-block");
                    }
                }
            }
            self.acknowledged(end - offset);
            offset = end;
        }
    }

    fn acknowledged(&mut self, len: usize) {
        self.ctx.our_sequence ^= 1;
        self.ctx.bytes_written += len;
        self.ctx.first_block = false;
    }

    /// Collect chained I-blocks until one arrives without the chaining bit
    fn receive_response(&mut self, first: Block) -> Step<Bytes> {
        let mut response = BytesMut::new();
        let mut block = first;
        let mut attempts = 0;
        loop {
            match block.kind()? {
                BlockKind::Information { sequence, chaining } if sequence == self.ctx.their_sequence => {
                    response.extend_from_slice(&block.data);
                    self.ctx.bytes_read += block.data.len();
                    self.ctx.their_sequence ^= 1;
                    attempts = 0;
                    if !chaining {
                        debug!(len = response.len(), "T=1 response complete");
                        return Ok(response.freeze());
                    }
                }
                kind => {
                    // A repeated I-block or a lost acknowledgement
                    attempts += 1;
                    if attempts > MAX_RETRIES {
                        return Err(self.resynchronise());
                    }
                    debug!(?kind, expected = self.ctx.their_sequence, "Block not accepted");
                }
            }
            let ack = Block::receive_ready(self.ctx.nad, self.ctx.their_sequence, RCode::NoError);
            block = self.exchange(&ack)?;
        }
    }

    /// Send one block and return the next valid answer that is not an S request
    fn exchange(&mut self, block: &Block) -> Step<Block> {
        self.send(block)?;
        let mut errors = 0;
        loop {
            let fault = match self.receive() {
                Ok(reply) => match reply.kind() {
                    Ok(BlockKind::Supervisory { kind, response: false }) => {
                        self.answer_request(&reply, kind)?;
                        continue;
                    }
                    Ok(_) => return Ok(reply),
                    Err(_) => RCode::OtherError,
                },
                Err(ProtocolError::ChecksumError) => RCode::EdcError,
                Err(ProtocolError::Timeout) => RCode::OtherError,
                Err(err) => return Err(Failure::Fatal(err)),
            };

            errors += 1;
            if errors > MAX_RETRIES {
                return Err(self.resynchronise());
            }
            let expected = if self.ctx.first_block { 0 } else { self.ctx.their_sequence };
            warn!(%fault, attempt = errors, "Requesting retransmission");
            self.send(&Block::receive_ready(self.ctx.nad, expected, fault))?;
        }
    }

    fn answer_request(&mut self, request: &Block, kind: SType) -> Step<()> {
        let reply = Block::supervisory(self.ctx.nad, kind, true, request.data.clone());
        match kind {
            SType::Wtx => {
                let multiplier = request.data.first().copied().unwrap_or(1).max(1);
                debug!(multiplier, "Waiting time extension");
                self.send(&reply)?;
                self.ctx.bwt_multiplier = u32::from(multiplier);
                Ok(())
            }
            SType::Ifs => {
                let ifsc = request.data.first().copied().unwrap_or(0);
                if ifsc == 0 || usize::from(ifsc) > MAX_INF_LEN {
                    warn!(ifsc, "Ignoring invalid IFSC");
                } else {
                    debug!(ifsc, "Card changed IFSC");
                    self.ctx.ifsc = usize::from(ifsc);
                }
                self.send(&reply)?;
                Ok(())
            }
            SType::Abort => {
                warn!("Card aborted the chain");
                self.send(&reply)?;
                Err(Failure::Fatal(ProtocolError::Aborted))
            }
            SType::Resynch => {
                warn!("Card requested resynchronisation");
                self.send(&reply)?;
                self.ctx.resynchronised();
                Err(Failure::Resynchronised)
            }
        }
    }

    fn resynchronise(&mut self) -> Failure {
        let request = Block::supervisory(self.ctx.nad, SType::Resynch, false, Bytes::new());
        for attempt in 1..=MAX_RESYNCH {
            warn!(attempt, "Sending S(RESYNCH)");
            if let Err(err) = self.send(&request) {
                if err == ProtocolError::Aborted {
                    return Failure::Fatal(err);
                }
                continue;
            }
            match self.receive() {
                Ok(reply)
                    if matches!(
                        reply.kind(),
                        Ok(BlockKind::Supervisory {
                            kind: SType::Resynch,
                            response: true
                        })
                    ) =>
                {
                    self.ctx.resynchronised();
                    return Failure::Resynchronised;
                }
                Ok(reply) => debug!(?reply, "Unexpected answer to S(RESYNCH)"),
                Err(ProtocolError::ChecksumError | ProtocolError::Timeout) => {}
                Err(err) => return Failure::Fatal(err),
            }
        }
        error!("Resynchronisation failed");
        Failure::Fatal(ProtocolError::Unrecoverable)
    }

    fn send(&mut self, block: &Block) -> Result<()> {
        // Block guard time runs from the last character received
        if let Some(last) = self.last_rx {
            let guard = Duration::from_millis(u64::from(self.ctx.timeouts.bgt_ms));
            let since = self.io.now().saturating_duration_since(last);
            if since < guard {
                self.io.pause(guard - since);
            }
        }
        let frame = block.encode(self.ctx.epilogue);
        trace!(pcb = block.pcb, len = block.data.len(), "Sending block");
        let timeout = if self.timeout_ms == 0 { self.ctx.timeouts.wwt_ms } else { self.timeout_ms };
        self.io.write(&frame, timeout)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Block> {
        let t = self.ctx.timeouts;
        let multiplier = std::mem::replace(&mut self.ctx.bwt_multiplier, 1);
        let first_wait = t.bwt_ms.saturating_mul(multiplier).saturating_add(t.cwt_ms).saturating_add(1);
        let char_wait = t.cwt_ms.saturating_add(1);

        let nad = self.io.read_byte(first_wait)?;
        let pcb = self.io.read_byte(char_wait)?;
        let len = self.io.read_byte(char_wait)?;
        if usize::from(len) > MAX_INF_LEN {
            self.last_rx = Some(self.io.now());
            return Err(ProtocolError::ChecksumError);
        }

        let rest = usize::from(len) + self.ctx.epilogue.size();
        let mut frame = vec![0u8; PROLOGUE_LEN + rest];
        frame[..PROLOGUE_LEN].copy_from_slice(&[nad, pcb, len]);
        let rest_wait = t.cwt_ms.saturating_mul(rest as u32).saturating_add(1);
        self.io.read(&mut frame[PROLOGUE_LEN..], rest, rest_wait)?;
        self.last_rx = Some(self.io.now());

        let block = Block::decode(&frame, self.ctx.epilogue)?;
        trace!(?block, "Received block");
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::parse_atr;
    use crate::io::script::{Arrival, ScriptedIo};
    use crate::t1::EpilogueKind;
    use crate::timing::compute_timeouts;

    fn context(epilogue: EpilogueKind) -> T1BlockContext {
        let atr = parse_atr(&hex::decode("3BF89600008131FE454A434F507632343132").unwrap()).unwrap();
        let timeouts = compute_timeouts(3_571_200, 1, 1, &atr).unwrap();
        let mut ctx = T1BlockContext::new(&atr, timeouts, 0, 254);
        ctx.epilogue = epilogue;
        ctx
    }

    fn frame(block: Block, epilogue: EpilogueKind) -> Arrival {
        Arrival::now(block.encode(epilogue).to_vec())
    }

    fn i_block(seq: u8, more: bool, data: &[u8]) -> Block {
        Block::information(0, seq, more, Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_single_block_exchange() {
        let mut ctx = context(EpilogueKind::Lrc);
        let mut io = ScriptedIo::new();
        io.push(i_block(0, false, &[0x90, 0x00]).encode(EpilogueKind::Lrc).to_vec());

        let response = T1Engine::new(&mut io, &mut ctx).transfer(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(response.as_ref(), &[0x90, 0x00]);
        assert_eq!((ctx.our_sequence, ctx.their_sequence), (1, 1));
        assert!(!ctx.first_block);
        assert_eq!(io.written()[0], vec![0x00, 0x00, 0x04, 0x00, 0xA4, 0x04, 0x00, 0xA4]);
    }

    #[test]
    fn test_block_guard_time_on_virtual_clock() {
        let mut ctx = context(EpilogueKind::Lrc);
        ctx.ifsc = 4;
        let mut io = ScriptedIo::with_responder(|written| {
            let block = Block::decode(written, EpilogueKind::Lrc).unwrap();
            match block.kind().unwrap() {
                BlockKind::Information { sequence, chaining: true } => {
                    vec![frame(Block::receive_ready(0, sequence ^ 1, RCode::NoError), EpilogueKind::Lrc)]
                }
                _ => vec![frame(i_block(0, false, &[0x90, 0x00]), EpilogueKind::Lrc)],
            }
        });

        let apdu = [0x80, 0x10, 0x00, 0x00, 0x03, 1, 2, 3];
        T1Engine::new(&mut io, &mut ctx).transfer(&apdu).unwrap();
        // Only the second block follows a reception and waits out the guard time
        let bgt = u64::from(ctx.timeouts.bgt_ms);
        assert!(bgt > 0);
        assert_eq!(io.written().len(), 2);
        assert_eq!(io.elapsed_ms(), bgt);
    }

    #[test]
    fn test_write_uses_transfer_timeout() {
        let mut ctx = context(EpilogueKind::Lrc);
        let mut io = ScriptedIo::new();
        io.stall_writes(60);
        let result = T1Engine::new(&mut io, &mut ctx).with_timeout(50).transfer(&[0x00, 0xA4, 0x04, 0x00]);
        assert_eq!(result, Err(ProtocolError::Timeout));
        assert!(io.written().is_empty());
        assert_eq!(io.elapsed_ms(), 50);
    }

    #[test]
    fn test_command_chaining_respects_ifsc() {
        let mut ctx = context(EpilogueKind::Crc);
        ctx.ifsc = 4;
        let mut io = ScriptedIo::with_responder(|written| {
            let block = Block::decode(written, EpilogueKind::Crc).unwrap();
            match block.kind().unwrap() {
                BlockKind::Information { sequence, chaining: true } => {
                    vec![frame(Block::receive_ready(0, sequence ^ 1, RCode::NoError), EpilogueKind::Crc)]
                }
                _ => vec![frame(i_block(0, false, &[0x90, 0x00]), EpilogueKind::Crc)],
            }
        });

        let apdu = [0x80, 0x10, 0x00, 0x00, 0x05, 1, 2, 3, 4, 5];
        let response = T1Engine::new(&mut io, &mut ctx).transfer(&apdu).unwrap();
        assert_eq!(response.as_ref(), &[0x90, 0x00]);
        let sent: Vec<_> = io
            .written()
            .iter()
            .map(|w| Block::decode(w, EpilogueKind::Crc).unwrap())
            .collect();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].pcb, 0x20);
        assert_eq!(sent[1].pcb, 0x60);
        assert_eq!(sent[2].pcb, 0x00);
        assert_eq!(sent[2].data.as_ref(), &[4, 5]);
        assert_eq!(ctx.bytes_written, apdu.len());
    }

    #[test]
    fn test_wtx_is_answered() {
        let mut ctx = context(EpilogueKind::Lrc);
        let mut io = ScriptedIo::with_responder(|written| match written[1] {
            0x00 => vec![frame(
                Block::supervisory(0, SType::Wtx, false, Bytes::from_static(&[3])),
                EpilogueKind::Lrc,
            )],
            0xE3 => vec![Arrival::after(3000, i_block(0, false, &[0x90, 0x00]).encode(EpilogueKind::Lrc).to_vec())],
            _ => vec![],
        });

        // BWT is 1601 ms, so the answer only fits thanks to the extension
        let response = T1Engine::new(&mut io, &mut ctx).transfer(&[0x00, 0x20, 0x00, 0x00]).unwrap();
        assert_eq!(response.as_ref(), &[0x90, 0x00]);
        assert_eq!(io.written()[1], vec![0x00, 0xE3, 0x01, 0x03, 0xE1]);
        assert_eq!(ctx.bwt_multiplier, 1);
    }

    #[test]
    fn test_checksum_error_is_recovered() {
        let mut ctx = context(EpilogueKind::Lrc);
        let good = i_block(0, false, &[0x90, 0x00]).encode(EpilogueKind::Lrc).to_vec();
        let mut bad = good.clone();
        bad[3] ^= 0x80;
        let mut io = ScriptedIo::with_responder(move |written| match written[1] {
            0x00 => vec![Arrival::now(bad.clone())],
            0x81 => vec![Arrival::now(good.clone())],
            _ => vec![],
        });

        let response = T1Engine::new(&mut io, &mut ctx).transfer(&[0x00, 0xB0, 0x00, 0x00]).unwrap();
        assert_eq!(response.as_ref(), &[0x90, 0x00]);
        // R(EDC) with N(R) = 0
        assert_eq!(io.written()[1], vec![0x00, 0x81, 0x00, 0x81]);
    }

    #[test]
    fn test_card_abort() {
        let mut ctx = context(EpilogueKind::Lrc);
        let mut io = ScriptedIo::new();
        io.push(
            Block::supervisory(0, SType::Abort, false, Bytes::new())
                .encode(EpilogueKind::Lrc)
                .to_vec(),
        );
        assert_eq!(
            T1Engine::new(&mut io, &mut ctx).transfer(&[0x00, 0xB0, 0x00, 0x00]),
            Err(ProtocolError::Aborted)
        );
        assert_eq!(io.written()[1], vec![0x00, 0xE2, 0x00, 0xE2]);
    }

    #[test]
    fn test_ifsd_negotiation() {
        let mut ctx = context(EpilogueKind::Lrc);
        let mut io = ScriptedIo::with_responder(|written| {
            let block = Block::decode(written, EpilogueKind::Lrc).unwrap();
            vec![frame(block.response_to(), EpilogueKind::Lrc)]
        });
        assert_eq!(T1Engine::new(&mut io, &mut ctx).negotiate_ifsd(200), Ok(200));
        assert_eq!(ctx.ifsd, 200);
        assert_eq!(io.written()[0], vec![0x00, 0xC1, 0x01, 0xC8, 0x08]);
    }
}
