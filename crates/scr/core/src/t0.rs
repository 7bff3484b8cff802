//! T=0 character protocol
//!
//! A command APDU is mapped to one or more TPDUs (five byte header plus
//! optional data). Each TPDU is driven by the procedure bytes the card sends
//! back: NULL (`60`) asks for patience, INS acknowledges the remaining data,
//! the complement of INS acknowledges a single byte, and SW1 ends the
//! exchange.
//!
//! The engine never retries on its own: a timeout or an unexpected
//! procedure byte ends the transfer.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument, trace, warn};

use crate::apdu::{ApduCase, HEADER_LEN, INS_ENVELOPE, INS_GET_RESPONSE, StatusWord, classify};
use crate::error::{ProtocolError, Result};
use crate::io::ByteIo;

/// NULL procedure byte
pub const NULL_BYTE: u8 = 0x60;
/// Default bound on GET RESPONSE round trips for one command
pub const DEFAULT_MAX_CHAIN: usize = 32;
/// Largest command data carried by one short TPDU
const MAX_SHORT_DATA: usize = 255;

/// Drives T=0 exchanges over a byte channel
#[derive(Debug)]
pub struct T0Engine<'a, I: ByteIo + ?Sized> {
    io: &'a mut I,
    timeout_ms: u32,
    max_chain: usize,
}

/// Outcome of a single TPDU
#[derive(Debug)]
struct TpduResponse {
    data: BytesMut,
    status: StatusWord,
}

impl<'a, I: ByteIo + ?Sized> T0Engine<'a, I> {
    /// Create an engine with a per-character timeout (normally the WWT)
    pub const fn new(io: &'a mut I, timeout_ms: u32) -> Self {
        Self {
            io,
            timeout_ms,
            max_chain: DEFAULT_MAX_CHAIN,
        }
    }

    /// Bound the number of GET RESPONSE commands issued for one APDU
    pub const fn with_max_chain(mut self, max_chain: usize) -> Self {
        self.max_chain = max_chain;
        self
    }

    /// Exchange a command APDU and return response data followed by SW1 SW2
    #[instrument(level = "trace", skip_all, fields(len = apdu.len()))]
    pub fn transfer(&mut self, apdu: &[u8]) -> Result<Bytes> {
        let class = classify(apdu)?;
        debug!(case = %class.case, lc = class.lc, le = class.le, "T=0 transfer");

        let header = |p3: u8| [apdu[0], apdu[1], apdu[2], apdu[3], p3];
        let data = if class.case.has_command_data() {
            &apdu[class.data_offset..class.data_offset + class.lc]
        } else {
            &[][..]
        };

        let first = match class.case {
            ApduCase::Case1 => self.exchange_tpdu(header(0), &[], 0)?,
            ApduCase::Case2Short => self.exchange_expecting(header(apdu[HEADER_LEN]), class.le)?,
            ApduCase::Case2Extended => {
                // Ask for up to 256 bytes, the rest comes through GET RESPONSE
                let p3 = if class.le >= 256 { 0 } else { class.le as u8 };
                self.exchange_expecting(header(p3), class.le.min(256))?
            }
            ApduCase::Case3Short | ApduCase::Case4Short => self.exchange_tpdu(header(apdu[HEADER_LEN]), data, 0)?,
            ApduCase::Case3Extended | ApduCase::Case4Extended => {
                if data.len() <= MAX_SHORT_DATA {
                    self.exchange_tpdu(header(data.len() as u8), data, 0)?
                } else {
                    self.envelope(apdu)?
                }
            }
        };

        let wanted = if class.case.expects_response_data() {
            class.le
        } else {
            0
        };
        let response = self.collect_remaining(first, wanted)?;
        Ok(response)
    }

    /// Send a header that expects `le` bytes and apply a 6Cxx correction once
    fn exchange_expecting(&mut self, header: [u8; 5], le: usize) -> Result<TpduResponse> {
        let response = self.exchange_tpdu(header, &[], le)?;
        match response.status.corrected_le() {
            Some(exact) => {
                debug!(exact, "Wrong Le, resending with corrected length");
                let mut retry = header;
                retry[4] = exact;
                self.exchange_tpdu(retry, &[], if exact == 0 { 256 } else { usize::from(exact) })
            }
            None => Ok(response),
        }
    }

    /// Chain GET RESPONSE while the card reports more data
    fn collect_remaining(&mut self, first: TpduResponse, wanted: usize) -> Result<Bytes> {
        let TpduResponse { mut data, mut status } = first;
        let mut chain = 0;
        while let Some(available) = status.remaining_bytes() {
            if chain == self.max_chain {
                warn!(chain, "GET RESPONSE chain limit reached");
                break;
            }
            let le = if wanted > data.len() && wanted - data.len() < usize::from(available) {
                (wanted - data.len()) as u8
            } else {
                available
            };
            trace!(le, chain, "Fetching remaining response");
            let next = self.exchange_expecting([0x00, INS_GET_RESPONSE, 0x00, 0x00, le], Self::expected(le))?;
            data.extend_from_slice(&next.data);
            status = next.status;
            chain += 1;
        }
        data.reserve(2);
        data.put_u8(status.sw1);
        data.put_u8(status.sw2);
        Ok(data.freeze())
    }

    /// Carry a command whose data does not fit a short TPDU inside ENVELOPE commands
    fn envelope(&mut self, apdu: &[u8]) -> Result<TpduResponse> {
        let cla = apdu[0];
        let mut chunks = apdu.chunks(MAX_SHORT_DATA).peekable();
        while let Some(chunk) = chunks.next() {
            let header = [cla, INS_ENVELOPE, 0x00, 0x00, chunk.len() as u8];
            let response = self.exchange_tpdu(header, chunk, 0)?;
            if chunks.peek().is_none() || !response.status.is_success() {
                return Ok(response);
            }
        }
        Err(ProtocolError::InvalidApdu("empty envelope"))
    }

    const fn expected(p3: u8) -> usize {
        if p3 == 0 { 256 } else { p3 as usize }
    }

    /// Run one TPDU to completion
    fn exchange_tpdu(&mut self, header: [u8; 5], data: &[u8], le: usize) -> Result<TpduResponse> {
        let ins = header[1];
        self.io.write(&header, self.timeout_ms)?;

        let mut sent = 0;
        let mut received = BytesMut::with_capacity(le);
        loop {
            let procedure = self.io.read_byte(self.timeout_ms)?;
            if procedure == NULL_BYTE {
                trace!("NULL procedure byte");
                continue;
            }
            if procedure == ins {
                if sent < data.len() {
                    self.io.write(&data[sent..], self.timeout_ms)?;
                    sent = data.len();
                } else if received.len() < le {
                    let remaining = le - received.len();
                    self.read_into(&mut received, remaining)?;
                }
                continue;
            }
            if procedure == ins ^ 0xFF {
                if sent < data.len() {
                    self.io.write(&data[sent..=sent], self.timeout_ms)?;
                    sent += 1;
                } else if received.len() < le {
                    self.read_into(&mut received, 1)?;
                }
                continue;
            }
            if StatusWord::is_sw1(procedure) {
                let sw2 = self.io.read_byte(self.timeout_ms)?;
                let status = StatusWord::new(procedure, sw2);
                trace!(%status, sent, received = received.len(), "TPDU complete");
                return Ok(TpduResponse { data: received, status });
            }
            debug!(procedure, ins, "Unexpected procedure byte");
            return Err(ProtocolError::InvalidProcedureByte(procedure));
        }
    }

    fn read_into(&mut self, out: &mut BytesMut, count: usize) -> Result<()> {
        let start = out.len();
        out.resize(start + count, 0);
        let result = self.io.read(&mut out[start..], count, self.timeout_ms);
        if result.is_err() {
            out.truncate(start);
        }
        result?;
        Ok(())
    }
}

/// Exchange an APDU with T=0 using the default GET RESPONSE bound
pub fn transfer<I: ByteIo + ?Sized>(io: &mut I, apdu: &[u8], timeout_ms: u32) -> Result<Bytes> {
    T0Engine::new(io, timeout_ms).transfer(apdu)
}
