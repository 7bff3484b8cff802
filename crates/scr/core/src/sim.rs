//! Simulated card
//!
//! [`SimulatedCard`] answers on a [`ScriptedIo`] the way a real card answers
//! on the wire: it sends its ATR, echoes PPS requests, and runs an applet
//! behind either the T=0 procedure bytes or T=1 blocks. The applet sees
//! complete command APDUs and returns response data followed by SW1 SW2.
//!
//! An ATR starting with `03` makes the card talk inverse convention: frames
//! from the reader are decoded and replies encoded on the line.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::apdu::{INS_GET_RESPONSE, classify};
use crate::atr::{BitConvention, Protocol, TS_INVERSE_AS_DIRECT};
use crate::io::script::{Arrival, ScriptedIo};
use crate::pps::{PPSS, check_request};
use crate::t1::block::{Block, BlockKind, EpilogueKind, MAX_INF_LEN, RCode, SType};

/// T=0 card without TA1 and five historical bytes
pub const T0_ATR: [u8; 9] = [0x3B, 0x65, 0x00, 0x00, 0x9C, 0x11, 0x01, 0x01, 0x03];
/// T=1 card with IFSC 254 and LRC
pub const T1_ATR: [u8; 18] = [
    0x3B, 0xF8, 0x96, 0x00, 0x00, 0x81, 0x31, 0xFE, 0x45, 0x4A, 0x43, 0x4F, 0x50, 0x76, 0x32, 0x34, 0x31, 0x32,
];

/// Command handler: full command APDU in, response data and status out
pub type Applet = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Instructions whose P3 is Le on T=0
const OUTGOING_INS: [u8; 3] = [0xB0, 0xB2, 0xCA];

/// A small file system free applet
///
/// SELECT and UPDATE BINARY succeed, READ BINARY returns `Le` counting
/// bytes, GET DATA returns a fixed serial number and anything else is an
/// unknown instruction.
pub fn default_applet(apdu: &[u8]) -> Vec<u8> {
    let Ok(class) = classify(apdu) else {
        return vec![0x67, 0x00];
    };
    let mut response = match apdu[1] {
        0xA4 | 0xD6 => Vec::new(),
        0xB0 => (0..class.le).map(|i| i as u8).collect(),
        0xCA => vec![0x12, 0x34, 0x56, 0x78],
        _ => return vec![0x6D, 0x00],
    };
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

/// Card side of a simulated slot
pub struct SimulatedCard {
    protocol: Protocol,
    atr: Vec<u8>,
    convention: BitConvention,
    applet: Applet,
    // T=0
    t0_expecting: Option<[u8; 5]>,
    t0_pending: Vec<u8>,
    // T=1
    epilogue: EpilogueKind,
    ifsd: usize,
    ns: u8,
    nr: u8,
    command: Vec<u8>,
    outgoing: VecDeque<Bytes>,
    last_sent: Option<Block>,
}

impl fmt::Debug for SimulatedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCard")
            .field("protocol", &self.protocol)
            .field("atr", &hex::encode(&self.atr))
            .field("convention", &self.convention)
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .finish_non_exhaustive()
    }
}

impl SimulatedCard {
    /// Card speaking `protocol` with the matching built-in ATR
    pub fn new(protocol: Protocol) -> Self {
        let atr = match protocol {
            Protocol::T1 => T1_ATR.to_vec(),
            Protocol::T0 | Protocol::T14 => T0_ATR.to_vec(),
        };
        Self::with_atr(protocol, atr)
    }

    /// Card speaking `protocol` with a custom ATR, given as sent on the line
    pub fn with_atr(protocol: Protocol, atr: impl Into<Vec<u8>>) -> Self {
        let atr = atr.into();
        let convention = if atr.first() == Some(&TS_INVERSE_AS_DIRECT) {
            BitConvention::Inverse
        } else {
            BitConvention::Direct
        };
        Self {
            protocol,
            atr,
            convention,
            applet: Box::new(default_applet),
            t0_expecting: None,
            t0_pending: Vec::new(),
            epilogue: EpilogueKind::Lrc,
            ifsd: usize::from(crate::t1::DEFAULT_IFSD),
            ns: 0,
            nr: 0,
            command: Vec::new(),
            outgoing: VecDeque::new(),
            last_sent: None,
        }
    }

    /// Replace the applet
    pub fn with_applet<F>(mut self, applet: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.applet = Box::new(applet);
        self
    }

    /// Use CRC instead of LRC on T=1
    pub const fn with_epilogue(mut self, epilogue: EpilogueKind) -> Self {
        self.epilogue = epilogue;
        self
    }

    /// The ATR sent on reset
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Wire with the ATR queued and this card answering every frame
    pub fn into_io(mut self) -> ScriptedIo {
        let atr = std::mem::take(&mut self.atr);
        let mut io = ScriptedIo::with_responder(move |frame| self.on_frame(frame));
        io.push(atr);
        io
    }

    /// React to one frame written by the reader
    pub fn on_frame(&mut self, frame: &[u8]) -> Vec<Arrival> {
        let mut frame = frame.to_vec();
        self.convention.transcode(&mut frame);
        let mut reply = self.reply(&frame);
        if reply.is_empty() {
            return Vec::new();
        }
        self.convention.transcode(&mut reply);
        vec![Arrival::now(reply)]
    }

    fn reply(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.first() == Some(&PPSS) && check_request(frame).is_ok() {
            debug!(pps = %hex::encode(frame), "Confirming PPS");
            return frame.to_vec();
        }
        let reply = match self.protocol {
            Protocol::T0 => self.t0_frame(frame),
            Protocol::T1 => self.t1_frame(frame),
            Protocol::T14 => Vec::new(),
        };
        trace!(reply = %hex::encode(&reply), "Card reply");
        reply
    }

    fn t0_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        if let Some(header) = self.t0_expecting.take() {
            let mut apdu = header.to_vec();
            apdu.extend_from_slice(frame);
            return self.t0_complete(&apdu);
        }
        let Ok(header) = <[u8; 5]>::try_from(frame) else {
            return vec![0x67, 0x00];
        };
        let (ins, p3) = (header[1], header[4]);
        let le = if p3 == 0 { 256 } else { usize::from(p3) };

        if ins == INS_GET_RESPONSE {
            if self.t0_pending.is_empty() {
                return vec![0x6F, 0x00];
            }
            if le > self.t0_pending.len() {
                return vec![0x6C, self.t0_pending.len() as u8];
            }
            let mut reply = vec![ins];
            reply.extend(self.t0_pending.drain(..le));
            reply.extend_from_slice(&remaining_status(self.t0_pending.len()));
            return reply;
        }

        if OUTGOING_INS.contains(&ins) {
            let response = (self.applet)(&header);
            let (data, sw) = split_status(&response);
            if data.is_empty() {
                return sw.to_vec();
            }
            if data.len() != le {
                return vec![0x6C, data.len() as u8];
            }
            let mut reply = vec![ins];
            reply.extend_from_slice(data);
            reply.extend_from_slice(sw);
            return reply;
        }

        if p3 == 0 {
            return self.t0_complete(&header);
        }
        self.t0_expecting = Some(header);
        vec![ins]
    }

    fn t0_complete(&mut self, apdu: &[u8]) -> Vec<u8> {
        let response = (self.applet)(apdu);
        let (data, sw) = split_status(&response);
        if data.is_empty() {
            return sw.to_vec();
        }
        self.t0_pending = data.to_vec();
        remaining_status(self.t0_pending.len()).to_vec()
    }

    fn t1_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let Ok(block) = Block::decode(frame, self.epilogue) else {
            return self.t1_send(Block::receive_ready(0, self.nr, RCode::EdcError));
        };
        match block.kind() {
            Ok(BlockKind::Information { sequence, chaining }) => {
                if sequence != self.nr {
                    debug!(sequence, "Repeated I-block");
                    return self.t1_resend();
                }
                self.nr ^= 1;
                self.command.extend_from_slice(&block.data);
                if chaining {
                    return self.t1_send(Block::receive_ready(block.nad, self.nr, RCode::NoError));
                }
                let apdu = std::mem::take(&mut self.command);
                let response = (self.applet)(&apdu);
                self.outgoing = response
                    .chunks(self.ifsd.clamp(1, MAX_INF_LEN))
                    .map(Bytes::copy_from_slice)
                    .collect();
                self.t1_next_chunk(block.nad)
            }
            Ok(BlockKind::Receive { sequence, .. }) => {
                if sequence == self.ns && !self.outgoing.is_empty() {
                    self.t1_next_chunk(block.nad)
                } else {
                    self.t1_resend()
                }
            }
            Ok(BlockKind::Supervisory { kind, response: false }) => {
                match kind {
                    SType::Resynch => {
                        self.ns = 0;
                        self.nr = 0;
                        self.command.clear();
                        self.outgoing.clear();
                    }
                    SType::Ifs => {
                        if let Some(&ifsd) = block.data.first() {
                            self.ifsd = usize::from(ifsd);
                        }
                    }
                    SType::Abort | SType::Wtx => {}
                }
                self.t1_send(block.response_to())
            }
            Ok(BlockKind::Supervisory { response: true, .. }) => Vec::new(),
            Err(_) => self.t1_send(Block::receive_ready(block.nad, self.nr, RCode::OtherError)),
        }
    }

    fn t1_next_chunk(&mut self, nad: u8) -> Vec<u8> {
        let chunk = self.outgoing.pop_front().unwrap_or_default();
        let chaining = !self.outgoing.is_empty();
        let block = Block::information(nad, self.ns, chaining, chunk);
        self.ns ^= 1;
        self.t1_send(block)
    }

    fn t1_resend(&mut self) -> Vec<u8> {
        match self.last_sent.clone() {
            Some(block) => self.t1_send(block),
            None => self.t1_send(Block::receive_ready(0, self.nr, RCode::OtherError)),
        }
    }

    fn t1_send(&mut self, block: Block) -> Vec<u8> {
        let frame = block.encode(self.epilogue).to_vec();
        self.last_sent = Some(block);
        frame
    }
}

fn split_status(response: &[u8]) -> (&[u8], &[u8]) {
    if response.len() < 2 {
        return (&[], &[0x6F, 0x00]);
    }
    response.split_at(response.len() - 2)
}

fn remaining_status(remaining: usize) -> [u8; 2] {
    match remaining {
        0 => [0x90, 0x00],
        n if n >= 256 => [0x61, 0x00],
        n => [0x61, n as u8],
    }
}

impl From<SimulatedCard> for ScriptedIo {
    fn from(card: SimulatedCard) -> Self {
        card.into_io()
    }
}
